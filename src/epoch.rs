//! The reader epoch tracker.
//!
//! Every reader thread owns one cache-padded slot in a global table. A
//! slot is either INACTIVE or records the global epoch observed when the
//! thread entered its outermost critical section. A writer that needs a
//! grace period advances the global epoch and then waits, per slot, until
//! the slot is inactive or records a newer epoch; at that point every
//! critical section that could have seen the pre-publication state has
//! ended.
//!
//! Thread IDs are allocated lazily on first pin, recycled through a free
//! list when the thread exits, and capped at [`MAX_READERS`]. Nested
//! [`pin`] calls on one thread share the outermost slot through a
//! pin count in the thread-local handle.

use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam_utils::{Backoff, CachePadded};
use log::trace;
use once_cell::race::OnceBox;

/// Maximum number of threads that can be registered as readers at once.
///
/// Slots are recycled on thread exit, so this bounds concurrent reader
/// threads, not the total over a process lifetime.
pub const MAX_READERS: usize = 256;

/// Slot state of a thread with no critical section in flight.
const INACTIVE: u64 = 0;

#[inline]
const fn active(epoch: u64) -> u64 {
    (epoch << 1) | 1
}

#[inline]
const fn epoch_of(state: u64) -> u64 {
    state >> 1
}

struct SlotTable {
    /// Global epoch. Starts at 1 so an active slot never encodes as
    /// INACTIVE.
    epoch: CachePadded<AtomicU64>,
    slots: Box<[CachePadded<AtomicU64>]>,
    next_tid: AtomicUsize,
    free_tids: Mutex<Vec<usize>>,
}

impl SlotTable {
    fn new() -> Self {
        let slots = (0..MAX_READERS)
            .map(|_| CachePadded::new(AtomicU64::new(INACTIVE)))
            .collect();

        Self {
            epoch: CachePadded::new(AtomicU64::new(1)),
            slots,
            next_tid: AtomicUsize::new(0),
            free_tids: Mutex::new(Vec::new()),
        }
    }

    fn alloc_tid(&self) -> usize {
        {
            let mut free = self.free_tids.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tid) = free.pop() {
                return tid;
            }
        }
        // CAS loop: only increment on success so the counter stays valid
        // if the assert fires under catch_unwind.
        loop {
            let current = self.next_tid.load(Ordering::Relaxed);
            assert!(
                current < MAX_READERS,
                "quiesce: exceeded maximum reader thread count ({MAX_READERS})"
            );
            match self.next_tid.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(_) => continue,
            }
        }
    }

    fn free_tid(&self, tid: usize) {
        self.slots[tid].store(INACTIVE, Ordering::Release);
        let mut free = self.free_tids.lock().unwrap_or_else(PoisonError::into_inner);
        free.push(tid);
    }
}

static TABLE: OnceBox<SlotTable> = OnceBox::new();

#[inline]
fn table() -> &'static SlotTable {
    TABLE.get_or_init(|| Box::new(SlotTable::new()))
}

/// Mark the slot active at the current epoch.
///
/// The store must be visible before any protected load this thread makes:
/// the SeqCst store + fence pair with the fence-then-scan in
/// [`synchronize`]. Either the writer's scan observes this slot and
/// waits, or this thread's subsequent head load observes the writer's
/// publication; never neither.
fn enter_slot(tid: usize) {
    let t = table();
    let epoch = t.epoch.load(Ordering::SeqCst);
    t.slots[tid].store(active(epoch), Ordering::SeqCst);
    fence(Ordering::SeqCst);
}

fn exit_slot(tid: usize) {
    table().slots[tid].store(INACTIVE, Ordering::Release);
}

/// Thread-local reader handle: lazily allocated slot plus the pin count
/// that lets nested critical sections share it.
struct Handle {
    tid: Cell<Option<usize>>,
    pin_count: Cell<usize>,
}

impl Handle {
    const fn new() -> Self {
        Self {
            tid: Cell::new(None),
            pin_count: Cell::new(0),
        }
    }

    fn tid(&self) -> usize {
        match self.tid.get() {
            Some(tid) => tid,
            None => {
                let tid = table().alloc_tid();
                self.tid.set(Some(tid));
                tid
            }
        }
    }

    fn pin(&self) -> ReadGuard {
        let count = self.pin_count.get();
        self.pin_count.set(count + 1);

        // Only the outermost pin touches the slot; nested pins stay
        // covered by its entry.
        if count == 0 {
            enter_slot(self.tid());
        }

        ReadGuard {
            ephemeral: None,
            _not_send: PhantomData,
        }
    }

    fn unpin(&self) {
        // Saturating: a dummy guard created while TLS was unavailable was
        // never counted here.
        let count = self.pin_count.get().saturating_sub(1);
        self.pin_count.set(count);

        if count == 0 {
            if let Some(tid) = self.tid.get() {
                exit_slot(tid);
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(tid) = self.tid.get() {
            table().free_tid(tid);
        }
    }
}

thread_local! {
    static HANDLE: Handle = const { Handle::new() };
}

/// RAII guard for a read critical section.
///
/// While any guard on a thread is live, that thread's epoch slot is set
/// and nothing it can reach through [`crate::Link::read`] will be freed.
/// Guards do not cross threads.
pub struct ReadGuard {
    /// A throwaway slot, used only when the thread-local handle is gone
    /// (critical sections entered during thread teardown). `None` for
    /// ordinary guards, which track their nesting through the handle.
    ephemeral: Option<usize>,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for ReadGuard {
    #[inline]
    fn drop(&mut self) {
        match self.ephemeral {
            Some(tid) => table().free_tid(tid),
            // try_with: during process teardown TLS may already be
            // destroyed; the handle's own Drop has cleared the slot then.
            None => {
                let _ = HANDLE.try_with(Handle::unpin);
            }
        }
    }
}

/// Enter a read critical section.
///
/// An epoch-slot store on the outermost call, a counter bump on nested
/// calls; wait-free except for the very first call on a thread, which
/// registers it with the slot allocator. The returned guard ends the
/// section when dropped.
#[inline]
pub fn pin() -> ReadGuard {
    match HANDLE.try_with(Handle::pin) {
        Ok(guard) => guard,
        // TLS destroyed (thread teardown): take a throwaway slot so the
        // critical section is still visible to writers.
        Err(_) => {
            let tid = table().alloc_tid();
            enter_slot(tid);
            ReadGuard {
                ephemeral: Some(tid),
                _not_send: PhantomData,
            }
        }
    }
}

/// Wait out a grace period: block until every read critical section that
/// was entered at or before this call has ended.
pub(crate) fn synchronize() {
    let t = table();

    // Readers entering from here on record a newer epoch and are not
    // waited for; anything they load is already the published state.
    let target = t.epoch.fetch_add(1, Ordering::SeqCst);
    fence(Ordering::SeqCst);

    let limit = t.next_tid.load(Ordering::Acquire).min(MAX_READERS);
    for tid in 0..limit {
        let slot = &t.slots[tid];
        let backoff = Backoff::new();
        loop {
            let state = slot.load(Ordering::SeqCst);
            if state == INACTIVE || epoch_of(state) > target {
                break;
            }
            backoff.snooze();
        }
    }

    trace!("grace period elapsed at epoch {target}");
}
