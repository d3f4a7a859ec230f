//! A concurrent singly-linked queue driving the `quiesce` RCU framework.
//!
//! Readers fold over the list (minimum value) while writers enqueue at
//! the head and dequeue at the tail. Everything threads share travels in
//! one explicit [`Harness`] context; allocation and destruction are
//! counted through [`Telemetry`] so tests can assert that every cell is
//! reclaimed exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use log::warn;
use rand::Rng;

use quiesce::{
    Collector, Link, Protected, Protocol, Publisher, ReadGuard, ReadRef, Retired, Unpublished,
    Val, WriteError, WriteRef, Writer,
};

/// Allocation/destruction counters shared by every cell of one queue.
#[derive(Debug, Default)]
pub struct Telemetry {
    allocated: AtomicUsize,
    dropped: AtomicUsize,
}

impl Telemetry {
    /// Cells allocated so far.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Cell destructors run so far.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Cells currently alive.
    pub fn live(&self) -> usize {
        self.allocated() - self.dropped()
    }
}

/// One queue cell: a link to the next cell and an integer payload.
pub struct QueueCell {
    /// Next cell towards the tail.
    pub next: Link<QueueCell>,
    /// The enqueued value.
    pub value: Val<i64>,
    telemetry: Arc<Telemetry>,
}

impl QueueCell {
    /// Stage a fresh, unpublished cell.
    pub fn stage(value: i64, telemetry: &Arc<Telemetry>) -> Unpublished<QueueCell> {
        telemetry.allocated.fetch_add(1, Ordering::Relaxed);
        Unpublished::new(QueueCell {
            next: Link::empty(),
            value: Val::new(value),
            telemetry: telemetry.clone(),
        })
    }
}

impl Drop for QueueCell {
    fn drop(&mut self) {
        self.telemetry.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

unsafe impl Protocol for QueueCell {
    fn for_each_link(&self, f: &mut dyn FnMut(&Link<QueueCell>)) {
        f(&self.next);
    }
}

/// Fold the minimum value over the list. `None` marks an empty list.
pub fn fold_min<'cs>(
    guard: &'cs ReadGuard,
    head: Option<ReadRef<'cs, QueueCell>>,
) -> Option<i64> {
    let mut min = None;
    let mut cursor = head;
    while let Some(cell) = cursor {
        let value = cell.value.get(guard);
        min = Some(match min {
            None => value,
            Some(m) if value < m => value,
            Some(m) => m,
        });
        cursor = cell.next.read(guard);
    }
    min
}

/// Enqueue one value at the head of the queue.
pub struct Enqueue {
    value: i64,
    telemetry: Arc<Telemetry>,
    staged: Option<Unpublished<QueueCell>>,
}

impl Enqueue {
    /// A writer that will enqueue `value`.
    pub fn new(value: i64, telemetry: Arc<Telemetry>) -> Self {
        Self {
            value,
            telemetry,
            staged: None,
        }
    }
}

impl Writer<QueueCell> for Enqueue {
    fn setup(&mut self) -> quiesce::Result<()> {
        self.staged = Some(QueueCell::stage(self.value, &self.telemetry));
        Ok(())
    }

    fn while_readers_exist<'w>(
        &mut self,
        head: Option<WriteRef<'w, QueueCell>>,
        publisher: &mut Publisher<'w, QueueCell>,
    ) -> quiesce::Result<()> {
        let pen = publisher.pen();
        let cell = publisher.promote(self.staged.take().ok_or(WriteError::Aborted)?);
        cell.next.store(head, pen);
        publisher.publish(Some(cell));
        Ok(())
    }
}

/// Remove the cell at the tail of the queue, if any.
#[derive(Default)]
pub struct DequeueTail {
    removed: Option<Retired<QueueCell>>,
    /// The value carried by the removed cell, if one was removed.
    pub removed_value: Option<i64>,
}

impl Writer<QueueCell> for DequeueTail {
    fn while_readers_exist<'w>(
        &mut self,
        head: Option<WriteRef<'w, QueueCell>>,
        publisher: &mut Publisher<'w, QueueCell>,
    ) -> quiesce::Result<()> {
        let pen = publisher.pen();

        let Some(mut cell) = head else {
            return Ok(());
        };

        // Walk to the last cell, remembering its predecessor. Stepping
        // through write references is loads only, so nothing becomes
        // visible to readers during the walk.
        let mut prev: Option<WriteRef<'w, QueueCell>> = None;
        while let Some(next) = cell.next.load(pen) {
            prev = Some(cell);
            cell = next;
        }

        self.removed_value = Some(cell.value.load(pen));
        match prev {
            // The tail is the only cell: unlink it by emptying the root.
            None => {
                publisher.publish(None);
            }
            Some(prev) => prev.next.store(None, pen),
        }
        self.removed = Some(publisher.retire(cell));
        Ok(())
    }

    fn teardown(&mut self, collector: &mut Collector<'_, QueueCell>) {
        if let Some(cell) = self.removed.take() {
            drop(collector.demote(cell));
        }
    }
}

/// Unlink every cell with one publish and reclaim the whole chain.
///
/// Running it against an already-empty queue is a no-op.
#[derive(Default)]
pub struct Drain {
    chain: Option<Retired<QueueCell>>,
    /// Number of cells reclaimed by this drain.
    pub reclaimed: usize,
}

impl Writer<QueueCell> for Drain {
    fn while_readers_exist<'w>(
        &mut self,
        head: Option<WriteRef<'w, QueueCell>>,
        publisher: &mut Publisher<'w, QueueCell>,
    ) -> quiesce::Result<()> {
        if head.is_some() {
            if let Some(old) = publisher.publish(None) {
                self.chain = Some(publisher.retire(old));
            }
        }
        Ok(())
    }

    fn teardown(&mut self, collector: &mut Collector<'_, QueueCell>) {
        // The whole chain became unreachable at the publish; claim our
        // way down it, destroying cell by cell.
        let mut pending = self.chain.take();
        while let Some(token) = pending {
            let cell = collector.demote(token);
            pending = collector.claim(&cell.next);
            self.reclaimed += 1;
        }
    }
}

/// One queue operation of the random workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Enqueue this value at the head.
    Push(i64),
    /// Dequeue the tail cell.
    PopTail,
}

/// Everything the reader and writer threads share, passed explicitly
/// instead of living in globals.
pub struct Harness {
    /// The protected queue.
    pub queue: Protected<QueueCell>,
    /// Cell allocation/destruction counters.
    pub telemetry: Arc<Telemetry>,
    /// Operations each writer thread performs.
    pub ops_per_writer: usize,
    live_writers: AtomicUsize,
    queue_len: AtomicUsize,
}

impl Harness {
    /// The original workload's per-writer operation count.
    pub const DEFAULT_OPS_PER_WRITER: usize = 5;

    /// A harness expecting `num_writers` writer threads.
    pub fn new(num_writers: usize, ops_per_writer: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Protected::empty(),
            telemetry: Arc::new(Telemetry::default()),
            ops_per_writer,
            live_writers: AtomicUsize::new(num_writers),
            queue_len: AtomicUsize::new(0),
        })
    }

    /// Cells currently enqueued.
    pub fn len(&self) -> usize {
        self.queue_len.load(Ordering::Acquire)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every writer thread has finished its workload.
    pub fn writers_done(&self) -> bool {
        self.live_writers.load(Ordering::Acquire) == 0
    }

    /// Sign one writer thread off. Readers exit their loop once every
    /// writer has.
    pub fn finish_writer(&self) {
        self.live_writers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Apply one operation to the queue.
    pub fn apply(&self, op: Op) {
        match op {
            Op::Push(value) => {
                let mut enqueue = Enqueue::new(value, self.telemetry.clone());
                match self.queue.write(&mut enqueue) {
                    Ok(()) => {
                        self.queue_len.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(err) => warn!("enqueue failed: {err}"),
                }
            }
            Op::PopTail => {
                let mut dequeue = DequeueTail::default();
                match self.queue.write(&mut dequeue) {
                    Ok(()) => {
                        if dequeue.removed_value.is_some() {
                            self.queue_len.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                    Err(err) => warn!("dequeue failed: {err}"),
                }
            }
        }
    }

    /// Apply a whole operation plan in order.
    pub fn run_plan(&self, plan: &[Op]) {
        for op in plan {
            self.apply(*op);
        }
    }

    /// Unlink and reclaim every cell; returns how many were reclaimed.
    pub fn drain(&self) -> usize {
        let mut drain = Drain::default();
        if let Err(err) = self.queue.write(&mut drain) {
            warn!("drain failed: {err}");
        }
        self.queue_len.store(0, Ordering::Release);
        drain.reclaimed
    }
}

/// A coin-flip plan: push a random value or pop the tail.
pub fn random_plan(len: usize) -> Vec<Op> {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            if rng.random_bool(0.5) {
                Op::Push(rng.random_range(0..1_000_000))
            } else {
                Op::PopTail
            }
        })
        .collect()
}

/// Writer thread body: run a random plan, then sign off.
pub fn writer_thread(harness: &Harness) {
    let plan = random_plan(harness.ops_per_writer);
    harness.run_plan(&plan);
    harness.finish_writer();
}

/// Reader thread body: fold the list until every writer is done.
/// Returns the number of folds performed.
pub fn reader_thread(harness: &Harness) -> usize {
    let mut folds = 0usize;
    loop {
        harness.queue.read(fold_min);
        folds += 1;
        if harness.writers_done() {
            return folds;
        }
        // Give writers a chance even on a saturated machine.
        thread::yield_now();
    }
}
