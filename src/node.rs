//! Node building blocks: the field cells and the protocol descriptor.
//!
//! A protected node type declares its layout with two field kinds:
//! [`Link<N>`] for owning references into the structure (these take part
//! in publication and reachability) and [`Val<T>`] for plain values read
//! and written in place. The [`Protocol`] impl completes the declaration
//! by enumerating the links, which is all the reclamation machinery needs
//! to walk the graph.

use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::fmt;

use crossbeam_utils::atomic::AtomicCell;

use crate::epoch::ReadGuard;
use crate::refs::{Pen, ReadRef, WriteRef};

/// An RCU-protected reference field: an owning link to another node, or
/// empty.
///
/// Access is capability-gated. Readers follow a link with
/// [`read`](Link::read), which demands the critical-section guard and
/// yields another [`ReadRef`]. The writer loads it with
/// [`load`](Link::load) and installs a new target with
/// [`store`](Link::store), both of which demand the phase [`Pen`]; and
/// `store` accepts only a [`WriteRef`], so an unpublished node cannot be
/// linked into the graph without going through
/// [`crate::Publisher::promote`] first.
pub struct Link<N> {
    cell: AtomicPtr<N>,
}

impl<N> Link<N> {
    /// An empty link.
    #[inline]
    pub const fn empty() -> Self {
        Self {
            cell: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Follow this link inside a read critical section.
    #[inline]
    pub fn read<'cs>(&self, _guard: &'cs ReadGuard) -> Option<ReadRef<'cs, N>> {
        let ptr = self.cell.load(Ordering::Acquire);
        // SAFETY: the guard defers reclamation of anything reachable here.
        unsafe { ReadRef::from_raw(ptr) }
    }

    /// Follow this link inside a while-readers-exist phase.
    ///
    /// This is a plain load: stepping a write reference through the
    /// structure publishes nothing.
    #[inline]
    pub fn load<'w>(&self, _pen: Pen<'w>) -> Option<WriteRef<'w, N>> {
        let ptr = self.cell.load(Ordering::Acquire);
        // SAFETY: the writer phase keeps every reachable node alive.
        unsafe { WriteRef::from_raw(ptr) }
    }

    /// Install a new target, or `None` to clear the link.
    ///
    /// A release store: everything written to the target before this call
    /// is visible to any reader that reaches it through this link.
    #[inline]
    pub fn store<'w>(&self, target: Option<WriteRef<'w, N>>, _pen: Pen<'w>) {
        let ptr = target.map_or(ptr::null_mut(), |r| r.as_raw());
        self.cell.store(ptr, Ordering::Release);
    }

    /// Capability-free load for contexts that own the node outright
    /// (collector traversal, drop-time reaping).
    #[inline]
    pub(crate) fn raw(&self) -> *mut N {
        self.cell.load(Ordering::Acquire)
    }

    pub(crate) fn swap(&self, new: *mut N) -> *mut N {
        self.cell.swap(new, Ordering::SeqCst)
    }

    pub(crate) fn take(&mut self) -> *mut N {
        core::mem::replace(self.cell.get_mut(), ptr::null_mut())
    }
}

impl<N> Default for Link<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<N> fmt::Debug for Link<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({:p})", self.cell.load(Ordering::Relaxed))
    }
}

/// A value field: plain data, read and written in place.
///
/// Backed by an atomic cell so that the writer's in-place mutation
/// ([`put`](Val::put)) races safely with reader snapshots
/// ([`get`](Val::get)). For word-sized `T` both are single lock-free
/// loads and stores.
pub struct Val<T> {
    cell: AtomicCell<T>,
}

impl<T> Val<T> {
    /// Wrap an initial value.
    #[inline]
    pub const fn new(value: T) -> Self {
        Self {
            cell: AtomicCell::new(value),
        }
    }

    /// Snapshot the value inside a read critical section.
    #[inline]
    pub fn get(&self, _guard: &ReadGuard) -> T
    where
        T: Copy,
    {
        self.cell.load()
    }

    /// Read the live value inside a while-readers-exist phase.
    #[inline]
    pub fn load(&self, _pen: Pen<'_>) -> T
    where
        T: Copy,
    {
        self.cell.load()
    }

    /// Mutate the value in place inside a while-readers-exist phase.
    ///
    /// Concurrent readers observe either the old or the new value.
    #[inline]
    pub fn put(&self, value: T, _pen: Pen<'_>) {
        self.cell.store(value);
    }

    /// Replace the value through exclusive ownership (an
    /// [`Unpublished`] handle, before promotion).
    #[inline]
    pub fn set(&mut self, value: T) {
        self.cell.store(value);
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Val<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Val({:?})", self.cell.load())
    }
}

/// Declares the RCU layout of a node type.
///
/// Implementations enumerate every [`Link<Self>`] field; value fields are
/// not reported. The framework walks links when a [`crate::Protected`]
/// root is dropped, freeing each still-reachable node exactly once.
///
/// # Safety
///
/// `for_each_link` must invoke `f` only on link fields of `self`, and on
/// each of them at most once per call. Reporting another node's link
/// would let the reaper free a node that is still linked elsewhere.
pub unsafe trait Protocol: Sized + Send + Sync + 'static {
    /// Visit every link field of this node.
    fn for_each_link(&self, f: &mut dyn FnMut(&Link<Self>));
}

/// A node the writer owns and readers cannot see.
///
/// Created in a writer's `setup` hook with [`Unpublished::new`]; mutated
/// freely through `Deref`/`DerefMut`; handed to
/// [`crate::Publisher::promote`] to become linkable. Dropping an
/// unpromoted handle frees the node, so an aborted write cleans itself
/// up through ordinary ownership.
pub struct Unpublished<N> {
    node: Box<N>,
}

impl<N> Unpublished<N> {
    /// Take ownership of a freshly constructed node.
    #[inline]
    pub fn new(node: N) -> Self {
        Self {
            node: Box::new(node),
        }
    }

    pub(crate) fn into_nonnull(self) -> core::ptr::NonNull<N> {
        core::ptr::NonNull::from(Box::leak(self.node))
    }

    /// # Safety
    ///
    /// `ptr` must come from [`Unpublished::into_nonnull`] (or an
    /// equivalent `Box` allocation) and must not be reachable from any
    /// published state.
    pub(crate) unsafe fn from_raw(ptr: *mut N) -> Self {
        Self {
            // SAFETY: per the contract above this re-forms the original Box.
            node: unsafe { Box::from_raw(ptr) },
        }
    }
}

impl<N> Deref for Unpublished<N> {
    type Target = N;

    #[inline]
    fn deref(&self) -> &N {
        &self.node
    }
}

impl<N> DerefMut for Unpublished<N> {
    #[inline]
    fn deref_mut(&mut self) -> &mut N {
        &mut self.node
    }
}

impl<N: fmt::Debug> fmt::Debug for Unpublished<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Unpublished").field(&self.node).finish()
    }
}
