//! The protected root: one atomic head cell plus its writer lock.

use std::sync::{Mutex, PoisonError};

use log::debug;

use crate::epoch::{self, pin, ReadGuard};
use crate::node::{Link, Protocol};
use crate::reclaim;
use crate::refs::ReadRef;
use crate::writer::{Collector, Publisher, Result, Writer};

/// An RCU-protected structure anchored at a single head reference.
///
/// Readers enter through [`read`](Protected::read): wait-free, never
/// blocked by the writer. Writers enter through
/// [`write`](Protected::write): serialized among themselves, blocked
/// only on each other and on the grace-period wait. Dropping the root
/// reclaims every node still reachable from the head.
pub struct Protected<N: Protocol> {
    head: Link<N>,
    writer: Mutex<()>,
}

impl<N: Protocol> Protected<N> {
    /// A root with no published nodes.
    pub fn empty() -> Self {
        Self {
            head: Link::empty(),
            writer: Mutex::new(()),
        }
    }

    /// Run `f` inside a read critical section over a snapshot of the
    /// head.
    ///
    /// `f` gets the section's guard and the head reference (or `None`
    /// for an empty root); the lifetimes prevent either from escaping.
    /// Whatever `f` returns, including an `Err` of the caller's own, is
    /// handed back after the critical section has ended. Never blocks.
    pub fn read<R, F>(&self, f: F) -> R
    where
        F: for<'cs> FnOnce(&'cs ReadGuard, Option<ReadRef<'cs, N>>) -> R,
    {
        let guard = pin();
        let head = self.head.read(&guard);
        f(&guard, head)
    }

    /// Run `writer` against this root under the writer lock.
    ///
    /// Executes the hook sequence of [`Writer`]: `setup`, then
    /// `while_readers_exist` over the current head, then (if the phase
    /// published or retired anything) a grace-period wait, then
    /// `teardown`. A hook `Err` abandons the write at that point;
    /// already-published changes remain published.
    ///
    /// Must not be called from inside a read critical section on the same
    /// thread: the grace-period wait would wait for the caller's own
    /// guard.
    pub fn write<W: Writer<N>>(&self, writer: &mut W) -> Result<()> {
        // A poisoned lock means an earlier writer panicked. Its published
        // state is consistent (publication is a single swap), so later
        // writers proceed.
        let _serial = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        writer.setup()?;

        let mut publisher = Publisher::new(self);
        let head = self.head.load(publisher.pen());
        writer.while_readers_exist(head, &mut publisher)?;

        let (dirty, mut issued) = publisher.finish();
        if dirty {
            epoch::synchronize();
        }

        let mut collector = Collector::new(&mut issued);
        writer.teardown(&mut collector);

        Ok(())
    }

    pub(crate) fn head_cell(&self) -> &Link<N> {
        &self.head
    }
}

impl<N: Protocol> Default for Protected<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<N: Protocol> Drop for Protected<N> {
    fn drop(&mut self) {
        // Exclusive access: no read critical section can reach this root
        // any more, so the graph can be reaped immediately.
        let head = self.head.take();
        // SAFETY: every node reachable from the head is owned by this
        // root and about to become unreachable.
        let freed = unsafe { reclaim::reap(head) };
        if freed != 0 {
            debug!("reaped {freed} nodes with their root");
        }
    }
}
