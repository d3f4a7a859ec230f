//! The writer side: the three-hook contract, the publisher, and the
//! collector.
//!
//! A write runs as `setup` → `while_readers_exist` → grace period →
//! `teardown`, serialized against other writes on the same root. The
//! [`Publisher`] is the phase-two capability (promote, publish, retire);
//! the [`Collector`] is the teardown capability (demote, claim). Both are
//! stack-scoped and cannot escape their phase.

use core::ptr::NonNull;

use log::trace;

use crate::node::{Link, Protocol, Unpublished};
use crate::refs::{Pen, Retired, WriteRef};
use crate::root::Protected;

/// Writer-path result type.
pub type Result<T> = core::result::Result<T, WriteError>;

/// Why a write was abandoned.
///
/// Nothing is retried by the framework; a failed write leaves whatever it
/// already published in place and the caller decides what to do next.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// Allocation failed while staging nodes in `setup`.
    #[error("allocation failed in writer setup")]
    Alloc,

    /// The writer chose to abandon the write.
    #[error("write aborted")]
    Aborted,

    /// An application error surfaced inside a hook.
    #[error("writer failed ({0})")]
    Inner(String),
}

/// A write against a [`Protected`] root, expressed as three hooks.
///
/// The framework runs them in order under the root's writer lock:
///
/// 1. [`setup`](Writer::setup) stages [`Unpublished`] nodes. It receives
///    no capability token, so it cannot read or mutate published nodes.
///    An `Err` aborts the write before any structural change.
/// 2. [`while_readers_exist`](Writer::while_readers_exist) receives the
///    current head and the [`Publisher`], and performs the structural
///    change. An `Err` here abandons the write: whatever was already
///    published stays published, and the remaining phases are skipped.
/// 3. After the grace period, [`teardown`](Writer::teardown) receives
///    the [`Collector`] and destroys whatever phase two retired.
///
/// Writers are plain values borrowed for the duration of the call; no
/// heap allocation or trait objects required.
pub trait Writer<N: Protocol> {
    /// Stage unpublished nodes. Defaults to doing nothing.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Read, mutate, and republish the structure.
    fn while_readers_exist<'w>(
        &mut self,
        head: Option<WriteRef<'w, N>>,
        publisher: &mut Publisher<'w, N>,
    ) -> Result<()>;

    /// Destroy retired nodes. Runs strictly after the grace period.
    /// Defaults to doing nothing.
    fn teardown(&mut self, _collector: &mut Collector<'_, N>) {}
}

/// The while-readers-exist capability: promotes staged nodes, swings the
/// root, and records retirements.
pub struct Publisher<'w, N: Protocol> {
    root: &'w Protected<N>,
    /// Every node a retirement token was issued for during this write.
    issued: Vec<*mut N>,
    /// Whether phase two published or retired anything. A write that did
    /// neither has nothing for readers to catch up on and skips the
    /// grace-period wait.
    dirty: bool,
}

impl<'w, N: Protocol> Publisher<'w, N> {
    pub(crate) fn new(root: &'w Protected<N>) -> Self {
        Self {
            root,
            issued: Vec::new(),
            dirty: false,
        }
    }

    /// The capability token for this phase, demanded by
    /// [`Link::store`](crate::Link::store) and
    /// [`Val::put`](crate::Val::put).
    #[inline]
    pub fn pen(&self) -> Pen<'w> {
        Pen::new()
    }

    /// Transfer a staged node into the write, yielding a linkable
    /// reference.
    ///
    /// Promotion does not publish: the node stays invisible to readers
    /// until a reference to it is installed somewhere reachable from the
    /// root. Promoting a node and then never linking or publishing it
    /// leaks it.
    pub fn promote(&mut self, node: Unpublished<N>) -> WriteRef<'w, N> {
        WriteRef::from_nonnull(node.into_nonnull())
    }

    /// Atomically install `new` as the root's head and return the prior
    /// head.
    ///
    /// Everything stored into nodes reachable from `new` before this call
    /// is visible to any reader that enters afterwards. `None` empties
    /// the root.
    pub fn publish(&mut self, new: Option<WriteRef<'w, N>>) -> Option<WriteRef<'w, N>> {
        self.dirty = true;
        let new_ptr = new.map_or(core::ptr::null_mut(), |r| r.as_raw());
        let old = self.root.head_cell().swap(new_ptr);
        trace!("published head {new_ptr:p} (was {old:p})");
        // SAFETY: the prior head was owned by this root; it now belongs
        // to the in-flight write.
        unsafe { WriteRef::from_raw(old) }
    }

    /// Record that `node` was unlinked from the published graph, yielding
    /// the token that [`Collector::demote`] will redeem after the grace
    /// period.
    ///
    /// The caller asserts the node is no longer reachable from the (new)
    /// published state. Retiring the same node twice is a contract
    /// violation and panics.
    pub fn retire(&mut self, node: WriteRef<'w, N>) -> Retired<N> {
        let ptr = node.as_raw();
        assert!(
            !self.issued.contains(&ptr),
            "quiesce: node {ptr:p} retired twice in one write"
        );
        self.issued.push(ptr);
        self.dirty = true;
        trace!("retired {ptr:p}");
        Retired::new(node.nonnull())
    }

    pub(crate) fn finish(self) -> (bool, Vec<*mut N>) {
        (self.dirty, self.issued)
    }
}

/// The teardown capability: redeems retirement tokens for owned handles
/// and follows links out of dead nodes to retire whole unlinked chains.
pub struct Collector<'t, N: Protocol> {
    issued: &'t mut Vec<*mut N>,
}

impl<'t, N: Protocol> Collector<'t, N> {
    pub(crate) fn new(issued: &'t mut Vec<*mut N>) -> Self {
        Self { issued }
    }

    /// Redeem a retirement token for exclusive ownership.
    ///
    /// The grace period has already elapsed, so dropping the returned
    /// handle runs the node's destructor immediately and safely.
    pub fn demote(&mut self, node: Retired<N>) -> Unpublished<N> {
        // SAFETY: the token proves the node was unlinked during this
        // write, and teardown runs after the grace period.
        unsafe { Unpublished::from_raw(node.into_raw()) }
    }

    /// Follow a link out of an already-demoted node, retiring its target.
    ///
    /// This is how a writer that unlinked a whole chain with one publish
    /// reclaims it: demote the head, claim its outgoing link, repeat.
    /// The caller asserts the target is unreachable from the published
    /// state; claiming a node twice is a contract violation and panics.
    pub fn claim(&mut self, link: &Link<N>) -> Option<Retired<N>> {
        let ptr = link.raw();
        let target = NonNull::new(ptr)?;
        assert!(
            !self.issued.contains(&ptr),
            "quiesce: node {ptr:p} retired twice in one write"
        );
        self.issued.push(ptr);
        Some(Retired::new(target))
    }
}
