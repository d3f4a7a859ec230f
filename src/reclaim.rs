//! Drop-time reclamation of a still-published graph.

use foldhash::{HashSet, HashSetExt};

use crate::node::Protocol;

/// Free every node reachable from `head`, each exactly once, and return
/// how many were freed.
///
/// Children are discovered through [`Protocol::for_each_link`] before the
/// node itself is freed. The seen-set deduplicates shared targets, so
/// diamond-shaped graphs are freed once per node (and an accidental cycle
/// terminates instead of looping).
///
/// # Safety
///
/// The caller must own the whole graph: no reader critical section may be
/// able to reach `head`, and no other owner may free any node in it.
pub(crate) unsafe fn reap<N: Protocol>(head: *mut N) -> usize {
    if head.is_null() {
        return 0;
    }

    let mut seen: HashSet<*mut N> = HashSet::new();
    let mut stack = vec![head];
    seen.insert(head);

    let mut freed = 0;
    while let Some(ptr) = stack.pop() {
        // Collect the children before the node goes away.
        // SAFETY: `ptr` was reachable from `head` and has not been freed
        // (the seen-set admits each node once).
        let node = unsafe { &*ptr };
        node.for_each_link(&mut |link| {
            let child = link.raw();
            if !child.is_null() && seen.insert(child) {
                stack.push(child);
            }
        });

        // SAFETY: all nodes in the graph are Box allocations owned by the
        // root, per the caller's contract.
        drop(unsafe { Box::from_raw(ptr) });
        freed += 1;
    }

    freed
}
