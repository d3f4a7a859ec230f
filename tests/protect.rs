//! Grace-period correctness: a node retired after a publication must not
//! be destroyed while a reader that entered before the publication is
//! still inside its critical section.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use quiesce::{Link, Protected, Protocol, Publisher, Retired, Unpublished, Val, WriteRef, Writer};

struct GateNode {
    next: Link<GateNode>,
    value: Val<u64>,
    drops: Arc<AtomicUsize>,
}

impl Drop for GateNode {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

unsafe impl Protocol for GateNode {
    fn for_each_link(&self, f: &mut dyn FnMut(&Link<GateNode>)) {
        f(&self.next);
    }
}

struct Push {
    value: u64,
    drops: Arc<AtomicUsize>,
    staged: Option<Unpublished<GateNode>>,
}

impl Writer<GateNode> for Push {
    fn setup(&mut self) -> quiesce::Result<()> {
        self.staged = Some(Unpublished::new(GateNode {
            next: Link::empty(),
            value: Val::new(self.value),
            drops: self.drops.clone(),
        }));
        Ok(())
    }

    fn while_readers_exist<'w>(
        &mut self,
        head: Option<WriteRef<'w, GateNode>>,
        publisher: &mut Publisher<'w, GateNode>,
    ) -> quiesce::Result<()> {
        let pen = publisher.pen();
        let node = publisher.promote(self.staged.take().expect("setup ran"));
        node.next.store(head, pen);
        publisher.publish(Some(node));
        Ok(())
    }
}

#[derive(Default)]
struct PopHead {
    removed: Option<Retired<GateNode>>,
}

impl Writer<GateNode> for PopHead {
    fn while_readers_exist<'w>(
        &mut self,
        head: Option<WriteRef<'w, GateNode>>,
        publisher: &mut Publisher<'w, GateNode>,
    ) -> quiesce::Result<()> {
        let pen = publisher.pen();
        if let Some(head) = head {
            publisher.publish(head.next.load(pen));
            self.removed = Some(publisher.retire(head));
        }
        Ok(())
    }

    fn teardown(&mut self, collector: &mut quiesce::Collector<'_, GateNode>) {
        if let Some(node) = self.removed.take() {
            drop(collector.demote(node));
        }
    }
}

#[test]
fn retired_node_survives_an_in_flight_reader() {
    let drops = Arc::new(AtomicUsize::new(0));
    let root = Arc::new(Protected::<GateNode>::empty());
    root.write(&mut Push {
        value: 42,
        drops: drops.clone(),
        staged: None,
    })
    .unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    // A reader that enters, reports in, and then parks inside its
    // critical section while holding a reference to the head node.
    let reader = {
        let root = root.clone();
        thread::spawn(move || {
            root.read(|guard, head| {
                let node = head.expect("head was published");
                entered_tx.send(node.value.get(guard)).unwrap();
                release_rx.recv().unwrap();
                // Still inside the critical section: the node must still
                // be alive even though the writer has retired it by now.
                node.value.get(guard)
            })
        })
    };

    assert_eq!(entered_rx.recv().unwrap(), 42);

    // The writer unlinks the node and blocks in its grace-period wait.
    let writer = {
        let root = root.clone();
        thread::spawn(move || {
            root.write(&mut PopHead::default()).unwrap();
        })
    };

    // Give the writer ample time to reach the wait; the destructor must
    // not have run while the reader holds its guard.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    release_tx.send(()).unwrap();
    writer.join().unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    assert_eq!(reader.join().unwrap(), 42);
    assert!(root.read(|_, head| head.is_none()));
}

#[test]
fn reader_entering_after_the_unlink_sees_the_new_state() {
    let drops = Arc::new(AtomicUsize::new(0));
    let root = Arc::new(Protected::<GateNode>::empty());
    root.write(&mut Push {
        value: 7,
        drops: drops.clone(),
        staged: None,
    })
    .unwrap();

    root.write(&mut PopHead::default()).unwrap();

    // The unlink completed with no readers in flight; a reader entering
    // now must observe the empty root, not the destroyed node.
    assert!(root.read(|_, head| head.is_none()));
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}
