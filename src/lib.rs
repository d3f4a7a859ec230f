//! Quiesce: read-copy-update synchronization for linked data structures.
//!
//! Quiesce lets any number of reader threads traverse a shared linked
//! structure without locks or read-modify-write operations, while a
//! serialized writer installs new versions with a single atomic pointer
//! publication and defers freeing unlinked nodes until every reader that
//! could still see them has left its critical section.
//!
//! # Key Features
//!
//! - **Wait-Free Readers**: a read critical section costs one epoch-slot
//!   store on entry and plain acquire loads while traversing
//! - **Typed Reference Discipline**: separate read, write, unpublished and
//!   retired views over one node layout, so linking an unconstructed node
//!   into the published graph is a compile error
//! - **Atomic Publication**: a freshly built subgraph becomes visible to
//!   readers in one pointer swap, whole or not at all
//! - **Grace-Period Reclamation**: retired nodes are destroyed only after
//!   every pre-publication reader has departed
//!
//! # Example
//!
//! ```
//! use quiesce::{Link, Protected, Protocol, Publisher, Unpublished, Val, WriteRef, Writer};
//!
//! struct Node {
//!     next: Link<Node>,
//!     value: Val<u64>,
//! }
//!
//! unsafe impl Protocol for Node {
//!     fn for_each_link(&self, f: &mut dyn FnMut(&Link<Node>)) {
//!         f(&self.next);
//!     }
//! }
//!
//! struct Push {
//!     value: u64,
//!     staged: Option<Unpublished<Node>>,
//! }
//!
//! impl Writer<Node> for Push {
//!     fn setup(&mut self) -> quiesce::Result<()> {
//!         self.staged = Some(Unpublished::new(Node {
//!             next: Link::empty(),
//!             value: Val::new(self.value),
//!         }));
//!         Ok(())
//!     }
//!
//!     fn while_readers_exist<'w>(
//!         &mut self,
//!         head: Option<WriteRef<'w, Node>>,
//!         publisher: &mut Publisher<'w, Node>,
//!     ) -> quiesce::Result<()> {
//!         let pen = publisher.pen();
//!         let node = publisher.promote(self.staged.take().expect("setup ran"));
//!         node.next.store(head, pen);
//!         publisher.publish(Some(node));
//!         Ok(())
//!     }
//! }
//!
//! let list = Protected::<Node>::empty();
//! list.write(&mut Push { value: 7, staged: None })?;
//!
//! let front = list.read(|guard, head| head.map(|node| node.value.get(guard)));
//! assert_eq!(front, Some(7));
//! # Ok::<(), quiesce::WriteError>(())
//! ```

#![warn(missing_docs)]

mod epoch;
mod node;
mod reclaim;
mod refs;
mod root;
mod writer;

pub use epoch::{pin, ReadGuard, MAX_READERS};
pub use node::{Link, Protocol, Unpublished, Val};
pub use refs::{Pen, ReadRef, Retired, WriteRef};
pub use root::Protected;
pub use writer::{Collector, Publisher, Result, WriteError, Writer};
