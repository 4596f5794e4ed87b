//! framecast - lock-light broadcast streams and read-mostly shared state.
//!
//! The core is the [`Subject`]/[`View`] pair: producers append values to
//! an unbounded stream stored in chained 64-slot frames, while any
//! number of consumers traverse the stream independently, parking only
//! when they catch up. Publication is a single atomic OR into a frame's
//! occupancy mask; the one mutex per stream exists purely to park and
//! wake sleeping consumers.
//!
//! On top of the stream:
//!
//! - [`Map`] - a read-mostly concurrent map that logs writes to a
//!   stream and serves lock-free reads from one of two alternating
//!   snapshots, swapped by a single atomic add once a reader-count
//!   barrier proves the off-duty snapshot reader-free.
//! - [`Channel`] - an unbounded MPMC queue reusing the frame layout
//!   with independent produce/consume tickets and close semantics.
//! - [`List`] - a compare-and-swap doubly-linked list.
//! - [`pipe`] - a synchronous byte rendezvous implementing the
//!   standard I/O traits.
//!
//! # Example
//!
//! ```
//! use framecast::Subject;
//! use std::thread;
//!
//! let subject = Subject::new();
//! let start = subject.set(0);
//!
//! let consumer = thread::spawn(move || {
//!     // Parks until the producer publishes each successor.
//!     let first = start.next();
//!     let second = first.next();
//!     (*first.value(), *second.value())
//! });
//!
//! subject.set(1);
//! subject.set(2);
//! assert_eq!(consumer.join().unwrap(), (1, 2));
//! ```

mod channel;
mod frame;
mod invariants;
mod list;
mod map;
mod pipe;
mod spin;
mod subject;

pub use channel::{Channel, TryDequeueError};
pub use list::{Element, List};
pub use map::Map;
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use subject::{Subject, View};
