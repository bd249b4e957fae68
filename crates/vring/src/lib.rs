//! Single-writer, multi-reader message rings in POSIX shared memory.
//!
//! A [`Writer`] creates a topic: one shared segment holding a descriptor
//! table, an avail ring of free descriptors and one used ring per reader
//! slot, plus a separately mapped buffer per descriptor. [`Reader`]s in other
//! processes attach by topic name, claim a slot and receive every message the
//! writer publishes afterwards, in order, without copying.
//!
//! ```text
//! Writer::get -> fill -> Writer::put ──┬─> used ring 0 -> Reader::get -> Reader::put ─┐
//!      ^                               └─> used ring N -> Reader::get -> Reader::put ─┤
//!      └──────────────────── avail ring <── last reference released ──────────────────┘
//! ```
//!
//! Buffers are reference counted across processes: publishing takes one
//! reference per live reader, and the last `put` returns the buffer to the
//! avail ring. The writer runs a monitor that reclaims slots of readers whose
//! heartbeat stopped and, as a last resort, recycles buffers that stayed
//! referenced longer than [`VringConfig::stale_after`].

mod config;
mod error;
pub mod layout;
mod monitor;
pub mod naming;
mod reader;
mod rings;
mod segment;
mod status;
mod ticker;
mod writer;

pub use config::{ReaderConfig, VringConfig};
pub use error::{Result, VringError};
pub use layout::{LayoutError, MAX_READERS, RingState};
pub use monitor::MonitorReport;
pub use naming::TopicNames;
pub use reader::{Reader, Receipt, Sample};
pub use rings::UsedRingStatus;
pub use segment::Shape;
pub use status::{VringStatus, inspect};
pub use vring_primitives::RingStatus;
pub use writer::{Loan, Writer};
