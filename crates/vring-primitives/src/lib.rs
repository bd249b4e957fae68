//! Building blocks for shared memory rings shared between processes.
//!
//! Everything here works on raw mapped memory through [`Region`] views, so the
//! same code runs over a POSIX shared mapping or over heap memory in tests.
//!
//! # Primitives
//!
//! - [`SpinLock`]: a one-word lock with a bounded retry budget that reports
//!   [`Deadlock`] instead of spinning forever on a dead holder
//! - [`IndexRing`]: a bounded circular queue with a single producer and a
//!   compare-and-swap claimed consumer cursor
//!
//! With the `std` feature the crate also provides the POSIX plumbing:
//! [`ShmRegion`] (named shared memory), [`NamedSemaphore`] and
//! [`monotonic_nanos`].
//!
//! # Loom Testing
//!
//! Enable the `loom` feature to model-check the spinlock and the ring:
//!
//! ```text
//! cargo test -p vring-primitives --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod region;
pub mod ring;
pub mod spinlock;
pub mod sync;

#[cfg(feature = "std")]
mod clock;
#[cfg(feature = "std")]
pub mod semaphore;
#[cfg(feature = "std")]
pub mod shm;

#[cfg(feature = "std")]
pub use clock::monotonic_nanos;
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use ring::{IndexRing, PushResult, RingHeader, RingStatus};
#[cfg(feature = "std")]
pub use semaphore::NamedSemaphore;
#[cfg(feature = "std")]
pub use shm::ShmRegion;
pub use spinlock::{DEFAULT_SPIN_LIMIT, Deadlock, SpinGuard, SpinLock};

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
