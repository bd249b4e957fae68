#[cfg(not(feature = "loom"))]
pub use core::hint::spin_loop;
#[cfg(feature = "loom")]
pub use loom::hint::spin_loop;

#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

#[cfg(feature = "loom")]
pub use loom::thread;
#[cfg(all(not(feature = "loom"), any(test, feature = "std")))]
pub use std::thread;

/// Give up the CPU after a failed spin, when a scheduler is available.
#[inline]
pub(crate) fn relax(attempt: u32, yield_after: u32) {
    #[cfg(any(test, feature = "std", feature = "loom"))]
    if attempt >= yield_after {
        thread::yield_now();
        return;
    }
    let _ = (attempt, yield_after);
    spin_loop();
}
