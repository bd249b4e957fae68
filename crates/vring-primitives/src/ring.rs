//! Bounded circular queue of small `Copy` entries living in shared memory.
//!
//! One producer at a time appends at `head`; callers with several producers
//! serialize them externally (the avail ring does so with a [`SpinLock`]).
//! Consumers claim entries by compare-and-swap on `tail`, so any number of
//! parties may pop concurrently and each entry is handed out exactly once.
//!
//! Capacity is arbitrary (not restricted to powers of two): the cursors are
//! free-running `u64` counters and the slot is `cursor % capacity`.
//!
//! [`SpinLock`]: crate::SpinLock

use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr;

use crate::region::Region;
use crate::sync::{AtomicU64, Ordering};

/// Ring header (192 bytes, producer and consumer cursors on separate cache lines).
#[repr(C)]
pub struct RingHeader {
    /// Producer cursor: number of entries ever published.
    pub head: AtomicU64,
    _pad1: [u8; 56],

    /// Consumer cursor: number of entries ever claimed.
    pub tail: AtomicU64,
    _pad2: [u8; 56],

    /// Number of entry slots, immutable after init.
    pub capacity: u32,
    _pad3: [u8; 60],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(size_of::<RingHeader>() == 192);

impl RingHeader {
    fn new(capacity: u32) -> Self {
        Self {
            head: AtomicU64::new(0),
            _pad1: [0; 56],
            tail: AtomicU64::new(0),
            _pad2: [0; 56],
            capacity,
            _pad3: [0; 60],
        }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.saturating_sub(tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity as u64
    }
}

/// Result of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Ok,
    WouldBlock,
}

impl PushResult {
    #[inline]
    pub fn is_would_block(self) -> bool {
        matches!(self, PushResult::WouldBlock)
    }
}

/// A view of an index ring placed at `header_offset` inside a [`Region`].
pub struct IndexRing<T> {
    region: Region,
    header_offset: usize,
    entries_offset: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for IndexRing<T> {}
unsafe impl<T: Send> Sync for IndexRing<T> {}

impl<T> Clone for IndexRing<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            header_offset: self.header_offset,
            entries_offset: self.entries_offset,
            _marker: PhantomData,
        }
    }
}

impl<T: Copy> IndexRing<T> {
    /// Bytes needed for a ring of `capacity` entries (header included).
    pub const fn required_size(capacity: u32) -> usize {
        size_of::<RingHeader>() + capacity as usize * size_of::<T>()
    }

    /// Initialize a new, empty ring in the region.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let ring = unsafe { Self::view(region, header_offset, capacity) };
        let header = region.ptr_at::<RingHeader>(header_offset);
        unsafe { ptr::write(header, RingHeader::new(capacity)) };
        ring
    }

    /// Attach to a ring some other party initialized.
    ///
    /// # Safety
    ///
    /// The region must contain a valid, initialized ring header at `header_offset`.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Self {
        let capacity = unsafe { region.get::<RingHeader>(header_offset) }.capacity;
        assert!(capacity > 0, "invalid ring capacity");
        unsafe { Self::view(region, header_offset, capacity) }
    }

    unsafe fn view(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );
        assert!(align_of::<T>() <= 64, "entry alignment must be <= 64");

        let entries_offset = header_offset + size_of::<RingHeader>();
        let required = header_offset + Self::required_size(capacity);
        assert!(required <= region.len(), "region too small for ring");

        Self {
            region,
            header_offset,
            entries_offset,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        unsafe { self.region.get::<RingHeader>(self.header_offset) }
    }

    #[inline]
    fn entry_ptr(&self, cursor: u64) -> *mut T {
        let slot = (cursor % self.header().capacity as u64) as usize;
        let base = self.region.offset(self.entries_offset);
        unsafe { base.add(slot * size_of::<T>()) as *mut T }
    }

    /// Append an entry.
    ///
    /// Producers must be serialized: at most one `try_push` may run at a time
    /// across every process sharing the ring.
    pub fn try_push(&self, entry: T) -> PushResult {
        let header = self.header();
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= header.capacity as u64 {
            return PushResult::WouldBlock;
        }

        unsafe { ptr::write_volatile(self.entry_ptr(head), entry) };
        header.head.store(head.wrapping_add(1), Ordering::Release);
        PushResult::Ok
    }

    /// Claim the oldest entry.
    pub fn try_pop(&self) -> Option<T> {
        let header = self.header();
        let mut tail = header.tail.load(Ordering::Acquire);
        loop {
            let head = header.head.load(Ordering::Acquire);
            if tail >= head {
                return None;
            }

            // The slot cannot be reused before `tail` moves past it, so the value
            // read here is valid whenever the claim below succeeds.
            let entry = unsafe { ptr::read_volatile(self.entry_ptr(tail)) };
            match header.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(entry),
                Err(actual) => tail = actual,
            }
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.header().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header().is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.header().is_full()
    }

    pub fn status(&self) -> RingStatus {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        RingStatus {
            head,
            tail,
            capacity: header.capacity,
            len: head.saturating_sub(tail) as u32,
        }
    }
}

/// Status snapshot of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatus {
    pub head: u64,
    pub tail: u64,
    pub capacity: u32,
    pub len: u32,
}

impl fmt::Display for RingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "head={} tail={} len={}/{}",
            self.head, self.tail, self.len, self.capacity
        )
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn ring(owner: &HeapRegion, capacity: u32) -> IndexRing<u32> {
        unsafe { IndexRing::init(owner.region(), 0, capacity) }
    }

    #[test]
    fn push_pop_in_order() {
        let owner = HeapRegion::new_zeroed(1024);
        let ring = ring(&owner, 4);
        assert!(ring.is_empty());
        for i in 0..4 {
            assert_eq!(ring.try_push(i), PushResult::Ok);
        }
        assert!(ring.is_full());
        assert!(ring.try_push(99).is_would_block());
        for i in 0..4 {
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn wraps_with_odd_capacity() {
        let owner = HeapRegion::new_zeroed(1024);
        let ring = ring(&owner, 3);
        for round in 0..10u32 {
            assert_eq!(ring.try_push(round * 2), PushResult::Ok);
            assert_eq!(ring.try_push(round * 2 + 1), PushResult::Ok);
            assert_eq!(ring.try_pop(), Some(round * 2));
            assert_eq!(ring.try_pop(), Some(round * 2 + 1));
        }
        let status = ring.status();
        assert_eq!(status.head, 20);
        assert_eq!(status.tail, 20);
        assert_eq!(status.len, 0);
    }

    #[test]
    fn attach_sees_initialized_ring() {
        let owner = HeapRegion::new_zeroed(1024);
        let ring = unsafe { IndexRing::<u64>::init(owner.region(), 64, 5) };
        ring.try_push(7);
        let other = unsafe { IndexRing::<u64>::attach(owner.region(), 64) };
        assert_eq!(other.capacity(), 5);
        assert_eq!(other.try_pop(), Some(7));
        assert!(ring.is_empty());
    }

    #[test]
    fn required_size_counts_header_and_entries() {
        assert_eq!(IndexRing::<u32>::required_size(8), 192 + 32);
        assert_eq!(IndexRing::<[u32; 4]>::required_size(3), 192 + 48);
    }

    #[test]
    #[should_panic(expected = "region too small")]
    fn init_rejects_short_region() {
        let owner = HeapRegion::new_zeroed(200);
        let _ = ring(&owner, 8);
    }
}
