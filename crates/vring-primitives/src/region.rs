use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// A view of a contiguous block of memory: a shared mapping, or heap memory in tests.
///
/// `Region` does not own the memory. Whoever created it keeps the backing
/// allocation (mapping, [`HeapRegion`]) alive for as long as views are in use.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: Region is a plain pointer + length; all shared mutation goes through atomics
// or is serialized by the protocol built on top of it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a view from a base pointer and a length.
    ///
    /// # Safety
    ///
    /// `base` must be non-null and valid for reads and writes of `len` bytes for
    /// as long as this view (or any copy of it) is used.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        let base = NonNull::new(base).unwrap_or_else(|| panic!("region base must be non-null"));
        Self { base, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Pointer to the byte at `offset`.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset {offset} out of region ({})", self.len);
        // SAFETY: offset is within the region (checked above).
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Typed pointer to a `T` at `offset`, bounds- and alignment-checked.
    #[inline]
    pub fn ptr_at<T>(&self, offset: usize) -> *mut T {
        let end = offset
            .checked_add(size_of::<T>())
            .unwrap_or_else(|| panic!("offset overflow"));
        assert!(end <= self.len, "type at {offset} overruns region ({})", self.len);
        let ptr = self.offset(offset);
        assert!(
            (ptr as usize).is_multiple_of(align_of::<T>()),
            "misaligned access at offset {offset}"
        );
        ptr as *mut T
    }

    /// Shared reference to the `T` at `offset`.
    ///
    /// # Safety
    ///
    /// A valid, initialized `T` must live at `offset`. Concurrent writers must only
    /// touch it through interior mutability (atomics).
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        unsafe { &*self.ptr_at::<T>(offset) }
    }

    /// A sub-view starting at `offset` spanning `len` bytes.
    pub fn subregion(&self, offset: usize, len: usize) -> Region {
        let end = offset
            .checked_add(len)
            .unwrap_or_else(|| panic!("subregion overflow"));
        assert!(end <= self.len, "subregion overruns region");
        Region {
            base: NonNull::new(self.offset(offset)).unwrap_or(self.base),
            len,
        }
    }
}

/// Zeroed, 64-byte aligned heap memory standing in for a shared mapping.
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: alloc::alloc::Layout,
}

#[cfg(any(test, feature = "alloc"))]
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    pub fn new_zeroed(len: usize) -> Self {
        let layout = alloc::alloc::Layout::from_size_align(len.max(1), 64)
            .unwrap_or_else(|_| panic!("heap region of {len} bytes is not allocatable"));
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::alloc::handle_alloc_error(layout),
        };
        Self { ptr, layout }
    }

    pub fn region(&self) -> Region {
        Region {
            base: self.ptr,
            len: self.layout.size(),
        }
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with this exact layout.
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
