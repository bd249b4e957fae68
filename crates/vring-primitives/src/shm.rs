//! Named POSIX shared memory objects mapped read-write into this process.

use std::ffi::CString;
use std::io;
use std::ptr::{self, NonNull};
use std::string::String;

use crate::region::Region;

/// A mapped POSIX shared memory object.
///
/// The creating side owns the name: dropping a created `ShmRegion` unmaps it
/// and unlinks the name. Opened regions only unmap.
#[derive(Debug)]
pub struct ShmRegion {
    base: NonNull<u8>,
    len: usize,
    name: String,
    owner: bool,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))
}

impl ShmRegion {
    /// Create a new, zero-filled object of `len` bytes. Fails with
    /// `AlreadyExists` if the name is taken.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory size must be non-zero",
            ));
        }
        let cname = c_name(name)?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mapped = truncate_and_map(fd, len);
        unsafe { libc::close(fd) };
        match mapped {
            Ok(base) => {
                tracing::debug!(name, len, "created shared memory object");
                Ok(Self {
                    base,
                    len,
                    name: name.into(),
                    owner: true,
                })
            }
            Err(e) => {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                Err(e)
            }
        }
    }

    /// Map an existing object at its current size.
    pub fn open(name: &str) -> io::Result<Self> {
        let cname = c_name(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mapped = size_of_fd(fd).and_then(|len| map(fd, len).map(|base| (base, len)));
        unsafe { libc::close(fd) };
        let (base, len) = mapped?;
        tracing::debug!(name, len, "opened shared memory object");
        Ok(Self {
            base,
            len,
            name: name.into(),
            owner: false,
        })
    }

    /// Remove a name. A missing name is not an error.
    pub fn unlink(name: &str) -> io::Result<()> {
        let cname = c_name(name)?;
        if unsafe { libc::shm_unlink(cname.as_ptr()) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(())
        } else {
            Err(err)
        }
    }

    pub fn region(&self) -> Region {
        unsafe { Region::from_raw(self.base.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

fn truncate_and_map(fd: libc::c_int, len: usize) -> io::Result<NonNull<u8>> {
    let size = libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "size out of range"))?;
    if unsafe { libc::ftruncate(fd, size) } != 0 {
        return Err(io::Error::last_os_error());
    }
    map(fd, len)
}

fn size_of_fd(fd: libc::c_int) -> io::Result<usize> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    usize::try_from(stat.st_size)
        .ok()
        .filter(|len| *len > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "shared memory object is empty"))
}

fn map(fd: libc::c_int, len: usize) -> io::Result<NonNull<u8>> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
        if self.owner {
            if let Err(e) = Self::unlink(&self.name) {
                tracing::warn!(name = %self.name, error = %e, "failed to unlink shared memory");
            }
        }
    }
}
