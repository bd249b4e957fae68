//! Named POSIX counting semaphores for blocking handoff between processes.

use std::ffi::CString;
use std::io;
use std::string::String;
use std::time::Duration;

/// A named counting semaphore.
///
/// Like [`ShmRegion`](crate::ShmRegion), the creating side owns the name and
/// unlinks it on drop.
#[derive(Debug)]
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
    owner: bool,
}

// SAFETY: sem_t handles are process-wide and the sem_* calls are thread-safe.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))
}

impl NamedSemaphore {
    /// Create a semaphore with `initial` tokens. Fails with `AlreadyExists`
    /// if the name is taken.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        let cname = c_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        tracing::debug!(name, initial, "created semaphore");
        Ok(Self {
            sem,
            name: name.into(),
            owner: true,
        })
    }

    pub fn open(name: &str) -> io::Result<Self> {
        let cname = c_name(name)?;
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            sem,
            name: name.into(),
            owner: false,
        })
    }

    /// Remove a name. A missing name is not an error.
    pub fn unlink(name: &str) -> io::Result<()> {
        let cname = c_name(name)?;
        if unsafe { libc::sem_unlink(cname.as_ptr()) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(())
        } else {
            Err(err)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Take a token if one is available. `Ok(false)` when the count is zero.
    pub fn try_wait(&self) -> io::Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Take a token, blocking up to `timeout`. `Ok(false)` on timeout; a zero
    /// timeout only tries once.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        if timeout.is_zero() {
            return self.try_wait();
        }
        self.timed_wait(timeout)
    }

    #[cfg(target_os = "linux")]
    fn timed_wait(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = realtime_deadline(timeout)?;
        loop {
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    // No sem_timedwait outside Linux: poll.
    #[cfg(not(target_os = "linux"))]
    fn timed_wait(&self, timeout: Duration) -> io::Result<bool> {
        let start = std::time::Instant::now();
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(target_os = "linux")]
fn realtime_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    let secs = (now.tv_sec as u64)
        .saturating_add(timeout.as_secs())
        .saturating_add(nanos / 1_000_000_000);

    let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
    deadline.tv_sec = secs.min(libc::time_t::MAX as u64) as libc::time_t;
    deadline.tv_nsec = (nanos % 1_000_000_000) as _;
    Ok(deadline)
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
        if self.owner {
            if let Err(e) = Self::unlink(&self.name) {
                tracing::warn!(name = %self.name, error = %e, "failed to unlink semaphore");
            }
        }
    }
}
