use std::fmt;
use std::io;

use vring_primitives::Deadlock;

use crate::layout::LayoutError;

/// Errors from writer and reader operations.
///
/// Every variant maps to the errno a C caller of this transport would see,
/// see [`VringError::errno`].
#[derive(Debug)]
pub enum VringError {
    /// A backing buffer could not be mapped (ENOMEM).
    OutOfMemory,
    /// Every used-ring slot is claimed (ENOSPC).
    NoReaderSlot,
    /// Nothing arrived before the timeout (ETIMEDOUT).
    TimedOut,
    /// The avail ring was empty after the semaphore fired (ENODATA).
    NoData,
    /// The used ring was empty after the semaphore fired (ENOMSG).
    NoMessage,
    /// The writer reclaimed this reader's slot (EBADF). Fatal for the reader.
    Killed,
    /// Descriptor index out of range or not held by the caller (EINVAL).
    InvalidIndex { index: u32 },
    /// Payload longer than the message size (EINVAL).
    TooLarge { len: usize, max: usize },
    /// `put` found no live reader; the buffer went back to the pool (ENOLINK).
    NoReaders,
    /// A spinlock holder is presumed dead (EDEADLK).
    Deadlock,
    /// The segment does not exist (ENOENT).
    NotFound,
    /// A segment or semaphore with this name already exists (EEXIST).
    AlreadyExists,
    /// Rejected configuration.
    InvalidConfig(&'static str),
    /// An opened segment failed validation.
    Layout(LayoutError),
    /// Any other OS failure.
    Io(io::Error),
}

pub type Result<T, E = VringError> = std::result::Result<T, E>;

impl VringError {
    /// The errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::OutOfMemory => libc::ENOMEM,
            Self::NoReaderSlot => libc::ENOSPC,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::NoData => libc::ENODATA,
            Self::NoMessage => libc::ENOMSG,
            Self::Killed => libc::EBADF,
            Self::InvalidIndex { .. } | Self::TooLarge { .. } | Self::InvalidConfig(_) => {
                libc::EINVAL
            }
            Self::NoReaders => libc::ENOLINK,
            Self::Deadlock => libc::EDEADLK,
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::Layout(_) => libc::EPROTO,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether the caller can simply retry or treat the call as a no-op.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TimedOut | Self::NoData | Self::NoMessage | Self::NoReaders
        )
    }
}

impl fmt::Display for VringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "failed to map message buffer"),
            Self::NoReaderSlot => write!(f, "no free reader slot"),
            Self::TimedOut => write!(f, "timed out"),
            Self::NoData => write!(f, "no free descriptor"),
            Self::NoMessage => write!(f, "no message available"),
            Self::Killed => write!(f, "reader slot was reclaimed by the writer"),
            Self::InvalidIndex { index } => write!(f, "invalid descriptor index {}", index),
            Self::TooLarge { len, max } => {
                write!(f, "payload too large: {} bytes, max {}", len, max)
            }
            Self::NoReaders => write!(f, "no live reader"),
            Self::Deadlock => write!(f, "spinlock deadlock detected"),
            Self::NotFound => write!(f, "segment not found"),
            Self::AlreadyExists => write!(f, "segment already exists"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for VringError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Layout(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for VringError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            _ => Self::Io(e),
        }
    }
}

impl From<LayoutError> for VringError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<Deadlock> for VringError {
    fn from(_: Deadlock) -> Self {
        Self::Deadlock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(VringError::NoReaderSlot.errno(), libc::ENOSPC);
        assert_eq!(VringError::Killed.errno(), libc::EBADF);
        assert_eq!(VringError::NoReaders.errno(), libc::ENOLINK);
        assert_eq!(VringError::InvalidIndex { index: 9 }.errno(), libc::EINVAL);
        assert_eq!(VringError::from(Deadlock).errno(), libc::EDEADLK);
    }

    #[test]
    fn io_errors_fold_into_named_variants() {
        let err = VringError::from(io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(err, VringError::NotFound));
        let err = VringError::from(io::Error::from_raw_os_error(libc::EEXIST));
        assert!(matches!(err, VringError::AlreadyExists));
        let err = VringError::from(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn recoverability_follows_policy() {
        assert!(VringError::TimedOut.is_recoverable());
        assert!(VringError::NoMessage.is_recoverable());
        assert!(!VringError::Killed.is_recoverable());
        assert!(!VringError::Deadlock.is_recoverable());
    }
}
