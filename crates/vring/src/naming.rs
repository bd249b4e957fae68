//! Rendezvous names derived from a topic.
//!
//! Writer and readers never exchange names: both derive every shared memory
//! and semaphore name from the topic string alone.

use crate::error::{Result, VringError};

/// Prefix applied to every object this crate creates.
pub const NAME_PREFIX: &str = "/vring.";

/// Longest accepted topic, leaving room for the buffer and slot suffixes
/// inside the platform's name limit.
pub const MAX_TOPIC_LEN: usize = 200;

/// All names belonging to one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    base: String,
}

impl TopicNames {
    /// Derive names for `topic`. Leading slashes are dropped and path
    /// separators are replaced, so `"sensors/imu"` and `"/sensors/imu"` meet.
    pub fn new(topic: &str) -> Result<Self> {
        let trimmed = topic.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(VringError::InvalidConfig("topic must not be empty"));
        }
        if trimmed.len() > MAX_TOPIC_LEN {
            return Err(VringError::InvalidConfig("topic too long"));
        }
        if trimmed.contains('\0') {
            return Err(VringError::InvalidConfig("topic contains NUL"));
        }
        let sanitized: String = trimmed
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        Ok(Self {
            base: format!("{NAME_PREFIX}{sanitized}"),
        })
    }

    /// The shared memory object holding the tables.
    pub fn segment(&self) -> &str {
        &self.base
    }

    /// The semaphore counting free descriptors.
    pub fn avail_sem(&self) -> &str {
        &self.base
    }

    /// The semaphore counting messages for reader slot `slot`.
    pub fn used_sem(&self, slot: u32) -> String {
        format!("{}_used{}", self.base, slot)
    }

    /// The shared memory object backing descriptor `index`.
    pub fn buffer(&self, index: u32, msg_size: u32) -> String {
        format!("{}_{}_{}", self.base, index, msg_size)
    }
}
