use std::time::Duration;

use crate::error::{Result, VringError};
use crate::layout::{MAX_READERS, MIN_ALIGNMENT};

/// Writer-side configuration.
///
/// The shape fields (`msg_size`, `num_desc`, `max_readers`, `alignment`) are
/// written into the segment header; readers pick them up from there.
#[derive(Debug, Clone)]
pub struct VringConfig {
    /// Size of every message buffer, in bytes.
    pub msg_size: u32,
    /// Number of descriptors (message buffers) in the pool.
    pub num_desc: u32,
    /// Number of used-ring slots, i.e. readers that can attach at once.
    pub max_readers: u32,
    /// Alignment of every table inside the segment.
    pub alignment: u32,
    /// Tick of the dead-reader and stale-descriptor monitor.
    pub monitor_period: Duration,
    /// Age after which a still-referenced descriptor is forcibly recycled.
    pub stale_after: Duration,
    /// Unlink names left behind by a crashed writer before creating.
    pub replace_existing: bool,
}

impl Default for VringConfig {
    fn default() -> Self {
        Self {
            msg_size: 4096,
            num_desc: 16,
            max_readers: 8,
            alignment: MIN_ALIGNMENT,
            monitor_period: Duration::from_millis(500),
            stale_after: Duration::from_secs(2),
            replace_existing: false,
        }
    }
}

impl VringConfig {
    /// Single-reader configuration.
    pub fn spsc() -> Self {
        Self {
            max_readers: 1,
            ..Self::default()
        }
    }

    pub fn with_msg_size(mut self, msg_size: u32) -> Self {
        self.msg_size = msg_size;
        self
    }

    pub fn with_num_desc(mut self, num_desc: u32) -> Self {
        self.num_desc = num_desc;
        self
    }

    pub fn with_max_readers(mut self, max_readers: u32) -> Self {
        self.max_readers = max_readers;
        self
    }

    pub fn with_alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_monitor_period(mut self, period: Duration) -> Self {
        self.monitor_period = period;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.msg_size == 0 {
            return Err(VringError::InvalidConfig("msg_size must be non-zero"));
        }
        if self.num_desc == 0 {
            return Err(VringError::InvalidConfig("num_desc must be non-zero"));
        }
        if self.max_readers == 0 || self.max_readers > MAX_READERS {
            return Err(VringError::InvalidConfig("max_readers out of range"));
        }
        if !self.alignment.is_power_of_two() || self.alignment < MIN_ALIGNMENT {
            return Err(VringError::InvalidConfig(
                "alignment must be a power of two of at least 64",
            ));
        }
        if self.monitor_period.is_zero() {
            return Err(VringError::InvalidConfig("monitor_period must be non-zero"));
        }
        Ok(())
    }
}

/// Reader-side configuration.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// How often the heartbeat thread bumps the slot's counter. Must be
    /// comfortably shorter than the writer's monitor period.
    pub heartbeat_period: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_millis(100),
        }
    }
}

impl ReaderConfig {
    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        VringConfig::default().validate().unwrap();
        assert_eq!(VringConfig::spsc().max_readers, 1);
    }

    #[test]
    fn rejects_bad_shapes() {
        let cases = [
            VringConfig::default().with_msg_size(0),
            VringConfig::default().with_num_desc(0),
            VringConfig::default().with_max_readers(0),
            VringConfig::default().with_max_readers(MAX_READERS + 1),
            VringConfig::default().with_alignment(96),
            VringConfig::default().with_alignment(32),
            VringConfig::default().with_monitor_period(Duration::ZERO),
        ];
        for cfg in cases {
            assert!(
                matches!(cfg.validate(), Err(VringError::InvalidConfig(_))),
                "{cfg:?} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_wide_alignment() {
        VringConfig::default().with_alignment(4096).validate().unwrap();
    }
}
