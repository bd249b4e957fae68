use std::sync::atomic::Ordering;

use vring_primitives::RingStatus;

use crate::error::Result;
use crate::naming::TopicNames;
use crate::rings::UsedRingStatus;
use crate::segment::{Segment, Shape};

/// Diagnostics snapshot of a topic.
///
/// Counters are read without locks, so a snapshot taken while messages flow
/// may be slightly inconsistent.
#[derive(Debug, Clone)]
pub struct VringStatus {
    pub segment: String,
    pub shape: Shape,
    /// Descriptors in the avail ring.
    pub free: u32,
    /// Descriptors held by at least one reader.
    pub published: u32,
    /// Descriptors neither free nor published: owned by the writer between
    /// `get` and `put`, or in transit.
    pub in_flight: u32,
    /// Sum of all descriptor reference counts.
    pub total_refs: u64,
    pub avail: RingStatus,
    pub readers: Vec<UsedRingStatus>,
}

impl VringStatus {
    pub(crate) fn collect(segment: &Segment) -> Self {
        let shape = segment.shape();
        let mut published = 0u32;
        let mut total_refs = 0u64;
        for index in 0..shape.num_desc {
            let Ok(desc) = segment.descriptor(index) else {
                continue;
            };
            let refs = desc.refcount.load(Ordering::Acquire);
            if refs > 0 {
                published += 1;
                total_refs += u64::from(refs);
            }
        }
        let avail = segment.avail().status();
        let free = avail.len;

        Self {
            segment: segment.names().segment().to_owned(),
            shape,
            free,
            published,
            in_flight: shape.num_desc.saturating_sub(free).saturating_sub(published),
            total_refs,
            avail,
            readers: segment.used_rings().iter().map(|r| r.status()).collect(),
        }
    }

    /// Number of reader slots currently claimed.
    pub fn attached_readers(&self) -> usize {
        self.readers
            .iter()
            .filter(|r| r.state == Some(crate::layout::RingState::Ready))
            .count()
    }
}

/// Open `topic` read-only for diagnostics, without claiming a reader slot.
pub fn inspect(topic: &str) -> Result<VringStatus> {
    let names = TopicNames::new(topic)?;
    let segment = Segment::open(&names)?;
    Ok(VringStatus::collect(&segment))
}

impl std::fmt::Display for VringStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{}: msg_size={} num_desc={} max_readers={}",
            self.segment, self.shape.msg_size, self.shape.num_desc, self.shape.max_readers
        )?;
        write!(
            f,
            "descriptors: {}/{} free, {} published ({} refs), {} in flight",
            self.free, self.shape.num_desc, self.published, self.total_refs, self.in_flight
        )?;
        if self.free + self.published > self.shape.num_desc {
            write!(f, " [INCONSISTENT: free + published exceeds num_desc]")?;
        }
        writeln!(f)?;
        writeln!(f, "avail: {}", self.avail)?;
        for reader in &self.readers {
            writeln!(f, "  {}", reader)?;
        }
        Ok(())
    }
}
