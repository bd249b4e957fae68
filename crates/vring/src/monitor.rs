//! Writer-side recovery from dead readers and leaked descriptors.
//!
//! Both checks are heuristics. A reader stalled for longer than a monitor
//! tick is indistinguishable from a dead one and gets its slot reclaimed; it
//! learns about it through [`VringError::Killed`](crate::VringError::Killed)
//! on its next `get`. The staleness backstop recycles descriptors still
//! referenced after `stale_after`, which loses the message for any reader
//! that had not consumed it yet.

use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::layout::{RingState, UNSAMPLED};
use crate::writer::WriterShared;

/// What one monitor pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Reader slots reclaimed because their heartbeat stopped.
    pub killed_readers: u32,
    /// References dropped while draining reclaimed slots.
    pub drained_refs: u32,
    /// Descriptors forcibly recycled by the staleness backstop.
    pub recycled_stale: u32,
}

impl WriterShared {
    pub(crate) fn monitor_tick(&self, now: u64) -> Result<MonitorReport> {
        let mut report = MonitorReport::default();
        self.reader_heart_check(&mut report)?;
        self.check_desc_life(now, &mut report)?;
        Ok(report)
    }

    /// Reclaim every `Ready` slot whose heartbeat did not move since the
    /// previous pass.
    fn reader_heart_check(&self, report: &mut MonitorReport) -> Result<()> {
        let _fanout = self.fanout.lock();
        for ring in self.segment.used_rings() {
            if ring.state() != Some(RingState::Ready) {
                continue;
            }
            let header = ring.header();
            let epoch = header.claim_epoch.load(Ordering::Acquire);
            let (previous, heartbeat) = ring.sample_heartbeat();
            if previous == UNSAMPLED || previous != heartbeat {
                continue;
            }
            // The claim may have changed hands since the state check.
            if !ring.kill(Some(epoch))? {
                continue;
            }

            let slot = ring.slot();
            let pid = header.owner_pid.load(Ordering::Relaxed);
            let drained = self.segment.drain_killed(
                slot,
                &self.avail_sem,
                &self.used_sems[slot as usize],
            )?;
            ring.free();
            tracing::warn!(slot, pid, heartbeat, drained, "reader heartbeat stalled, slot reclaimed");

            report.killed_readers += 1;
            report.drained_refs += drained as u32;
        }
        Ok(())
    }

    /// Recycle descriptors still referenced `stale_after` after their publish.
    fn check_desc_life(&self, now: u64, report: &mut MonitorReport) -> Result<()> {
        let stale_nanos = u64::try_from(self.stale_after.as_nanos()).unwrap_or(u64::MAX);
        let Some(cutoff) = now.checked_sub(stale_nanos) else {
            return Ok(());
        };

        for index in 0..self.segment.shape().num_desc {
            let desc = self.segment.descriptor(index)?;
            if desc.refcount.load(Ordering::Acquire) == 0
                || desc.published_at.load(Ordering::Acquire) > cutoff
            {
                continue;
            }
            let dropped = self.segment.force_recycle(&self.avail_sem, index, cutoff)?;
            if dropped > 0 {
                tracing::warn!(index, refs = dropped, "recycled stale descriptor");
                report.recycled_stale += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use vring_primitives::monotonic_nanos;

    use crate::{Reader, ReaderConfig, VringConfig, VringError, Writer};

    fn topic(tag: &str) -> String {
        format!("monitor-test-{}-{}", tag, std::process::id())
    }

    fn manual_writer(tag: &str) -> Writer {
        let config = VringConfig::default()
            .with_msg_size(32)
            .with_num_desc(4)
            .with_max_readers(2)
            .with_monitor_period(Duration::from_secs(3600))
            .with_stale_after(Duration::from_secs(2));
        Writer::create(&topic(tag), config).unwrap()
    }

    fn publish(writer: &Writer, byte: u8) -> u32 {
        let mut loan = writer.get(Duration::ZERO).unwrap();
        loan.as_mut_slice()[0] = byte;
        let index = loan.index();
        writer.put(loan, 1).unwrap();
        index
    }

    #[test]
    fn silent_reader_is_reclaimed_on_second_pass() {
        let writer = manual_writer("silent");
        let reader = Reader::open(
            &topic("silent"),
            ReaderConfig::default().with_heartbeat_period(Duration::from_secs(3600)),
        )
        .unwrap();

        publish(&writer, 1);
        publish(&writer, 2);
        let held = reader.get(Duration::ZERO).unwrap();

        let now = monotonic_nanos();
        assert_eq!(writer.run_monitor(now).unwrap().killed_readers, 0);
        let report = writer.run_monitor(now).unwrap();
        assert_eq!(report.killed_readers, 1);
        assert_eq!(report.drained_refs, 1);

        assert!(reader.is_killed());
        assert!(matches!(reader.get(Duration::ZERO), Err(VringError::Killed)));
        let status = writer.status();
        assert_eq!(status.free, 3);
        assert_eq!(status.published, 1);
        assert_eq!(status.attached_readers(), 0);

        // The held buffer only comes back through the staleness backstop.
        let later = now + Duration::from_secs(3).as_nanos() as u64;
        assert_eq!(writer.run_monitor(later).unwrap().recycled_stale, 1);
        assert_eq!(writer.status().free, 4);

        // Releasing after the recycle is a harmless no-op.
        reader.put(held).unwrap();
        assert_eq!(writer.status().free, 4);
    }

    #[test]
    fn blocked_reader_learns_it_was_killed() {
        let config = VringConfig::default()
            .with_msg_size(32)
            .with_num_desc(4)
            .with_max_readers(1)
            .with_monitor_period(Duration::from_millis(20));
        let _writer = Writer::create(&topic("blocked"), config).unwrap();
        let reader = Reader::open(
            &topic("blocked"),
            ReaderConfig::default().with_heartbeat_period(Duration::from_secs(3600)),
        )
        .unwrap();

        let start = Instant::now();
        assert!(matches!(
            reader.get(Duration::from_secs(10)),
            Err(VringError::Killed)
        ));
        assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
    }

    #[test]
    fn beating_reader_survives() {
        let writer = manual_writer("alive");
        let reader = Reader::open(
            &topic("alive"),
            ReaderConfig::default().with_heartbeat_period(Duration::from_millis(2)),
        )
        .unwrap();

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(writer.run_monitor(monotonic_nanos()).unwrap().killed_readers, 0);
        }
        assert!(!reader.is_killed());
    }

    #[test]
    fn fresh_descriptors_are_not_recycled() {
        let writer = manual_writer("fresh");
        let reader = Reader::open(&topic("fresh"), ReaderConfig::default()).unwrap();
        publish(&writer, 7);

        let report = writer.run_monitor(monotonic_nanos()).unwrap();
        assert_eq!(report.recycled_stale, 0);
        let sample = reader.get(Duration::ZERO).unwrap();
        assert_eq!(sample.as_slice(), &[7]);
    }

    #[test]
    fn reclaimed_slot_can_be_claimed_again() {
        let writer = manual_writer("reclaim");
        let config = ReaderConfig::default().with_heartbeat_period(Duration::from_secs(3600));
        let first = Reader::open(&topic("reclaim"), config.clone()).unwrap();
        let _second = Reader::open(&topic("reclaim"), config.clone()).unwrap();
        assert!(matches!(
            Reader::open(&topic("reclaim"), config.clone()),
            Err(VringError::NoReaderSlot)
        ));

        let now = monotonic_nanos();
        writer.run_monitor(now).unwrap();
        assert_eq!(writer.run_monitor(now).unwrap().killed_readers, 2);

        let third = Reader::open(&topic("reclaim"), config).unwrap();
        assert!(third.slot() < 2);
        assert!(first.is_killed());
        publish(&writer, 9);
        assert!(matches!(first.get(Duration::ZERO), Err(VringError::Killed)));
        assert_eq!(third.get(Duration::ZERO).unwrap().as_slice(), &[9]);
    }
}
