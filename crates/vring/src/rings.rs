//! Typed views of the avail ring and the used rings inside a mapped segment.

use std::sync::atomic::Ordering;

use vring_primitives::{IndexRing, PushResult, Region, RingStatus};

use crate::error::Result;
use crate::layout::{AvailHeader, Offsets, RingState, UNSAMPLED, UsedElem, UsedRingHeader};

/// Free descriptor indices. Every operation runs under the avail spinlock.
pub(crate) struct AvailRing {
    region: Region,
    header_offset: usize,
    ring: IndexRing<u32>,
}

impl AvailRing {
    /// # Safety
    ///
    /// The region must be exclusively owned and large enough for `offsets`.
    pub(crate) unsafe fn init(region: Region, offsets: &Offsets, num_desc: u32) -> Self {
        unsafe { std::ptr::write(region.ptr_at::<AvailHeader>(offsets.avail), AvailHeader::new()) };
        let ring = unsafe { IndexRing::init(region, offsets.avail_ring(), num_desc) };
        Self {
            region,
            header_offset: offsets.avail,
            ring,
        }
    }

    /// # Safety
    ///
    /// The region must hold a segment initialized with the same `offsets`.
    pub(crate) unsafe fn attach(region: Region, offsets: &Offsets) -> Self {
        Self {
            region,
            header_offset: offsets.avail,
            ring: unsafe { IndexRing::attach(region, offsets.avail_ring()) },
        }
    }

    fn header(&self) -> &AvailHeader {
        unsafe { self.region.get::<AvailHeader>(self.header_offset) }
    }

    pub(crate) fn push(&self, index: u32) -> Result<()> {
        let _guard = self.header().lock.lock()?;
        if self.ring.try_push(index).is_would_block() {
            // Each index is in the avail ring at most once, so a full ring
            // means a descriptor was released twice.
            tracing::error!(index, "avail ring full, dropping duplicate release");
        }
        Ok(())
    }

    pub(crate) fn pop(&self) -> Result<Option<u32>> {
        let _guard = self.header().lock.lock()?;
        Ok(self.ring.try_pop())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> u64 {
        self.ring.len()
    }

    pub(crate) fn status(&self) -> RingStatus {
        self.ring.status()
    }
}

/// Outcome of appending to a used ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Append {
    Pushed,
    NotReady,
    Full,
}

/// Outcome of a reader popping its own used ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pop {
    Entry(UsedElem),
    Empty,
    /// The claim no longer holds: the slot was killed or reclaimed.
    Lost,
}

/// One reader slot: header plus its queue of published entries.
pub(crate) struct UsedRing {
    slot: u32,
    region: Region,
    header_offset: usize,
    ring: IndexRing<UsedElem>,
}

impl UsedRing {
    /// # Safety
    ///
    /// The region must be exclusively owned and large enough for `offsets`.
    pub(crate) unsafe fn init(region: Region, offsets: &Offsets, slot: u32, num_desc: u32) -> Self {
        let header_offset = offsets.used_slot(slot);
        unsafe { std::ptr::write(region.ptr_at::<UsedRingHeader>(header_offset), UsedRingHeader::new()) };
        let ring = unsafe { IndexRing::init(region, offsets.used_ring(slot), num_desc) };
        Self {
            slot,
            region,
            header_offset,
            ring,
        }
    }

    /// # Safety
    ///
    /// The region must hold a segment initialized with the same `offsets`.
    pub(crate) unsafe fn attach(region: Region, offsets: &Offsets, slot: u32) -> Self {
        Self {
            slot,
            region,
            header_offset: offsets.used_slot(slot),
            ring: unsafe { IndexRing::attach(region, offsets.used_ring(slot)) },
        }
    }

    pub(crate) fn header(&self) -> &UsedRingHeader {
        unsafe { self.region.get::<UsedRingHeader>(self.header_offset) }
    }

    pub(crate) fn slot(&self) -> u32 {
        self.slot
    }

    pub(crate) fn state(&self) -> Option<RingState> {
        self.header().state()
    }

    /// Claim a free slot. Returns the new claim epoch.
    pub(crate) fn try_claim(&self, pid: u32) -> Result<Option<u32>> {
        let header = self.header();
        if header.state() != Some(RingState::Free) {
            return Ok(None);
        }
        let _guard = header.lock.lock()?;
        if header.state() != Some(RingState::Free) {
            return Ok(None);
        }
        let epoch = header.claim_epoch.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        header.owner_pid.store(pid, Ordering::Relaxed);
        header.last_heartbeat.store(UNSAMPLED, Ordering::Relaxed);
        header.state.store(RingState::Ready as u32, Ordering::Release);
        Ok(Some(epoch))
    }

    /// Whether the claim made at `epoch` still holds.
    pub(crate) fn owned_by(&self, epoch: u32) -> bool {
        let header = self.header();
        header.state() == Some(RingState::Ready)
            && header.claim_epoch.load(Ordering::Acquire) == epoch
    }

    /// Advance the heartbeat if the claim made at `epoch` still holds.
    pub(crate) fn beat(&self, epoch: u32) -> bool {
        if !self.owned_by(epoch) {
            return false;
        }
        self.header().heartbeat.fetch_add(1, Ordering::Release);
        true
    }

    /// Swap in the current heartbeat as the monitor's snapshot.
    /// Returns `(previous snapshot, current heartbeat)`.
    pub(crate) fn sample_heartbeat(&self) -> (u64, u64) {
        let header = self.header();
        let now = header.heartbeat.load(Ordering::Acquire);
        let previous = header.last_heartbeat.swap(now, Ordering::AcqRel);
        (previous, now)
    }

    /// Append an entry if the slot is `Ready`.
    pub(crate) fn append(&self, elem: UsedElem) -> Result<Append> {
        let header = self.header();
        let _guard = header.lock.lock()?;
        if header.state() != Some(RingState::Ready) {
            return Ok(Append::NotReady);
        }
        Ok(match self.ring.try_push(elem) {
            PushResult::Ok => Append::Pushed,
            PushResult::WouldBlock => Append::Full,
        })
    }

    /// Pop the oldest entry on behalf of the reader that claimed at `epoch`.
    pub(crate) fn pop_owned(&self, epoch: u32) -> Result<Pop> {
        let _guard = self.header().lock.lock()?;
        if !self.owned_by(epoch) {
            return Ok(Pop::Lost);
        }
        Ok(match self.ring.try_pop() {
            Some(elem) => Pop::Entry(elem),
            None => Pop::Empty,
        })
    }

    /// `Ready -> Killed`. With `epoch`, only if that claim is still current.
    pub(crate) fn kill(&self, epoch: Option<u32>) -> Result<bool> {
        let header = self.header();
        let _guard = header.lock.lock()?;
        let owned = match epoch {
            Some(epoch) => self.owned_by(epoch),
            None => header.state() == Some(RingState::Ready),
        };
        if owned {
            header.state.store(RingState::Killed as u32, Ordering::Release);
        }
        Ok(owned)
    }

    /// Pop without an ownership check. Only valid on a `Killed` slot.
    pub(crate) fn drain_one(&self) -> Option<UsedElem> {
        debug_assert_eq!(self.state(), Some(RingState::Killed));
        self.ring.try_pop()
    }

    /// `Killed -> Free`, making the slot claimable again.
    pub(crate) fn free(&self) {
        let header = self.header();
        header.owner_pid.store(0, Ordering::Relaxed);
        header.last_heartbeat.store(UNSAMPLED, Ordering::Relaxed);
        header.state.store(RingState::Free as u32, Ordering::Release);
    }

    pub(crate) fn status(&self) -> UsedRingStatus {
        let header = self.header();
        UsedRingStatus {
            slot: self.slot,
            state: header.state(),
            epoch: header.claim_epoch.load(Ordering::Acquire),
            owner_pid: header.owner_pid.load(Ordering::Relaxed),
            heartbeat: header.heartbeat.load(Ordering::Acquire),
            ring: self.ring.status(),
        }
    }
}

/// Diagnostics for one reader slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedRingStatus {
    pub slot: u32,
    /// `None` if the state word holds garbage.
    pub state: Option<RingState>,
    pub epoch: u32,
    pub owner_pid: u32,
    pub heartbeat: u64,
    pub ring: RingStatus,
}

impl std::fmt::Display for UsedRingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            Some(RingState::Free) => "free",
            Some(RingState::Ready) => "ready",
            Some(RingState::Killed) => "killed",
            None => "UNKNOWN",
        };
        write!(f, "slot {}: {}", self.slot, state)?;
        if self.state != Some(RingState::Free) {
            write!(
                f,
                " pid={} epoch={} heartbeat={}",
                self.owner_pid, self.epoch, self.heartbeat
            )?;
        }
        write!(f, " [{}]", self.ring)
    }
}
