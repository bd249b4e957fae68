//! A consumer attached to one used-ring slot.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use vring_primitives::NamedSemaphore;

use crate::config::ReaderConfig;
use crate::error::{Result, VringError};
use crate::naming::TopicNames;
use crate::rings::Pop;
use crate::segment::{Release, Segment, Shape};
use crate::ticker::Ticker;

/// The consumer side of a topic.
///
/// Holds one used-ring slot for its whole life. Dropping the reader (or
/// [`Reader::close`]) releases every buffer it still holds or has not
/// consumed yet and frees the slot.
pub struct Reader {
    segment: Arc<Segment>,
    slot: u32,
    epoch: u32,
    avail_sem: NamedSemaphore,
    used_sem: NamedSemaphore,
    /// Generation of every descriptor taken by `get` and not yet `put`.
    held: Mutex<Vec<Option<u32>>>,
    heartbeat: Option<Ticker>,
    closed: bool,
}

/// A received message.
///
/// Passing it to [`Reader::put`] or dropping it releases the buffer; keep it
/// alive as long as the data is needed.
pub struct Sample<'r> {
    reader: &'r Reader,
    index: u32,
    generation: u32,
    ptr: *const u8,
    len: usize,
}

impl Sample<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the writer does not touch a published buffer until every
        // reader has released it, and the mapping lives as long as the reader.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Give up access to the data but keep the reference, to be released
    /// later with [`Reader::release`].
    pub fn into_receipt(self) -> Receipt {
        let receipt = Receipt {
            index: self.index,
            generation: self.generation,
            slot: self.reader.slot,
            epoch: self.reader.epoch,
        };
        std::mem::forget(self);
        receipt
    }
}

impl Drop for Sample<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.reader.release_held(self.index, self.generation) {
            tracing::warn!(index = self.index, error = %e, "releasing sample failed");
        }
    }
}

impl std::fmt::Debug for Sample<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

/// A buffer reference kept without its data, see [`Sample::into_receipt`].
///
/// Only the reader that issued it can release it. A receipt never released
/// is released when the reader shuts down.
#[derive(Debug, PartialEq, Eq)]
pub struct Receipt {
    index: u32,
    generation: u32,
    slot: u32,
    epoch: u32,
}

impl Receipt {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Longest a blocked `get` sleeps before checking whether its slot was reclaimed.
const KILL_CHECK_PERIOD: Duration = Duration::from_millis(50);

impl Reader {
    /// Attach to an existing topic, claiming the first free reader slot.
    pub fn open(topic: &str, config: ReaderConfig) -> Result<Self> {
        let names = TopicNames::new(topic)?;
        let segment = Arc::new(Segment::open(&names)?);
        let avail_sem = NamedSemaphore::open(names.avail_sem())?;

        let pid = std::process::id();
        let mut claimed = None;
        for ring in segment.used_rings() {
            if let Some(epoch) = ring.try_claim(pid)? {
                claimed = Some((ring.slot(), epoch));
                break;
            }
        }
        let Some((slot, epoch)) = claimed else {
            return Err(VringError::NoReaderSlot);
        };
        let ring = segment.used(slot);
        ring.beat(epoch);

        let used_sem = match NamedSemaphore::open(&names.used_sem(slot)) {
            Ok(sem) => sem,
            Err(e) => {
                if ring.kill(Some(epoch))? {
                    ring.free();
                }
                return Err(e.into());
            }
        };

        let held = Mutex::new(vec![None; segment.shape().num_desc as usize]);
        let mut reader = Self {
            segment,
            slot,
            epoch,
            avail_sem,
            used_sem,
            held,
            heartbeat: None,
            closed: false,
        };

        let beat_segment = reader.segment.clone();
        reader.heartbeat = Some(Ticker::spawn(
            "vring-heartbeat",
            config.heartbeat_period,
            move || beat_segment.used(slot).beat(epoch),
        )?);

        tracing::debug!(topic, slot, epoch, "reader attached");
        Ok(reader)
    }

    /// The used-ring slot this reader claimed.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn shape(&self) -> Shape {
        self.segment.shape()
    }

    /// Whether the writer has reclaimed this reader's slot.
    pub fn is_killed(&self) -> bool {
        !self.segment.used(self.slot).owned_by(self.epoch)
    }

    /// Receive the next message, waiting up to `timeout`.
    ///
    /// Fails with [`VringError::Killed`] once the writer has reclaimed the
    /// slot, including while blocked; the reader is then unusable for
    /// receiving.
    pub fn get(&self, timeout: Duration) -> Result<Sample<'_>> {
        let ring = self.segment.used(self.slot);
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if !ring.owned_by(self.epoch) {
                return Err(VringError::Killed);
            }
            let remaining = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::MAX);
            if self.used_sem.wait_timeout(remaining.min(KILL_CHECK_PERIOD))? {
                break;
            }
            if remaining <= KILL_CHECK_PERIOD {
                if !ring.owned_by(self.epoch) {
                    return Err(VringError::Killed);
                }
                return Err(VringError::TimedOut);
            }
        }

        loop {
            let elem = match ring.pop_owned(self.epoch)? {
                Pop::Entry(elem) => elem,
                Pop::Empty => return Err(VringError::NoMessage),
                Pop::Lost => return Err(VringError::Killed),
            };

            let desc = self.segment.descriptor(elem.id)?;
            if desc.generation.load(Ordering::Acquire) != elem.generation {
                // Recycled by the staleness backstop; nothing to release. The
                // next entry's token is taken here to keep the count in step.
                tracing::debug!(index = elem.id, "skipping recycled entry");
                self.used_sem.try_wait()?;
                continue;
            }

            let ptr = match self.segment.buffer_ptr(elem.id) {
                Ok(ptr) => ptr,
                Err(e) => {
                    self.segment
                        .release_ref(&self.avail_sem, elem.id, elem.generation)?;
                    return Err(e);
                }
            };
            self.held.lock()[elem.id as usize] = Some(elem.generation);
            tracing::trace!(slot = self.slot, index = elem.id, len = elem.len, "reader get");
            return Ok(Sample {
                reader: self,
                index: elem.id,
                generation: elem.generation,
                ptr,
                len: elem.len as usize,
            });
        }
    }

    /// Release a buffer obtained from [`Reader::get`].
    ///
    /// A sample from another reader is rejected with
    /// [`VringError::InvalidIndex`] and released by its own reader instead.
    pub fn put(&self, sample: Sample<'_>) -> Result<()> {
        if !std::ptr::eq(sample.reader, self) {
            return Err(VringError::InvalidIndex { index: sample.index });
        }
        let (index, generation) = (sample.index, sample.generation);
        std::mem::forget(sample);
        self.release_held(index, generation)
    }

    /// Release a reference kept through [`Sample::into_receipt`].
    pub fn release(&self, receipt: Receipt) -> Result<()> {
        if receipt.slot != self.slot || receipt.epoch != self.epoch {
            return Err(VringError::InvalidIndex { index: receipt.index });
        }
        self.release_held(receipt.index, receipt.generation)
    }

    fn release_held(&self, index: u32, generation: u32) -> Result<()> {
        {
            let mut held = self.held.lock();
            let entry = held
                .get_mut(index as usize)
                .ok_or(VringError::InvalidIndex { index })?;
            match *entry {
                Some(current) if current == generation => *entry = None,
                // Force-recycled and handed to this reader again since.
                Some(_) => return Ok(()),
                None => return Err(VringError::InvalidIndex { index }),
            }
        }

        let release = self
            .segment
            .release_ref(&self.avail_sem, index, generation)?;
        tracing::trace!(slot = self.slot, index, ?release, "reader put");
        Ok(())
    }

    /// Detach, reporting failures that `Drop` can only log.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }

        let mut released = 0usize;
        let ring = self.segment.used(self.slot);
        if ring.kill(Some(self.epoch))? {
            released += self
                .segment
                .drain_killed(self.slot, &self.avail_sem, &self.used_sem)?;
            ring.free();
        }

        let held: Vec<(u32, u32)> = self
            .held
            .lock()
            .iter_mut()
            .enumerate()
            .filter_map(|(index, generation)| generation.take().map(|g| (index as u32, g)))
            .collect();
        for (index, generation) in held {
            if self.segment.release_ref(&self.avail_sem, index, generation)? != Release::Stale {
                released += 1;
            }
        }

        tracing::debug!(slot = self.slot, released, "reader detached");
        Ok(())
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("segment", &self.segment.names().segment())
            .field("slot", &self.slot)
            .field("epoch", &self.epoch)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(slot = self.slot, error = %e, "reader shutdown failed");
        }
    }
}
