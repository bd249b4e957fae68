//! The single producer: owns the segment, the descriptor pool and the monitor.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use vring_primitives::{NamedSemaphore, monotonic_nanos};

use crate::config::VringConfig;
use crate::error::{Result, VringError};
use crate::layout::{Descriptor, RingState, UsedElem};
use crate::naming::TopicNames;
use crate::rings::Append;
use crate::segment::{Segment, Shape};
use crate::status::VringStatus;
use crate::ticker::Ticker;

/// State shared between the writer and its monitor thread.
pub(crate) struct WriterShared {
    pub(crate) segment: Segment,
    pub(crate) avail_sem: NamedSemaphore,
    pub(crate) used_sems: Vec<NamedSemaphore>,
    /// Which descriptors the writer holds between `get` and `put`/`drop_buffer`.
    ///
    /// Also the fan-out guard: `put` appends to used rings and the monitor
    /// kills and drains them only while holding this lock.
    pub(crate) fanout: Mutex<Vec<bool>>,
    pub(crate) stale_after: Duration,
}

/// The producer side of a topic.
///
/// Dropping the writer stops the monitor and unlinks every name it created.
/// Readers that still have the segment mapped keep their mappings.
pub struct Writer {
    shared: Arc<WriterShared>,
    monitor: Ticker,
}

/// A buffer obtained from [`Writer::get`], to be filled and then published
/// with [`Writer::put`].
///
/// Dropping an unpublished loan hands the buffer back to the pool.
pub struct Loan<'w> {
    writer: &'w Writer,
    index: u32,
    ptr: *mut u8,
    capacity: usize,
}

impl Loan<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Size of the buffer (the topic's message size).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping lives as long as the writer, and the buffer is
        // not reachable from any reader or other loan until this one is consumed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.capacity) }
    }

    /// Consume the loan without returning the buffer; the caller takes over
    /// the writer's hold on `index`.
    fn into_index(self) -> u32 {
        let index = self.index;
        std::mem::forget(self);
        index
    }
}

impl Drop for Loan<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.writer.release_loan(self.index) {
            tracing::warn!(index = self.index, error = %e, "returning unpublished buffer failed");
        }
    }
}

impl std::fmt::Debug for Loan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loan")
            .field("index", &self.index)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Writer {
    /// Create the topic: the segment, every backing buffer, the avail
    /// semaphore (pre-signaled to `num_desc`) and one used semaphore per
    /// reader slot. Starts the monitor.
    pub fn create(topic: &str, config: VringConfig) -> Result<Self> {
        config.validate()?;
        let names = TopicNames::new(topic)?;
        let shape = Shape {
            msg_size: config.msg_size,
            num_desc: config.num_desc,
            max_readers: config.max_readers,
            alignment: config.alignment,
        };
        if config.replace_existing {
            Segment::unlink_all(&names, shape)?;
        }

        let segment = Segment::create(&names, shape)?;
        let avail_sem = NamedSemaphore::create(names.avail_sem(), shape.num_desc)?;
        let used_sems = (0..shape.max_readers)
            .map(|slot| NamedSemaphore::create(&names.used_sem(slot), 0))
            .collect::<std::io::Result<Vec<_>>>()?;

        let shared = Arc::new(WriterShared {
            segment,
            avail_sem,
            used_sems,
            fanout: Mutex::new(vec![false; shape.num_desc as usize]),
            stale_after: config.stale_after,
        });

        let monitor_shared = shared.clone();
        let monitor = Ticker::spawn("vring-monitor", config.monitor_period, move || {
            if let Err(e) = monitor_shared.monitor_tick(monotonic_nanos()) {
                tracing::warn!(error = %e, "monitor tick failed");
            }
            true
        })?;

        tracing::debug!(topic, ?shape, "writer ready");
        Ok(Self { shared, monitor })
    }

    pub fn shape(&self) -> Shape {
        self.shared.segment.shape()
    }

    pub fn names(&self) -> &TopicNames {
        self.shared.segment.names()
    }

    /// Take a free buffer, waiting up to `timeout` for one to be released.
    pub fn get(&self, timeout: Duration) -> Result<Loan<'_>> {
        let shared = &*self.shared;
        if !shared.avail_sem.wait_timeout(timeout)? {
            return Err(VringError::TimedOut);
        }
        let Some(index) = shared.segment.avail().pop()? else {
            return Err(VringError::NoData);
        };

        let desc = shared.segment.descriptor(index)?;
        {
            let _guard = desc.lock.lock()?;
            let refs = desc.refcount.load(Ordering::Acquire);
            if refs != 0 {
                tracing::error!(index, refs, "descriptor from avail ring is still referenced");
                debug_assert_eq!(refs, 0, "descriptor {index} in avail ring with refs");
                desc.refcount.store(0, Ordering::Release);
            }
            desc.generation.fetch_add(1, Ordering::AcqRel);
            desc.len.store(0, Ordering::Relaxed);
        }
        shared.fanout.lock()[index as usize] = true;

        let ptr = match shared.segment.buffer_ptr(index) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.release_loan(index)?;
                return Err(e);
            }
        };
        tracing::trace!(index, "writer get");
        Ok(Loan {
            writer: self,
            index,
            ptr,
            capacity: shared.segment.shape().msg_size as usize,
        })
    }

    /// Publish the first `len` bytes of `loan` to every live reader.
    ///
    /// With no live reader the buffer goes straight back to the pool and the
    /// call fails with [`VringError::NoReaders`]. A rejected loan is dropped,
    /// which also returns its buffer.
    pub fn put(&self, loan: Loan<'_>, len: usize) -> Result<()> {
        if !std::ptr::eq(loan.writer, self) {
            return Err(VringError::InvalidIndex { index: loan.index });
        }
        let shared = &*self.shared;
        let max = shared.segment.shape().msg_size as usize;
        if len > max {
            return Err(VringError::TooLarge { len, max });
        }
        let desc = shared.segment.descriptor(loan.index)?;
        let index = loan.into_index();

        let mut held = shared.fanout.lock();
        debug_assert!(held[index as usize], "loan for descriptor {index} not held");
        let mut targets = Vec::new();
        let fanned = self.fan_out(desc, index, len, &mut targets);
        held[index as usize] = false;
        drop(held);

        // Entries appended before a failure are live: their readers must be
        // woken and the buffer must not go back to the pool.
        let mut posted = Ok(());
        for slot in &targets {
            if let Err(e) = shared.used_sems[*slot as usize].post() {
                posted = posted.and(Err(e));
            }
        }

        if targets.is_empty() {
            tracing::trace!(index, "no reader took the buffer, recycling");
            shared.segment.recycle(&shared.avail_sem, index)?;
            fanned?;
            return Err(VringError::NoReaders);
        }
        fanned?;
        posted?;
        tracing::trace!(index, len, readers = targets.len(), "writer put");
        Ok(())
    }

    /// Append `index` to every `Ready` used ring, taking one reference per
    /// ring. Slots appended to are pushed onto `targets` even on failure.
    fn fan_out(
        &self,
        desc: &Descriptor,
        index: u32,
        len: usize,
        targets: &mut Vec<u32>,
    ) -> Result<()> {
        let _guard = desc.lock.lock()?;
        let generation = desc.generation.load(Ordering::Acquire);
        desc.len.store(len as u32, Ordering::Release);
        desc.published_at.store(monotonic_nanos(), Ordering::Release);

        let elem = UsedElem::new(index, len as u32, generation);
        for ring in self.shared.segment.used_rings() {
            if ring.state() != Some(RingState::Ready) {
                continue;
            }
            match ring.append(elem)? {
                Append::Pushed => {
                    desc.refcount.fetch_add(1, Ordering::AcqRel);
                    targets.push(ring.slot());
                }
                Append::NotReady => {}
                Append::Full => {
                    tracing::warn!(slot = ring.slot(), index, "used ring full, skipping reader");
                }
            }
        }
        Ok(())
    }

    /// Return an unpublished buffer to the pool.
    pub fn drop_buffer(&self, loan: Loan<'_>) -> Result<()> {
        if !std::ptr::eq(loan.writer, self) {
            return Err(VringError::InvalidIndex { index: loan.index });
        }
        self.release_loan(loan.into_index())
    }

    fn release_loan(&self, index: u32) -> Result<()> {
        let shared = &*self.shared;
        shared.segment.descriptor(index)?;
        {
            let mut held = shared.fanout.lock();
            if !held[index as usize] {
                return Err(VringError::InvalidIndex { index });
            }
            held[index as usize] = false;
        }
        shared.segment.recycle(&shared.avail_sem, index)
    }

    /// Diagnostics snapshot.
    pub fn status(&self) -> VringStatus {
        VringStatus::collect(&self.shared.segment)
    }

    /// Run one monitor pass now, as if `now` were the current
    /// `CLOCK_MONOTONIC` time in nanoseconds.
    pub fn run_monitor(&self, now: u64) -> Result<crate::monitor::MonitorReport> {
        self.shared.monitor_tick(now)
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("segment", &self.shared.segment.names().segment())
            .field("shape", &self.shared.segment.shape())
            .finish()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.monitor.stop();
        tracing::debug!(segment = self.shared.segment.names().segment(), "writer closed");
    }
}
