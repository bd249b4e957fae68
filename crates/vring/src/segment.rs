//! The mapped shared segment and the descriptor lifecycle built on it.

use std::sync::atomic::{Ordering, fence};

use parking_lot::Mutex;
use vring_primitives::{NamedSemaphore, Region, ShmRegion};

use crate::error::{Result, VringError};
use crate::layout::{Descriptor, Meta, Offsets};
use crate::naming::TopicNames;
use crate::rings::{AvailRing, UsedRing};

/// Shape of a segment, as recorded in its [`Meta`] header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub msg_size: u32,
    pub num_desc: u32,
    pub max_readers: u32,
    pub alignment: u32,
}

/// Result of dropping one reference to a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// That was the last reference; the descriptor is back in the avail ring.
    Recycled,
    /// Other holders remain.
    Held { remaining: u32 },
    /// The reference predates a recycle and was ignored.
    Stale,
}

/// A process-local mapping of a topic's segment.
pub(crate) struct Segment {
    names: TopicNames,
    shape: Shape,
    offsets: Offsets,
    region: Region,
    avail: AvailRing,
    used: Vec<UsedRing>,
    /// Backing buffers, mapped on first use. The writer maps (and owns) all of
    /// them at creation.
    buffers: Mutex<Vec<Option<ShmRegion>>>,
    // Declared last: the views above point into it.
    _shm: ShmRegion,
}

impl Segment {
    /// Create and initialize the segment and every backing buffer.
    pub(crate) fn create(names: &TopicNames, shape: Shape) -> Result<Self> {
        let offsets = Offsets::calculate(shape.num_desc, shape.max_readers, shape.alignment)
            .map_err(VringError::InvalidConfig)?;
        let shm = ShmRegion::create(names.segment(), offsets.total)?;
        let region = shm.region();

        for index in 0..shape.num_desc {
            let desc = region.ptr_at::<Descriptor>(offsets.descriptor(index));
            // SAFETY: freshly created segment, nobody else has it mapped usefully
            // until the header below is published.
            unsafe { std::ptr::write(desc, Descriptor::new(u64::from(shape.msg_size))) };
        }
        let avail = unsafe { AvailRing::init(region, &offsets, shape.num_desc) };
        let used = (0..shape.max_readers)
            .map(|slot| unsafe { UsedRing::init(region, &offsets, slot, shape.num_desc) })
            .collect();

        let mut buffers = Vec::with_capacity(shape.num_desc as usize);
        for index in 0..shape.num_desc {
            let name = names.buffer(index, shape.msg_size);
            // Earlier buffers are unlinked by their drop if this fails.
            buffers.push(Some(ShmRegion::create(&name, shape.msg_size as usize)?));
        }
        for index in 0..shape.num_desc {
            avail.push(index)?;
        }

        let meta = Meta::new(
            shape.msg_size,
            shape.num_desc,
            shape.max_readers,
            shape.alignment,
            offsets.total as u64,
        );
        fence(Ordering::Release);
        unsafe { std::ptr::write(region.ptr_at::<Meta>(offsets.meta), meta) };
        fence(Ordering::Release);

        tracing::debug!(
            segment = names.segment(),
            size = offsets.total,
            msg_size = shape.msg_size,
            num_desc = shape.num_desc,
            max_readers = shape.max_readers,
            "created segment"
        );

        Ok(Self {
            names: names.clone(),
            shape,
            offsets,
            region,
            avail,
            used,
            buffers: Mutex::new(buffers),
            _shm: shm,
        })
    }

    /// Map an existing segment. Never creates.
    pub(crate) fn open(names: &TopicNames) -> Result<Self> {
        let shm = ShmRegion::open(names.segment())?;
        let region = shm.region();
        if region.len() < std::mem::size_of::<Meta>() {
            return Err(crate::layout::LayoutError::SegmentTooSmall {
                required: std::mem::size_of::<Meta>(),
                found: region.len(),
            }
            .into());
        }
        fence(Ordering::Acquire);
        let meta = unsafe { region.get::<Meta>(0) };
        let offsets = meta.validate(region.len())?;
        let shape = Shape {
            msg_size: meta.msg_size,
            num_desc: meta.num_desc,
            max_readers: meta.max_readers,
            alignment: meta.alignment,
        };

        let avail = unsafe { AvailRing::attach(region, &offsets) };
        let used = (0..shape.max_readers)
            .map(|slot| unsafe { UsedRing::attach(region, &offsets, slot) })
            .collect();
        let buffers = (0..shape.num_desc).map(|_| None).collect();

        tracing::debug!(segment = names.segment(), size = region.len(), "opened segment");

        Ok(Self {
            names: names.clone(),
            shape,
            offsets,
            region,
            avail,
            used,
            buffers: Mutex::new(buffers),
            _shm: shm,
        })
    }

    /// Remove every name a writer with this shape would create. Missing names
    /// are ignored.
    pub(crate) fn unlink_all(names: &TopicNames, shape: Shape) -> Result<()> {
        ShmRegion::unlink(names.segment())?;
        for index in 0..shape.num_desc {
            ShmRegion::unlink(&names.buffer(index, shape.msg_size))?;
        }
        NamedSemaphore::unlink(names.avail_sem())?;
        for slot in 0..shape.max_readers {
            NamedSemaphore::unlink(&names.used_sem(slot))?;
        }
        Ok(())
    }

    pub(crate) fn names(&self) -> &TopicNames {
        &self.names
    }

    pub(crate) fn shape(&self) -> Shape {
        self.shape
    }

    pub(crate) fn avail(&self) -> &AvailRing {
        &self.avail
    }

    pub(crate) fn used_rings(&self) -> &[UsedRing] {
        &self.used
    }

    pub(crate) fn used(&self, slot: u32) -> &UsedRing {
        &self.used[slot as usize]
    }

    pub(crate) fn descriptor(&self, index: u32) -> Result<&Descriptor> {
        if index >= self.shape.num_desc {
            return Err(VringError::InvalidIndex { index });
        }
        Ok(unsafe { self.region.get::<Descriptor>(self.offsets.descriptor(index)) })
    }

    /// Process-local address of descriptor `index`'s buffer, mapping it on
    /// first use.
    pub(crate) fn buffer_ptr(&self, index: u32) -> Result<*mut u8> {
        let size = self.descriptor(index)?.buffer_size as usize;
        let mut buffers = self.buffers.lock();
        let entry = &mut buffers[index as usize];
        if let Some(mapped) = entry {
            return Ok(mapped.as_ptr());
        }

        let name = self.names.buffer(index, self.shape.msg_size);
        let mapped = ShmRegion::open(&name).map_err(|e| {
            tracing::warn!(buffer = %name, error = %e, "failed to map message buffer");
            VringError::OutOfMemory
        })?;
        if mapped.len() < size {
            tracing::warn!(buffer = %name, len = mapped.len(), expected = size, "message buffer too small");
            return Err(VringError::OutOfMemory);
        }
        let ptr = mapped.as_ptr();
        *entry = Some(mapped);
        Ok(ptr)
    }

    /// Hand `index` back to the avail ring and wake the writer.
    pub(crate) fn recycle(&self, avail_sem: &NamedSemaphore, index: u32) -> Result<()> {
        self.avail.push(index)?;
        avail_sem.post()?;
        Ok(())
    }

    /// Drop one reference taken at `generation`.
    pub(crate) fn release_ref(
        &self,
        avail_sem: &NamedSemaphore,
        index: u32,
        generation: u32,
    ) -> Result<Release> {
        let desc = self.descriptor(index)?;
        let remaining = {
            let _guard = desc.lock.lock()?;
            let refs = desc.refcount.load(Ordering::Acquire);
            if desc.generation.load(Ordering::Acquire) != generation || refs == 0 {
                tracing::debug!(index, generation, "ignoring stale release");
                return Ok(Release::Stale);
            }
            desc.refcount.store(refs - 1, Ordering::Release);
            refs - 1
        };

        if remaining > 0 {
            return Ok(Release::Held { remaining });
        }
        self.recycle(avail_sem, index)?;
        Ok(Release::Recycled)
    }

    /// Recycle a descriptor regardless of outstanding references, provided it
    /// is still referenced and was last published at or before `cutoff`.
    /// Bumps the generation so the references still out there become stale.
    /// Returns the number of references dropped.
    pub(crate) fn force_recycle(
        &self,
        avail_sem: &NamedSemaphore,
        index: u32,
        cutoff: u64,
    ) -> Result<u32> {
        let desc = self.descriptor(index)?;
        let dropped = {
            let _guard = desc.lock.lock()?;
            let refs = desc.refcount.load(Ordering::Acquire);
            if refs == 0 || desc.published_at.load(Ordering::Acquire) > cutoff {
                return Ok(0);
            }
            desc.refcount.store(0, Ordering::Release);
            desc.generation.fetch_add(1, Ordering::AcqRel);
            refs
        };
        self.recycle(avail_sem, index)?;
        Ok(dropped)
    }

    /// Release every entry left in a `Killed` used ring, and absorb the
    /// semaphore tokens posted for them. Returns the number of references
    /// dropped.
    pub(crate) fn drain_killed(
        &self,
        slot: u32,
        avail_sem: &NamedSemaphore,
        used_sem: &NamedSemaphore,
    ) -> Result<usize> {
        let ring = self.used(slot);
        let mut released = 0;
        while let Some(elem) = ring.drain_one() {
            if self.release_ref(avail_sem, elem.id, elem.generation)? != Release::Stale {
                released += 1;
            }
        }
        while used_sem.try_wait()? {}
        Ok(released)
    }
}
