//! Shared segment memory layout.
//!
//! All structures are `repr(C)` and live inside one named shared memory
//! object. Every table starts on an `alignment` boundary so records touched
//! by processes on different cores do not share cache lines.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------------------------------------------------------------+
//! | META (64 bytes)                                                   |
//! |   magic: "VRING\0\0\0", version, msg_size, num_desc, max_readers  |
//! +-------------------------------------------------------------------+
//! | DESCRIPTOR TABLE (num_desc entries, 64 bytes each)                |
//! |   Per descriptor: lock, len, refcount, generation, published_at   |
//! +-------------------------------------------------------------------+
//! | AVAIL RING                                                        |
//! |   AvailHeader (64B, spinlock) + RingHeader (192B) + num_desc * u32|
//! +-------------------------------------------------------------------+
//! | USED RINGS (max_readers blocks, `used_stride` bytes each)         |
//! |   UsedRingHeader (64B: state, heartbeat, snapshot, epoch)         |
//! |   RingHeader (192B) + num_desc * UsedElem (16B)                   |
//! +-------------------------------------------------------------------+
//! ```
//!
//! Message payloads are not in this object: each descriptor is backed by a
//! separate shared memory object (see [`crate::naming`]).

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::const_assert_eq;
use vring_primitives::{RingHeader, SpinLock};

/// Magic bytes identifying a vring segment.
pub const VRING_MAGIC: [u8; 8] = *b"VRING\0\0\0";

/// Layout version (major.minor packed into u32).
pub const VRING_PROTOCOL_VERSION: u32 = 1 << 16; // v1.0

/// Upper bound on used-ring slots per segment.
pub const MAX_READERS: u32 = 64;

/// Smallest table alignment: one cache line.
pub const MIN_ALIGNMENT: u32 = 64;

/// Heartbeat snapshot value meaning "not sampled since the slot was claimed".
pub const UNSAMPLED: u64 = u64::MAX;

/// Segment header (64 bytes). Immutable once the writer has created it.
#[repr(C, align(64))]
pub struct Meta {
    /// Magic bytes: "VRING\0\0\0".
    pub magic: [u8; 8],
    /// Layout version (major.minor packed).
    pub version: u32,
    pub msg_size: u32,
    pub num_desc: u32,
    pub max_readers: u32,
    pub alignment: u32,
    pub _reserved: u32,
    /// Total size of the segment, for validation by openers.
    pub segment_size: u64,
    pub _pad: [u8; 24],
}

const_assert_eq!(size_of::<Meta>(), 64);

impl Meta {
    pub fn new(msg_size: u32, num_desc: u32, max_readers: u32, alignment: u32, size: u64) -> Self {
        Self {
            magic: VRING_MAGIC,
            version: VRING_PROTOCOL_VERSION,
            msg_size,
            num_desc,
            max_readers,
            alignment,
            _reserved: 0,
            segment_size: size,
            _pad: [0; 24],
        }
    }

    /// Validate a header found in a segment of `mapped_len` bytes.
    pub fn validate(&self, mapped_len: usize) -> Result<Offsets, LayoutError> {
        if self.magic != VRING_MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        if self.version >> 16 != VRING_PROTOCOL_VERSION >> 16 {
            return Err(LayoutError::IncompatibleVersion {
                expected: VRING_PROTOCOL_VERSION,
                found: self.version,
            });
        }
        if self.msg_size == 0 || self.num_desc == 0 {
            return Err(LayoutError::InvalidConfig("zero msg_size or num_desc"));
        }
        if self.max_readers == 0 || self.max_readers > MAX_READERS {
            return Err(LayoutError::InvalidConfig("max_readers out of range"));
        }
        if !self.alignment.is_power_of_two() || self.alignment < MIN_ALIGNMENT {
            return Err(LayoutError::InvalidConfig("bad alignment"));
        }

        let offsets = Offsets::calculate(self.num_desc, self.max_readers, self.alignment)
            .map_err(LayoutError::InvalidConfig)?;
        if self.segment_size != offsets.total as u64 || mapped_len < offsets.total {
            return Err(LayoutError::SegmentTooSmall {
                required: offsets.total,
                found: mapped_len,
            });
        }
        Ok(offsets)
    }
}

/// One message buffer's bookkeeping (64 bytes).
///
/// `len`, `refcount` and `published_at` are only modified under `lock`.
/// `generation` is bumped each time the writer takes the descriptor from the
/// avail ring, and again when the monitor force-recycles it, so references
/// from before either event can be recognized as stale.
#[repr(C, align(64))]
pub struct Descriptor {
    pub lock: SpinLock,
    /// Payload length of the current message.
    pub len: AtomicU32,
    /// Number of used rings this descriptor was appended to and that have not
    /// released it yet.
    pub refcount: AtomicU32,
    pub generation: AtomicU32,
    /// `CLOCK_MONOTONIC` nanos of the last publish.
    pub published_at: AtomicU64,
    /// Size of the backing buffer mapping.
    pub buffer_size: u64,
    pub _pad: [u8; 32],
}

const_assert_eq!(size_of::<Descriptor>(), 64);

impl Descriptor {
    pub fn new(buffer_size: u64) -> Self {
        Self {
            lock: SpinLock::new(),
            len: AtomicU32::new(0),
            refcount: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            published_at: AtomicU64::new(0),
            buffer_size,
            _pad: [0; 32],
        }
    }
}

/// Spinlock serializing producers of the avail ring (64 bytes).
///
/// Readers, the writer's unwind path and the monitor all push released
/// descriptors, possibly from different processes at once.
#[repr(C, align(64))]
pub struct AvailHeader {
    pub lock: SpinLock,
    pub _pad: [u8; 60],
}

const_assert_eq!(size_of::<AvailHeader>(), 64);

impl AvailHeader {
    pub fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            _pad: [0; 60],
        }
    }
}

impl Default for AvailHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Used-ring slot state.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    /// No reader; may be claimed.
    Free = 0,
    /// Owned by a live reader; the writer publishes into it.
    Ready = 1,
    /// Being torn down (by the monitor or the reader itself).
    Killed = 2,
}

impl RingState {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(RingState::Free),
            1 => Some(RingState::Ready),
            2 => Some(RingState::Killed),
            _ => None,
        }
    }
}

/// Per-reader slot header (64 bytes), followed by the ring itself.
///
/// `lock` makes "check state is Ready, then append" atomic on the writer side
/// against the `Ready -> Killed` transition on the teardown side.
#[repr(C, align(64))]
pub struct UsedRingHeader {
    /// [`RingState`] as u32.
    pub state: AtomicU32,
    pub lock: SpinLock,
    /// Bumped on every successful claim; a reader only acts on the slot while
    /// the epoch it claimed is current.
    pub claim_epoch: AtomicU32,
    /// PID of the claiming process, for diagnostics.
    pub owner_pid: AtomicU32,
    /// Incremented by the reader's heartbeat thread.
    pub heartbeat: AtomicU64,
    /// The monitor's sample of `heartbeat` from its previous tick.
    pub last_heartbeat: AtomicU64,
    pub _pad: [u8; 32],
}

const_assert_eq!(size_of::<UsedRingHeader>(), 64);

impl UsedRingHeader {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(RingState::Free as u32),
            lock: SpinLock::new(),
            claim_epoch: AtomicU32::new(0),
            owner_pid: AtomicU32::new(0),
            heartbeat: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(UNSAMPLED),
            _pad: [0; 32],
        }
    }

    #[inline]
    pub fn state(&self) -> Option<RingState> {
        RingState::from_u32(self.state.load(Ordering::Acquire))
    }
}

impl Default for UsedRingHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry of a used ring (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
    /// Descriptor generation at publish time.
    pub generation: u32,
    pub _reserved: u32,
}

const_assert_eq!(size_of::<UsedElem>(), 16);

impl UsedElem {
    pub fn new(id: u32, len: u32, generation: u32) -> Self {
        Self {
            id,
            len,
            generation,
            _reserved: 0,
        }
    }
}

#[inline]
fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Offsets within the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offsets {
    pub meta: usize,
    pub descriptors: usize,
    /// Start of the [`AvailHeader`]; the ring header follows it.
    pub avail: usize,
    /// Start of used-ring slot 0.
    pub used: usize,
    /// Distance between consecutive used-ring slots.
    pub used_stride: usize,
    pub total: usize,
}

impl Offsets {
    /// Calculate offsets for the segment layout.
    pub fn calculate(num_desc: u32, max_readers: u32, alignment: u32) -> Result<Self, &'static str> {
        let align = alignment as usize;
        if !align.is_power_of_two() || align < MIN_ALIGNMENT as usize {
            return Err("alignment must be a power of two of at least 64");
        }
        let n = num_desc as usize;

        let desc_table_size = size_of::<Descriptor>()
            .checked_mul(n)
            .ok_or("descriptor table size overflow")?;
        let avail_size = (n
            .checked_mul(size_of::<u32>())
            .and_then(|v| v.checked_add(size_of::<AvailHeader>() + size_of::<RingHeader>())))
        .ok_or("avail ring size overflow")?;
        let used_size = n
            .checked_mul(size_of::<UsedElem>())
            .and_then(|v| v.checked_add(size_of::<UsedRingHeader>() + size_of::<RingHeader>()))
            .ok_or("used ring size overflow")?;
        let used_stride = align_up(used_size, align).ok_or("used ring stride overflow")?;

        let meta = 0usize;
        let descriptors = align_up(size_of::<Meta>(), align).ok_or("descriptor offset overflow")?;
        let avail = descriptors
            .checked_add(desc_table_size)
            .and_then(|v| align_up(v, align))
            .ok_or("avail offset overflow")?;
        let used = avail
            .checked_add(avail_size)
            .and_then(|v| align_up(v, align))
            .ok_or("used offset overflow")?;
        let total = used_stride
            .checked_mul(max_readers as usize)
            .and_then(|v| v.checked_add(used))
            .ok_or("total size overflow")?;

        Ok(Self {
            meta,
            descriptors,
            avail,
            used,
            used_stride,
            total,
        })
    }

    #[inline]
    pub fn descriptor(&self, index: u32) -> usize {
        self.descriptors + index as usize * size_of::<Descriptor>()
    }

    #[inline]
    pub fn avail_ring(&self) -> usize {
        self.avail + size_of::<AvailHeader>()
    }

    #[inline]
    pub fn used_slot(&self, slot: u32) -> usize {
        self.used + slot as usize * self.used_stride
    }

    #[inline]
    pub fn used_ring(&self, slot: u32) -> usize {
        self.used_slot(slot) + size_of::<UsedRingHeader>()
    }
}

/// Errors from segment layout validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Invalid magic bytes.
    InvalidMagic,
    /// Incompatible layout version.
    IncompatibleVersion { expected: u32, found: u32 },
    /// Segment smaller than its header claims.
    SegmentTooSmall { required: usize, found: usize },
    /// Invalid configuration in header.
    InvalidConfig(&'static str),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid segment magic bytes (expected VRING)"),
            Self::IncompatibleVersion { expected, found } => {
                write!(
                    f,
                    "incompatible segment version: expected {}.{}, found {}.{}",
                    expected >> 16,
                    expected & 0xFFFF,
                    found >> 16,
                    found & 0xFFFF
                )
            }
            Self::SegmentTooSmall { required, found } => {
                write!(f, "segment too small: need {} bytes, got {}", required, found)
            }
            Self::InvalidConfig(msg) => write!(f, "invalid segment config: {}", msg),
        }
    }
}

impl std::error::Error for LayoutError {}
