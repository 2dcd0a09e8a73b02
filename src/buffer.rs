//! Frame buffers and their metadata.
//!
//! A `FrameBuffer` is one reusable slot of a channel's pool. It is moved, not
//! shared: whoever holds the value owns the slot, and the pool records which
//! of the four ownership states the slot is in.

use std::fmt;
use std::time::Duration;

use crate::memory::{BackingMemory, RawDescriptor};
use crate::ChannelId;

/// Backing-memory strategy for a channel's pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationMode {
    /// Page-aligned memory allocated by the pool itself.
    SelfAllocated,
    /// Memory allocated and mapped by the device.
    DeviceMapped,
    /// Device memory exported as a sharable descriptor.
    DeviceExported,
    /// Descriptors borrowed from a downstream-owned pool.
    DownstreamImported,
}

impl AllocationMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "self_allocated" | "userptr" => Some(AllocationMode::SelfAllocated),
            "device_mapped" | "mmap" => Some(AllocationMode::DeviceMapped),
            "device_exported" | "dma_export" => Some(AllocationMode::DeviceExported),
            "downstream_imported" | "dma_import" => Some(AllocationMode::DownstreamImported),
            _ => None,
        }
    }
}

impl fmt::Display for AllocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocationMode::SelfAllocated => "self_allocated",
            AllocationMode::DeviceMapped => "device_mapped",
            AllocationMode::DeviceExported => "device_exported",
            AllocationMode::DownstreamImported => "downstream_imported",
        };
        f.write_str(name)
    }
}

/// Who currently holds a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// Idle in the pool, ready to be acquired.
    InPool,
    /// Acquired by a production loop and being filled by the device, or
    /// parked after a dropped submission.
    WithDevice,
    /// Delivered to the downstream consumer.
    WithDownstream,
    /// Released and waiting in the submission queue.
    Queued,
}

/// Field parity reported by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FieldParity {
    #[default]
    Any,
    /// Progressive frame.
    None,
    Top,
    Bottom,
    /// Alternating top/bottom fields, one per buffer.
    Alternate,
}

impl FieldParity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "any" => Some(FieldParity::Any),
            "none" | "progressive" => Some(FieldParity::None),
            "top" => Some(FieldParity::Top),
            "bottom" => Some(FieldParity::Bottom),
            "alternate" => Some(FieldParity::Alternate),
            _ => None,
        }
    }
}

/// Per-buffer flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const SW_READ: BufferFlags = BufferFlags(1 << 0);
    pub const SW_WRITE: BufferFlags = BufferFlags(1 << 1);
    pub const DMA_EXPORT: BufferFlags = BufferFlags(1 << 2);
    pub const TOP_FIELD_FIRST: BufferFlags = BufferFlags(1 << 8);
    pub const INTERLACED: BufferFlags = BufferFlags(1 << 9);
    pub const DISCONT: BufferFlags = BufferFlags(1 << 10);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

/// Usage hint tagged onto buffers when they are released for re-submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferUsage {
    #[default]
    None,
    Read,
    Write,
    DmaExport,
}

impl BufferUsage {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(BufferUsage::None),
            "read" => Some(BufferUsage::Read),
            "write" => Some(BufferUsage::Write),
            "dma_export" => Some(BufferUsage::DmaExport),
            _ => None,
        }
    }

    pub fn flags(self) -> BufferFlags {
        match self {
            BufferUsage::None => BufferFlags::NONE,
            BufferUsage::Read => BufferFlags::SW_READ,
            BufferUsage::Write => BufferFlags::SW_WRITE,
            BufferUsage::DmaExport => BufferFlags::DMA_EXPORT,
        }
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// One captured frame slot.
#[derive(Debug)]
pub struct FrameBuffer {
    channel: ChannelId,
    index: usize,
    generation: u64,
    size: usize,
    memory: BackingMemory,
    sequence: Option<u64>,
    timestamp: Option<Duration>,
    field: FieldParity,
    flags: BufferFlags,
}

impl FrameBuffer {
    pub(crate) fn new(
        channel: ChannelId,
        index: usize,
        generation: u64,
        size: usize,
        memory: BackingMemory,
    ) -> Self {
        Self {
            channel,
            index,
            generation,
            size,
            memory,
            sequence: None,
            timestamp: None,
            field: FieldParity::Any,
            flags: BufferFlags::NONE,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Slot index inside the owning pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Device sequence number of the captured frame.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Capture timestamp, relative to the device clock.
    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    pub fn field(&self) -> FieldParity {
        self.field
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn memory(&self) -> &BackingMemory {
        &self.memory
    }

    pub fn mode(&self) -> AllocationMode {
        self.memory.mode()
    }

    pub fn descriptor(&self) -> Option<RawDescriptor> {
        self.memory.descriptor()
    }

    /// Frame bytes, when the memory is mapped into this process.
    pub fn data(&self) -> Option<&[u8]> {
        self.memory.as_slice()
    }

    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.memory.as_mut_slice()
    }

    /// Record what the device captured into this buffer.
    pub fn set_capture(&mut self, sequence: u64, timestamp: Option<Duration>, field: FieldParity) {
        self.sequence = Some(sequence);
        self.timestamp = timestamp;
        self.field = field;
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: Option<Duration>) {
        self.timestamp = timestamp;
    }

    pub(crate) fn insert_flags(&mut self, flags: BufferFlags) {
        self.flags.insert(flags);
    }

    pub(crate) fn remove_flags(&mut self, flags: BufferFlags) {
        self.flags.remove(flags);
    }

    /// Clear capture metadata so the device assigns fresh values.
    pub(crate) fn reset_for_submission(&mut self) {
        self.sequence = None;
        self.timestamp = None;
        self.flags.remove(
            BufferFlags::TOP_FIELD_FIRST | BufferFlags::INTERLACED | BufferFlags::DISCONT,
        );
    }

    pub(crate) fn into_memory(self) -> BackingMemory {
        self.memory
    }
}
