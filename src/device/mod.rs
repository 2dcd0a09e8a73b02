//! Device adapter seam.
//!
//! The capture core talks to hardware/firmware only through
//! [`DeviceAdapter`]. It never assumes a transport: a real adapter may wrap a
//! V4L2 node or a vendor HAL, and [`SyntheticDevice`] runs entirely in
//! process for tests and demos.
//!
//! Contract:
//! - `submit` receives exactly one buffer per active channel.
//! - `dequeue` blocks until the device has filled the given buffer or
//!   `cancel_dequeue` is called.
//! - Memory handed out by `allocate_memory` stays valid until it comes back
//!   through `release_memory`.

pub mod synthetic;

use crate::buffer::{AllocationMode, FieldParity, FrameBuffer};
use crate::error::CaptureResult;
use crate::memory::{DeviceMemory, ImportedBuffer};
use crate::ChannelId;

pub use synthetic::{DescriptorTable, SyntheticConfig, SyntheticDevice, SyntheticDownstreamPool};

/// Stream layout passed to `configure_streams`, one entry per channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub channel: ChannelId,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub field: FieldParity,
    pub frame_size: usize,
    pub mode: AllocationMode,
}

pub trait DeviceAdapter: Send + Sync {
    fn configure_streams(&self, streams: &[StreamConfig]) -> CaptureResult<()>;

    fn start(&self) -> CaptureResult<()>;

    fn stop(&self) -> CaptureResult<()>;

    /// Allocate memory for `DeviceMapped` or `DeviceExported` pools.
    fn allocate_memory(
        &self,
        channel: ChannelId,
        mode: AllocationMode,
        size: usize,
    ) -> CaptureResult<DeviceMemory>;

    fn release_memory(&self, channel: ChannelId, memory: DeviceMemory);

    /// Queue one buffer per active channel back to the device.
    fn submit(&self, batch: &[FrameBuffer]) -> CaptureResult<()>;

    /// Block until the device has captured a frame into `buffer`.
    fn dequeue(&self, channel: ChannelId, buffer: &mut FrameBuffer) -> CaptureResult<()>;

    /// Unblock every pending `dequeue` with `CaptureError::Cancelled`.
    fn cancel_dequeue(&self) {}
}

/// Buffer pool owned by the downstream consumer, used in
/// `DownstreamImported` mode. Its buffers are borrowed, never freed here.
pub trait DownstreamPool: Send + Sync {
    fn acquire(&self, size: usize) -> CaptureResult<ImportedBuffer>;

    fn give_back(&self, buffer: ImportedBuffer);
}
