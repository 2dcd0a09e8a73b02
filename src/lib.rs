//! Camera capture streaming core.
//!
//! Turns a capture device into one or more paced, timestamped buffer
//! streams for a downstream consumer.
//!
//! # Architecture
//!
//! Three parts carry the hard work:
//!
//! 1. **Buffer pools** (`pool`): one per channel, a fixed set of frame
//!    buffers backed by self-allocated, device-mapped, device-exported or
//!    downstream-imported memory.
//! 2. **Submission synchronizer** (`submit`): collects returned buffers per
//!    channel and hands them back to the device in batches covering every
//!    active channel.
//! 3. **Live pacing** (`live`): running/flushing state, clock-paced
//!    emission and prompt cancellation of every blocked wait.
//!
//! `CaptureSource` ties them together with one production task per channel.
//! The device is reached only through [`DeviceAdapter`]; `SyntheticDevice`
//! runs the whole pipeline in process.
//!
//! # Module Structure
//!
//! - `buffer`, `memory`: frame buffers and their backing memory
//! - `clock`: clock abstraction and abortable waits
//! - `device`: device adapter seam and the synthetic device
//! - `channel`, `stream`, `source`: channels, production tasks, control plane
//! - `config`, `logging`: file/environment configuration and logger setup

pub mod buffer;
pub mod channel;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod live;
pub mod logging;
pub mod memory;
pub mod pool;
pub mod segment;
pub mod source;
pub mod stats;
pub mod stream;
pub mod submit;

pub use buffer::{AllocationMode, BufferFlags, BufferUsage, FieldParity, FrameBuffer, Ownership};
pub use channel::{frame_size_for, Channel, ChannelId, ChannelSettings};
pub use clock::{Clock, ClockEntry, SystemClock};
pub use config::CaptureConfig;
pub use device::{
    DeviceAdapter, DownstreamPool, StreamConfig, SyntheticConfig, SyntheticDevice,
    SyntheticDownstreamPool,
};
pub use error::{CaptureError, CaptureResult, FlowStatus, SyncStatus};
pub use live::{LiveController, LiveGuard};
pub use memory::{BackingMemory, DmaHandle, ImportedBuffer};
pub use pool::{BufferPool, OwnershipCensus};
pub use segment::{SeekRequest, SeekTarget, Segment};
pub use source::{CaptureSource, ReturnPath, SourceSettings};
pub use stats::{FpsSummary, FrameRateMonitor};
pub use stream::{Downstream, StreamEvent};
pub use submit::{SubmissionPhase, SubmissionStats, SubmissionSynchronizer, SubmitFailurePolicy};
