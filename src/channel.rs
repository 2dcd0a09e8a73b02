//! Output channels.
//!
//! A `Channel` is one output stream of a capture source: its settings, its
//! buffer pool, and the per-channel state its production task works on. The
//! primary channel (`ChannelId(0)`) exists for the source's whole lifetime.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::buffer::{AllocationMode, FieldParity};
use crate::device::StreamConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::pool::BufferPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub const PRIMARY: ChannelId = ChannelId(0);

    pub fn is_primary(self) -> bool {
        self == Self::PRIMARY
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Negotiated format of one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSettings {
    pub width: u32,
    pub height: u32,
    /// FourCC-style format name, e.g. `NV12`.
    pub format: String,
    pub field: FieldParity,
    /// Explicit frame size in bytes. Derived from the format when `None`.
    pub frame_size: Option<usize>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: "NV12".to_string(),
            field: FieldParity::None,
            frame_size: None,
        }
    }
}

impl ChannelSettings {
    pub fn resolved_frame_size(&self) -> CaptureResult<usize> {
        if let Some(size) = self.frame_size {
            if size == 0 {
                return Err(CaptureError::InvalidConfig(
                    "frame_size must be greater than zero".to_string(),
                ));
            }
            return Ok(size);
        }
        frame_size_for(&self.format, self.width, self.height).ok_or_else(|| {
            CaptureError::InvalidConfig(format!(
                "cannot derive frame size for {} {}x{}",
                self.format, self.width, self.height
            ))
        })
    }
}

/// Bytes per frame for the formats the core knows how to size.
pub fn frame_size_for(format: &str, width: u32, height: u32) -> Option<usize> {
    let pixels = (width as usize).checked_mul(height as usize)?;
    if pixels == 0 {
        return None;
    }
    match format.trim().to_ascii_uppercase().as_str() {
        "NV12" | "NV21" | "I420" | "YV12" => Some(pixels + pixels / 2),
        "YUY2" | "YUYV" | "UYVY" | "NV16" => Some(pixels * 2),
        "RGB" | "BGR" | "RGB24" => Some(pixels * 3),
        "BGRA" | "RGBA" | "BGRX" | "RGBX" => Some(pixels * 4),
        "GRAY8" | "Y8" => Some(pixels),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// Channel
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskState {
    Stopped,
    Running,
    Paused,
}

pub(crate) struct ChannelState {
    pub activated: bool,
    pub stream_start_sent: bool,
    pub segment_pending: bool,
    /// Buffers still allowed before EOS; `None` is unlimited.
    pub buffers_left: Option<u64>,
    pub delivered: u64,
    pub last_sequence: Option<u64>,
    /// Set once the task sent EOS or an error; the task is not restarted by
    /// a resume until a flush or a new start clears it.
    pub ended: bool,
    pub task: TaskState,
    pub handle: Option<JoinHandle<()>>,
}

pub struct Channel {
    id: ChannelId,
    settings: ChannelSettings,
    pool: Arc<BufferPool>,
    pub(crate) state: Mutex<ChannelState>,
    pub(crate) cond: Condvar,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, settings: ChannelSettings, pool: Arc<BufferPool>) -> Self {
        Self {
            id,
            settings,
            pool,
            state: Mutex::new(ChannelState {
                activated: false,
                stream_start_sent: false,
                segment_pending: false,
                buffers_left: None,
                delivered: 0,
                last_sequence: None,
                ended: false,
                task: TaskState::Stopped,
                handle: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_primary(&self) -> bool {
        self.id.is_primary()
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn is_activated(&self) -> bool {
        self.state.lock().activated
    }

    /// Buffers pushed downstream since the last start.
    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    pub(crate) fn stream_config(&self, mode: AllocationMode) -> CaptureResult<StreamConfig> {
        Ok(StreamConfig {
            channel: self.id,
            width: self.settings.width,
            height: self.settings.height,
            format: self.settings.format.clone(),
            field: self.settings.field,
            frame_size: self.settings.resolved_frame_size()?,
            mode,
        })
    }

    /// Reset per-run state before the first task of a new start.
    pub(crate) fn prepare_for_start(&self, num_buffers: Option<u64>) {
        let mut state = self.state.lock();
        state.activated = true;
        state.stream_start_sent = false;
        state.segment_pending = true;
        state.buffers_left = num_buffers;
        state.delivered = 0;
        state.last_sequence = None;
        state.ended = false;
    }

    pub(crate) fn set_activated(&self, activated: bool) {
        self.state.lock().activated = activated;
        self.cond.notify_all();
    }

    pub(crate) fn mark_segment_pending(&self) {
        let mut state = self.state.lock();
        state.segment_pending = true;
        state.ended = false;
    }

    pub(crate) fn clear_ended(&self) {
        self.state.lock().ended = false;
    }

    pub(crate) fn set_task_state(&self, task: TaskState) {
        self.state.lock().task = task;
        self.cond.notify_all();
    }

    pub(crate) fn task_state(&self) -> TaskState {
        self.state.lock().task
    }

    /// Block until the channel's task is no longer running, or `timeout`
    /// expires. Returns `true` if the task is paused or stopped.
    pub fn wait_task_paused(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.task == TaskState::Running {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.task != TaskState::Running;
            }
        }
        true
    }

    /// Join the task thread if one was spawned.
    pub(crate) fn join_task(&self) {
        let handle = self.state.lock().handle.take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                // Called from the task itself, e.g. a flush issued by a
                // downstream callback. The task exits on its own.
                self.state.lock().handle = Some(handle);
                return;
            }
            if handle.join().is_err() {
                log::error!("channel={} capture task panicked", self.id);
            }
        }
        let mut state = self.state.lock();
        if state.task == TaskState::Running {
            state.task = TaskState::Stopped;
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .finish()
    }
}
