//! Per-channel production tasks.
//!
//! Each active channel runs one thread that repeats:
//! 1. check for flushing or a host EOS request, then wait until playing
//! 2. send stream-start and segment events when due
//! 3. acquire a buffer from the channel's pool
//! 4. have the device fill it
//! 5. pace it against the clock
//! 6. push it downstream
//!
//! A pause reason ends the task. Flushing ends it silently; EOS and errors
//! are reported downstream exactly once.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::buffer::{BufferFlags, FieldParity, FrameBuffer};
use crate::channel::{Channel, TaskState};
use crate::device::DeviceAdapter;
use crate::error::{CaptureError, CaptureResult, FlowStatus, SyncStatus};
use crate::live::LiveController;
use crate::segment::Segment;
use crate::ChannelId;

/// Events sent to the downstream consumer, per channel.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    StreamStart { stream_id: String },
    Segment(Segment),
    FlushStart,
    FlushStop,
    /// `forced` marks an EOS the host asked for, as opposed to the end of
    /// data or a terminal error.
    Eos { forced: bool },
    Error(CaptureError),
}

/// The consumer of captured buffers.
pub trait Downstream: Send + Sync {
    /// Take ownership of a captured buffer. Whatever the returned status,
    /// the buffer must come back exactly once through
    /// [`ReturnPath::release`](crate::ReturnPath::release).
    fn push(&self, channel: ChannelId, buffer: FrameBuffer, timestamp: Option<Duration>)
        -> FlowStatus;

    fn event(&self, channel: ChannelId, event: StreamEvent);
}

/// State shared by every production task of one source.
pub(crate) struct StreamContext {
    pub device_id: u32,
    pub live: LiveController,
    pub device: Arc<dyn DeviceAdapter>,
    pub downstream: Arc<dyn Downstream>,
    pub segment: Mutex<Segment>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum PauseReason {
    Flushing,
    Deactivated,
    Eos { forced: bool },
    Error(CaptureError),
}

/// Start the channel's task unless it is already running.
pub(crate) fn spawn_task(ctx: &Arc<StreamContext>, channel: &Arc<Channel>) -> CaptureResult<()> {
    let previous = {
        let mut state = channel.state.lock();
        if state.task == TaskState::Running {
            return Ok(());
        }
        state.handle.take()
    };
    if let Some(previous) = previous {
        if previous.join().is_err() {
            log::error!("channel={} previous capture task panicked", channel.id());
        }
    }

    let mut state = channel.state.lock();
    if state.task == TaskState::Running {
        return Ok(());
    }
    let task_ctx = ctx.clone();
    let task_channel = channel.clone();
    let handle = thread::Builder::new()
        .name(format!("capture-ch{}", channel.id()))
        .spawn(move || run(task_ctx, task_channel))
        .map_err(|e| {
            CaptureError::InvalidState(format!(
                "failed to spawn capture task for channel {}: {}",
                channel.id(),
                e
            ))
        })?;
    state.task = TaskState::Running;
    state.handle = Some(handle);
    Ok(())
}

fn run(ctx: Arc<StreamContext>, channel: Arc<Channel>) {
    log::debug!("channel={} capture task running", channel.id());
    loop {
        if let Err(reason) = iterate(&ctx, &channel) {
            pause(&ctx, &channel, reason);
            break;
        }
    }
    channel.set_task_state(TaskState::Paused);
}

/// After a cancelled wait: stop if flushing, otherwise go round again.
fn retry_or_pause(ctx: &StreamContext, channel: &Channel) -> Result<(), PauseReason> {
    if ctx.live.is_flushing() {
        return Err(PauseReason::Flushing);
    }
    if !channel.is_activated() {
        return Err(PauseReason::Deactivated);
    }
    Ok(())
}

fn iterate(ctx: &StreamContext, channel: &Channel) -> Result<(), PauseReason> {
    let id = channel.id();
    {
        let mut live = ctx.live.lock();
        if live.is_flushing() {
            return Err(PauseReason::Flushing);
        }
        if live.take_pending_eos(id) {
            // The EOS request unlocked the pool to wake a blocked acquire.
            channel.pool().unlock_stop();
            return Err(PauseReason::Eos { forced: true });
        }
        if live.wait_until_playing(id).is_err() {
            return Err(if live.is_flushing() {
                PauseReason::Flushing
            } else {
                PauseReason::Deactivated
            });
        }
    }

    let (send_start, send_segment) = {
        let mut state = channel.state.lock();
        if !state.activated {
            return Err(PauseReason::Deactivated);
        }
        if state.buffers_left == Some(0) {
            return Err(PauseReason::Eos { forced: false });
        }
        let send_start = !state.stream_start_sent;
        state.stream_start_sent = true;
        let send_segment = std::mem::replace(&mut state.segment_pending, false);
        (send_start, send_segment)
    };
    if send_start {
        let stream_id = format!("capture-{}/{}", ctx.device_id, id);
        ctx.downstream.event(id, StreamEvent::StreamStart { stream_id });
    }
    if send_segment {
        let segment = ctx.segment.lock().clone();
        ctx.downstream.event(id, StreamEvent::Segment(segment));
    }

    let pool = channel.pool();
    let mut buffer = match pool.acquire() {
        Ok(buffer) => buffer,
        Err(CaptureError::Cancelled) => return retry_or_pause(ctx, channel),
        Err(CaptureError::NotStarted) => return Err(PauseReason::Flushing),
        Err(err) => return Err(PauseReason::Error(err)),
    };

    if let Err(err) = ctx.device.dequeue(id, &mut buffer) {
        pool.recycle(buffer);
        return match err {
            CaptureError::Cancelled => retry_or_pause(ctx, channel),
            err => Err(PauseReason::Error(err)),
        };
    }
    apply_frame_flags(channel, &mut buffer);

    match ctx.live.do_sync(id, &mut buffer) {
        SyncStatus::OnTime => {}
        SyncStatus::Early => {
            log::debug!("channel={} slot {} is late", id, buffer.index());
        }
        SyncStatus::Cancelled => {
            pool.recycle(buffer);
            return retry_or_pause(ctx, channel);
        }
        SyncStatus::ClockError(err) => {
            pool.recycle(buffer);
            return Err(PauseReason::Error(CaptureError::ClockError(err)));
        }
    }

    let timestamp = buffer.timestamp();
    if let Some(ts) = timestamp {
        let mut segment = ctx.segment.lock();
        if segment.is_past_stop(ts) {
            drop(segment);
            pool.recycle(buffer);
            return Err(PauseReason::Eos { forced: false });
        }
        segment.position = ts;
    }

    {
        let mut state = channel.state.lock();
        state.delivered += 1;
        if let Some(left) = state.buffers_left.as_mut() {
            *left = left.saturating_sub(1);
        }
    }
    log::debug!(
        "channel={} pushing slot {} seq={:?} ts={:?}",
        id,
        buffer.index(),
        buffer.sequence(),
        timestamp
    );
    pool.mark_delivered(&buffer);
    match ctx.downstream.push(id, buffer, timestamp) {
        FlowStatus::Ok => Ok(()),
        FlowStatus::Flushing => Err(PauseReason::Flushing),
        FlowStatus::Eos => Err(PauseReason::Eos { forced: false }),
        FlowStatus::NotLinked => Err(PauseReason::Error(CaptureError::InvalidState(
            "channel output not linked".to_string(),
        ))),
        FlowStatus::Error(err) => Err(PauseReason::Error(err)),
    }
}

/// Derive interlace and discontinuity flags from what the device reported.
fn apply_frame_flags(channel: &Channel, buffer: &mut FrameBuffer) {
    buffer.remove_flags(
        BufferFlags::TOP_FIELD_FIRST | BufferFlags::INTERLACED | BufferFlags::DISCONT,
    );
    match buffer.field() {
        FieldParity::Top => {
            buffer.insert_flags(BufferFlags::INTERLACED | BufferFlags::TOP_FIELD_FIRST)
        }
        FieldParity::Bottom | FieldParity::Alternate => {
            buffer.insert_flags(BufferFlags::INTERLACED)
        }
        FieldParity::Any | FieldParity::None => {}
    }

    let Some(sequence) = buffer.sequence() else {
        return;
    };
    let mut state = channel.state.lock();
    if let Some(last) = state.last_sequence {
        if sequence > last + 1 {
            log::debug!(
                "channel={} sequence jumped {} -> {}, {} frame(s) lost",
                channel.id(),
                last,
                sequence,
                sequence - last - 1
            );
            buffer.insert_flags(BufferFlags::DISCONT);
        }
    }
    state.last_sequence = Some(sequence);
}

fn pause(ctx: &StreamContext, channel: &Channel, reason: PauseReason) {
    let id = channel.id();
    match reason {
        PauseReason::Flushing => {
            log::debug!("channel={} pausing task: flushing", id);
        }
        PauseReason::Deactivated => {
            log::debug!("channel={} pausing task: deactivated", id);
        }
        PauseReason::Eos { forced } => {
            log::info!("channel={} end of stream (forced={})", id, forced);
            channel.state.lock().ended = true;
            ctx.downstream.event(id, StreamEvent::Eos { forced });
        }
        PauseReason::Error(err) => {
            log::error!("channel={} streaming stopped: {}", id, err);
            channel.state.lock().ended = true;
            ctx.downstream.event(id, StreamEvent::Error(err));
            ctx.downstream.event(id, StreamEvent::Eos { forced: false });
        }
    }
}
