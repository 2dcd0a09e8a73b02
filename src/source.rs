//! Capture source: lifecycle and control plane.
//!
//! `CaptureSource` owns the channels of one opened device and drives them
//! through start/stop, playing/paused, flush, seek and EOS. Data flows on
//! one production task per channel (see `stream`); buffers come back
//! through a [`ReturnPath`] handed to the downstream consumer.
//!
//! Lock order: control, then live, then channel, then pool.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::{AllocationMode, BufferUsage, FrameBuffer};
use crate::channel::{Channel, ChannelId, ChannelSettings};
use crate::clock::Clock;
use crate::device::{DeviceAdapter, DownstreamPool, StreamConfig};
use crate::error::{CaptureError, CaptureResult};
use crate::live::LiveController;
use crate::pool::{BufferPool, MAX_CAPACITY, MIN_CAPACITY};
use crate::segment::{SeekRequest, Segment};
use crate::stream::{spawn_task, Downstream, StreamContext, StreamEvent};
use crate::submit::{SubmissionSynchronizer, SubmitFailurePolicy};

/// Runtime settings of a capture source.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    pub device_id: u32,
    pub io_mode: AllocationMode,
    /// Pool capacity of every channel.
    pub buffer_count: usize,
    pub buffer_usage: BufferUsage,
    /// EOS after this many buffers per channel.
    pub num_buffers: Option<u64>,
    pub do_timestamp: bool,
    pub live: bool,
    pub print_fps: bool,
    pub async_start: bool,
    pub submit_failure: SubmitFailurePolicy,
    pub primary: ChannelSettings,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            device_id: 0,
            io_mode: AllocationMode::SelfAllocated,
            buffer_count: 6,
            buffer_usage: BufferUsage::None,
            num_buffers: None,
            do_timestamp: false,
            live: true,
            print_fps: false,
            async_start: false,
            submit_failure: SubmitFailurePolicy::Drop,
            primary: ChannelSettings::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartState {
    Stopped,
    Starting,
    Started,
}

struct ObjectState {
    start: StartState,
    start_result: Option<CaptureResult<()>>,
    last_seek_seqnum: Option<u32>,
    next_channel: u32,
}

type ChannelMap = Arc<RwLock<BTreeMap<ChannelId, Arc<Channel>>>>;

struct SourceInner {
    settings: SourceSettings,
    ctx: Arc<StreamContext>,
    sync: Arc<SubmissionSynchronizer>,
    downstream_pool: Option<Arc<dyn DownstreamPool>>,
    channels: ChannelMap,
    object: Mutex<ObjectState>,
    object_cond: Condvar,
    control: Mutex<()>,
}

/// Hands delivered buffers back to their channel's pool.
#[derive(Clone)]
pub struct ReturnPath {
    channels: ChannelMap,
}

impl ReturnPath {
    /// Return a buffer received through `Downstream::push`. Call exactly
    /// once per delivered buffer.
    pub fn release(&self, buffer: FrameBuffer) {
        let pool = self
            .channels
            .read()
            .get(&buffer.channel())
            .map(|channel| channel.pool().clone());
        match pool {
            Some(pool) => pool.release(buffer),
            None => log::warn!(
                "channel={} released a buffer after the channel was removed",
                buffer.channel()
            ),
        }
    }
}

pub struct CaptureSource {
    inner: Arc<SourceInner>,
}

fn validate_settings(settings: &SourceSettings) -> CaptureResult<()> {
    if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&settings.buffer_count) {
        return Err(CaptureError::InvalidConfig(format!(
            "buffer_count {} outside {}..={}",
            settings.buffer_count, MIN_CAPACITY, MAX_CAPACITY
        )));
    }
    settings.primary.resolved_frame_size()?;
    Ok(())
}

impl CaptureSource {
    pub fn new(
        settings: SourceSettings,
        device: Arc<dyn DeviceAdapter>,
        clock: Arc<dyn Clock>,
        downstream: Arc<dyn Downstream>,
    ) -> CaptureResult<Self> {
        Self::with_downstream_pool(settings, device, clock, downstream, None)
    }

    /// Like `new`, with the downstream-owned pool that `DownstreamImported`
    /// channels import their buffers from.
    pub fn with_downstream_pool(
        settings: SourceSettings,
        device: Arc<dyn DeviceAdapter>,
        clock: Arc<dyn Clock>,
        downstream: Arc<dyn Downstream>,
        downstream_pool: Option<Arc<dyn DownstreamPool>>,
    ) -> CaptureResult<Self> {
        validate_settings(&settings)?;
        if settings.io_mode == AllocationMode::DownstreamImported && downstream_pool.is_none() {
            return Err(CaptureError::InvalidConfig(
                "downstream_imported mode needs a downstream pool".to_string(),
            ));
        }
        let sync = SubmissionSynchronizer::new(device.clone(), settings.submit_failure);
        let ctx = Arc::new(StreamContext {
            device_id: settings.device_id,
            live: LiveController::new(clock, settings.live, settings.do_timestamp),
            device,
            downstream,
            segment: Mutex::new(Segment::default()),
        });
        let inner = Arc::new(SourceInner {
            settings,
            ctx,
            sync,
            downstream_pool,
            channels: Arc::new(RwLock::new(BTreeMap::new())),
            object: Mutex::new(ObjectState {
                start: StartState::Stopped,
                start_result: None,
                last_seek_seqnum: None,
                next_channel: 1,
            }),
            object_cond: Condvar::new(),
            control: Mutex::new(()),
        });
        let primary = inner.make_channel(ChannelId::PRIMARY, inner.settings.primary.clone());
        inner.channels.write().insert(ChannelId::PRIMARY, primary);
        log::info!(
            "capture source {} created (mode={}, buffers={}, live={})",
            inner.settings.device_id,
            inner.settings.io_mode,
            inner.settings.buffer_count,
            inner.settings.live
        );
        Ok(Self { inner })
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.inner.settings
    }

    pub fn live(&self) -> &LiveController {
        &self.inner.ctx.live
    }

    pub fn synchronizer(&self) -> &Arc<SubmissionSynchronizer> {
        &self.inner.sync
    }

    pub fn segment(&self) -> Segment {
        self.inner.ctx.segment.lock().clone()
    }

    pub fn return_path(&self) -> ReturnPath {
        ReturnPath {
            channels: self.inner.channels.clone(),
        }
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.inner.channels.read().get(&id).cloned()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.inner.channels.read().keys().copied().collect()
    }

    // ------------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------------

    /// Request a secondary output. Only possible while stopped.
    pub fn add_channel(&self, settings: ChannelSettings) -> CaptureResult<ChannelId> {
        settings.resolved_frame_size()?;
        let mut object = self.inner.object.lock();
        if object.start != StartState::Stopped {
            return Err(CaptureError::InvalidState(
                "channels can only be added while stopped".to_string(),
            ));
        }
        let id = ChannelId(object.next_channel);
        object.next_channel += 1;
        let channel = self.inner.make_channel(id, settings);
        self.inner.channels.write().insert(id, channel);
        log::info!("channel={} added", id);
        Ok(id)
    }

    /// Release a secondary output. Only possible while stopped.
    pub fn remove_channel(&self, id: ChannelId) -> CaptureResult<()> {
        if id.is_primary() {
            return Err(CaptureError::InvalidState(
                "the primary channel cannot be removed".to_string(),
            ));
        }
        let object = self.inner.object.lock();
        if object.start != StartState::Stopped {
            return Err(CaptureError::InvalidState(
                "channels can only be removed while stopped".to_string(),
            ));
        }
        drop(object);
        match self.inner.channels.write().remove(&id) {
            Some(_) => {
                log::info!("channel={} removed", id);
                Ok(())
            }
            None => Err(CaptureError::UnknownChannel(id)),
        }
    }

    // ------------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------------

    /// Open the device: configure streams, start every pool and start
    /// streaming. With `async_start` the sequence runs on a helper thread
    /// and this returns at once; `start_wait` reports the outcome.
    pub fn start(&self) -> CaptureResult<()> {
        {
            let mut object = self.inner.object.lock();
            if object.start != StartState::Stopped {
                log::debug!("capture source already started");
                return Ok(());
            }
            object.start = StartState::Starting;
            object.start_result = None;
        }

        if self.inner.settings.async_start {
            let inner = self.inner.clone();
            let spawned = thread::Builder::new()
                .name("capture-start".to_string())
                .spawn(move || {
                    let result = inner.open();
                    inner.start_complete(result);
                });
            if let Err(e) = spawned {
                let err = CaptureError::InvalidState(format!("failed to spawn start thread: {}", e));
                self.inner.start_complete(Err(err.clone()));
                return Err(err);
            }
            return Ok(());
        }

        let result = self.inner.open();
        self.inner.start_complete(result.clone());
        result
    }

    /// Finish a pending start with `result`. Starts the production tasks on
    /// success.
    pub fn start_complete(&self, result: CaptureResult<()>) {
        self.inner.start_complete(result);
    }

    /// Block until a pending start finishes and return its outcome.
    pub fn start_wait(&self) -> CaptureResult<()> {
        let mut object = self.inner.object.lock();
        while object.start == StartState::Starting {
            self.inner.object_cond.wait(&mut object);
        }
        object.start_result.clone().unwrap_or(Err(CaptureError::NotStarted))
    }

    /// `start_wait` with a deadline. `None` means the start is still
    /// pending.
    pub fn start_wait_timeout(&self, timeout: Duration) -> Option<CaptureResult<()>> {
        let deadline = Instant::now() + timeout;
        let mut object = self.inner.object.lock();
        while object.start == StartState::Starting {
            if self
                .inner
                .object_cond
                .wait_until(&mut object, deadline)
                .timed_out()
            {
                if object.start == StartState::Starting {
                    return None;
                }
                break;
            }
        }
        Some(object.start_result.clone().unwrap_or(Err(CaptureError::NotStarted)))
    }

    /// Whether the source is started. Blocks while a start is pending.
    pub fn is_started(&self) -> bool {
        let mut object = self.inner.object.lock();
        while object.start == StartState::Starting {
            self.inner.object_cond.wait(&mut object);
        }
        object.start == StartState::Started
    }

    /// Stop streaming and free every pool. Buffers still held downstream
    /// are freed when they are released.
    pub fn stop(&self) -> CaptureResult<()> {
        {
            let mut object = self.inner.object.lock();
            while object.start == StartState::Starting {
                self.inner.object_cond.wait(&mut object);
            }
            if object.start == StartState::Stopped {
                return Ok(());
            }
        }

        let inner = &self.inner;
        let _control = inner.control.lock();
        let channels = inner.channel_list();
        let pools = pools_of(&channels);

        inner.ctx.live.set_flushing(true, false, &pools);
        inner.ctx.device.cancel_dequeue();
        for channel in &channels {
            channel.join_task();
        }

        inner.sync.begin_stop();
        for channel in &channels {
            inner.sync.deactivate_channel(channel.id());
            channel.set_activated(false);
        }
        let result = inner.ctx.device.stop();
        if let Err(err) = &result {
            log::error!("device stop failed: {}", err);
        }
        for pool in &pools {
            pool.stop();
        }
        inner.sync.finish_stop();

        let mut object = inner.object.lock();
        object.start = StartState::Stopped;
        object.start_result = None;
        log::info!("capture source {} stopped", inner.settings.device_id);
        result
    }

    // ------------------------------------------------------------------------
    // Playing / flushing / seek / EOS
    // ------------------------------------------------------------------------

    /// PLAYING (`true`) or PAUSED (`false`) transition.
    pub fn set_playing(&self, playing: bool) {
        let inner = &self.inner;
        let _control = inner.control.lock();
        let channels = inner.channel_list();
        let pools = pools_of(&channels);
        inner.ctx.live.set_playing(playing, &pools);
        if !playing {
            inner.ctx.device.cancel_dequeue();
        } else if inner.is_started() {
            inner.restart_tasks(&channels);
        }
    }

    /// Enter or leave flushing.
    ///
    /// Entering cancels every blocked acquire, clock wait and dequeue, and
    /// returns once the production tasks have paused. Leaving sets the
    /// running state to `resume` and restarts the tasks.
    pub fn set_flushing(&self, flushing: bool, resume: bool) {
        let inner = &self.inner;
        let _control = inner.control.lock();
        let channels = inner.channel_list();
        let pools = pools_of(&channels);
        if flushing {
            inner.flush_start(&channels, &pools, resume);
        } else {
            inner.ctx.live.set_flushing(false, resume, &pools);
            for channel in &channels {
                channel.clear_ended();
            }
            if inner.is_started() {
                inner.restart_tasks(&channels);
            }
        }
    }

    /// Apply a seek, or re-apply the current segment when `request` is
    /// `None`. Returns whether the seek was accepted.
    pub fn perform_seek(&self, request: Option<SeekRequest>) -> bool {
        let inner = &self.inner;
        let flush = request.as_ref().map(|r| r.flush).unwrap_or(false);
        let _control = inner.control.lock();
        let channels = inner.channel_list();
        let pools = pools_of(&channels);
        let playing = inner.ctx.live.is_running();

        if flush {
            for channel in &channels {
                inner.ctx.downstream.event(channel.id(), StreamEvent::FlushStart);
            }
        }
        inner.flush_start(&channels, &pools, playing);

        if let Some(req) = &request {
            let mut object = inner.object.lock();
            if object.last_seek_seqnum == Some(req.seqnum) {
                log::warn!("seek {} already handled", req.seqnum);
            }
            object.last_seek_seqnum = Some(req.seqnum);
        }

        inner.ctx.live.set_flushing(false, playing, &pools);

        let mut segment = inner.ctx.segment.lock().clone();
        let accepted = match &request {
            Some(req) => segment.do_seek(req),
            None => true,
        };

        if flush {
            for channel in &channels {
                inner.ctx.downstream.event(channel.id(), StreamEvent::FlushStop);
            }
        }
        if accepted {
            *inner.ctx.segment.lock() = segment;
            for channel in &channels {
                channel.mark_segment_pending();
            }
        } else {
            log::warn!("seek rejected, keeping current segment");
            for channel in &channels {
                channel.clear_ended();
            }
        }
        if inner.is_started() {
            inner.restart_tasks(&channels);
        }
        accepted
    }

    /// Ask every channel to end its stream. Each one sends a forced EOS.
    ///
    /// Every pool is unlocked first, so a task blocked on an exhausted pool
    /// wakes and takes the request; the task re-locks its pool when it does.
    pub fn send_eos(&self) {
        let channels = self.inner.channel_list();
        log::info!("EOS requested for {} channel(s)", channels.len());
        for channel in &channels {
            channel.pool().unlock();
        }
        self.inner
            .ctx
            .live
            .request_eos(channels.iter().map(|channel| channel.id()));
        self.inner.ctx.device.cancel_dequeue();
    }

    /// Take a failed channel out of batch submission, return its queued
    /// buffers and stop its pool. The other channels keep streaming.
    pub fn deactivate_channel(&self, id: ChannelId) -> CaptureResult<()> {
        let inner = &self.inner;
        let _control = inner.control.lock();
        let channel = inner
            .channels
            .read()
            .get(&id)
            .cloned()
            .ok_or(CaptureError::UnknownChannel(id))?;

        channel.set_activated(false);
        inner.ctx.live.deactivate_channel(id);
        channel.pool().set_active(false);
        inner.ctx.device.cancel_dequeue();
        channel.join_task();

        inner.sync.deactivate_channel(id);
        channel.pool().stop();
        log::info!("channel={} deactivated", id);
        Ok(())
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("capture source stop on drop failed: {}", err);
        }
    }
}

fn pools_of(channels: &[Arc<Channel>]) -> Vec<Arc<BufferPool>> {
    channels.iter().map(|channel| channel.pool().clone()).collect()
}

impl SourceInner {
    fn make_channel(&self, id: ChannelId, settings: ChannelSettings) -> Arc<Channel> {
        let pool = Arc::new(BufferPool::new(
            id,
            self.ctx.device.clone(),
            self.downstream_pool.clone(),
        ));
        pool.set_print_fps(self.settings.print_fps);
        Arc::new(Channel::new(id, settings, pool))
    }

    fn channel_list(&self) -> Vec<Arc<Channel>> {
        self.channels.read().values().cloned().collect()
    }

    fn is_started(&self) -> bool {
        self.object.lock().start == StartState::Started
    }

    /// The device-open sequence.
    fn open(&self) -> CaptureResult<()> {
        let _control = self.control.lock();
        let settings = &self.settings;
        let channels = self.channel_list();
        let streams = channels
            .iter()
            .map(|channel| channel.stream_config(settings.io_mode))
            .collect::<CaptureResult<Vec<StreamConfig>>>()?;
        self.ctx.device.configure_streams(&streams)?;

        let mut started: Vec<Arc<BufferPool>> = Vec::with_capacity(channels.len());
        for (channel, stream) in channels.iter().zip(&streams) {
            let pool = channel.pool();
            let result = pool
                .configure(settings.io_mode, settings.buffer_count, stream.frame_size)
                .and_then(|_| pool.start());
            if let Err(err) = result {
                log::error!("channel={} pool start failed: {}", channel.id(), err);
                for pool in started {
                    pool.stop();
                }
                return Err(err);
            }
            started.push(pool.clone());
        }

        self.ctx.live.reset_for_start();
        *self.ctx.segment.lock() = Segment::default();
        self.sync.set_usage(settings.buffer_usage);
        for channel in &channels {
            self.sync.activate_channel(channel.pool().clone());
            channel.prepare_for_start(settings.num_buffers);
        }
        self.sync.start();

        if let Err(err) = self.ctx.device.start() {
            log::error!("device start failed: {}", err);
            self.sync.begin_stop();
            for channel in &channels {
                self.sync.deactivate_channel(channel.id());
                channel.set_activated(false);
                channel.pool().stop();
            }
            self.sync.finish_stop();
            return Err(err);
        }
        log::info!(
            "capture source {} streaming on {} channel(s)",
            settings.device_id,
            channels.len()
        );
        Ok(())
    }

    fn start_complete(&self, result: CaptureResult<()>) {
        {
            let mut object = self.object.lock();
            if object.start != StartState::Starting {
                log::warn!("start completion without a pending start ignored");
                return;
            }
            object.start = if result.is_ok() {
                StartState::Started
            } else {
                StartState::Stopped
            };
            object.start_result = Some(result.clone());
            self.object_cond.notify_all();
        }
        match result {
            Ok(()) => {
                let _control = self.control.lock();
                self.restart_tasks(&self.channel_list());
            }
            Err(err) => log::error!("capture source failed to start: {}", err),
        }
    }

    fn flush_start(&self, channels: &[Arc<Channel>], pools: &[Arc<BufferPool>], resume: bool) {
        self.ctx.live.set_flushing(true, resume, pools);
        self.ctx.device.cancel_dequeue();
        for channel in channels {
            channel.join_task();
        }
    }

    fn restart_tasks(&self, channels: &[Arc<Channel>]) {
        for channel in channels {
            let restart = {
                let state = channel.state.lock();
                state.activated && !state.ended
            };
            if !restart {
                continue;
            }
            if let Err(err) = spawn_task(&self.ctx, channel) {
                log::error!("channel={} {}", channel.id(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::device::{SyntheticConfig, SyntheticDevice};
    use crate::error::FlowStatus;

    struct Discard;

    impl Downstream for Discard {
        fn push(&self, _channel: ChannelId, _buffer: FrameBuffer, _ts: Option<Duration>) -> FlowStatus {
            FlowStatus::Ok
        }

        fn event(&self, _channel: ChannelId, _event: StreamEvent) {}
    }

    fn small_settings() -> SourceSettings {
        SourceSettings {
            buffer_count: 2,
            primary: ChannelSettings {
                width: 8,
                height: 8,
                format: "GRAY8".to_string(),
                ..ChannelSettings::default()
            },
            ..SourceSettings::default()
        }
    }

    fn source(settings: SourceSettings) -> (CaptureSource, Arc<SyntheticDevice>) {
        let device = SyntheticDevice::shared(SyntheticConfig::default());
        let source = CaptureSource::new(
            settings,
            device.clone(),
            SystemClock::shared(),
            Arc::new(Discard),
        )
        .unwrap();
        (source, device)
    }

    #[test]
    fn rejects_out_of_range_buffer_count() {
        let device = SyntheticDevice::shared(SyntheticConfig::default());
        let result = CaptureSource::new(
            SourceSettings {
                buffer_count: 11,
                ..small_settings()
            },
            device,
            SystemClock::shared(),
            Arc::new(Discard),
        );
        assert!(matches!(result, Err(CaptureError::InvalidConfig(_))));
    }

    #[test]
    fn channels_change_only_while_stopped() {
        let (source, _device) = source(small_settings());
        let id = source.add_channel(small_settings().primary).unwrap();
        assert_eq!(id, ChannelId(1));
        assert_eq!(source.channel_ids(), vec![ChannelId(0), ChannelId(1)]);

        source.start().unwrap();
        assert!(source.add_channel(small_settings().primary).is_err());
        assert!(source.remove_channel(id).is_err());
        source.stop().unwrap();

        source.remove_channel(id).unwrap();
        assert!(source.remove_channel(ChannelId::PRIMARY).is_err());
        assert_eq!(
            source.remove_channel(ChannelId(9)),
            Err(CaptureError::UnknownChannel(ChannelId(9)))
        );
    }

    #[test]
    fn start_and_stop_drive_the_device() {
        let (source, device) = source(small_settings());
        source.start().unwrap();
        assert!(source.is_started());
        assert!(device.is_started());
        assert_eq!(device.streams().len(), 1);
        assert_eq!(source.synchronizer().active_channels(), vec![ChannelId(0)]);

        source.stop().unwrap();
        assert!(!source.is_started());
        assert!(!device.is_started());
        assert!(source.synchronizer().active_channels().is_empty());
        assert!(!source.channel(ChannelId(0)).unwrap().pool().is_started());
    }

    #[test]
    fn failed_start_leaves_source_stopped() {
        let device = SyntheticDevice::shared(SyntheticConfig {
            fail_allocation_at: Some(1),
            ..SyntheticConfig::default()
        });
        let source = CaptureSource::new(
            SourceSettings {
                io_mode: AllocationMode::DeviceMapped,
                ..small_settings()
            },
            device.clone(),
            SystemClock::shared(),
            Arc::new(Discard),
        )
        .unwrap();
        assert!(matches!(
            source.start(),
            Err(CaptureError::AllocationFailure(_))
        ));
        assert!(!source.is_started());
        assert_eq!(device.live_mappings(), 0);
    }

    #[test]
    fn async_start_reports_through_start_wait() {
        let (source, _device) = source(SourceSettings {
            async_start: true,
            ..small_settings()
        });
        source.start().unwrap();
        assert_eq!(source.start_wait_timeout(Duration::from_secs(5)), Some(Ok(())));
        assert_eq!(source.start_wait(), Ok(()));
        assert!(source.is_started());
        source.stop().unwrap();
    }

    #[test]
    fn start_complete_without_pending_start_is_ignored() {
        let (source, _device) = source(small_settings());
        source.start_complete(Ok(()));
        assert!(!source.is_started());
    }

    #[test]
    fn rejected_seek_keeps_segment() {
        let (source, _device) = source(small_settings());
        let before = source.segment();
        assert!(!source.perform_seek(Some(SeekRequest {
            rate: 0.0,
            ..SeekRequest::default()
        })));
        assert_eq!(source.segment(), before);
        assert!(source.perform_seek(None));
    }
}
