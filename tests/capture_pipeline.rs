use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use capture_engine::{
    AllocationMode, CaptureError, CaptureSource, ChannelId, ChannelSettings, Downstream,
    DownstreamPool, FlowStatus, FrameBuffer, ReturnPath, SeekRequest, SeekTarget, SourceSettings,
    StreamEvent, SyntheticConfig, SyntheticDevice, SyntheticDownstreamPool, SystemClock,
};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Record {
    events: Vec<(ChannelId, StreamEvent)>,
    pushed: HashMap<ChannelId, u64>,
    held: Vec<FrameBuffer>,
}

/// Downstream that hands every buffer straight back through the return path,
/// or keeps it while `keep` is set.
#[derive(Default)]
struct Loopback {
    path: OnceLock<ReturnPath>,
    keep: AtomicBool,
    record: Mutex<Record>,
    cond: Condvar,
}

impl Loopback {
    fn wait_until(&self, mut done: impl FnMut(&Record) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut record = self.record.lock();
        while !done(&record) {
            if self.cond.wait_until(&mut record, deadline).timed_out() {
                return done(&record);
            }
        }
        true
    }

    fn pushed(&self, channel: ChannelId) -> u64 {
        self.record.lock().pushed.get(&channel).copied().unwrap_or(0)
    }

    fn return_held(&self) {
        let held = std::mem::take(&mut self.record.lock().held);
        if let Some(path) = self.path.get() {
            for buffer in held {
                path.release(buffer);
            }
        }
    }

    fn events(&self, channel: ChannelId) -> Vec<StreamEvent> {
        self.record
            .lock()
            .events
            .iter()
            .filter(|(id, _)| *id == channel)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

impl Downstream for Loopback {
    fn push(&self, channel: ChannelId, buffer: FrameBuffer, _ts: Option<Duration>) -> FlowStatus {
        {
            let mut record = self.record.lock();
            *record.pushed.entry(channel).or_default() += 1;
            self.cond.notify_all();
            if self.keep.load(Ordering::SeqCst) {
                record.held.push(buffer);
                return FlowStatus::Ok;
            }
        }
        if let Some(path) = self.path.get() {
            path.release(buffer);
        }
        FlowStatus::Ok
    }

    fn event(&self, channel: ChannelId, event: StreamEvent) {
        self.record.lock().events.push((channel, event));
        self.cond.notify_all();
    }
}

fn gray(width: u32, height: u32) -> ChannelSettings {
    ChannelSettings {
        width,
        height,
        format: "GRAY8".to_string(),
        ..ChannelSettings::default()
    }
}

fn settings() -> SourceSettings {
    SourceSettings {
        buffer_count: 4,
        live: false,
        primary: gray(16, 8),
        ..SourceSettings::default()
    }
}

fn fast_device() -> SyntheticConfig {
    SyntheticConfig {
        frame_interval: Duration::from_millis(2),
        ..SyntheticConfig::default()
    }
}

fn build(
    settings: SourceSettings,
    config: SyntheticConfig,
    downstream_pool: Option<Arc<dyn DownstreamPool>>,
) -> (CaptureSource, Arc<SyntheticDevice>, Arc<Loopback>) {
    capture_engine::logging::init_for_tests();
    let device = SyntheticDevice::shared(config);
    let loopback = Arc::new(Loopback::default());
    let source = CaptureSource::with_downstream_pool(
        settings,
        device.clone(),
        SystemClock::shared(),
        loopback.clone(),
        downstream_pool,
    )
    .expect("source");
    let _ = loopback.path.set(source.return_path());
    (source, device, loopback)
}

/// Start, and for a live source also go to playing.
fn start_streaming(source: &CaptureSource) {
    source.start().expect("start");
    if source.settings().live {
        source.set_playing(true);
    }
}

fn has_event(record: &Record, channel: ChannelId, event: &StreamEvent) -> bool {
    record
        .events
        .iter()
        .any(|(id, seen)| *id == channel && seen == event)
}

#[test]
fn every_allocation_mode_streams_and_frees_its_memory() {
    for mode in [
        AllocationMode::SelfAllocated,
        AllocationMode::DeviceMapped,
        AllocationMode::DeviceExported,
        AllocationMode::DownstreamImported,
    ] {
        let lender = SyntheticDownstreamPool::shared(8);
        let (source, device, loopback) = build(
            SourceSettings {
                io_mode: mode,
                num_buffers: Some(20),
                ..settings()
            },
            fast_device(),
            Some(lender.clone() as Arc<dyn DownstreamPool>),
        );
        source.start().expect("start");

        let eos = StreamEvent::Eos { forced: false };
        assert!(
            loopback.wait_until(|r| has_event(r, ChannelId::PRIMARY, &eos)),
            "{} never reached EOS",
            mode
        );
        assert_eq!(loopback.pushed(ChannelId::PRIMARY), 20, "{}", mode);
        let events = loopback.events(ChannelId::PRIMARY);
        assert!(matches!(events[0], StreamEvent::StreamStart { .. }), "{}", mode);
        assert!(matches!(events[1], StreamEvent::Segment(_)), "{}", mode);
        assert_eq!(events.last(), Some(&eos), "{}", mode);

        source.stop().expect("stop");
        assert_eq!(device.live_mappings(), 0, "{}", mode);
        assert_eq!(device.open_descriptors(), 0, "{}", mode);
        assert_eq!(lender.lent(), 0, "{}", mode);
        assert_eq!(lender.open_descriptors(), 0, "{}", mode);
    }
}

#[test]
fn channels_are_submitted_together() {
    for live in [false, true] {
        let (source, device, loopback) = build(
            SourceSettings {
                print_fps: true,
                live,
                ..settings()
            },
            fast_device(),
            None,
        );
        let secondary = source.add_channel(gray(8, 8)).expect("add channel");
        start_streaming(&source);

        assert!(
            loopback.wait_until(|r| {
                r.pushed.get(&ChannelId::PRIMARY).copied().unwrap_or(0) >= 20
                    && r.pushed.get(&secondary).copied().unwrap_or(0) >= 20
            }),
            "live={}",
            live
        );
        source.stop().expect("stop");

        let batches = device.submissions();
        assert!(!batches.is_empty(), "live={}", live);
        for batch in &batches {
            let mut channels: Vec<ChannelId> = batch.iter().map(|(id, _)| *id).collect();
            channels.sort();
            assert_eq!(channels, vec![ChannelId::PRIMARY, secondary], "live={}", live);
        }
        assert_eq!(source.synchronizer().stats().failures, 0);
    }
}

#[test]
fn host_eos_is_forced_on_every_channel() {
    for live in [false, true] {
        let (source, _device, loopback) = build(
            SourceSettings {
                live,
                ..settings()
            },
            fast_device(),
            None,
        );
        let secondary = source.add_channel(gray(8, 8)).expect("add channel");
        start_streaming(&source);
        assert!(loopback.wait_until(|r| r.pushed.get(&secondary).copied().unwrap_or(0) >= 3));

        source.send_eos();
        let forced = StreamEvent::Eos { forced: true };
        assert!(
            loopback.wait_until(|r| {
                has_event(r, ChannelId::PRIMARY, &forced) && has_event(r, secondary, &forced)
            }),
            "live={}",
            live
        );
        for channel in [ChannelId::PRIMARY, secondary] {
            assert!(!loopback
                .events(channel)
                .iter()
                .any(|event| matches!(event, StreamEvent::Error(_))));
        }
        source.stop().expect("stop");
    }
}

#[test]
fn host_eos_reaches_a_channel_whose_buffers_are_all_downstream() {
    let (source, _device, loopback) = build(
        SourceSettings {
            buffer_count: 2,
            ..settings()
        },
        fast_device(),
        None,
    );
    loopback.keep.store(true, Ordering::SeqCst);
    source.start().expect("start");
    assert!(loopback.wait_until(|r| r.held.len() == 2));
    // The task is now blocked waiting for a free buffer.
    std::thread::sleep(Duration::from_millis(50));

    source.send_eos();
    let forced = StreamEvent::Eos { forced: true };
    let deadline = Instant::now() + Duration::from_millis(500);
    let mut delivered = false;
    while Instant::now() < deadline {
        if has_event(&loopback.record.lock(), ChannelId::PRIMARY, &forced) {
            delivered = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(delivered, "EOS not delivered while downstream held every buffer");
    assert_eq!(loopback.pushed(ChannelId::PRIMARY), 2);

    // Once the buffers come back, a flush cycle streams again.
    loopback.keep.store(false, Ordering::SeqCst);
    loopback.return_held();
    source.set_flushing(true, false);
    source.set_flushing(false, true);
    assert!(loopback.wait_until(|r| r.pushed.get(&ChannelId::PRIMARY).copied().unwrap_or(0) >= 5));
    source.stop().expect("stop");
}

#[test]
fn device_failure_reports_error_then_eos() {
    let (source, _device, loopback) = build(
        settings(),
        SyntheticConfig {
            fail_dequeue_after: Some(3),
            ..fast_device()
        },
        None,
    );
    source.start().expect("start");

    let eos = StreamEvent::Eos { forced: false };
    assert!(loopback.wait_until(|r| has_event(r, ChannelId::PRIMARY, &eos)));
    assert_eq!(loopback.pushed(ChannelId::PRIMARY), 3);
    let events = loopback.events(ChannelId::PRIMARY);
    let tail = &events[events.len() - 2..];
    assert!(matches!(tail[0], StreamEvent::Error(CaptureError::DeviceFailure(_))));
    assert_eq!(tail[1], eos);
    source.stop().expect("stop");
}

#[test]
fn flushing_seek_sends_flush_events_and_a_new_segment() {
    let (source, _device, loopback) = build(settings(), fast_device(), None);
    source.start().expect("start");
    assert!(loopback.wait_until(|r| r.pushed.get(&ChannelId::PRIMARY).copied().unwrap_or(0) >= 2));

    let accepted = source.perform_seek(Some(SeekRequest {
        start: SeekTarget::Set(Duration::from_millis(1)),
        stop: SeekTarget::Set(Duration::from_millis(500)),
        seqnum: 7,
        ..SeekRequest::default()
    }));
    assert!(accepted);
    assert_eq!(source.segment().stop, Some(Duration::from_millis(500)));

    // Buffers past the new stop end the stream.
    let eos = StreamEvent::Eos { forced: false };
    assert!(loopback.wait_until(|r| has_event(r, ChannelId::PRIMARY, &eos)));

    let events = loopback.events(ChannelId::PRIMARY);
    let flush_start = events
        .iter()
        .position(|e| *e == StreamEvent::FlushStart)
        .expect("flush start");
    let flush_stop = events
        .iter()
        .position(|e| *e == StreamEvent::FlushStop)
        .expect("flush stop");
    assert!(flush_start < flush_stop);
    let segment = events[flush_stop..]
        .iter()
        .find_map(|e| match e {
            StreamEvent::Segment(segment) => Some(segment.clone()),
            _ => None,
        })
        .expect("segment after seek");
    assert_eq!(segment.start, Duration::from_millis(1));
    source.stop().expect("stop");
}

#[test]
fn deactivated_channel_leaves_the_others_streaming() {
    for live in [false, true] {
        let (source, device, loopback) = build(
            SourceSettings {
                live,
                ..settings()
            },
            fast_device(),
            None,
        );
        let secondary = source.add_channel(gray(8, 8)).expect("add channel");
        start_streaming(&source);
        assert!(loopback.wait_until(|r| r.pushed.get(&secondary).copied().unwrap_or(0) >= 3));

        source.deactivate_channel(secondary).expect("deactivate");
        assert_eq!(source.synchronizer().active_channels(), vec![ChannelId::PRIMARY]);
        let batches_before = device.submissions().len();
        let primary_before = loopback.pushed(ChannelId::PRIMARY);

        assert!(
            loopback.wait_until(|r| {
                r.pushed.get(&ChannelId::PRIMARY).copied().unwrap_or(0) >= primary_before + 10
            }),
            "live={}",
            live
        );
        let batches = device.submissions();
        assert!(batches.len() > batches_before);
        for batch in &batches[batches_before..] {
            assert!(batch.iter().all(|(id, _)| *id == ChannelId::PRIMARY));
        }
        assert_eq!(
            source.deactivate_channel(ChannelId(42)),
            Err(CaptureError::UnknownChannel(ChannelId(42)))
        );
        source.stop().expect("stop");
    }
}

#[test]
fn deactivating_a_channel_of_a_paused_live_source_returns() {
    let (source, device, loopback) = build(
        SourceSettings {
            live: true,
            ..settings()
        },
        fast_device(),
        None,
    );
    let secondary = source.add_channel(gray(8, 8)).expect("add channel");
    source.start().expect("start");
    std::thread::sleep(Duration::from_millis(50));

    let source = Arc::new(source);
    let (tx, rx) = mpsc::channel();
    {
        let source = source.clone();
        std::thread::spawn(move || {
            let _ = tx.send(source.deactivate_channel(secondary));
        });
    }
    let result = rx.recv_timeout(Duration::from_secs(3));
    assert_eq!(result, Ok(Ok(())));
    assert_eq!(source.synchronizer().active_channels(), vec![ChannelId::PRIMARY]);

    // Control operations still go through, and the remaining channel plays.
    source.set_playing(true);
    assert!(loopback.wait_until(|r| r.pushed.get(&ChannelId::PRIMARY).copied().unwrap_or(0) >= 5));
    assert_eq!(loopback.pushed(secondary), 0);
    for batch in device.submissions() {
        assert!(batch.iter().all(|(id, _)| *id == ChannelId::PRIMARY));
    }
    source.stop().expect("stop");
}

#[test]
fn paused_live_source_produces_nothing_until_playing() {
    let (source, _device, loopback) = build(
        SourceSettings {
            live: true,
            ..settings()
        },
        fast_device(),
        None,
    );
    source.start().expect("start");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(loopback.pushed(ChannelId::PRIMARY), 0);

    source.set_playing(true);
    assert!(loopback.wait_until(|r| r.pushed.get(&ChannelId::PRIMARY).copied().unwrap_or(0) >= 5));
    source.stop().expect("stop");
}

#[test]
fn flush_unblocks_a_slow_device_promptly() {
    let (source, _device, loopback) = build(
        SourceSettings {
            live: true,
            ..settings()
        },
        SyntheticConfig {
            frame_interval: Duration::from_secs(2),
            ..SyntheticConfig::default()
        },
        None,
    );
    source.start().expect("start");
    source.set_playing(true);
    std::thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    source.set_flushing(true, false);
    assert!(started.elapsed() < Duration::from_millis(500));
    let channel = source.channel(ChannelId::PRIMARY).expect("primary");
    assert!(channel.wait_task_paused(Duration::ZERO));
    assert_eq!(loopback.pushed(ChannelId::PRIMARY), 0);

    // No EOS or error for a flush.
    assert!(!loopback
        .events(ChannelId::PRIMARY)
        .iter()
        .any(|e| matches!(e, StreamEvent::Eos { .. } | StreamEvent::Error(_))));

    source.set_flushing(false, true);
    std::thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    source.stop().expect("stop");
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn restart_after_stop_streams_again() {
    let (source, device, loopback) = build(settings(), fast_device(), None);
    source.start().expect("start");
    assert!(loopback.wait_until(|r| r.pushed.get(&ChannelId::PRIMARY).copied().unwrap_or(0) >= 3));
    source.stop().expect("stop");
    let first_run = loopback.pushed(ChannelId::PRIMARY);

    source.start().expect("restart");
    assert!(loopback.wait_until(|r| {
        r.pushed.get(&ChannelId::PRIMARY).copied().unwrap_or(0) >= first_run + 3
    }));
    source.stop().expect("stop");

    let starts = loopback
        .events(ChannelId::PRIMARY)
        .iter()
        .filter(|e| matches!(e, StreamEvent::StreamStart { .. }))
        .count();
    assert_eq!(starts, 2);
    assert_eq!(device.live_mappings(), 0);
}

#[test]
fn async_start_streams_after_start_wait() {
    let (source, _device, loopback) = build(
        SourceSettings {
            async_start: true,
            ..settings()
        },
        fast_device(),
        None,
    );
    source.start().expect("start");
    assert_eq!(source.start_wait(), Ok(()));
    assert!(loopback.wait_until(|r| r.pushed.get(&ChannelId::PRIMARY).copied().unwrap_or(0) >= 3));
    source.stop().expect("stop");
}

#[test]
fn failed_submissions_park_every_slot_until_stop() {
    let (source, device, loopback) = build(settings(), fast_device(), None);
    source.start().expect("start");
    assert!(loopback.wait_until(|r| r.pushed.get(&ChannelId::PRIMARY).copied().unwrap_or(0) >= 2));

    device.set_fail_submit(true);
    // Each failed batch parks one slot; with four slots the channel stops
    // producing once all are orphaned.
    let deadline = Instant::now() + WAIT;
    while source.synchronizer().stats().failures < 4 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(source.synchronizer().stats().failures, 4);
    let census = source
        .channel(ChannelId::PRIMARY)
        .expect("primary")
        .pool()
        .census();
    assert_eq!(census.total(), 4);
    source.stop().expect("stop");
    assert_eq!(device.live_mappings(), 0);
}
