//! Synthetic capture device.
//!
//! `SyntheticDevice` stands in for real hardware the way `stub://` sources
//! do: frames are generated in memory at a fixed interval, so the full
//! capture path can run without a camera.
//!
//! It also keeps the bookkeeping tests need:
//! - every batch submission, in order
//! - mapped regions and open descriptors, for leak checks
//! - fault injection for dequeue, allocation and submission

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{DeviceAdapter, DownstreamPool, StreamConfig};
use crate::buffer::{AllocationMode, FieldParity, FrameBuffer};
use crate::error::{CaptureError, CaptureResult};
use crate::memory::{
    DescriptorOps, DeviceMemory, DmaHandle, ImportedBuffer, MappedRegion, RawDescriptor,
};
use crate::ChannelId;

/// Behaviour of a synthetic device.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Time between two frames of the same channel.
    pub frame_interval: Duration,
    /// Report alternating top/bottom fields instead of progressive frames.
    pub alternate_fields: bool,
    /// Fail every dequeue once this many frames were delivered on a channel.
    pub fail_dequeue_after: Option<u64>,
    /// Fail the allocation with this zero-based index.
    pub fail_allocation_at: Option<usize>,
    /// Skip one sequence number every N frames to simulate dropped frames.
    pub drop_sequence_every: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(10),
            alternate_fields: false,
            fail_dequeue_after: None,
            fail_allocation_at: None,
            drop_sequence_every: None,
        }
    }
}

// ----------------------------------------------------------------------------
// DescriptorTable: in-process descriptor namespace
// ----------------------------------------------------------------------------

/// Descriptor namespace that only tracks numbers, for devices that have no
/// kernel objects behind their handles.
#[derive(Debug, Default)]
pub struct DescriptorTable {
    inner: Mutex<DescriptorInner>,
}

#[derive(Debug, Default)]
struct DescriptorInner {
    next: RawDescriptor,
    open: HashSet<RawDescriptor>,
}

impl DescriptorTable {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(self: &Arc<Self>, len: usize) -> DmaHandle {
        let raw = self.inner.lock().allocate();
        DmaHandle::from_raw(raw, len, self.clone())
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().open.len()
    }
}

impl DescriptorInner {
    fn allocate(&mut self) -> RawDescriptor {
        self.next += 1;
        self.open.insert(self.next);
        self.next
    }
}

impl DescriptorOps for DescriptorTable {
    fn duplicate(&self, raw: RawDescriptor) -> io::Result<RawDescriptor> {
        let mut inner = self.inner.lock();
        if !inner.open.contains(&raw) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {} is not open", raw),
            ));
        }
        Ok(inner.allocate())
    }

    fn close(&self, raw: RawDescriptor) -> io::Result<()> {
        if self.inner.lock().open.remove(&raw) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("descriptor {} closed twice", raw),
            ))
        }
    }
}

// ----------------------------------------------------------------------------
// SyntheticDevice
// ----------------------------------------------------------------------------

pub struct SyntheticDevice {
    config: SyntheticConfig,
    descriptors: Arc<DescriptorTable>,
    state: Mutex<DeviceState>,
    wake: Condvar,
}

#[derive(Default)]
struct DeviceState {
    streams: Vec<StreamConfig>,
    started: bool,
    epoch: Option<Instant>,
    channels: HashMap<ChannelId, ChannelClock>,
    mappings: HashMap<u64, Box<[u8]>>,
    next_cookie: u64,
    allocations: usize,
    submissions: Vec<Vec<(ChannelId, usize)>>,
    fail_submit: bool,
    cancel_generation: u64,
}

#[derive(Default)]
struct ChannelClock {
    next_due: Option<Instant>,
    sequence: u64,
    delivered: u64,
}

impl SyntheticDevice {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            descriptors: DescriptorTable::shared(),
            state: Mutex::new(DeviceState::default()),
            wake: Condvar::new(),
        }
    }

    pub fn shared(config: SyntheticConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn descriptors(&self) -> Arc<DescriptorTable> {
        self.descriptors.clone()
    }

    /// Make every following `submit` fail (or succeed again).
    pub fn set_fail_submit(&self, fail: bool) {
        self.state.lock().fail_submit = fail;
    }

    /// Slot indices of every successful batch, in submission order.
    pub fn submissions(&self) -> Vec<Vec<(ChannelId, usize)>> {
        self.state.lock().submissions.clone()
    }

    pub fn streams(&self) -> Vec<StreamConfig> {
        self.state.lock().streams.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn frames_delivered(&self, channel: ChannelId) -> u64 {
        self.state
            .lock()
            .channels
            .get(&channel)
            .map(|clock| clock.delivered)
            .unwrap_or(0)
    }

    /// Device-mapped regions not yet released.
    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    pub fn open_descriptors(&self) -> usize {
        self.descriptors.open_count()
    }

    fn fill_pattern(buffer: &mut FrameBuffer, frame_count: u64) {
        let Some(bytes) = buffer.data_mut() else {
            return;
        };
        // Mix frame count and position so consecutive frames differ.
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = ((i as u64 + frame_count) % 256) as u8;
        }
    }
}

impl DeviceAdapter for SyntheticDevice {
    fn configure_streams(&self, streams: &[StreamConfig]) -> CaptureResult<()> {
        if streams.is_empty() {
            return Err(CaptureError::InvalidConfig(
                "no streams to configure".to_string(),
            ));
        }
        let mut state = self.state.lock();
        state.streams = streams.to_vec();
        state.channels = streams
            .iter()
            .map(|s| (s.channel, ChannelClock::default()))
            .collect();
        log::info!("SyntheticDevice: configured {} stream(s)", streams.len());
        Ok(())
    }

    fn start(&self) -> CaptureResult<()> {
        let mut state = self.state.lock();
        if state.streams.is_empty() {
            return Err(CaptureError::DeviceFailure(
                "start before configure_streams".to_string(),
            ));
        }
        let now = Instant::now();
        state.started = true;
        state.epoch = Some(now);
        for clock in state.channels.values_mut() {
            clock.next_due = Some(now + self.config.frame_interval);
        }
        log::info!("SyntheticDevice: streaming started");
        Ok(())
    }

    fn stop(&self) -> CaptureResult<()> {
        let mut state = self.state.lock();
        state.started = false;
        state.cancel_generation += 1;
        self.wake.notify_all();
        log::info!("SyntheticDevice: streaming stopped");
        Ok(())
    }

    fn allocate_memory(
        &self,
        channel: ChannelId,
        mode: AllocationMode,
        size: usize,
    ) -> CaptureResult<DeviceMemory> {
        let mut state = self.state.lock();
        let attempt = state.allocations;
        state.allocations += 1;
        if self.config.fail_allocation_at == Some(attempt) {
            return Err(CaptureError::AllocationFailure(format!(
                "injected failure at allocation {} (channel={})",
                attempt, channel
            )));
        }
        match mode {
            AllocationMode::DeviceMapped => {
                let mut backing = vec![0u8; size].into_boxed_slice();
                let addr = backing.as_mut_ptr();
                state.next_cookie += 1;
                let cookie = state.next_cookie;
                state.mappings.insert(cookie, backing);
                // SAFETY: the boxed slice lives in `mappings` until
                // release_memory removes it, and its heap block never moves.
                let region = unsafe { MappedRegion::from_raw_parts(addr, size, cookie) }
                    .ok_or_else(|| {
                        CaptureError::AllocationFailure("null mapping".to_string())
                    })?;
                Ok(DeviceMemory::Mapped(region))
            }
            AllocationMode::DeviceExported => Ok(DeviceMemory::Exported(self.descriptors.open(size))),
            other => Err(CaptureError::InvalidConfig(format!(
                "device cannot allocate {} memory",
                other
            ))),
        }
    }

    fn release_memory(&self, channel: ChannelId, memory: DeviceMemory) {
        match memory {
            DeviceMemory::Mapped(region) => {
                if self.state.lock().mappings.remove(&region.cookie()).is_none() {
                    log::warn!(
                        "SyntheticDevice: unknown mapping {} released (channel={})",
                        region.cookie(),
                        channel
                    );
                }
            }
            DeviceMemory::Exported(handle) => {
                if let Err(err) = handle.close() {
                    log::warn!("SyntheticDevice: close failed (channel={}): {}", channel, err);
                }
            }
        }
    }

    fn submit(&self, batch: &[FrameBuffer]) -> CaptureResult<()> {
        let mut state = self.state.lock();
        if state.fail_submit {
            return Err(CaptureError::SubmissionFailure(
                "injected submission failure".to_string(),
            ));
        }
        state
            .submissions
            .push(batch.iter().map(|b| (b.channel(), b.index())).collect());
        Ok(())
    }

    fn dequeue(&self, channel: ChannelId, buffer: &mut FrameBuffer) -> CaptureResult<()> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(CaptureError::DeviceFailure("device not started".to_string()));
        }
        let generation = state.cancel_generation;
        let interval = self.config.frame_interval;

        let due = {
            let clock = state
                .channels
                .get_mut(&channel)
                .ok_or(CaptureError::UnknownChannel(channel))?;
            if let Some(limit) = self.config.fail_dequeue_after {
                if clock.delivered >= limit {
                    return Err(CaptureError::DeviceFailure(format!(
                        "injected dequeue failure after {} frames",
                        limit
                    )));
                }
            }
            clock.next_due.unwrap_or_else(Instant::now)
        };

        loop {
            if state.cancel_generation != generation {
                return Err(CaptureError::Cancelled);
            }
            let now = Instant::now();
            if now >= due {
                break;
            }
            self.wake.wait_for(&mut state, due - now);
        }

        let epoch = state.epoch.unwrap_or_else(Instant::now);
        let clock = state
            .channels
            .get_mut(&channel)
            .ok_or(CaptureError::UnknownChannel(channel))?;
        clock.sequence += 1;
        if let Some(every) = self.config.drop_sequence_every {
            if every > 0 && clock.sequence % every == 0 {
                clock.sequence += 1;
            }
        }
        clock.delivered += 1;
        clock.next_due = Some(due + interval);

        let field = if self.config.alternate_fields {
            if clock.sequence % 2 == 1 {
                FieldParity::Top
            } else {
                FieldParity::Bottom
            }
        } else {
            FieldParity::None
        };
        let sequence = clock.sequence;
        let delivered = clock.delivered;
        buffer.set_capture(sequence, Some(due.saturating_duration_since(epoch)), field);
        drop(state);

        Self::fill_pattern(buffer, delivered);
        Ok(())
    }

    fn cancel_dequeue(&self) {
        let mut state = self.state.lock();
        state.cancel_generation += 1;
        self.wake.notify_all();
    }
}

// ----------------------------------------------------------------------------
// SyntheticDownstreamPool
// ----------------------------------------------------------------------------

/// Downstream-owned pool lending descriptors to an importing capture pool.
pub struct SyntheticDownstreamPool {
    descriptors: Arc<DescriptorTable>,
    capacity: usize,
    state: Mutex<LendingState>,
}

#[derive(Default)]
struct LendingState {
    next_token: u64,
    lent: HashSet<u64>,
    returned: u64,
}

impl SyntheticDownstreamPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            descriptors: DescriptorTable::shared(),
            capacity,
            state: Mutex::new(LendingState::default()),
        }
    }

    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    pub fn lent(&self) -> usize {
        self.state.lock().lent.len()
    }

    pub fn returned(&self) -> u64 {
        self.state.lock().returned
    }

    pub fn open_descriptors(&self) -> usize {
        self.descriptors.open_count()
    }
}

impl DownstreamPool for SyntheticDownstreamPool {
    fn acquire(&self, size: usize) -> CaptureResult<ImportedBuffer> {
        let mut state = self.state.lock();
        if state.lent.len() >= self.capacity {
            return Err(CaptureError::AllocationFailure(format!(
                "downstream pool exhausted ({} buffers lent)",
                state.lent.len()
            )));
        }
        state.next_token += 1;
        let token = state.next_token;
        state.lent.insert(token);
        Ok(ImportedBuffer {
            handle: self.descriptors.open(size),
            token,
        })
    }

    fn give_back(&self, buffer: ImportedBuffer) {
        let mut state = self.state.lock();
        if !state.lent.remove(&buffer.token) {
            log::warn!("SyntheticDownstreamPool: unknown buffer {} returned", buffer.token);
        }
        state.returned += 1;
        drop(state);
        if let Err(err) = buffer.handle.close() {
            log::warn!("SyntheticDownstreamPool: close failed: {}", err);
        }
    }
}
