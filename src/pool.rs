//! Per-channel buffer pool.
//!
//! The pool owns a fixed set of slots, one `FrameBuffer` each, backed by
//! memory from one of the four allocation modes. It records which side owns
//! every slot and is the only place slot ownership changes:
//!
//! ```text
//!   InPool --acquire--> WithDevice --mark_delivered--> WithDownstream
//!     ^                                                      |
//!     +---- recycle (batch submitted) <--- Queued <--release-+
//! ```
//!
//! A dropped batch parks its buffers as `WithDevice` until the pool stops.
//! Buffers still outstanding at `stop()` belong to a retired generation and
//! are freed as soon as they come back.

use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::buffer::{AllocationMode, FrameBuffer, Ownership};
use crate::device::{DeviceAdapter, DownstreamPool};
use crate::error::{CaptureError, CaptureResult};
use crate::memory::{BackingMemory, DeviceMemory, PinnedMemory};
use crate::stats::FrameRateMonitor;
use crate::submit::SubmissionSynchronizer;
use crate::ChannelId;

pub const MIN_CAPACITY: usize = 2;
pub const MAX_CAPACITY: usize = 10;

/// Slot counts per ownership state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OwnershipCensus {
    pub in_pool: usize,
    pub with_device: usize,
    pub with_downstream: usize,
    pub queued: usize,
}

impl OwnershipCensus {
    pub fn total(&self) -> usize {
        self.in_pool + self.with_device + self.with_downstream + self.queued
    }
}

struct Slot {
    ownership: Ownership,
    /// Present while the pool holds the buffer: `InPool`, or parked after a
    /// dropped submission.
    buffer: Option<FrameBuffer>,
}

struct PoolState {
    mode: AllocationMode,
    capacity: usize,
    size: usize,
    configured: bool,
    started: bool,
    active: bool,
    unlocked: bool,
    generation: u64,
    acquire_index: usize,
    slots: Vec<Slot>,
    print_fps: bool,
    fps: Option<FrameRateMonitor>,
}

pub struct BufferPool {
    channel: ChannelId,
    device: Arc<dyn DeviceAdapter>,
    downstream: Option<Arc<dyn DownstreamPool>>,
    submitter: Mutex<Weak<SubmissionSynchronizer>>,
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl BufferPool {
    pub fn new(
        channel: ChannelId,
        device: Arc<dyn DeviceAdapter>,
        downstream: Option<Arc<dyn DownstreamPool>>,
    ) -> Self {
        Self {
            channel,
            device,
            downstream,
            submitter: Mutex::new(Weak::new()),
            state: Mutex::new(PoolState {
                mode: AllocationMode::SelfAllocated,
                capacity: 0,
                size: 0,
                configured: false,
                started: false,
                active: false,
                unlocked: false,
                generation: 0,
                acquire_index: 0,
                slots: Vec::new(),
                print_fps: false,
                fps: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn configure(&self, mode: AllocationMode, capacity: usize, size: usize) -> CaptureResult<()> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(CaptureError::InvalidConfig(format!(
                "pool capacity {} outside {}..={}",
                capacity, MIN_CAPACITY, MAX_CAPACITY
            )));
        }
        if size == 0 {
            return Err(CaptureError::InvalidConfig(
                "buffer size must be greater than zero".to_string(),
            ));
        }
        if mode == AllocationMode::DownstreamImported && self.downstream.is_none() {
            return Err(CaptureError::InvalidConfig(
                "downstream_imported mode needs a downstream pool".to_string(),
            ));
        }
        let mut state = self.state.lock();
        if state.started {
            return Err(CaptureError::InvalidState(
                "pool must be stopped before it is reconfigured".to_string(),
            ));
        }
        state.mode = mode;
        state.capacity = capacity;
        state.size = size;
        state.configured = true;
        log::debug!(
            "channel={} pool configured: mode={} capacity={} size={}",
            self.channel,
            mode,
            capacity,
            size
        );
        Ok(())
    }

    pub fn set_print_fps(&self, enabled: bool) {
        self.state.lock().print_fps = enabled;
    }

    pub fn mode(&self) -> AllocationMode {
        self.state.lock().mode
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.state.lock().size
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Allocate every slot. Either all `capacity` buffers are allocated or
    /// none are kept.
    pub fn start(&self) -> CaptureResult<()> {
        let (mode, capacity, size, generation) = {
            let state = self.state.lock();
            if !state.configured {
                return Err(CaptureError::InvalidState(
                    "pool started before configure".to_string(),
                ));
            }
            if state.started {
                return Ok(());
            }
            (state.mode, state.capacity, state.size, state.generation)
        };

        let mut buffers = Vec::with_capacity(capacity);
        for index in 0..capacity {
            match self.allocate(mode, size) {
                Ok(memory) => {
                    buffers.push(FrameBuffer::new(self.channel, index, generation, size, memory))
                }
                Err(err) => {
                    log::error!(
                        "channel={} allocation of slot {} failed: {}",
                        self.channel,
                        index,
                        err
                    );
                    for buffer in buffers {
                        self.free(buffer);
                    }
                    return Err(err);
                }
            }
        }

        let mut state = self.state.lock();
        state.slots = buffers
            .into_iter()
            .map(|buffer| Slot {
                ownership: Ownership::InPool,
                buffer: Some(buffer),
            })
            .collect();
        state.started = true;
        state.active = true;
        state.unlocked = false;
        state.acquire_index = 0;
        let print_fps = state.print_fps;
        state.fps = print_fps.then(|| FrameRateMonitor::new(self.channel));
        log::info!(
            "channel={} pool started: {} x {} bytes ({})",
            self.channel,
            capacity,
            size,
            mode
        );
        Ok(())
    }

    fn allocate(&self, mode: AllocationMode, size: usize) -> CaptureResult<BackingMemory> {
        match mode {
            AllocationMode::SelfAllocated => Ok(BackingMemory::Pinned(PinnedMemory::allocate(size)?)),
            AllocationMode::DeviceMapped => {
                match self.device.allocate_memory(self.channel, mode, size)? {
                    DeviceMemory::Mapped(region) => Ok(BackingMemory::Mapped(region)),
                    other => {
                        self.device.release_memory(self.channel, other);
                        Err(CaptureError::AllocationFailure(
                            "device returned a descriptor for mapped memory".to_string(),
                        ))
                    }
                }
            }
            AllocationMode::DeviceExported => {
                let handle = match self.device.allocate_memory(self.channel, mode, size)? {
                    DeviceMemory::Exported(handle) => handle,
                    other => {
                        self.device.release_memory(self.channel, other);
                        return Err(CaptureError::AllocationFailure(
                            "device returned a mapping for exported memory".to_string(),
                        ));
                    }
                };
                match handle.duplicate() {
                    Ok(shared) => Ok(BackingMemory::Exported {
                        device: handle,
                        shared,
                    }),
                    Err(err) => {
                        self.device
                            .release_memory(self.channel, DeviceMemory::Exported(handle));
                        Err(CaptureError::AllocationFailure(format!(
                            "failed to duplicate exported descriptor: {}",
                            err
                        )))
                    }
                }
            }
            AllocationMode::DownstreamImported => {
                let downstream = self.downstream.as_ref().ok_or_else(|| {
                    CaptureError::InvalidConfig("no downstream pool to import from".to_string())
                })?;
                let origin = downstream.acquire(size)?;
                match origin.handle.duplicate() {
                    Ok(handle) => Ok(BackingMemory::Imported { handle, origin }),
                    Err(err) => {
                        downstream.give_back(origin);
                        Err(CaptureError::AllocationFailure(format!(
                            "failed to duplicate imported descriptor: {}",
                            err
                        )))
                    }
                }
            }
        }
    }

    fn free(&self, buffer: FrameBuffer) {
        let index = buffer.index();
        match buffer.into_memory() {
            BackingMemory::Pinned(memory) => drop(memory),
            BackingMemory::Mapped(region) => self
                .device
                .release_memory(self.channel, DeviceMemory::Mapped(region)),
            BackingMemory::Exported { device, shared } => {
                if let Err(err) = shared.close() {
                    log::warn!("channel={} slot {} close failed: {}", self.channel, index, err);
                }
                self.device
                    .release_memory(self.channel, DeviceMemory::Exported(device));
            }
            BackingMemory::Imported { handle, origin } => {
                if let Err(err) = handle.close() {
                    log::warn!("channel={} slot {} close failed: {}", self.channel, index, err);
                }
                match &self.downstream {
                    Some(downstream) => downstream.give_back(origin),
                    None => {
                        if let Err(err) = origin.handle.close() {
                            log::warn!("channel={} slot {} close failed: {}", self.channel, index, err);
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Acquire
    // ------------------------------------------------------------------------

    fn check_ready(state: &PoolState) -> CaptureResult<()> {
        if !state.started {
            return Err(CaptureError::NotStarted);
        }
        if !state.active || state.unlocked {
            return Err(CaptureError::Cancelled);
        }
        Ok(())
    }

    /// Prefer slot `acquire_index % capacity`; fall back to the next free
    /// slot in ring order.
    fn take_free(state: &mut PoolState) -> Option<FrameBuffer> {
        let capacity = state.slots.len();
        if capacity == 0 {
            return None;
        }
        let first = state.acquire_index % capacity;
        for offset in 0..capacity {
            let index = (first + offset) % capacity;
            let slot = &mut state.slots[index];
            if slot.ownership != Ownership::InPool {
                continue;
            }
            if let Some(buffer) = slot.buffer.take() {
                slot.ownership = Ownership::WithDevice;
                state.acquire_index = index + 1;
                return Some(buffer);
            }
        }
        None
    }

    /// Take the next free buffer, blocking while every slot is out.
    ///
    /// Fails with `NotStarted` before `start()` and with `Cancelled` as soon
    /// as the pool is deactivated or unlocked.
    pub fn acquire(&self) -> CaptureResult<FrameBuffer> {
        let mut state = self.state.lock();
        loop {
            Self::check_ready(&state)?;
            if let Some(buffer) = Self::take_free(&mut state) {
                log::debug!("channel={} acquired slot {}", self.channel, buffer.index());
                return Ok(buffer);
            }
            self.cond.wait(&mut state);
        }
    }

    /// Like `acquire`, but fails with `PoolExhausted` instead of blocking.
    pub fn try_acquire(&self) -> CaptureResult<FrameBuffer> {
        let mut state = self.state.lock();
        Self::check_ready(&state)?;
        Self::take_free(&mut state).ok_or(CaptureError::PoolExhausted)
    }

    // ------------------------------------------------------------------------
    // Ownership transitions
    // ------------------------------------------------------------------------

    /// Record that `buffer` is being handed to the downstream consumer.
    pub fn mark_delivered(&self, buffer: &FrameBuffer) {
        let mut state = self.state.lock();
        if buffer.generation() != state.generation {
            return;
        }
        if let Some(slot) = state.slots.get_mut(buffer.index()) {
            slot.ownership = Ownership::WithDownstream;
        }
        if let Some(fps) = state.fps.as_mut() {
            fps.record(Instant::now());
        }
    }

    /// Return a delivered buffer. It is queued for the next batch
    /// submission, or goes straight back to the pool when the channel takes
    /// no part in submission.
    pub fn release(&self, buffer: FrameBuffer) {
        let submitter = {
            let mut state = self.state.lock();
            if buffer.generation() != state.generation || buffer.index() >= state.slots.len() {
                drop(state);
                self.retire(buffer);
                return;
            }
            let slot = &mut state.slots[buffer.index()];
            if slot.ownership != Ownership::WithDownstream {
                // Never delivered: it goes back to the pool, not to the device.
                log::warn!(
                    "channel={} slot {} released while {:?}, recycling",
                    self.channel,
                    buffer.index(),
                    slot.ownership
                );
                drop(state);
                self.recycle(buffer);
                return;
            }
            slot.ownership = Ownership::Queued;
            self.submitter.lock().upgrade()
        };

        let leftover = match submitter {
            Some(sync) => sync.release(buffer),
            None => Some(buffer),
        };
        if let Some(buffer) = leftover {
            self.recycle(buffer);
        }
    }

    /// Put a buffer back into the pool as available for capture.
    pub fn recycle(&self, buffer: FrameBuffer) {
        let mut state = self.state.lock();
        if buffer.generation() != state.generation || buffer.index() >= state.slots.len() {
            drop(state);
            self.retire(buffer);
            return;
        }
        let index = buffer.index();
        let slot = &mut state.slots[index];
        slot.ownership = Ownership::InPool;
        slot.buffer = Some(buffer);
        self.cond.notify_one();
    }

    /// Park a buffer whose submission was dropped. The slot stays
    /// `WithDevice` until the pool stops.
    pub fn orphan(&self, buffer: FrameBuffer) {
        let mut state = self.state.lock();
        if buffer.generation() != state.generation || buffer.index() >= state.slots.len() {
            drop(state);
            self.retire(buffer);
            return;
        }
        let index = buffer.index();
        let slot = &mut state.slots[index];
        slot.ownership = Ownership::WithDevice;
        slot.buffer = Some(buffer);
        log::warn!("channel={} slot {} orphaned until pool stop", self.channel, index);
    }

    fn retire(&self, buffer: FrameBuffer) {
        log::debug!(
            "channel={} freeing slot {} of a stopped pool",
            self.channel,
            buffer.index()
        );
        self.free(buffer);
    }

    // ------------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------------

    /// Deactivating makes every pending and future `acquire` fail with
    /// `Cancelled` until the pool is activated again.
    pub fn set_active(&self, active: bool) {
        let mut state = self.state.lock();
        state.active = active && state.started;
        self.cond.notify_all();
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Unblock acquires for a pause without deactivating the pool.
    pub fn unlock(&self) {
        self.state.lock().unlocked = true;
        self.cond.notify_all();
    }

    pub fn unlock_stop(&self) {
        self.state.lock().unlocked = false;
    }

    /// Deactivate and free every slot the pool holds. Buffers still out
    /// are freed when they come back.
    pub fn stop(&self) {
        let (buffers, outstanding, fps) = {
            let mut state = self.state.lock();
            if !state.started {
                return;
            }
            state.started = false;
            state.active = false;
            state.generation += 1;
            let slots = std::mem::take(&mut state.slots);
            let outstanding = slots.iter().filter(|slot| slot.buffer.is_none()).count();
            let buffers: Vec<FrameBuffer> =
                slots.into_iter().filter_map(|slot| slot.buffer).collect();
            (buffers, outstanding, state.fps.take())
        };
        self.cond.notify_all();

        let freed = buffers.len();
        for buffer in buffers {
            self.free(buffer);
        }
        if let Some(fps) = fps {
            fps.log_summary();
        }
        log::info!(
            "channel={} pool stopped: freed {} buffer(s), {} still outstanding",
            self.channel,
            freed,
            outstanding
        );
    }

    pub(crate) fn attach_submitter(&self, submitter: Weak<SubmissionSynchronizer>) {
        *self.submitter.lock() = submitter;
    }

    pub(crate) fn detach_submitter(&self) {
        *self.submitter.lock() = Weak::new();
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn ownership(&self, index: usize) -> Option<Ownership> {
        self.state.lock().slots.get(index).map(|slot| slot.ownership)
    }

    pub fn census(&self) -> OwnershipCensus {
        let state = self.state.lock();
        let mut census = OwnershipCensus::default();
        for slot in &state.slots {
            match slot.ownership {
                Ownership::InPool => census.in_pool += 1,
                Ownership::WithDevice => census.with_device += 1,
                Ownership::WithDownstream => census.with_downstream += 1,
                Ownership::Queued => census.queued += 1,
            }
        }
        census
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.stop();
    }
}
