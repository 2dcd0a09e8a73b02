//! Cross-channel submission synchronizer.
//!
//! The device takes buffers back in a single call covering every active
//! channel. Channels return buffers at their own pace, so each released
//! buffer waits in its channel's FIFO until every active channel has at
//! least one queued; then one buffer is popped from each queue and the whole
//! batch is submitted at once.
//!
//! Lock order: the synchronizer mutex may be held while calling into a
//! pool; a pool never calls in here while holding its own lock.

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::buffer::{BufferFlags, BufferUsage, FrameBuffer};
use crate::device::DeviceAdapter;
use crate::pool::BufferPool;
use crate::ChannelId;

/// What happens to a batch the device refused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubmitFailurePolicy {
    /// Log and drop the batch. Its slots are parked until the pool stops.
    #[default]
    Drop,
    /// Keep the buffers at the head of their queues; the next release
    /// retries them.
    Retain,
}

impl SubmitFailurePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drop" => Some(SubmitFailurePolicy::Drop),
            "retain" => Some(SubmitFailurePolicy::Retain),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionPhase {
    Idle,
    Running,
    /// Teardown in progress: releases are queued but never submitted.
    Stopping,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmissionStats {
    pub batches: u64,
    pub buffers: u64,
    pub failures: u64,
    pub dropped: u64,
}

struct ChannelQueue {
    pool: Arc<BufferPool>,
    queue: VecDeque<FrameBuffer>,
}

struct SyncState {
    phase: SubmissionPhase,
    channels: BTreeMap<ChannelId, ChannelQueue>,
    usage: BufferFlags,
    stats: SubmissionStats,
}

pub struct SubmissionSynchronizer {
    device: Arc<dyn DeviceAdapter>,
    policy: SubmitFailurePolicy,
    state: Mutex<SyncState>,
}

impl SubmissionSynchronizer {
    pub fn new(device: Arc<dyn DeviceAdapter>, policy: SubmitFailurePolicy) -> Arc<Self> {
        Arc::new(Self {
            device,
            policy,
            state: Mutex::new(SyncState {
                phase: SubmissionPhase::Idle,
                channels: BTreeMap::new(),
                usage: BufferFlags::NONE,
                stats: SubmissionStats::default(),
            }),
        })
    }

    pub fn policy(&self) -> SubmitFailurePolicy {
        self.policy
    }

    pub fn set_usage(&self, usage: BufferUsage) {
        self.state.lock().usage = usage.flags();
    }

    pub fn phase(&self) -> SubmissionPhase {
        self.state.lock().phase
    }

    /// Enter the running phase and submit whatever is already complete.
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.phase = SubmissionPhase::Running;
        self.submit_ready(&mut state);
    }

    pub fn begin_stop(&self) {
        self.state.lock().phase = SubmissionPhase::Stopping;
    }

    pub fn finish_stop(&self) {
        let mut state = self.state.lock();
        state.phase = SubmissionPhase::Idle;
        state.stats = SubmissionStats::default();
    }

    /// Add a channel to the set every batch must cover.
    pub fn activate_channel(self: &Arc<Self>, pool: Arc<BufferPool>) {
        let channel = pool.channel();
        let mut state = self.state.lock();
        if state.channels.contains_key(&channel) {
            log::debug!("channel={} already active for submission", channel);
            return;
        }
        pool.attach_submitter(Arc::downgrade(self));
        state.channels.insert(
            channel,
            ChannelQueue {
                pool,
                queue: VecDeque::new(),
            },
        );
        log::debug!("channel={} activated for submission", channel);
    }

    /// Remove a channel from the batch set. Its queued buffers go back to
    /// its pool and the remaining channels are checked for a complete
    /// batch. Returns `false` if the channel was not active.
    pub fn deactivate_channel(&self, channel: ChannelId) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.channels.remove(&channel) else {
            return false;
        };
        entry.pool.detach_submitter();
        let drained = entry.queue.len();
        for buffer in entry.queue {
            entry.pool.recycle(buffer);
        }
        log::debug!(
            "channel={} deactivated for submission, {} queued buffer(s) returned",
            channel,
            drained
        );
        self.submit_ready(&mut state);
        true
    }

    pub fn active_channels(&self) -> Vec<ChannelId> {
        self.state.lock().channels.keys().copied().collect()
    }

    pub fn queued(&self, channel: ChannelId) -> usize {
        self.state
            .lock()
            .channels
            .get(&channel)
            .map(|entry| entry.queue.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> SubmissionStats {
        self.state.lock().stats
    }

    /// Queue a buffer returned by the downstream consumer and submit a
    /// batch if every active channel now has one waiting.
    ///
    /// Returns the buffer when its channel is not active, so the caller can
    /// put it back into the pool.
    pub fn release(&self, mut buffer: FrameBuffer) -> Option<FrameBuffer> {
        let mut state = self.state.lock();
        let usage = state.usage;
        let channel = buffer.channel();
        let Some(entry) = state.channels.get_mut(&channel) else {
            return Some(buffer);
        };
        buffer.insert_flags(usage);
        log::debug!("channel={} queued slot {}", channel, buffer.index());
        entry.queue.push_back(buffer);

        if state.phase != SubmissionPhase::Running {
            return None;
        }
        self.submit_ready(&mut state);
        None
    }

    fn batch_ready(state: &SyncState) -> bool {
        !state.channels.is_empty() && state.channels.values().all(|entry| !entry.queue.is_empty())
    }

    fn submit_ready(&self, state: &mut SyncState) {
        while state.phase == SubmissionPhase::Running && Self::batch_ready(state) {
            let mut batch = Vec::with_capacity(state.channels.len());
            for entry in state.channels.values_mut() {
                if let Some(mut buffer) = entry.queue.pop_front() {
                    buffer.reset_for_submission();
                    batch.push(buffer);
                }
            }

            match self.device.submit(&batch) {
                Ok(()) => {
                    state.stats.batches += 1;
                    state.stats.buffers += batch.len() as u64;
                    log::debug!("submitted batch of {} buffer(s)", batch.len());
                    for buffer in batch {
                        match state.channels.get(&buffer.channel()) {
                            Some(entry) => entry.pool.recycle(buffer),
                            None => drop(buffer),
                        }
                    }
                }
                Err(err) => {
                    state.stats.failures += 1;
                    match self.policy {
                        SubmitFailurePolicy::Drop => {
                            log::warn!("dropping batch of {} buffer(s): {}", batch.len(), err);
                            state.stats.dropped += batch.len() as u64;
                            for buffer in batch {
                                if let Some(entry) = state.channels.get(&buffer.channel()) {
                                    entry.pool.orphan(buffer);
                                }
                            }
                        }
                        SubmitFailurePolicy::Retain => {
                            log::warn!(
                                "batch of {} buffer(s) kept for retry: {}",
                                batch.len(),
                                err
                            );
                            for buffer in batch {
                                if let Some(entry) = state.channels.get_mut(&buffer.channel()) {
                                    entry.queue.push_front(buffer);
                                }
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AllocationMode, Ownership};
    use crate::device::{SyntheticConfig, SyntheticDevice};
    use std::collections::HashMap;

    fn setup(
        channels: u32,
        policy: SubmitFailurePolicy,
    ) -> (Arc<SyntheticDevice>, Arc<SubmissionSynchronizer>, Vec<Arc<BufferPool>>) {
        let device = SyntheticDevice::shared(SyntheticConfig::default());
        let sync = SubmissionSynchronizer::new(device.clone(), policy);
        let pools: Vec<Arc<BufferPool>> = (0..channels)
            .map(|id| {
                let pool = Arc::new(BufferPool::new(ChannelId(id), device.clone(), None));
                pool.configure(AllocationMode::SelfAllocated, 4, 256).unwrap();
                pool.start().unwrap();
                sync.activate_channel(pool.clone());
                pool
            })
            .collect();
        sync.start();
        (device, sync, pools)
    }

    fn deliver(pool: &BufferPool) -> FrameBuffer {
        let buffer = pool.try_acquire().unwrap();
        pool.mark_delivered(&buffer);
        buffer
    }

    #[test]
    fn batches_follow_the_slowest_channel() {
        let (device, sync, pools) = setup(2, SubmitFailurePolicy::Drop);
        let (a, b) = (&pools[0], &pools[1]);
        let mut a_indices = Vec::new();
        let mut b_releases = 0;

        for step in 0..6 {
            let buffer = deliver(a);
            a_indices.push(buffer.index());
            a.release(buffer);
            assert_eq!(device.submissions().len(), b_releases, "A alone never submits");

            if step % 2 == 0 {
                b.release(deliver(b));
                b_releases += 1;
                assert_eq!(device.submissions().len(), b_releases);
            }
        }

        assert_eq!(a_indices, vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(sync.queued(ChannelId(0)), 3);
        assert_eq!(sync.queued(ChannelId(1)), 0);

        let batches = device.submissions();
        let a_submitted: Vec<usize> = batches.iter().map(|batch| batch[0].1).collect();
        assert_eq!(a_submitted, vec![0, 1, 2]);
        for batch in &batches {
            assert_eq!(batch.len(), 2);
            assert_eq!(batch[0].0, ChannelId(0));
            assert_eq!(batch[1].0, ChannelId(1));
        }

        // Every submitted slot was released again before its next submission.
        let mut last_seen: HashMap<(ChannelId, usize), usize> = HashMap::new();
        for (n, batch) in batches.iter().enumerate() {
            for key in batch {
                if let Some(prev) = last_seen.insert(*key, n) {
                    assert!(prev < n);
                }
            }
        }
        assert_eq!(a.census().queued, 3);
    }

    #[test]
    fn submitted_buffers_return_to_pool() {
        let (device, sync, pools) = setup(2, SubmitFailurePolicy::Drop);
        let a = deliver(&pools[0]);
        let b = deliver(&pools[1]);
        pools[0].release(a);
        assert_eq!(pools[0].ownership(0), Some(Ownership::Queued));
        pools[1].release(b);
        assert_eq!(device.submissions(), vec![vec![(ChannelId(0), 0), (ChannelId(1), 0)]]);
        assert_eq!(pools[0].ownership(0), Some(Ownership::InPool));
        assert_eq!(pools[1].ownership(0), Some(Ownership::InPool));
        assert_eq!(sync.stats().batches, 1);
        assert_eq!(sync.stats().buffers, 2);
    }

    #[test]
    fn stopping_phase_queues_without_submitting() {
        let (device, sync, pools) = setup(2, SubmitFailurePolicy::Drop);
        sync.begin_stop();
        pools[0].release(deliver(&pools[0]));
        pools[1].release(deliver(&pools[1]));
        assert!(device.submissions().is_empty());
        assert_eq!(sync.queued(ChannelId(0)), 1);

        sync.start();
        assert_eq!(device.submissions().len(), 1);
    }

    #[test]
    fn dropped_batch_orphans_its_slots() {
        let (device, sync, pools) = setup(2, SubmitFailurePolicy::Drop);
        device.set_fail_submit(true);
        pools[0].release(deliver(&pools[0]));
        pools[1].release(deliver(&pools[1]));

        assert_eq!(sync.stats().failures, 1);
        assert_eq!(sync.stats().dropped, 2);
        assert_eq!(sync.queued(ChannelId(0)), 0);
        assert_eq!(pools[0].ownership(0), Some(Ownership::WithDevice));
        assert_eq!(pools[0].census().in_pool, 3);

        device.set_fail_submit(false);
        assert_eq!(pools[0].try_acquire().unwrap().index(), 1);
    }

    #[test]
    fn retained_batch_is_retried_first() {
        let (device, sync, pools) = setup(2, SubmitFailurePolicy::Retain);
        device.set_fail_submit(true);
        pools[0].release(deliver(&pools[0]));
        pools[1].release(deliver(&pools[1]));
        assert_eq!(sync.queued(ChannelId(0)), 1);
        assert_eq!(sync.queued(ChannelId(1)), 1);

        device.set_fail_submit(false);
        pools[0].release(deliver(&pools[0]));
        let batches = device.submissions();
        assert_eq!(batches, vec![vec![(ChannelId(0), 0), (ChannelId(1), 0)]]);
        assert_eq!(sync.queued(ChannelId(0)), 1);
    }

    #[test]
    fn usage_flags_are_tagged_on_release() {
        let (_device, sync, pools) = setup(2, SubmitFailurePolicy::Drop);
        sync.set_usage(BufferUsage::Read);
        pools[0].release(deliver(&pools[0]));
        pools[1].release(deliver(&pools[1]));
        let buffer = pools[0].try_acquire().unwrap();
        assert_eq!(buffer.index(), 1);
        let mut again = buffer;
        for _ in 0..3 {
            pools[0].recycle(again);
            again = pools[0].try_acquire().unwrap();
        }
        assert_eq!(again.index(), 0);
        assert!(again.flags().contains(BufferFlags::SW_READ));
    }

    #[test]
    fn deactivation_completes_a_waiting_batch() {
        let (device, sync, pools) = setup(3, SubmitFailurePolicy::Drop);
        pools[0].release(deliver(&pools[0]));
        pools[1].release(deliver(&pools[1]));
        assert!(device.submissions().is_empty());

        assert!(sync.deactivate_channel(ChannelId(2)));
        assert_eq!(device.submissions(), vec![vec![(ChannelId(0), 0), (ChannelId(1), 0)]]);
        assert_eq!(sync.active_channels(), vec![ChannelId(0), ChannelId(1)]);
        assert!(!sync.deactivate_channel(ChannelId(2)));

        // The detached pool recycles directly.
        pools[2].release(deliver(&pools[2]));
        assert_eq!(pools[2].census().in_pool, 4);
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!(SubmitFailurePolicy::parse("Retain"), Some(SubmitFailurePolicy::Retain));
        assert_eq!(SubmitFailurePolicy::parse("drop"), Some(SubmitFailurePolicy::Drop));
        assert_eq!(SubmitFailurePolicy::parse("requeue"), None);
    }
}
