//! Live pacing and flush control.
//!
//! `LiveController` is the monitor every production task consults before it
//! may produce: the live lock guards the running/flushing flags, and the live
//! condition is broadcast whenever either changes. Clock waits run with the
//! live lock released, and every pending wait is registered so a flush or a
//! pause can unschedule it.
//!
//! Lock order: the live lock is taken before any channel or pool lock.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::FrameBuffer;
use crate::clock::{Clock, ClockEntry};
use crate::error::{CaptureError, CaptureResult, SyncStatus};
use crate::pool::BufferPool;
use crate::ChannelId;

#[derive(Debug)]
struct LiveState {
    is_live: bool,
    live_running: bool,
    flushing: bool,
    do_timestamp: bool,
    base_time: Duration,
    pending_eos: BTreeSet<ChannelId>,
    /// Channels taken out of production until the next start.
    deactivated: BTreeSet<ChannelId>,
    clock_entries: HashMap<ChannelId, Arc<ClockEntry>>,
    /// Learned per channel from its first buffer: running time minus
    /// buffer timestamp, in nanoseconds.
    offsets: HashMap<ChannelId, i128>,
}

pub struct LiveController {
    clock: Arc<dyn Clock>,
    state: Mutex<LiveState>,
    cond: Condvar,
}

/// Scope guard over the live lock. Dropping it releases the lock on every
/// exit path.
pub struct LiveGuard<'a> {
    controller: &'a LiveController,
    state: MutexGuard<'a, LiveState>,
}

impl LiveGuard<'_> {
    pub fn is_flushing(&self) -> bool {
        self.state.flushing
    }

    pub fn is_running(&self) -> bool {
        self.state.live_running
    }

    /// Block until `channel` may produce. Non-live sources always may.
    ///
    /// The live lock is released while blocked, so a concurrent flush or a
    /// deactivation of `channel` can always get in; both make this return
    /// `Cancelled`.
    pub fn wait_until_playing(&mut self, channel: ChannelId) -> CaptureResult<()> {
        loop {
            if self.state.flushing || self.state.deactivated.contains(&channel) {
                return Err(CaptureError::Cancelled);
            }
            if !self.state.is_live || self.state.live_running {
                return Ok(());
            }
            log::debug!("live source not playing, waiting");
            self.controller.cond.wait(&mut self.state);
        }
    }

    /// Consume a host EOS request addressed to `channel`.
    pub fn take_pending_eos(&mut self, channel: ChannelId) -> bool {
        self.state.pending_eos.remove(&channel)
    }
}

fn nanos(duration: Duration) -> i128 {
    duration.as_nanos() as i128
}

fn from_nanos(value: i128) -> Duration {
    Duration::from_nanos(u64::try_from(value.max(0)).unwrap_or(u64::MAX))
}

impl LiveController {
    pub fn new(clock: Arc<dyn Clock>, is_live: bool, do_timestamp: bool) -> Self {
        Self {
            clock,
            state: Mutex::new(LiveState {
                is_live,
                live_running: false,
                flushing: false,
                do_timestamp,
                base_time: Duration::ZERO,
                pending_eos: BTreeSet::new(),
                deactivated: BTreeSet::new(),
                clock_entries: HashMap::new(),
                offsets: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> LiveGuard<'_> {
        LiveGuard {
            controller: self,
            state: self.state.lock(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().is_live
    }

    pub fn is_flushing(&self) -> bool {
        self.state.lock().flushing
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().live_running
    }

    /// Clock time elapsed since the last transition to playing.
    pub fn running_time(&self) -> Result<Duration, String> {
        let base_time = self.state.lock().base_time;
        Ok(self.clock.time()?.saturating_sub(base_time))
    }

    fn unschedule_all(state: &mut LiveState) {
        for (channel, entry) in state.clock_entries.drain() {
            log::debug!("channel={} unscheduling clock wait", channel);
            entry.unschedule();
        }
    }

    /// Clear flush state and learned offsets before a new start.
    pub(crate) fn reset_for_start(&self) {
        let mut state = self.state.lock();
        state.flushing = false;
        state.pending_eos.clear();
        state.deactivated.clear();
        state.offsets.clear();
        Self::unschedule_all(&mut state);
    }

    /// Take `channel` out of production: its pending clock wait is
    /// unscheduled and a task waiting to play is woken. Lasts until the
    /// next start.
    pub fn deactivate_channel(&self, channel: ChannelId) {
        let mut state = self.state.lock();
        state.deactivated.insert(channel);
        state.pending_eos.remove(&channel);
        if let Some(entry) = state.clock_entries.remove(&channel) {
            entry.unschedule();
        }
        self.cond.notify_all();
    }

    pub fn is_deactivated(&self, channel: ChannelId) -> bool {
        self.state.lock().deactivated.contains(&channel)
    }

    /// Enter or leave the flushing state.
    ///
    /// Entering deactivates `pools` first so blocked acquires fail at once,
    /// then sets `flushing`, drops pending EOS requests and unschedules every
    /// clock wait. Leaving sets `live_running` to `resume` and reactivates
    /// the pools. Both broadcast the live condition and may be repeated.
    pub fn set_flushing(&self, flushing: bool, resume: bool, pools: &[Arc<BufferPool>]) {
        if flushing {
            for pool in pools {
                pool.set_active(false);
            }
        }
        let mut state = self.state.lock();
        if flushing {
            state.flushing = true;
            state.pending_eos.clear();
            Self::unschedule_all(&mut state);
            log::debug!("flush start");
        } else {
            state.flushing = false;
            state.live_running = resume;
            for pool in pools {
                pool.unlock_stop();
                pool.set_active(true);
            }
            log::debug!("flush stop (resume={})", resume);
        }
        self.cond.notify_all();
    }

    /// PLAYING/PAUSED transition of a live source.
    ///
    /// Pausing unlocks `pools` and unschedules clock waits so producing
    /// tasks fall back into `wait_until_playing`. Playing clears the
    /// learned offsets and takes a new base time.
    pub fn set_playing(&self, playing: bool, pools: &[Arc<BufferPool>]) {
        if !self.is_live() {
            self.state.lock().live_running = playing;
            return;
        }
        if !playing {
            for pool in pools {
                pool.unlock();
            }
        }
        let mut state = self.state.lock();
        Self::unschedule_all(&mut state);
        state.live_running = playing;
        if playing {
            for pool in pools {
                pool.unlock_stop();
            }
            state.offsets.clear();
            match self.clock.time() {
                Ok(now) => state.base_time = now,
                Err(err) => log::warn!("cannot read clock for base time: {}", err),
            }
        }
        log::debug!("live running = {}", playing);
        self.cond.notify_all();
    }

    /// Mark an EOS request for each of `channels` and wake any clock wait so
    /// the tasks notice it.
    pub fn request_eos<I>(&self, channels: I)
    where
        I: IntoIterator<Item = ChannelId>,
    {
        let mut state = self.state.lock();
        state.pending_eos.extend(channels);
        Self::unschedule_all(&mut state);
        self.cond.notify_all();
    }

    pub fn has_pending_eos(&self, channel: ChannelId) -> bool {
        self.state.lock().pending_eos.contains(&channel)
    }

    /// Wait until `buffer` is due.
    ///
    /// The first buffer of a channel after start or resume fixes the offset
    /// between its timestamp and the running time and is emitted at once.
    /// Later buffers wait for `base_time + timestamp + offset`. Buffers
    /// without a timestamp, and all buffers of a non-live source, are not
    /// synchronised.
    pub fn do_sync(&self, channel: ChannelId, buffer: &mut FrameBuffer) -> SyncStatus {
        let mut state = self.state.lock();
        if state.flushing || state.deactivated.contains(&channel) {
            return SyncStatus::Cancelled;
        }
        let now = match self.clock.time() {
            Ok(now) => now,
            Err(err) => return SyncStatus::ClockError(err),
        };
        let running = now.saturating_sub(state.base_time);
        if state.do_timestamp && buffer.timestamp().is_none() {
            buffer.set_timestamp(Some(running));
        }
        let Some(pts) = buffer.timestamp() else {
            return SyncStatus::OnTime;
        };
        if !state.is_live {
            return SyncStatus::OnTime;
        }

        let offset = match state.offsets.get(&channel) {
            Some(offset) => *offset,
            None => {
                let offset = nanos(running) - nanos(pts);
                state.offsets.insert(channel, offset);
                log::debug!("channel={} learned sync offset {} ns", channel, offset);
                return SyncStatus::OnTime;
            }
        };

        let target = from_nanos(nanos(state.base_time) + nanos(pts) + offset);
        let entry = ClockEntry::new(target);
        state.clock_entries.insert(channel, entry.clone());
        let clock = self.clock.clone();
        let status = MutexGuard::unlocked(&mut state, || entry.wait(clock.as_ref()));

        let registered = state
            .clock_entries
            .get(&channel)
            .map(|current| Arc::ptr_eq(current, &entry))
            .unwrap_or(false);
        if registered {
            state.clock_entries.remove(&channel);
        }
        let aborted = state.flushing || state.deactivated.contains(&channel);
        if aborted && !matches!(status, SyncStatus::ClockError(_)) {
            return SyncStatus::Cancelled;
        }
        status
    }
}
