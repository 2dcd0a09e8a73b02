//! Frame-rate statistics for `print_fps`.
//!
//! After a short warm-up the monitor reports the frame rate of every 2 s
//! window, and keeps max/min/average over the windows for a final summary.

use std::time::{Duration, Instant};

use crate::ChannelId;

const WARMUP_FRAMES: u64 = 5;
const REPORT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FpsSummary {
    pub max: f64,
    pub min: f64,
    pub average: f64,
}

#[derive(Debug)]
pub struct FrameRateMonitor {
    channel: ChannelId,
    frames: u64,
    window_start: Option<Instant>,
    window_frames: u64,
    max: f64,
    min: f64,
    total: f64,
    windows: u64,
}

impl FrameRateMonitor {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            frames: 0,
            window_start: None,
            window_frames: 0,
            max: 0.0,
            min: f64::MAX,
            total: 0.0,
            windows: 0,
        }
    }

    /// Count one frame. Returns the window's frame rate when a reporting
    /// window closes.
    pub fn record(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;
        if self.frames <= WARMUP_FRAMES {
            return None;
        }
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            self.window_frames = 0;
            return None;
        };
        self.window_frames += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed < REPORT_INTERVAL {
            return None;
        }
        let fps = self.window_frames as f64 / elapsed.as_secs_f64();
        self.max = self.max.max(fps);
        self.min = self.min.min(fps);
        self.total += fps;
        self.windows += 1;
        self.window_start = Some(now);
        self.window_frames = 0;
        log::info!("channel={} fps: {:.2}", self.channel, fps);
        Some(fps)
    }

    /// Max/min/average over the completed windows.
    pub fn summary(&self) -> Option<FpsSummary> {
        if self.windows == 0 {
            return None;
        }
        Some(FpsSummary {
            max: self.max,
            min: self.min,
            average: self.total / self.windows as f64,
        })
    }

    pub fn log_summary(&self) {
        match self.summary() {
            Some(s) => log::info!(
                "channel={} fps summary: max {:.2} min {:.2} avg {:.2}",
                self.channel,
                s.max,
                s.min,
                s.average
            ),
            None => log::debug!("channel={} too few frames for an fps summary", self.channel),
        }
    }
}
