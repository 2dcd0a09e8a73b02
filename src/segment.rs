//! Playback segment and seek requests.

use std::time::Duration;

/// The time range a source is currently producing.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub rate: f64,
    pub start: Duration,
    pub stop: Option<Duration>,
    /// Timestamp of the last buffer pushed inside this segment.
    pub position: Duration,
    /// Stream time corresponding to `start`.
    pub time: Duration,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            rate: 1.0,
            start: Duration::ZERO,
            stop: None,
            position: Duration::ZERO,
            time: Duration::ZERO,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SeekTarget {
    /// Leave the boundary unchanged.
    #[default]
    Keep,
    Set(Duration),
    /// Reset the boundary: start to zero, stop to open-ended.
    Clear,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SeekRequest {
    pub rate: f64,
    /// Flush downstream before the new segment.
    pub flush: bool,
    pub start: SeekTarget,
    pub stop: SeekTarget,
    pub seqnum: u32,
}

impl Default for SeekRequest {
    fn default() -> Self {
        Self {
            rate: 1.0,
            flush: true,
            start: SeekTarget::Keep,
            stop: SeekTarget::Keep,
            seqnum: 0,
        }
    }
}

impl Segment {
    /// Apply a seek to this segment. Returns `false` and leaves the segment
    /// untouched if the request is invalid.
    pub fn do_seek(&mut self, request: &SeekRequest) -> bool {
        if !request.rate.is_finite() || request.rate == 0.0 {
            log::warn!("seek rejected: invalid rate {}", request.rate);
            return false;
        }
        let start = match request.start {
            SeekTarget::Keep => self.start,
            SeekTarget::Set(start) => start,
            SeekTarget::Clear => Duration::ZERO,
        };
        let stop = match request.stop {
            SeekTarget::Keep => self.stop,
            SeekTarget::Set(stop) => Some(stop),
            SeekTarget::Clear => None,
        };
        if let Some(stop) = stop {
            if start > stop {
                log::warn!("seek rejected: start {:?} after stop {:?}", start, stop);
                return false;
            }
        }
        self.rate = request.rate;
        self.start = start;
        self.stop = stop;
        self.time = start;
        self.position = start;
        true
    }

    /// Whether `timestamp` lies past the segment's stop.
    pub fn is_past_stop(&self, timestamp: Duration) -> bool {
        self.stop.map(|stop| timestamp > stop).unwrap_or(false)
    }
}
