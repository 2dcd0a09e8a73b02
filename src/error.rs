//! Error taxonomy for the capture core.
//!
//! `CaptureError` covers every failure the pool, the synchronizer and the
//! pacing controller can report. It is `Clone` so a terminal error can be
//! carried inside a [`StreamEvent`](crate::StreamEvent) to the host.

use thiserror::Error;

use crate::ChannelId;

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// A flush is in progress. Transient and expected.
    #[error("operation cancelled: flush in progress")]
    Cancelled,
    #[error("end of stream")]
    EndOfStream,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("buffer pool is not started")]
    NotStarted,
    #[error("buffer pool exhausted")]
    PoolExhausted,
    #[error("buffer allocation failed: {0}")]
    AllocationFailure(String),
    #[error("device failure: {0}")]
    DeviceFailure(String),
    #[error("clock error: {0}")]
    ClockError(String),
    #[error("batch submission failed: {0}")]
    SubmissionFailure(String),
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl CaptureError {
    /// Fatal errors end the owning channel's stream.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::DeviceFailure(_)
                | CaptureError::ClockError(_)
                | CaptureError::AllocationFailure(_)
        )
    }
}

/// Result of handing a buffer or event to the downstream consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowStatus {
    Ok,
    /// Downstream is flushing; the loop pauses without reporting anything.
    Flushing,
    /// Downstream wants no more data.
    Eos,
    /// Nothing is linked to this channel's output.
    NotLinked,
    Error(CaptureError),
}

impl FlowStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, FlowStatus::Ok)
    }
}

/// Outcome of a clock wait performed by `do_sync`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    OnTime,
    /// The target time had already passed. The buffer is still emitted.
    Early,
    /// The wait was unscheduled by a flush or a pause.
    Cancelled,
    ClockError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(CaptureError::DeviceFailure("dqbuf".into()).is_fatal());
        assert!(CaptureError::ClockError("bad time".into()).is_fatal());
        assert!(!CaptureError::Cancelled.is_fatal());
        assert!(!CaptureError::SubmissionFailure("qbuf".into()).is_fatal());
        assert!(!CaptureError::EndOfStream.is_fatal());
    }

    #[test]
    fn errors_render_channel_ids() {
        let err = CaptureError::UnknownChannel(ChannelId(3));
        assert_eq!(err.to_string(), "unknown channel 3");
    }
}
