//! ABOUTME: Error taxonomy for the capture lifecycle engine
//! ABOUTME: Fail-fast types surfaced to callers; no internal retry

use std::time::Duration;

/// Why a capture ended up in the `Failed` state.
///
/// Cloneable so it can live in the state machine and travel through the
/// frame broadcast channel as the terminal event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("no frame within the start deadline")]
    StartTimeout,

    #[error("frame flow stopped mid-run")]
    Stalled,

    #[error("encoder exited (status {status:?}): {stderr_tail}")]
    EncoderExited {
        status: Option<i32>,
        stderr_tail: String,
    },

    #[error("I/O error on encoder output: {0}")]
    Io(String),
}

impl FailureReason {
    /// Stable label for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::StartTimeout => "start_timeout",
            FailureReason::Stalled => "stalled",
            FailureReason::EncoderExited { .. } => "encoder_exited",
            FailureReason::Io(_) => "io",
        }
    }
}

/// Errors from `ProcessPool::acquire`
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool is saturated. Callers get this immediately; the pool
    /// never queues.
    #[error("process pool at capacity ({max} encoders)")]
    AtCapacity { max: usize },

    #[error("process pool is shut down")]
    ShutDown,

    #[error(transparent)]
    Spawn(#[from] gl_core::Error),
}

/// Errors from starting a capture
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("no first frame within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("encoder exited during startup (status {status:?}): {stderr_tail}")]
    EncoderExited {
        status: Option<i32>,
        stderr_tail: String,
    },

    #[error("capture was already started")]
    AlreadyStarted,

    #[error("capture failed during startup: {0}")]
    Failed(FailureReason),
}

impl From<FailureReason> for StartError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::StartTimeout => StartError::Failed(FailureReason::StartTimeout),
            FailureReason::EncoderExited {
                status,
                stderr_tail,
            } => StartError::EncoderExited {
                status,
                stderr_tail,
            },
            other => StartError::Failed(other),
        }
    }
}

/// Errors from subscribing to a capture's frame stream
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The source is not in the `Running` state. Calling `subscribe`
    /// before `start` returns or after stop is a caller bug.
    #[error("capture is not running (state: {0})")]
    NotReady(&'static str),
}
