//! ABOUTME: Capture lifecycle engine: process pool, sources, and owning handles
//! ABOUTME: Guarantees no encoder child ever outlives the capture that owns it

pub mod encoder_args;
pub mod error;
pub mod frame;
pub mod handle;
pub mod pool;
pub mod settings;
pub mod source;
pub mod stream_def;

pub use encoder_args::build_encoder_command;
pub use error::{FailureReason, PoolError, StartError, SubscribeError};
pub use frame::{Frame, FrameEvent, FrameReceiver, FrameScanner, FrameSignal};
pub use handle::CaptureHandle;
pub use pool::{PooledChild, ProcessPool};
pub use settings::CaptureSettings;
pub use source::{CaptureSource, HealthReport, SourceState};
pub use stream_def::{Credentials, HardwareAccel, OutputMode, ProtocolKind, StreamDefinition};

/// Start a capture for `def` and hand back its owning handle.
///
/// The handle is the only thing the caller stores; dropping it reaps the
/// encoder child.
pub async fn start_capture(
    def: StreamDefinition,
    pool: &ProcessPool,
) -> Result<CaptureHandle, StartError> {
    let settings = pool.settings().clone();
    let shutdown_timeout = settings.shutdown_timeout;
    let source = CaptureSource::new(def, settings);
    source.start(pool).await?;
    Ok(CaptureHandle::new(source, shutdown_timeout))
}

/// `start_capture` with a caller-supplied encoder invocation.
///
/// The command's argv must already carry the glimpser tag.
pub async fn start_capture_with_command(
    def: StreamDefinition,
    command: gl_proc::EncoderCommand,
    pool: &ProcessPool,
) -> Result<CaptureHandle, StartError> {
    let settings = pool.settings().clone();
    let shutdown_timeout = settings.shutdown_timeout;
    let source = CaptureSource::with_command(def, command, settings);
    source.start(pool).await?;
    Ok(CaptureHandle::new(source, shutdown_timeout))
}
