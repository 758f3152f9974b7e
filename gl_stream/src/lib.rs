//! ABOUTME: Streaming services over capture subscriptions
//! ABOUTME: MJPEG multipart adaptation and one-shot snapshot extraction

use gl_capture::{CaptureHandle, FailureReason, FrameReceiver, FrameSignal, SubscribeError};
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

mod metrics;
mod mjpeg;

pub use metrics::StreamMetrics;
pub use mjpeg::MjpegStream;

/// Errors from one-shot snapshot extraction
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    NotReady(#[from] SubscribeError),

    #[error("capture failed while waiting for a frame: {0}")]
    Failed(FailureReason),

    #[error("capture stopped before a frame arrived")]
    Closed,

    #[error("no frame within {0:?}")]
    Timeout(Duration),
}

/// Pull a single JPEG frame from a running capture.
///
/// Serves the snapshot endpoint from the existing capture instead of
/// spawning a second encoder; the pool bound is untouched.
pub async fn snapshot_frame(
    handle: &CaptureHandle,
    deadline: Duration,
) -> Result<Bytes, SnapshotError> {
    let receiver = handle.subscribe()?;
    next_frame(receiver, deadline).await
}

/// Wait for the next frame on an existing subscription.
pub async fn next_frame(
    mut receiver: FrameReceiver,
    deadline: Duration,
) -> Result<Bytes, SnapshotError> {
    let result = tokio::time::timeout(deadline, async {
        loop {
            match receiver.recv().await {
                FrameSignal::Frame(frame) => {
                    debug!(
                        sequence = frame.sequence,
                        size = frame.data.len(),
                        "Snapshot frame extracted"
                    );
                    return Ok(frame.data);
                }
                FrameSignal::Lagged(_) => continue,
                FrameSignal::Failed(reason) => return Err(SnapshotError::Failed(reason)),
                FrameSignal::Closed => return Err(SnapshotError::Closed),
            }
        }
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(SnapshotError::Timeout(deadline)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use gl_capture::{
        start_capture_with_command, CaptureSettings, OutputMode, ProcessPool, ProtocolKind,
        StreamDefinition,
    };
    use gl_core::Id;
    use gl_proc::EncoderCommand;
    use test_support::fake_encoder_emit;
    use uuid::Uuid;

    fn tagged(parts: (String, Vec<String>)) -> EncoderCommand {
        let tag = Uuid::new_v4();
        let (program, mut args) = parts;
        args.push("glimpser-fake-encoder".to_string());
        args.push(format!("glimpser_capture={}", tag));
        args.push("pipe:1".to_string());
        EncoderCommand::from_parts(program, args, tag)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_frame_returns_a_jpeg() {
        let pool = ProcessPool::new(CaptureSettings {
            max_encoders: 2,
            start_timeout: Duration::from_secs(2),
            kill_grace: Duration::from_millis(300),
            ..CaptureSettings::default()
        });
        let handle = start_capture_with_command(
            StreamDefinition::new(
                Id::new(),
                "fake://encoder",
                ProtocolKind::File,
                OutputMode::MjpegStream,
            ),
            tagged(fake_encoder_emit(100, 10)),
            &pool,
        )
        .await
        .expect("start");

        let jpeg = snapshot_frame(&handle, Duration::from_secs(2))
            .await
            .expect("snapshot");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        handle.stop().await;

        // After stop the capture is no longer subscribable
        assert!(matches!(
            snapshot_frame(&handle, Duration::from_millis(100)).await,
            Err(SnapshotError::NotReady(_))
        ));
    }
}
