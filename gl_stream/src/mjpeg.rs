//! ABOUTME: MJPEG streaming over multipart/x-mixed-replace HTTP responses
//! ABOUTME: Adapts a capture subscription into an Actix body stream

use crate::StreamMetrics;
use bytes::{Bytes, BytesMut};
use futures_util::stream::Stream;
use gl_capture::{FrameReceiver, FrameSignal};
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// MJPEG frame stream that implements the `Stream` trait.
///
/// Each part carries one JPEG frame; a slow client is lagged by the
/// broadcast channel and simply misses frames, it never blocks the
/// capture.
pub struct MjpegStream {
    /// Subscription on the capture's frame channel
    receiver: FrameReceiver,
    /// Boundary string for the multipart response
    boundary: String,
    /// Connection ID for logging
    connection_id: Uuid,
    /// Whether the initial boundary has been emitted
    started: bool,
    /// Whether a terminal signal has been observed
    finished: bool,
    metrics: StreamMetrics,
    /// Reusable buffer for building frame parts
    buffer: BytesMut,
    /// Last streamed frame sequence, for gap visibility in logs
    last_sequence: Option<u64>,
    /// Frames this connection lost to backpressure
    frames_dropped_count: u64,
}

impl MjpegStream {
    pub fn new(receiver: FrameReceiver, metrics: StreamMetrics) -> Self {
        let boundary = format!("mjpeg_boundary_{}", Uuid::new_v4());
        let connection_id = Uuid::new_v4();
        metrics.connections_total.inc();
        metrics.clients.inc();

        Self {
            receiver,
            boundary,
            connection_id,
            started: false,
            finished: false,
            metrics,
            buffer: BytesMut::with_capacity(1024),
            last_sequence: None,
            frames_dropped_count: 0,
        }
    }

    /// Content type for the multipart response
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped_count
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }
}

#[cfg(test)]
impl MjpegStream {
    fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

impl Stream for MjpegStream {
    type Item = Result<Bytes, actix_web::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        if !self.started {
            self.started = true;
            debug!(
                connection_id = %self.connection_id,
                boundary = %self.boundary,
                "Starting MJPEG stream"
            );
            let initial_boundary = format!("--{}\r\n", self.boundary);
            return Poll::Ready(Some(Ok(Bytes::from(initial_boundary))));
        }

        match self.receiver.try_recv() {
            Some(FrameSignal::Frame(frame)) => {
                if let Some(last) = self.last_sequence {
                    let gap = frame.sequence.saturating_sub(last + 1);
                    if gap > 0 {
                        debug!(
                            connection_id = %self.connection_id,
                            gap,
                            "Resuming after dropped frames"
                        );
                    }
                }
                self.last_sequence = Some(frame.sequence);
                self.metrics.frames_streamed.inc();

                // Build the part in the reusable buffer
                use std::fmt::Write as _;
                let boundary = self.boundary.clone();
                let len = frame.data.len();
                self.buffer.clear();
                write!(
                    &mut self.buffer,
                    "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n",
                )
                .expect("writing to BytesMut cannot fail");
                self.buffer.extend_from_slice(&frame.data);
                self.buffer.extend_from_slice(b"\r\n");
                let bytes = self.buffer.clone().freeze();
                self.buffer.truncate(0);
                Poll::Ready(Some(Ok(bytes)))
            }
            Some(FrameSignal::Lagged(skipped)) => {
                self.frames_dropped_count += skipped;
                self.metrics.frames_dropped.inc_by(skipped);
                warn!(
                    connection_id = %self.connection_id,
                    skipped_frames = skipped,
                    total_dropped = self.frames_dropped_count,
                    "Stream client lagged, frames dropped"
                );
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Some(FrameSignal::Failed(reason)) => {
                warn!(
                    connection_id = %self.connection_id,
                    reason = %reason,
                    "Capture failed, ending stream"
                );
                self.metrics.stream_failures.inc();
                self.finished = true;
                Poll::Ready(None)
            }
            Some(FrameSignal::Closed) => {
                info!(
                    connection_id = %self.connection_id,
                    "Frame channel closed, ending stream"
                );
                self.finished = true;
                Poll::Ready(None)
            }
            None => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

impl Drop for MjpegStream {
    fn drop(&mut self) {
        info!(
            connection_id = %self.connection_id,
            total_frames_dropped = self.frames_dropped_count,
            last_sequence = ?self.last_sequence,
            "MJPEG stream connection dropped"
        );
        self.metrics.disconnections_total.inc();
        self.metrics.clients.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use gl_capture::{
        start_capture_with_command, CaptureSettings, OutputMode, ProcessPool, ProtocolKind,
        StreamDefinition,
    };
    use gl_core::Id;
    use gl_proc::EncoderCommand;
    use test_support::fake_encoder_emit;

    fn tagged_stream_cmd() -> EncoderCommand {
        let tag = Uuid::new_v4();
        let (program, mut args) = fake_encoder_emit(200, 10);
        args.push("glimpser-fake-encoder".to_string());
        args.push(format!("glimpser_capture={}", tag));
        args.push("pipe:1".to_string());
        EncoderCommand::from_parts(program, args, tag)
    }

    fn fast_settings() -> CaptureSettings {
        CaptureSettings {
            max_encoders: 2,
            start_timeout: std::time::Duration::from_secs(2),
            kill_grace: std::time::Duration::from_millis(300),
            ..CaptureSettings::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn boundary_then_frame_parts() {
        let pool = ProcessPool::new(fast_settings());
        let handle = start_capture_with_command(
            StreamDefinition::new(
                Id::new(),
                "fake://encoder",
                ProtocolKind::File,
                OutputMode::MjpegStream,
            ),
            tagged_stream_cmd(),
            &pool,
        )
        .await
        .expect("start");

        let stream = MjpegStream::new(handle.subscribe().expect("subscribe"), StreamMetrics::new());
        assert!(stream.content_type().contains("multipart/x-mixed-replace"));

        tokio::pin!(stream);

        let first = stream.next().await.expect("boundary").expect("ok");
        assert!(first.starts_with(b"--mjpeg_boundary_"));

        let part = stream.next().await.expect("frame part").expect("ok");
        let text = String::from_utf8_lossy(&part);
        assert!(text.contains("Content-Type: image/jpeg"));
        assert!(text.contains("Content-Length: 4"));
        // The JPEG payload follows the blank line
        let body_at = part
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header terminator")
            + 4;
        assert_eq!(&part[body_at..body_at + 2], &[0xFF, 0xD8]);

        handle.stop().await;

        // Drain until the closed channel ends the stream
        let mut saw_end = false;
        for _ in 0..200 {
            match stream.next().await {
                Some(Ok(_)) => continue,
                None => {
                    saw_end = true;
                    break;
                }
                Some(Err(e)) => panic!("stream error: {}", e),
            }
        }
        assert!(saw_end);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn buffer_reused_across_frames() {
        let pool = ProcessPool::new(fast_settings());
        let handle = start_capture_with_command(
            StreamDefinition::new(
                Id::new(),
                "fake://encoder",
                ProtocolKind::File,
                OutputMode::MjpegStream,
            ),
            tagged_stream_cmd(),
            &pool,
        )
        .await
        .expect("start");

        let stream = MjpegStream::new(handle.subscribe().expect("subscribe"), StreamMetrics::new());
        let initial_cap = stream.buffer_capacity();
        assert!(initial_cap > 0);

        tokio::pin!(stream);
        stream.next().await; // boundary
        stream.next().await.expect("first frame").expect("ok");
        let after_first = stream.buffer_capacity();
        stream.next().await.expect("second frame").expect("ok");
        let after_second = stream.buffer_capacity();

        assert_eq!(initial_cap, after_first);
        assert_eq!(initial_cap, after_second);
    }
}
