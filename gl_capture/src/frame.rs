//! ABOUTME: Frame types, the broadcast channel surface, and JPEG boundary scanning
//! ABOUTME: Slow subscribers are lagged with a typed signal, never block producers

use crate::error::FailureReason;
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::broadcast;
use tracing::warn;

/// One JPEG frame with its position in the capture's global sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u64,
    pub data: Bytes,
}

impl Frame {
    pub fn new(sequence: u64, data: Bytes) -> Self {
        Self { sequence, data }
    }
}

/// What travels on the broadcast channel.
///
/// Graceful stop closes the channel without a terminal event; failure
/// delivers `Failed` first so subscribers can distinguish the two.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    Frame(Frame),
    Failed(FailureReason),
}

/// What a subscriber observes on each read.
#[derive(Debug, Clone)]
pub enum FrameSignal {
    Frame(Frame),
    /// The subscriber fell behind and `n` frames were dropped for it.
    /// The next `Frame` resumes the sequence further along.
    Lagged(u64),
    /// The source failed; no more frames will arrive.
    Failed(FailureReason),
    /// Clean end-of-stream after a graceful stop.
    Closed,
}

/// Receiving half of a capture's frame channel.
///
/// Snapshot captures seed the receiver with the latched frame so a
/// subscriber arriving after the encoder already finished still gets it.
pub struct FrameReceiver {
    seeded: Option<Frame>,
    inner: broadcast::Receiver<FrameEvent>,
}

impl FrameReceiver {
    pub(crate) fn new(inner: broadcast::Receiver<FrameEvent>, seeded: Option<Frame>) -> Self {
        Self { seeded, inner }
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> FrameSignal {
        if let Some(frame) = self.seeded.take() {
            return FrameSignal::Frame(frame);
        }
        match self.inner.recv().await {
            Ok(FrameEvent::Frame(frame)) => FrameSignal::Frame(frame),
            Ok(FrameEvent::Failed(reason)) => FrameSignal::Failed(reason),
            Err(broadcast::error::RecvError::Lagged(n)) => FrameSignal::Lagged(n),
            Err(broadcast::error::RecvError::Closed) => FrameSignal::Closed,
        }
    }

    /// Non-blocking poll for the next signal; `None` when nothing is
    /// buffered yet.
    pub fn try_recv(&mut self) -> Option<FrameSignal> {
        if let Some(frame) = self.seeded.take() {
            return Some(FrameSignal::Frame(frame));
        }
        match self.inner.try_recv() {
            Ok(FrameEvent::Frame(frame)) => Some(FrameSignal::Frame(frame)),
            Ok(FrameEvent::Failed(reason)) => Some(FrameSignal::Failed(reason)),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Some(FrameSignal::Lagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Some(FrameSignal::Closed),
            Err(broadcast::error::TryRecvError::Empty) => None,
        }
    }
}

/// JPEG start-of-image marker
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on a single frame; a stream that exceeds it without an EOI
/// is producing garbage and the buffer is reset.
const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// Incremental scanner that cuts complete JPEG frames out of the
/// encoder's stdout byte stream.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: BytesMut,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Feed a chunk read from the encoder.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Cut the next complete frame out of the buffer, if one is present.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let start = find_marker(&self.buf, &SOI)?;

        if start > 0 {
            // Garbage before the SOI; drop it
            self.buf.advance(start);
        }

        match find_marker(&self.buf[2..], &EOI) {
            Some(rel_end) => {
                let frame_len = 2 + rel_end + 2;
                let frame = self.buf.split_to(frame_len).freeze();
                Some(frame)
            }
            None => {
                if self.buf.len() > MAX_FRAME_BYTES {
                    warn!(
                        buffered = self.buf.len(),
                        "Frame buffer exceeded maximum without an end marker, resetting"
                    );
                    self.buf.clear();
                }
                None
            }
        }
    }
}

fn find_marker(buf: &[u8], marker: &[u8; 2]) -> Option<usize> {
    buf.windows(2)
        .position(|w| w[0] == marker[0] && w[1] == marker[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xD8];
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&[0xFF, 0xD9]);
        frame
    }

    #[test]
    fn single_frame_in_one_chunk() {
        let mut scanner = FrameScanner::new();
        scanner.extend(&jpeg(b"abc"));

        let frame = scanner.next_frame().expect("frame");
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
        assert_eq!(&frame[frame.len() - 2..], &[0xFF, 0xD9]);
        assert!(scanner.next_frame().is_none());
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn frame_split_across_chunks() {
        let full = jpeg(b"split-me");
        let mut scanner = FrameScanner::new();

        scanner.extend(&full[..3]);
        assert!(scanner.next_frame().is_none());

        scanner.extend(&full[3..]);
        let frame = scanner.next_frame().expect("frame");
        assert_eq!(frame.len(), full.len());
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut bytes = jpeg(b"one");
        bytes.extend_from_slice(&jpeg(b"two"));

        let mut scanner = FrameScanner::new();
        scanner.extend(&bytes);

        let first = scanner.next_frame().expect("first");
        let second = scanner.next_frame().expect("second");
        assert!(scanner.next_frame().is_none());
        assert_ne!(first, second);
    }

    #[test]
    fn garbage_before_soi_is_discarded() {
        let mut bytes = b"encoder banner noise".to_vec();
        bytes.extend_from_slice(&jpeg(b"frame"));

        let mut scanner = FrameScanner::new();
        scanner.extend(&bytes);

        let frame = scanner.next_frame().expect("frame");
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn minimal_soi_eoi_frame() {
        let mut scanner = FrameScanner::new();
        scanner.extend(&[0xFF, 0xD8, 0xFF, 0xD9]);

        let frame = scanner.next_frame().expect("frame");
        assert_eq!(frame.len(), 4);
    }

    #[tokio::test]
    async fn receiver_maps_lag_to_typed_signal() {
        let (tx, rx) = broadcast::channel(2);
        let mut receiver = FrameReceiver::new(rx, None);

        for seq in 0..5u64 {
            tx.send(FrameEvent::Frame(Frame::new(seq, Bytes::from_static(b"x"))))
                .unwrap();
        }

        match receiver.recv().await {
            FrameSignal::Lagged(n) => assert_eq!(n, 3),
            other => panic!("expected lag signal, got {:?}", other),
        }
        // The next frame resumes further along the sequence
        match receiver.recv().await {
            FrameSignal::Frame(frame) => assert_eq!(frame.sequence, 3),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn receiver_sees_closed_after_sender_drop() {
        let (tx, rx) = broadcast::channel::<FrameEvent>(2);
        let mut receiver = FrameReceiver::new(rx, None);
        drop(tx);

        assert!(matches!(receiver.recv().await, FrameSignal::Closed));
    }

    #[tokio::test]
    async fn receiver_sees_failure_before_close() {
        let (tx, rx) = broadcast::channel(4);
        let mut receiver = FrameReceiver::new(rx, None);

        tx.send(FrameEvent::Failed(FailureReason::Stalled)).unwrap();
        drop(tx);

        assert!(matches!(
            receiver.recv().await,
            FrameSignal::Failed(FailureReason::Stalled)
        ));
        assert!(matches!(receiver.recv().await, FrameSignal::Closed));
    }
}
