//! ABOUTME: Tunables for the capture engine: encoder binary, pool bound, deadlines
//! ABOUTME: Defaults match the documented environment variables

use std::time::Duration;

/// Capture engine settings.
///
/// The embedding application maps its configuration layer onto this;
/// defaults are the documented ones (`GLIMPSER_MAX_ENCODERS`=16,
/// `GLIMPSER_ENCODER_BIN`=ffmpeg, `GLIMPSER_CAPTURE_SHUTDOWN_MS`=5000).
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Encoder binary invoked for every capture
    pub encoder_bin: String,
    /// Hard bound on concurrently running encoder children
    pub max_encoders: usize,
    /// Deadline for the first frame after spawn
    pub start_timeout: Duration,
    /// Maximum tolerated gap between frames while running
    pub stall_timeout: Duration,
    /// Grace period between terminate and force-kill
    pub kill_grace: Duration,
    /// Budget for drop-time cleanup of a handle or the pool
    pub shutdown_timeout: Duration,
    /// Bounded capacity of the per-capture frame broadcast channel
    pub frame_channel_capacity: usize,
    /// Bytes of encoder stderr retained for diagnostics
    pub stderr_tail_bytes: usize,
    /// Concurrent kills during pool shutdown
    pub kill_concurrency: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            encoder_bin: "ffmpeg".to_string(),
            max_encoders: 16,
            start_timeout: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(5000),
            frame_channel_capacity: 16,
            stderr_tail_bytes: 8192,
            kill_concurrency: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = CaptureSettings::default();
        assert_eq!(settings.encoder_bin, "ffmpeg");
        assert_eq!(settings.max_encoders, 16);
        assert_eq!(settings.start_timeout, Duration::from_secs(10));
        assert_eq!(settings.stall_timeout, Duration::from_secs(30));
        assert_eq!(settings.kill_grace, Duration::from_secs(1));
        assert_eq!(settings.shutdown_timeout, Duration::from_millis(5000));
    }
}
