//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles server, capture, and stream settings from env and files

use config::{Config as ConfigBuilder, Environment, File};
use gl_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub capture: CaptureConfig,
    /// Stream definitions supplied by the embedding application
    pub streams: Vec<StreamEntry>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Capture subsystem configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CaptureConfig {
    /// Maximum number of concurrently running encoder processes
    #[validate(range(min = 1, max = 256))]
    pub max_encoders: usize,
    /// Encoder binary invoked for every capture
    #[validate(length(min = 1))]
    pub encoder_bin: String,
    /// Budget for drop-time capture cleanup
    #[validate(range(min = 100, max = 60000))]
    pub shutdown_timeout_ms: u64,
    /// Deadline for the first frame after spawn
    #[validate(range(min = 1, max = 300))]
    pub start_timeout_secs: u64,
    /// Maximum tolerated gap between frames while running
    #[validate(range(min = 1, max = 3600))]
    pub stall_timeout_secs: u64,
    /// Grace period between terminate and force-kill of a child
    #[validate(range(min = 10, max = 30000))]
    pub kill_grace_ms: u64,
    /// Grace period the reaper allows orphans after terminate
    #[validate(range(min = 10, max = 10000))]
    pub orphan_kill_grace_ms: u64,
    /// Bounded capacity of the per-capture frame broadcast channel
    #[validate(range(min = 1, max = 1024))]
    pub frame_channel_capacity: usize,
    /// Bytes of encoder stderr retained for diagnostics
    #[validate(range(min = 256, max = 1048576))]
    pub stderr_tail_bytes: usize,
    /// Concurrent kills during pool shutdown
    #[validate(range(min = 1, max = 64))]
    pub kill_concurrency: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_encoders: 16,
            encoder_bin: "ffmpeg".to_string(),
            shutdown_timeout_ms: 5000,
            start_timeout_secs: 10,
            stall_timeout_secs: 30,
            kill_grace_ms: 1000,
            orphan_kill_grace_ms: 100,
            frame_channel_capacity: 16,
            stderr_tail_bytes: 8192,
            kill_concurrency: 8,
        }
    }
}

/// One configured stream, as written in the config file.
///
/// The capture layer has its own richer `StreamDefinition` type; this is
/// the flat serde shape the embedding application maps from.
#[derive(Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct StreamEntry {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    pub url: String,
    /// One of: rtsp, http-mjpeg, http-snapshot, file
    pub protocol: String,
    /// One of: mjpeg, snapshot
    pub output: String,
    pub max_fps: Option<f64>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for StreamEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            url: String::new(),
            protocol: "rtsp".to_string(),
            output: "mjpeg".to_string(),
            max_fps: None,
            max_width: None,
            max_height: None,
            username: None,
            password: None,
        }
    }
}

impl fmt::Debug for StreamEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEntry")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("output", &self.output)
            .field("username", &self.username.as_ref().map(|_| "[REDACTED]"))
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables and optional .env file
    pub fn load() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        // Set defaults first
        builder = builder
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("capture.max_encoders", 16)?
            .set_default("capture.encoder_bin", "ffmpeg")?
            .set_default("capture.shutdown_timeout_ms", 5000)?
            .set_default("capture.start_timeout_secs", 10)?
            .set_default("capture.stall_timeout_secs", 30)?
            .set_default("capture.kill_grace_ms", 1000)?
            .set_default("capture.orphan_kill_grace_ms", 100)?
            .set_default("capture.frame_channel_capacity", 16)?
            .set_default("capture.stderr_tail_bytes", 8192)?
            .set_default("capture.kill_concurrency", 8)?;

        // Documented environment variables whose names don't follow the
        // generic separator scheme get explicit overrides.
        if let Ok(max_encoders) = std::env::var("GLIMPSER_MAX_ENCODERS") {
            builder = builder.set_override("capture.max_encoders", max_encoders)?;
        }
        if let Ok(encoder_bin) = std::env::var("GLIMPSER_ENCODER_BIN") {
            builder = builder.set_override("capture.encoder_bin", encoder_bin)?;
        }
        if let Ok(shutdown_ms) = std::env::var("GLIMPSER_CAPTURE_SHUTDOWN_MS") {
            builder = builder.set_override("capture.shutdown_timeout_ms", shutdown_ms)?;
        }

        // Try to load from .env file if it exists (optional)
        if std::path::Path::new(".env").exists() {
            builder = builder.add_source(File::with_name(".env").required(false));
        }

        // Load from environment variables with GLIMPSER_ prefix
        builder = builder.add_source(
            Environment::with_prefix("GLIMPSER")
                .try_parsing(true)
                .separator("_"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        // Validate the configuration
        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }
}
