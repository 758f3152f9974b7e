//! ABOUTME: Central service coordinating capture lifecycle per stream id
//! ABOUTME: Start/stop/snapshot/health over the pool, one capture per stream

use bytes::Bytes;
use dashmap::DashMap;
use gl_capture::{
    start_capture, start_capture_with_command, CaptureHandle, HealthReport, PoolError,
    ProcessPool, StartError, StreamDefinition,
};
use gl_core::Id;
use gl_proc::EncoderCommand;
use gl_stream::{next_frame, MjpegStream, SnapshotError, StreamMetrics};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Errors surfaced by the capture manager; the HTTP layer maps these to
/// status codes.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown stream: {0}")]
    UnknownStream(Id),

    #[error("stream {0} is already running")]
    AlreadyRunning(Id),

    #[error("stream {0} is not running")]
    NotRunning(Id),

    #[error("encoder pool at capacity ({max})")]
    AtCapacity { max: usize },

    #[error("stream {0} produced no frame before the start deadline")]
    StartTimeout(Id),

    #[error("stream {0} produced no snapshot frame in time")]
    SnapshotTimeout(Id),

    #[error("stream {0} is not accepting subscribers")]
    NotReady(Id),

    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// One registered stream: its definition plus an optional fixed encoder
/// invocation overriding the derived one.
struct RegisteredStream {
    def: StreamDefinition,
    command: Option<EncoderCommand>,
}

/// Central manager for capture processes.
///
/// Holds at most one running capture per stream id. Dropping the manager
/// drops every handle, which reaps every encoder.
pub struct CaptureManager {
    pool: Arc<ProcessPool>,
    streams: DashMap<Id, RegisteredStream>,
    captures: DashMap<Id, CaptureHandle>,
    metrics: StreamMetrics,
    snapshot_deadline: Duration,
    /// Serializes start/stop orchestration; data-plane reads bypass it
    ops: Mutex<()>,
}

impl CaptureManager {
    pub fn new(pool: Arc<ProcessPool>) -> Self {
        let snapshot_deadline = pool.settings().start_timeout;
        Self {
            pool,
            streams: DashMap::new(),
            captures: DashMap::new(),
            metrics: StreamMetrics::new(),
            snapshot_deadline,
            ops: Mutex::new(()),
        }
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    /// Register a stream definition. Replaces any previous definition for
    /// the same id; a running capture keeps its original one.
    pub fn register(&self, def: StreamDefinition) {
        self.streams.insert(
            def.id.clone(),
            RegisteredStream { def, command: None },
        );
    }

    /// Register a stream that runs a fixed encoder invocation instead of
    /// the one derived from its definition.
    pub fn register_with_command(&self, def: StreamDefinition, command: EncoderCommand) {
        self.streams.insert(
            def.id.clone(),
            RegisteredStream {
                def,
                command: Some(command),
            },
        );
    }

    pub fn is_registered(&self, id: &Id) -> bool {
        self.streams.contains_key(id)
    }

    pub fn is_running(&self, id: &Id) -> bool {
        self.captures.contains_key(id)
    }

    /// Start the capture for a stream.
    #[instrument(skip(self), fields(stream = %id))]
    pub async fn start(&self, id: &Id) -> Result<(), ManagerError> {
        let _ops = self.ops.lock().await;

        let (def, command) = {
            let entry = self
                .streams
                .get(id)
                .ok_or_else(|| ManagerError::UnknownStream(id.clone()))?;
            (entry.def.clone(), entry.command.clone())
        };

        if let Some(existing) = self.captures.get(id) {
            if !existing.health().state.eq_ignore_ascii_case("failed") {
                return Err(ManagerError::AlreadyRunning(id.clone()));
            }
            // A failed capture can be restarted
            drop(existing);
            self.captures.remove(id);
        }

        let handle = match command {
            Some(command) => start_capture_with_command(def, command, &self.pool).await,
            None => start_capture(def, &self.pool).await,
        }
        .map_err(|e| Self::map_start_error(id, e))?;

        info!(pid = ?handle.pid(), "Capture started");
        self.captures.insert(id.clone(), handle);
        Ok(())
    }

    /// Stop the capture for a stream.
    #[instrument(skip(self), fields(stream = %id))]
    pub async fn stop(&self, id: &Id) -> Result<(), ManagerError> {
        let _ops = self.ops.lock().await;

        let (_, handle) = self
            .captures
            .remove(id)
            .ok_or_else(|| ManagerError::NotRunning(id.clone()))?;

        handle.stop().await;
        info!("Capture stopped");
        Ok(())
    }

    /// One JPEG frame from the running capture.
    pub async fn snapshot(&self, id: &Id) -> Result<Bytes, ManagerError> {
        // Subscribe under the map reference, await frames outside it
        let receiver = {
            let handle = self
                .captures
                .get(id)
                .ok_or_else(|| ManagerError::NotRunning(id.clone()))?;
            handle
                .subscribe()
                .map_err(|_| ManagerError::NotReady(id.clone()))?
        };

        next_frame(receiver, self.snapshot_deadline)
            .await
            .map_err(|e| match e {
                SnapshotError::Timeout(_) => ManagerError::SnapshotTimeout(id.clone()),
                SnapshotError::NotReady(_) => ManagerError::NotReady(id.clone()),
                other => ManagerError::CaptureFailed(other.to_string()),
            })
    }

    /// Multipart MJPEG body stream over the running capture.
    pub fn mjpeg(&self, id: &Id) -> Result<MjpegStream, ManagerError> {
        let handle = self
            .captures
            .get(id)
            .ok_or_else(|| ManagerError::NotRunning(id.clone()))?;
        let receiver = handle
            .subscribe()
            .map_err(|_| ManagerError::NotReady(id.clone()))?;
        Ok(MjpegStream::new(receiver, self.metrics.clone()))
    }

    /// Health report for a stream: live capture state, or a stopped
    /// placeholder for registered-but-idle streams.
    pub fn health(&self, id: &Id) -> Result<HealthReport, ManagerError> {
        if let Some(handle) = self.captures.get(id) {
            return Ok(handle.health());
        }
        if self.streams.contains_key(id) {
            return Ok(HealthReport {
                state: "stopped".to_string(),
                failure: None,
                last_frame_age_ms: None,
                bytes_read: 0,
                frames: 0,
                stderr_tail: String::new(),
                exit_status: None,
                started_at: None,
                pid: None,
            });
        }
        Err(ManagerError::UnknownStream(id.clone()))
    }

    /// Stop every capture, then the pool.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _ops = self.ops.lock().await;

        let ids: Vec<Id> = self.captures.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.captures.remove(&id) {
                handle.stop().await;
            }
        }
        self.pool.shutdown().await;
        info!("Capture manager shut down");
    }

    fn map_start_error(id: &Id, err: StartError) -> ManagerError {
        match err {
            StartError::Pool(PoolError::AtCapacity { max }) => ManagerError::AtCapacity { max },
            StartError::Timeout(_) => ManagerError::StartTimeout(id.clone()),
            other => {
                warn!(stream = %id, error = %other, "Capture start failed");
                ManagerError::CaptureFailed(other.to_string())
            }
        }
    }
}

impl std::fmt::Debug for CaptureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureManager")
            .field("registered", &self.streams.len())
            .field("running", &self.captures.len())
            .finish()
    }
}
