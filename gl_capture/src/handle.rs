//! ABOUTME: Owning handle for a running capture with deterministic drop cleanup
//! ABOUTME: Dropping the handle kills the encoder within the shutdown budget

use crate::{
    error::SubscribeError,
    frame::FrameReceiver,
    source::{CaptureSource, HealthReport},
};
use gl_core::Id;
use std::{sync::Arc, time::Duration};
use tracing::{error, warn};

/// Exclusive owner of one running capture.
///
/// Callers store this and nothing else. Dropping it, gracefully or
/// during a panic unwind, drives the source to a terminal state and
/// reaps the encoder child within the shutdown budget. After drop
/// returns, no encoder process spawned by this handle remains.
pub struct CaptureHandle {
    source: Arc<CaptureSource>,
    /// Runtime captured at construction, used to drive async cleanup
    /// from the synchronous destructor
    runtime_handle: Option<tokio::runtime::Handle>,
    shutdown_timeout: Duration,
}

impl CaptureHandle {
    pub(crate) fn new(source: Arc<CaptureSource>, shutdown_timeout: Duration) -> Self {
        let runtime_handle = tokio::runtime::Handle::try_current().ok();
        if runtime_handle.is_none() {
            warn!("CaptureHandle created outside a runtime - drop cleanup will be best-effort");
        }

        Self {
            source,
            runtime_handle,
            shutdown_timeout,
        }
    }

    pub fn id(&self) -> &Id {
        &self.source.definition().id
    }

    /// Pid of the encoder child, while one exists.
    pub fn pid(&self) -> Option<u32> {
        self.source.pid()
    }

    /// Register a subscriber on the frame channel.
    pub fn subscribe(&self) -> Result<FrameReceiver, SubscribeError> {
        self.source.subscribe()
    }

    /// Health snapshot of the underlying source.
    pub fn health(&self) -> HealthReport {
        self.source.health()
    }

    /// Stop the capture explicitly. Idempotent; drop after this is free.
    pub async fn stop(&self) {
        self.source.stop().await;
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if self.source.state().is_terminal() {
            return;
        }

        let source = Arc::clone(&self.source);
        let budget = self.shutdown_timeout;

        if let Some(runtime_handle) = self.runtime_handle.take() {
            // Panic isolation: cleanup must never unwind out of a
            // destructor
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let cleanup = async move {
                    source.stop().await;
                };

                if runtime_handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
                    // Safe to block_on directly on a current-thread handle
                    match runtime_handle.block_on(tokio::time::timeout(budget, cleanup)) {
                        Ok(()) => true,
                        Err(_) => {
                            error!("Capture cleanup timed out during drop - process may be leaked");
                            false
                        }
                    }
                } else {
                    // Multi-threaded runtime: block on a dedicated thread
                    // so no worker is parked under us. The channel bounds
                    // the wait even if the runtime died and the thread
                    // never finishes.
                    let (done_tx, done_rx) = std::sync::mpsc::channel();
                    std::thread::spawn(move || {
                        let completed = runtime_handle
                            .block_on(tokio::time::timeout(budget, cleanup))
                            .is_ok();
                        let _ = done_tx.send(completed);
                    });

                    match done_rx.recv_timeout(budget + Duration::from_secs(1)) {
                        Ok(true) => true,
                        Ok(false) => {
                            error!("Capture cleanup timed out during drop - process may be leaked");
                            false
                        }
                        Err(_) => {
                            error!("Capture cleanup thread stalled or panicked during drop");
                            false
                        }
                    }
                }
            }));

            let completed = matches!(result, Ok(true));
            if result.is_err() {
                error!("Panic during capture drop cleanup");
            }
            if !completed {
                // The captured runtime may already be torn down; fall
                // back to the synchronous kill path
                self.source.sync_kill_best_effort();
            }
        } else {
            // Runtime already gone. Kill-on-drop remains as the final
            // backstop beneath this.
            warn!("No runtime available in capture drop, issuing best-effort kill");
            self.source.sync_kill_best_effort();
        }
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("stream", self.id())
            .field("state", &self.source.state().name())
            .field("pid", &self.pid())
            .finish()
    }
}
