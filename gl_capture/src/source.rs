//! ABOUTME: State machine for one logical capture: start, frames, stop, health
//! ABOUTME: Owns the pooled encoder child and the broadcast frame channel

use crate::{
    encoder_args::build_encoder_command,
    error::{FailureReason, StartError, SubscribeError},
    frame::{Frame, FrameEvent, FrameReceiver, FrameScanner},
    pool::{PooledChild, ProcessPool},
    settings::CaptureSettings,
    stream_def::{OutputMode, StreamDefinition},
};
use bytes::{Bytes, BytesMut};
use gl_proc::EncoderCommand;
use metrics::counter;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant, SystemTime},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{ChildStderr, ChildStdout},
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lifecycle of a capture. One-way along Starting → Running → Stopping →
/// Stopped; `Failed` is terminal and reachable until a stop begins.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(FailureReason),
}

impl SourceState {
    pub fn name(&self) -> &'static str {
        match self {
            SourceState::Starting => "starting",
            SourceState::Running => "running",
            SourceState::Stopping => "stopping",
            SourceState::Stopped => "stopped",
            SourceState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceState::Stopped | SourceState::Failed(_))
    }
}

/// Point-in-time view of a capture for the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub state: String,
    pub failure: Option<String>,
    pub last_frame_age_ms: Option<u64>,
    pub bytes_read: u64,
    pub frames: u64,
    pub stderr_tail: String,
    pub exit_status: Option<i32>,
    pub started_at: Option<String>,
    pub pid: Option<u32>,
}

/// Sender half of the frame channel plus the latched newest frame.
///
/// Both live under one lock so subscription is atomic with respect to
/// publication: a subscriber sees the latched frame and then every frame
/// published after it, with no gap.
struct ChannelSlot {
    tx: broadcast::Sender<FrameEvent>,
    latest: Option<Frame>,
}

/// Capped ring of recent encoder stderr output.
struct StderrRing {
    buf: VecDeque<u8>,
    cap: usize,
}

impl StderrRing {
    fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(4096)),
            cap,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.extend(line.as_bytes().iter().copied());
        self.buf.push_back(b'\n');
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }

    fn snapshot(&self) -> String {
        let bytes: Vec<u8> = self.buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// One logical capture: spawns the encoder through the pool, parses its
/// stdout into frames, and reports health.
pub struct CaptureSource {
    def: StreamDefinition,
    tag: Uuid,
    settings: CaptureSettings,
    /// Caller-supplied encoder invocation; built from the definition when
    /// absent
    command: StdMutex<Option<EncoderCommand>>,
    state_tx: watch::Sender<SourceState>,
    started: AtomicBool,
    child: Mutex<Option<PooledChild>>,
    pid: AtomicU32,
    channel: StdMutex<Option<ChannelSlot>>,
    frames: AtomicU64,
    bytes_read: AtomicU64,
    epoch: Instant,
    /// Millis since `epoch` of the newest frame; MAX = none yet
    last_frame_ms: AtomicU64,
    started_at: StdMutex<Option<SystemTime>>,
    stderr_tail: StdMutex<StderrRing>,
    exit_code: StdMutex<Option<i32>>,
    /// Set when a snapshot-mode encoder finished cleanly; the capture
    /// stays subscribable with the latched frame
    encoder_done: AtomicBool,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    /// Held separately so the exit path can drain stderr before
    /// snapshotting the tail
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
}

impl CaptureSource {
    pub fn new(def: StreamDefinition, settings: CaptureSettings) -> Arc<Self> {
        Self::build(def, None, settings)
    }

    /// Source running a caller-supplied encoder invocation instead of the
    /// one derived from the definition. The command's argv must already
    /// carry the glimpser tag.
    pub fn with_command(
        def: StreamDefinition,
        command: EncoderCommand,
        settings: CaptureSettings,
    ) -> Arc<Self> {
        Self::build(def, Some(command), settings)
    }

    fn build(
        def: StreamDefinition,
        command: Option<EncoderCommand>,
        settings: CaptureSettings,
    ) -> Arc<Self> {
        let tag = command.as_ref().map(|c| c.tag()).unwrap_or_else(Uuid::new_v4);
        let (tx, _) = broadcast::channel(settings.frame_channel_capacity);
        let (state_tx, _) = watch::channel(SourceState::Starting);
        let stderr_cap = settings.stderr_tail_bytes;

        Arc::new(Self {
            def,
            tag,
            settings,
            command: StdMutex::new(command),
            state_tx,
            started: AtomicBool::new(false),
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
            channel: StdMutex::new(Some(ChannelSlot { tx, latest: None })),
            frames: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            epoch: Instant::now(),
            last_frame_ms: AtomicU64::new(u64::MAX),
            started_at: StdMutex::new(None),
            stderr_tail: StdMutex::new(StderrRing::new(stderr_cap)),
            exit_code: StdMutex::new(None),
            encoder_done: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
            stderr_task: StdMutex::new(None),
        })
    }

    pub fn definition(&self) -> &StreamDefinition {
        &self.def
    }

    pub fn tag(&self) -> Uuid {
        self.tag
    }

    pub fn state(&self) -> SourceState {
        self.state_tx.borrow().clone()
    }

    /// Pid of the encoder child, once spawned.
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Spawn the encoder and wait for the first frame.
    ///
    /// Resolves when the capture reaches `Running`, or fails with the
    /// child already reaped. Abandoning the returned future mid-await
    /// kills the child too; nothing is leaked.
    #[instrument(skip(self, pool), fields(stream = %self.def.id))]
    pub async fn start(self: &Arc<Self>, pool: &ProcessPool) -> Result<(), StartError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StartError::AlreadyStarted);
        }

        let cmd = self
            .command
            .lock()
            .expect("command lock poisoned")
            .take()
            .unwrap_or_else(|| build_encoder_command(&self.def, &self.settings, self.tag));

        let pooled = pool.acquire(&cmd).await?;
        let pid = pooled.pid();
        self.pid.store(pid, Ordering::SeqCst);
        *self.started_at.lock().expect("started_at lock poisoned") = Some(SystemTime::now());

        // If this future is dropped from here on, the guard reaps the
        // child synchronously
        let guard = StartGuard { source: self };

        let (stdout, stderr) = {
            let mut child = pooled.child().lock().await;
            let stdout = child.stdout_reader().ok_or_else(|| {
                StartError::Failed(FailureReason::Io("encoder stdout unavailable".to_string()))
            })?;
            (stdout, child.stderr_reader())
        };

        *self.child.lock().await = Some(pooled);

        counter!("captures_started_total").increment(1);
        info!(pid, tag = %self.tag, "Capture starting");

        if let Some(stderr) = stderr {
            *self.stderr_task.lock().expect("stderr task lock poisoned") =
                Some(tokio::spawn(Arc::clone(self).stderr_task(stderr)));
        }
        {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            tasks.push(tokio::spawn(Arc::clone(self).reader_task(stdout)));
            tasks.push(tokio::spawn(Arc::clone(self).watchdog_task()));
        }

        let result = self.await_first_frame().await;
        if result.is_ok() {
            guard.disarm();
        }
        result
    }

    async fn await_first_frame(self: &Arc<Self>) -> Result<(), StartError> {
        let mut state_rx = self.state_tx.subscribe();
        let deadline = tokio::time::sleep(self.settings.start_timeout);
        tokio::pin!(deadline);

        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                SourceState::Running => return Ok(()),
                SourceState::Failed(reason) => return Err(reason.into()),
                SourceState::Stopping | SourceState::Stopped => {
                    return Err(StartError::Failed(FailureReason::Io(
                        "capture stopped during startup".to_string(),
                    )))
                }
                SourceState::Starting => {}
            }

            tokio::select! {
                _ = &mut deadline => {
                    warn!(stream = %self.def.id, "No frame before the start deadline");
                    self.fail(FailureReason::StartTimeout).await;
                    return Err(StartError::Timeout(self.settings.start_timeout));
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(StartError::Failed(FailureReason::Io(
                            "state channel closed".to_string(),
                        )));
                    }
                }
            }
        }
    }

    /// Register a subscriber on the frame channel. `Running` only.
    pub fn subscribe(&self) -> Result<FrameReceiver, SubscribeError> {
        let state = self.state();
        if !matches!(state, SourceState::Running) {
            return Err(SubscribeError::NotReady(state.name()));
        }

        let guard = self.channel.lock().expect("channel lock poisoned");
        match guard.as_ref() {
            Some(slot) => {
                let seeded = if self.def.output == OutputMode::Snapshot {
                    slot.latest.clone()
                } else {
                    None
                };
                Ok(FrameReceiver::new(slot.tx.subscribe(), seeded))
            }
            None => Err(SubscribeError::NotReady(state.name())),
        }
    }

    /// Stop the capture, kill the child, and drain the reader tasks.
    ///
    /// Idempotent: concurrent and repeat callers wait for the first stop
    /// to finish and observe the same terminal state.
    #[instrument(skip(self), fields(stream = %self.def.id))]
    pub async fn stop(&self) {
        let mut initiated = false;
        self.state_tx.send_if_modified(|state| match state {
            SourceState::Starting | SourceState::Running => {
                *state = SourceState::Stopping;
                initiated = true;
                true
            }
            _ => false,
        });

        if !initiated {
            self.wait_terminal().await;
            return;
        }

        debug!("Stopping capture");
        // Close the channel first: subscribers drain what is buffered and
        // then observe clean end-of-stream
        drop(self.channel.lock().expect("channel lock poisoned").take());
        self.cancel.cancel();
        self.reap_child().await;
        self.join_tasks().await;

        self.state_tx.send_modify(|state| *state = SourceState::Stopped);
        counter!("captures_stopped_total").increment(1);
        info!("Capture stopped");
    }

    /// Wait until the source reaches `Stopped` or `Failed`.
    pub async fn wait_terminal(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(SourceState::is_terminal).await;
    }

    /// Snapshot of the capture's health.
    pub fn health(&self) -> HealthReport {
        let state = self.state();
        HealthReport {
            failure: match &state {
                SourceState::Failed(reason) => Some(reason.to_string()),
                _ => None,
            },
            state: state.name().to_string(),
            last_frame_age_ms: self.last_frame_age().map(|age| age.as_millis() as u64),
            bytes_read: self.bytes_read.load(Ordering::SeqCst),
            frames: self.frames.load(Ordering::SeqCst),
            stderr_tail: self
                .stderr_tail
                .lock()
                .expect("stderr lock poisoned")
                .snapshot(),
            exit_status: *self.exit_code.lock().expect("exit_code lock poisoned"),
            started_at: self
                .started_at
                .lock()
                .expect("started_at lock poisoned")
                .map(gl_core::to_rfc3339),
            pid: self.pid(),
        }
    }

    fn last_frame_age(&self) -> Option<Duration> {
        match self.last_frame_ms.load(Ordering::SeqCst) {
            u64::MAX => None,
            at_ms => {
                let now_ms = self.epoch.elapsed().as_millis() as u64;
                Some(Duration::from_millis(now_ms.saturating_sub(at_ms)))
            }
        }
    }

    /// Synchronous last-resort kill for drop paths without a runtime.
    pub(crate) fn sync_kill_best_effort(&self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(pooled) = guard.take() {
                if let Ok(mut child) = pooled.child().try_lock() {
                    child.start_kill_best_effort();
                }
                // Dropping the slot releases pool capacity
            }
        }
        self.cancel.cancel();
        drop(self.channel.lock().expect("channel lock poisoned").take());
    }

    /// Kill and reap the child, releasing the pool slot.
    async fn reap_child(&self) {
        let pooled = self.child.lock().await.take();
        if let Some(pooled) = pooled {
            match pooled.kill(self.settings.kill_grace).await {
                Ok(status) => {
                    *self.exit_code.lock().expect("exit_code lock poisoned") = status.code();
                }
                Err(e) => {
                    warn!(pid = pooled.pid(), error = %e, "Failed to reap encoder child");
                }
            }
        }
    }

    /// Terminal failure transition. Publishes the reason to subscribers,
    /// closes the channel, and reaps the child. Loses to a stop already
    /// in flight.
    async fn fail(&self, reason: FailureReason) {
        let mut transitioned = false;
        self.state_tx.send_if_modified(|state| match state {
            SourceState::Starting | SourceState::Running => {
                *state = SourceState::Failed(reason.clone());
                transitioned = true;
                true
            }
            _ => false,
        });
        if !transitioned {
            return;
        }

        warn!(stream = %self.def.id, reason = %reason, "Capture failed");
        counter!("capture_failures_total", "reason" => reason.label()).increment(1);

        // Terminal event first, then close
        let slot = self.channel.lock().expect("channel lock poisoned").take();
        if let Some(slot) = slot {
            let _ = slot.tx.send(FrameEvent::Failed(reason));
        }

        self.cancel.cancel();
        self.reap_child().await;
    }

    fn publish_frame(&self, data: Bytes) {
        let sequence = self.frames.fetch_add(1, Ordering::SeqCst);
        self.last_frame_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
        counter!("capture_frames_total").increment(1);

        let frame = Frame::new(sequence, data);
        {
            let mut guard = self.channel.lock().expect("channel lock poisoned");
            if let Some(slot) = guard.as_mut() {
                slot.latest = Some(frame.clone());
                let _ = slot.tx.send(FrameEvent::Frame(frame));
            }
        }

        if sequence == 0 {
            debug!(stream = %self.def.id, "First frame observed");
            self.state_tx.send_if_modified(|state| {
                if matches!(state, SourceState::Starting) {
                    *state = SourceState::Running;
                    true
                } else {
                    false
                }
            });
        }
    }

    async fn reader_task(self: Arc<Self>, mut stdout: ChildStdout) {
        let mut scanner = FrameScanner::new();
        let mut chunk = BytesMut::with_capacity(8192);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                read = stdout.read_buf(&mut chunk) => match read {
                    Ok(0) => {
                        self.on_stdout_eof().await;
                        return;
                    }
                    Ok(n) => {
                        self.bytes_read.fetch_add(n as u64, Ordering::SeqCst);
                        scanner.extend(&chunk);
                        chunk.clear();
                        while let Some(data) = scanner.next_frame() {
                            self.publish_frame(data);
                        }
                    }
                    Err(e) => {
                        warn!(stream = %self.def.id, error = %e, "Encoder stdout read failed");
                        self.fail(FailureReason::Io(e.to_string())).await;
                        return;
                    }
                }
            }
        }
    }

    /// The encoder closed stdout. A snapshot encoder finishing cleanly
    /// after its frame is the one non-failure case.
    async fn on_stdout_eof(&self) {
        if !matches!(
            self.state(),
            SourceState::Starting | SourceState::Running
        ) {
            return;
        }

        let status = {
            let pooled = self.child.lock().await.take();
            match pooled {
                Some(pooled) => match pooled.kill(self.settings.kill_grace).await {
                    Ok(status) => {
                        *self.exit_code.lock().expect("exit_code lock poisoned") = status.code();
                        Some(status)
                    }
                    Err(e) => {
                        warn!(pid = pooled.pid(), error = %e, "Failed to reap exited encoder");
                        None
                    }
                },
                None => None,
            }
        };

        let clean_snapshot = self.def.output == OutputMode::Snapshot
            && self.frames.load(Ordering::SeqCst) > 0
            && status.map(|s| s.success()).unwrap_or(false);

        if clean_snapshot {
            debug!(stream = %self.def.id, "Snapshot encoder completed");
            self.encoder_done.store(true, Ordering::SeqCst);
            return;
        }

        // Drain stderr before reading the tail; the pipe hit EOF with the
        // process, so this resolves promptly
        let stderr_task = self
            .stderr_task
            .lock()
            .expect("stderr task lock poisoned")
            .take();
        if let Some(task) = stderr_task {
            let _ = tokio::time::timeout(self.settings.kill_grace, task).await;
        }

        let stderr_tail = self
            .stderr_tail
            .lock()
            .expect("stderr lock poisoned")
            .snapshot();
        self.fail(FailureReason::EncoderExited {
            status: status.and_then(|s| s.code()),
            stderr_tail,
        })
        .await;
    }

    async fn stderr_task(self: Arc<Self>, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        debug!(stream = %self.def.id, line = %line, "Encoder stderr");
                        self.stderr_tail
                            .lock()
                            .expect("stderr lock poisoned")
                            .push_line(&line);
                    }
                    Ok(None) | Err(_) => return,
                }
            }
        }
    }

    async fn watchdog_task(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            if !matches!(self.state(), SourceState::Running)
                || self.encoder_done.load(Ordering::SeqCst)
            {
                continue;
            }
            let Some(age) = self.last_frame_age() else {
                continue;
            };
            if age > self.settings.stall_timeout {
                warn!(
                    stream = %self.def.id,
                    age_ms = age.as_millis() as u64,
                    "Frame flow stalled"
                );
                self.fail(FailureReason::Stalled).await;
                return;
            }
        }
    }

    async fn join_tasks(&self) {
        let mut tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("tasks lock poisoned"));
        if let Some(task) = self
            .stderr_task
            .lock()
            .expect("stderr task lock poisoned")
            .take()
        {
            tasks.push(task);
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSource")
            .field("stream", &self.def.id)
            .field("tag", &self.tag)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

/// Reaps the child synchronously if `start()` is abandoned mid-await.
struct StartGuard<'a> {
    source: &'a Arc<CaptureSource>,
}

impl StartGuard<'_> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        // Error paths have already reaped the child through fail(); this
        // is then a no-op. A dropped-future path finds the child live.
        self.source.sync_kill_best_effort();
    }
}
