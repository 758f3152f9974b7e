//! ABOUTME: Bounded pool of encoder children with fail-fast admission
//! ABOUTME: Holds only weak back-references; never extends a child's lifetime

use crate::{error::PoolError, settings::CaptureSettings};
use futures_util::StreamExt;
use gl_proc::{EncoderChild, EncoderCommand};
use linked_hash_map::LinkedHashMap;
use metrics::counter;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Weak,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

type ChildMap = LinkedHashMap<u32, Weak<Mutex<EncoderChild>>>;

/// Bounded pool of running encoder children.
///
/// Admission is a hard bound: `acquire` fails immediately with
/// `AtCapacity` when `max_encoders` children are live, so backpressure
/// reaches the HTTP layer instead of queueing here. The pid map exists
/// purely for shutdown-time enumeration; ownership of each child stays
/// with the `PooledChild` guard.
pub struct ProcessPool {
    settings: CaptureSettings,
    /// Live plus in-flight admissions; the admission bound
    live: Arc<AtomicUsize>,
    /// Admitted children by pid, insertion order preserved
    children: Arc<RwLock<ChildMap>>,
    shutdown: Arc<AtomicBool>,
}

impl ProcessPool {
    pub fn new(settings: CaptureSettings) -> Self {
        info!(
            max_encoders = settings.max_encoders,
            encoder_bin = %settings.encoder_bin,
            "Creating encoder process pool"
        );
        Self {
            settings,
            live: Arc::new(AtomicUsize::new(0)),
            children: Arc::new(RwLock::new(LinkedHashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Number of live (or currently spawning) children.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Spawn an encoder child inside a pool slot.
    ///
    /// The returned guard releases the slot when dropped. Fails fast when
    /// the pool is saturated or shut down; never queues.
    #[instrument(skip(self, cmd), fields(program = %cmd.program(), tag = %cmd.tag()))]
    pub async fn acquire(&self, cmd: &EncoderCommand) -> Result<PooledChild, PoolError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }

        // Reserve the slot before spawning so the bound holds even while
        // a spawn is in flight.
        let max = self.settings.max_encoders;
        let mut current = self.live.load(Ordering::SeqCst);
        loop {
            if current >= max {
                counter!("encoder_pool_rejections_total").increment(1);
                debug!(live = current, max, "Pool at capacity, rejecting acquire");
                return Err(PoolError::AtCapacity { max });
            }
            match self
                .live
                .compare_exchange_weak(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let child = match EncoderChild::spawn(cmd).await {
            Ok(child) => child,
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(PoolError::Spawn(e));
            }
        };

        let pid = child.pid();
        let child = Arc::new(Mutex::new(child));

        {
            let mut map = self.children.write().await;
            // Entries whose guard was dropped under lock contention are
            // purged here
            let dead: Vec<u32> = map
                .iter()
                .filter(|(_, weak)| weak.upgrade().is_none())
                .map(|(pid, _)| *pid)
                .collect();
            for pid in dead {
                map.remove(&pid);
            }
            map.insert(pid, Arc::downgrade(&child));
        }

        debug!(pid, live = self.live_count(), "Encoder admitted to pool");

        Ok(PooledChild {
            child,
            pid,
            acquired_at: std::time::Instant::now(),
            live: Arc::clone(&self.live),
            children: Arc::downgrade(&self.children),
        })
    }

    /// Kill every admitted child and refuse further admissions.
    ///
    /// Idempotent; kills run concurrently, bounded by `kill_concurrency`,
    /// walking the map in insertion order.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            debug!("Pool shutdown already requested");
        }

        let targets: Vec<Arc<Mutex<EncoderChild>>> = {
            let map = self.children.read().await;
            map.values().filter_map(Weak::upgrade).collect()
        };

        if targets.is_empty() {
            info!("Process pool shut down (no live encoders)");
            return;
        }

        let grace = self.settings.kill_grace;
        futures_util::stream::iter(targets)
            .for_each_concurrent(self.settings.kill_concurrency, |child| async move {
                let mut guard = child.lock().await;
                let pid = guard.pid();
                if let Err(e) = guard.kill(grace).await {
                    warn!(pid, error = %e, "Failed to kill encoder during pool shutdown");
                }
            })
            .await;

        info!("Process pool shut down");
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            // Clean shutdown already ran
            return;
        }

        // Never block on the map here; a stuck caller must not deadlock
        // the destructor. On contention we work with what we can read.
        let snapshot: Vec<Arc<Mutex<EncoderChild>>> = match self.children.try_read() {
            Ok(map) => map.values().filter_map(Weak::upgrade).collect(),
            Err(_) => {
                warn!("Pool map contended during drop, proceeding without a snapshot");
                Vec::new()
            }
        };

        if snapshot.is_empty() {
            return;
        }

        let grace = self.settings.kill_grace;
        let budget = self.settings.shutdown_timeout;

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let targets = snapshot.clone();
                    let cleanup = async move {
                        for child in targets {
                            let mut guard = child.lock().await;
                            let pid = guard.pid();
                            if let Err(e) = guard.kill(grace).await {
                                warn!(pid, error = %e, "Failed to kill encoder during pool drop");
                            }
                        }
                    };

                    if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
                        match handle.block_on(tokio::time::timeout(budget, cleanup)) {
                            Ok(()) => true,
                            Err(_) => {
                                error!("Pool cleanup timed out during drop");
                                false
                            }
                        }
                    } else {
                        let (done_tx, done_rx) = std::sync::mpsc::channel();
                        std::thread::spawn(move || {
                            let completed = handle
                                .block_on(tokio::time::timeout(budget, cleanup))
                                .is_ok();
                            let _ = done_tx.send(completed);
                        });
                        match done_rx.recv_timeout(budget + std::time::Duration::from_secs(1)) {
                            Ok(true) => true,
                            Ok(false) => {
                                error!("Pool cleanup timed out during drop");
                                false
                            }
                            Err(_) => {
                                error!("Pool cleanup thread stalled or panicked during drop");
                                false
                            }
                        }
                    }
                }
                Err(_) => false,
            }
        }));

        let completed = matches!(result, Ok(true));
        if result.is_err() {
            error!("Panic during pool drop cleanup");
        }
        if !completed {
            // Runtime gone or cleanup failed; best-effort sync kills,
            // then kill-on-drop is the last line
            warn!("Pool drop falling back to best-effort kills");
            for child in &snapshot {
                if let Ok(mut guard) = child.try_lock() {
                    guard.start_kill_best_effort();
                }
            }
        }
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("max_encoders", &self.settings.max_encoders)
            .field("live", &self.live_count())
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

/// A pool slot holding one encoder child.
///
/// Exclusive owner of the child; dropping the guard releases the slot.
/// The pool keeps only a weak reference for shutdown enumeration.
pub struct PooledChild {
    child: Arc<Mutex<EncoderChild>>,
    pid: u32,
    acquired_at: std::time::Instant,
    live: Arc<AtomicUsize>,
    children: Weak<RwLock<ChildMap>>,
}

impl PooledChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// How long this slot has been held.
    pub fn held_for(&self) -> std::time::Duration {
        self.acquired_at.elapsed()
    }

    /// Shared handle to the child, for lock-and-operate access.
    pub fn child(&self) -> &Arc<Mutex<EncoderChild>> {
        &self.child
    }

    /// Kill the child with the given grace period. Idempotent.
    pub async fn kill(
        &self,
        grace: std::time::Duration,
    ) -> gl_core::Result<std::process::ExitStatus> {
        self.child.lock().await.kill(grace).await
    }
}

impl Drop for PooledChild {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        if let Some(map) = self.children.upgrade() {
            // Non-blocking: on contention the stale weak entry is purged
            // by the next acquire
            if let Ok(mut guard) = map.try_write() {
                guard.remove(&self.pid);
            }
        }
    }
}

impl std::fmt::Debug for PooledChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChild").field("pid", &self.pid).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_support::{fake_encoder_silent, pid_is_running, wait_for_exit};
    use uuid::Uuid;

    fn silent_cmd() -> EncoderCommand {
        let (program, args) = fake_encoder_silent(600);
        EncoderCommand::from_parts(program, args, Uuid::new_v4())
    }

    fn small_pool(max: usize) -> ProcessPool {
        ProcessPool::new(CaptureSettings {
            max_encoders: max,
            kill_grace: Duration::from_millis(200),
            ..CaptureSettings::default()
        })
    }

    #[tokio::test]
    async fn acquire_until_capacity_then_reject() {
        let pool = small_pool(2);

        let a = pool.acquire(&silent_cmd()).await.expect("first");
        let b = pool.acquire(&silent_cmd()).await.expect("second");
        assert_eq!(pool.live_count(), 2);
        assert!(b.held_for() <= Duration::from_secs(5));

        match pool.acquire(&silent_cmd()).await {
            Err(PoolError::AtCapacity { max }) => assert_eq!(max, 2),
            other => panic!("expected AtCapacity, got {:?}", other.map(|c| c.pid())),
        }

        // Releasing one slot admits the next caller
        let freed_pid = a.pid();
        drop(a);
        assert!(wait_for_exit(freed_pid, Duration::from_secs(2)).await);

        let c = pool.acquire(&silent_cmd()).await.expect("after release");
        assert_eq!(pool.live_count(), 2);

        pool.shutdown().await;
        drop((b, c));
    }

    #[tokio::test]
    async fn spawn_failure_releases_the_slot() {
        let pool = small_pool(1);
        let bad = EncoderCommand::from_parts(
            "glimpser-no-such-binary-12345",
            Vec::<String>::new(),
            Uuid::new_v4(),
        );

        assert!(matches!(
            pool.acquire(&bad).await,
            Err(PoolError::Spawn(_))
        ));
        assert_eq!(pool.live_count(), 0);

        // The slot is usable again
        let ok = pool.acquire(&silent_cmd()).await.expect("acquire");
        pool.shutdown().await;
        drop(ok);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_kills_admitted_children() {
        let pool = small_pool(4);
        let a = pool.acquire(&silent_cmd()).await.expect("a");
        let b = pool.acquire(&silent_cmd()).await.expect("b");
        let (pid_a, pid_b) = (a.pid(), b.pid());

        pool.shutdown().await;

        assert!(!pid_is_running(pid_a));
        assert!(!pid_is_running(pid_b));
        // Shutdown is idempotent
        pool.shutdown().await;

        drop((a, b));
    }

    #[tokio::test]
    async fn acquire_after_shutdown_is_refused() {
        let pool = small_pool(2);
        pool.shutdown().await;

        assert!(matches!(
            pool.acquire(&silent_cmd()).await,
            Err(PoolError::ShutDown)
        ));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_the_pool_reaps_children() {
        let pool = small_pool(4);
        let a = pool.acquire(&silent_cmd()).await.expect("a");
        let pid = a.pid();

        // Guard outlives the pool; the pool drop must still kill the child
        drop(pool);

        assert!(wait_for_exit(pid, Duration::from_secs(6)).await);
        drop(a);
    }
}
