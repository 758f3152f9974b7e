//! ABOUTME: Wrapper around one spawned encoder process
//! ABOUTME: Guarantees the OS process never outlives this value

use crate::EncoderCommand;
use gl_core::{Error, Result};
use metrics::counter;
use std::{
    process::ExitStatus,
    time::{Duration, Instant},
};
use tokio::{
    process::{Child, ChildStderr, ChildStdout},
    time::timeout,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// One running encoder child process.
///
/// If this value exists, the OS process is either running or being
/// actively reaped. `kill_on_drop` is set at spawn so even an abandoned
/// value takes the process down with it; the graceful path is `kill()`.
pub struct EncoderChild {
    child: Child,
    pid: u32,
    tag: Uuid,
    fingerprint: String,
    spawned_at: Instant,
    exit_status: Option<ExitStatus>,
}

impl EncoderChild {
    /// Spawn the encoder described by `cmd`.
    pub async fn spawn(cmd: &EncoderCommand) -> Result<Self> {
        let mut child = cmd.to_tokio().spawn().map_err(|e| {
            counter!("encoder_spawn_failures_total").increment(1);
            Error::Process(format!("Failed to spawn encoder {}: {}", cmd.program(), e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Process("Spawned encoder reported no pid".to_string()))?;

        counter!("encoder_spawns_total").increment(1);
        debug!(pid, tag = %cmd.tag(), program = %cmd.program(), "Encoder process spawned");

        Ok(Self {
            child,
            pid,
            tag: cmd.tag(),
            fingerprint: cmd.fingerprint(),
            spawned_at: Instant::now(),
            exit_status: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tag(&self) -> Uuid {
        self.tag
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn age(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Exit status, if the child has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn is_reaped(&self) -> bool {
        self.exit_status.is_some()
    }

    /// Take the stdout pipe. Available once, right after spawn.
    pub fn stdout_reader(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the stderr pipe. Available once, right after spawn.
    pub fn stderr_reader(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Kill the child and wait for the OS to reap it.
    ///
    /// Idempotent. Sends terminate first, waits up to `grace`, then
    /// force-kills. Returns only once the OS has reported exit, so no
    /// zombie remains.
    pub async fn kill(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        // The child may already be gone
        if let Some(status) = self.child.try_wait().map_err(Error::Io)? {
            self.exit_status = Some(status);
            return Ok(status);
        }

        self.terminate();

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, ?status, "Encoder exited after terminate");
                self.exit_status = Some(status);
                return Ok(status);
            }
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Encoder ignored terminate, force-killing"
                );
            }
        }

        self.child.kill().await.map_err(Error::Io)?;
        let status = self.child.wait().await.map_err(Error::Io)?;

        counter!("encoder_force_kills_total").increment(1);
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Wait for the child to exit on its own.
    pub async fn wait_exit(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await.map_err(Error::Io)?;
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Fire-and-forget kill for synchronous contexts (drop paths).
    ///
    /// Does not wait for exit; `kill_on_drop` plus the OS finish the job.
    pub fn start_kill_best_effort(&mut self) {
        if self.exit_status.is_none() {
            if let Err(e) = self.child.start_kill() {
                debug!(pid = self.pid, error = %e, "Best-effort kill failed (child likely gone)");
            }
        }
    }

    /// Deliver the platform's graceful-terminate signal.
    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            debug!(pid = self.pid, error = %e, "SIGTERM delivery failed");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        // No graceful signal on this platform; start_kill is terminate here
        if let Err(e) = self.child.start_kill() {
            debug!(pid = self.pid, error = %e, "Terminate failed");
        }
    }
}

impl Drop for EncoderChild {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            warn!(
                pid = self.pid,
                tag = %self.tag,
                "Encoder child dropped without kill(), issuing best-effort kill"
            );
            self.start_kill_best_effort();
        }
    }
}

impl std::fmt::Debug for EncoderChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderChild")
            .field("pid", &self.pid)
            .field("tag", &self.tag)
            .field("reaped", &self.exit_status.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::{fake_encoder_exit, fake_encoder_silent, pid_is_running, wait_for_exit};
    use uuid::Uuid;

    fn cmd_from(parts: (String, Vec<String>)) -> EncoderCommand {
        EncoderCommand::from_parts(parts.0, parts.1, Uuid::new_v4())
    }

    #[tokio::test]
    async fn spawn_and_wait_exit() {
        let cmd = cmd_from(fake_encoder_exit(0, ""));
        let mut child = EncoderChild::spawn(&cmd).await.expect("spawn");

        let status = child.wait_exit().await.expect("wait");
        assert!(status.success());
        assert!(child.is_reaped());
    }

    #[tokio::test]
    async fn wait_exit_reports_failure_code() {
        let cmd = cmd_from(fake_encoder_exit(3, "boom"));
        let mut child = EncoderChild::spawn(&cmd).await.expect("spawn");

        let status = child.wait_exit().await.expect("wait");
        assert_eq!(status.code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_reaps_a_running_child() {
        let cmd = cmd_from(fake_encoder_silent(600));
        let mut child = EncoderChild::spawn(&cmd).await.expect("spawn");
        let pid = child.pid();
        assert!(pid_is_running(pid));

        let status = child.kill(Duration::from_millis(500)).await.expect("kill");
        assert!(!status.success());
        assert!(!pid_is_running(pid));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_is_idempotent() {
        let cmd = cmd_from(fake_encoder_silent(600));
        let mut child = EncoderChild::spawn(&cmd).await.expect("spawn");

        let first = child.kill(Duration::from_millis(500)).await.expect("kill");
        let second = child.kill(Duration::from_millis(500)).await.expect("kill again");
        assert_eq!(first.code(), second.code());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drop_kills_the_process() {
        let cmd = cmd_from(fake_encoder_silent(600));
        let child = EncoderChild::spawn(&cmd).await.expect("spawn");
        let pid = child.pid();
        assert!(pid_is_running(pid));

        drop(child);

        assert!(wait_for_exit(pid, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn spawn_failure_surfaces() {
        let cmd = EncoderCommand::from_parts(
            "glimpser-no-such-binary-12345",
            Vec::<String>::new(),
            Uuid::new_v4(),
        );
        assert!(EncoderChild::spawn(&cmd).await.is_err());
    }
}
