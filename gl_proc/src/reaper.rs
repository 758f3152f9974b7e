//! ABOUTME: Startup reaper for encoder processes left behind by a prior run
//! ABOUTME: Kills processes whose argv carries the glimpser tag and an output token

use crate::command::TAG_KEY;
use gl_core::Result;
use metrics::counter;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Output-mode tokens our spawn routine always places in the encoder argv.
///
/// A candidate must carry the tag marker AND at least one of these before
/// the reaper will touch it. Parent-pid relationships are deliberately not
/// consulted; the OS may have reparented the orphan.
pub const OUTPUT_TOKENS: [&str; 2] = ["pipe:1", "mjpeg"];

/// Find and kill encoder processes left behind by a previous run.
///
/// Must run once, before any encoder is spawned. Returns the number of
/// orphans killed. A host without a usable process-enumeration facility
/// degrades to a no-op with a warning; individual kill failures are
/// logged, never fatal.
#[instrument]
pub async fn reap_orphans(encoder_bin: &str, kill_grace: Duration) -> Result<usize> {
    let bin_name = std::path::Path::new(encoder_bin)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(encoder_bin);

    let candidates = match enumerate_candidates(bin_name).await {
        Some(pids) => pids,
        None => {
            warn!(
                encoder_bin = bin_name,
                "Process enumeration unavailable, skipping orphan reap"
            );
            return Ok(0);
        }
    };

    let own_pid = std::process::id();
    let mut orphans = Vec::new();

    for pid in candidates {
        if pid == own_pid {
            continue;
        }
        let Some(cmdline) = read_cmdline(pid).await else {
            // Raced with process exit, nothing to do
            continue;
        };

        let has_tag = cmdline.contains(TAG_KEY);
        let has_token = OUTPUT_TOKENS.iter().any(|t| cmdline.contains(t));

        if has_tag && has_token {
            orphans.push(pid);
        } else if has_tag || has_token {
            debug!(pid, has_tag, has_token, "Encoder-like process left alone (partial match)");
        }
    }

    if orphans.is_empty() {
        debug!(encoder_bin = bin_name, "No orphaned encoders found");
        return Ok(0);
    }

    let mut kill_failures = 0usize;
    for &pid in &orphans {
        if let Err(e) = send_signal(pid, false) {
            warn!(pid, error = %e, "Failed to terminate orphaned encoder");
            kill_failures += 1;
        }
    }

    tokio::time::sleep(kill_grace).await;

    let mut killed = 0usize;
    for &pid in &orphans {
        if process_alive(pid) {
            warn!(pid, "Orphan ignored terminate, force-killing");
            if let Err(e) = send_signal(pid, true) {
                warn!(pid, error = %e, "Failed to force-kill orphaned encoder");
                kill_failures += 1;
                continue;
            }
        }
        killed += 1;
    }

    counter!("encoder_orphans_reaped_total").increment(killed as u64);

    if kill_failures > 0 {
        warn!(
            killed,
            kill_failures, "Orphan reap completed with unkillable candidates"
        );
    } else {
        info!(killed, "Reaped orphaned encoder processes");
    }

    Ok(killed)
}

/// List pids whose command line mentions the encoder binary.
///
/// None means the enumeration facility itself is unavailable.
#[cfg(any(target_os = "linux", target_os = "macos"))]
async fn enumerate_candidates(bin_name: &str) -> Option<Vec<u32>> {
    let output = tokio::process::Command::new("pgrep")
        .arg("-f")
        .arg(bin_name)
        .output()
        .await
        .ok()?;

    // pgrep exits 1 when nothing matched
    if !output.status.success() {
        return Some(Vec::new());
    }

    let pids = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect();
    Some(pids)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn enumerate_candidates(_bin_name: &str) -> Option<Vec<u32>> {
    None
}

#[cfg(target_os = "linux")]
async fn read_cmdline(pid: u32) -> Option<String> {
    // argv is NUL-separated; substring matching works on the raw bytes
    tokio::fs::read_to_string(format!("/proc/{}/cmdline", pid))
        .await
        .ok()
}

#[cfg(target_os = "macos")]
async fn read_cmdline(pid: u32) -> Option<String> {
    let output = tokio::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "args="])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn read_cmdline(_pid: u32) -> Option<String> {
    None
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) -> std::result::Result<(), nix::errno::Errno> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    kill(Pid::from_raw(pid as i32), signal)
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _force: bool) -> std::result::Result<(), std::io::Error> {
    Ok(())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use test_support::{pid_is_running, wait_for_exit};
    use uuid::Uuid;

    /// Spawn a long-lived shell whose argv carries the given markers as
    /// positional parameters, so they show up verbatim in the OS-reported
    /// command line.
    fn spawn_marked(fixture: &str, markers: &[String]) -> std::process::Child {
        std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30")
            .arg(fixture)
            .args(markers)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn fixture process")
    }

    #[tokio::test]
    async fn reaps_tagged_process_and_leaves_untagged() {
        let fixture = format!("glimpser_reap_fixture_{}", std::process::id());
        let tag = format!("{}={}", TAG_KEY, Uuid::new_v4());

        let mut tagged = spawn_marked(&fixture, &[tag, "pipe:1".to_string()]);
        // Same fixture name but no tag: must survive
        let mut untagged = spawn_marked(&fixture, &["pipe:1".to_string()]);

        let count = reap_orphans(&fixture, Duration::from_millis(100))
            .await
            .expect("reap");

        assert!(count >= 1, "expected at least the tagged fixture reaped");
        assert!(wait_for_exit(tagged.id(), Duration::from_secs(2)).await);
        assert!(pid_is_running(untagged.id()));

        let _ = untagged.kill();
        let _ = untagged.wait();
        let _ = tagged.wait();
    }

    #[tokio::test]
    async fn requires_output_token_in_addition_to_tag() {
        let fixture = format!("glimpser_reap_tokencheck_{}", std::process::id());
        let tag = format!("{}={}", TAG_KEY, Uuid::new_v4());

        // Tag present, no output token: must survive
        let mut tag_only = spawn_marked(&fixture, &[tag]);

        let count = reap_orphans(&fixture, Duration::from_millis(50))
            .await
            .expect("reap");

        assert_eq!(count, 0);
        assert!(pid_is_running(tag_only.id()));

        let _ = tag_only.kill();
        let _ = tag_only.wait();
    }

    #[tokio::test]
    async fn no_candidates_is_zero() {
        let fixture = format!("glimpser_reap_absent_{}", Uuid::new_v4().simple());
        let count = reap_orphans(&fixture, Duration::from_millis(10))
            .await
            .expect("reap");
        assert_eq!(count, 0);
    }
}
