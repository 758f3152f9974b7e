//! ABOUTME: Shared testing utilities and helper functions
//! ABOUTME: Fake encoder processes and pid probes for capture lifecycle tests

/// A minimal JPEG frame: SOI marker immediately followed by EOI.
///
/// Enough for the frame scanner, which only looks at the markers.
pub const MINIMAL_JPEG: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xD9];

/// Shell program + args for a fake encoder that writes `frames` minimal
/// JPEG frames to stdout (one every `interval_ms`) and then sleeps
/// forever, like a stalled encoder would.
///
/// `\377\330` and `\377\331` are the octal escapes for the JPEG SOI and
/// EOI markers.
pub fn fake_encoder_emit(frames: u32, interval_ms: u64) -> (String, Vec<String>) {
    let script = format!(
        "i=0; while [ $i -lt {frames} ]; do printf '\\377\\330\\377\\331'; i=$((i+1)); sleep {interval}; done; sleep 600",
        frames = frames,
        interval = interval_ms as f64 / 1000.0,
    );
    ("sh".to_string(), vec!["-c".to_string(), script])
}

/// Shell program + args for a fake encoder that accepts the connection
/// but never produces output (start-timeout scenario).
pub fn fake_encoder_silent(sleep_secs: u64) -> (String, Vec<String>) {
    (
        "sh".to_string(),
        vec!["-c".to_string(), format!("sleep {}", sleep_secs)],
    )
}

/// Shell program + args for a fake encoder that exits immediately with
/// `code`, optionally printing `stderr_line` to stderr first.
pub fn fake_encoder_exit(code: i32, stderr_line: &str) -> (String, Vec<String>) {
    let script = if stderr_line.is_empty() {
        format!("exit {}", code)
    } else {
        format!("echo '{}' >&2; exit {}", stderr_line, code)
    };
    ("sh".to_string(), vec!["-c".to_string(), script])
}

/// Check whether a pid still refers to a live process (signal 0 probe).
#[cfg(unix)]
pub fn pid_is_running(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_is_running(_pid: u32) -> bool {
    false
}

/// Poll `pid_is_running` until the process disappears or the deadline
/// elapses. Returns true if the process exited in time.
pub async fn wait_for_exit(pid: u32, deadline: std::time::Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if !pid_is_running(pid) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    !pid_is_running(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_jpeg_has_markers() {
        assert_eq!(&MINIMAL_JPEG[..2], &[0xFF, 0xD8]);
        assert_eq!(&MINIMAL_JPEG[2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn fake_encoder_scripts_are_sh() {
        let (prog, args) = fake_encoder_emit(3, 50);
        assert_eq!(prog, "sh");
        assert!(args[1].contains("while"));

        let (_, args) = fake_encoder_exit(2, "boom");
        assert!(args[1].contains("exit 2"));
        assert!(args[1].contains("boom"));
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_is_running() {
        assert!(pid_is_running(std::process::id()));
    }
}
