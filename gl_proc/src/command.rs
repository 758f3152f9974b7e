//! ABOUTME: Encoder command-line construction carrying the glimpser capture tag
//! ABOUTME: Every spawned encoder is identifiable across restarts by its argv

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use uuid::Uuid;

/// Key of the metadata argument embedded in every encoder command line.
///
/// The reaper treats `glimpser_capture=<uuid>` in a process's reported
/// command line as the source of truth for "this is ours".
pub const TAG_KEY: &str = "glimpser_capture";

/// Specification of one encoder invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderCommand {
    program: String,
    args: Vec<String>,
    tag: Uuid,
}

impl EncoderCommand {
    /// Start building a command for `program`.
    ///
    /// The first arguments are always the tag metadata pair, so the tag
    /// survives verbatim in the OS-reported command line regardless of
    /// what the caller appends.
    pub fn new(program: impl Into<String>, tag: Uuid) -> Self {
        Self {
            program: program.into(),
            args: vec!["-metadata".to_string(), format!("{}={}", TAG_KEY, tag)],
            tag,
        }
    }

    /// Build a command with a caller-controlled argv.
    ///
    /// The tag is not inserted; callers must embed `glimpser_capture=<tag>`
    /// somewhere in `args` themselves. Used for encoders whose argument
    /// grammar has no metadata flag, and by tests driving `sh`.
    pub fn from_parts(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl AsRef<str>>,
        tag: Uuid,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(|a| a.as_ref().to_string()).collect(),
            tag,
        }
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Append a single argument
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn tag(&self) -> Uuid {
        self.tag
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// Full command line as a single string, used as the process
    /// fingerprint in pool bookkeeping and logs.
    pub fn fingerprint(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    pub(crate) fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_pair_leads_argv() {
        let tag = Uuid::new_v4();
        let cmd = EncoderCommand::new("ffmpeg", tag).args(["-i", "rtsp://cam/1", "pipe:1"]);

        assert_eq!(cmd.argv()[0], "-metadata");
        assert_eq!(cmd.argv()[1], format!("glimpser_capture={}", tag));
        assert_eq!(cmd.argv().last().unwrap(), "pipe:1");
    }

    #[test]
    fn fingerprint_contains_tag_and_program() {
        let tag = Uuid::new_v4();
        let cmd = EncoderCommand::new("ffmpeg", tag).arg("pipe:1");
        let fp = cmd.fingerprint();

        assert!(fp.starts_with("ffmpeg "));
        assert!(fp.contains(&tag.to_string()));
        assert!(fp.contains("pipe:1"));
    }

    #[test]
    fn from_parts_keeps_argv_verbatim() {
        let tag = Uuid::new_v4();
        let cmd = EncoderCommand::from_parts("sh", ["-c", "sleep 1"], tag);

        assert_eq!(cmd.argv(), &["-c".to_string(), "sleep 1".to_string()]);
        assert_eq!(cmd.tag(), tag);
    }
}
