//! ABOUTME: Stream definition types: source URL, protocol, and output shape
//! ABOUTME: Immutable per capture; supplied by the embedding application

use gl_core::Id;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the source is spoken to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    Rtsp,
    HttpMjpeg,
    HttpSnapshot,
    File,
}

/// What the capture produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Continuous MJPEG frames on the broadcast channel
    MjpegStream,
    /// A single frame, then the encoder exits on its own
    Snapshot,
}

/// Encoder hardware acceleration types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareAccel {
    /// Software decoding (no acceleration)
    #[default]
    None,
    /// Video Acceleration API (Linux)
    Vaapi,
    /// NVIDIA CUDA
    Cuda,
    /// Intel Quick Sync Video
    Qsv,
    /// VideoToolbox (macOS)
    VideoToolbox,
}

/// Source credentials, injected into the URL userinfo at spawn time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Definition of one capture's input and output. Immutable once a capture
/// has been started from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub id: Id,
    pub url: String,
    pub protocol: ProtocolKind,
    pub credentials: Option<Credentials>,
    pub output: OutputMode,
    /// Frame-rate cap for MJPEG output; encoder-native rate when unset
    pub max_fps: Option<f64>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// JPEG quality (1-100, higher is better quality)
    pub jpeg_quality: u8,
    pub hardware_accel: HardwareAccel,
}

impl StreamDefinition {
    pub fn new(
        id: Id,
        url: impl Into<String>,
        protocol: ProtocolKind,
        output: OutputMode,
    ) -> Self {
        Self {
            id,
            url: url.into(),
            protocol,
            credentials: None,
            output,
            max_fps: None,
            max_width: None,
            max_height: None,
            jpeg_quality: 85,
            hardware_accel: HardwareAccel::None,
        }
    }

    /// Source URL with credentials injected as userinfo, when present.
    pub fn url_with_credentials(&self) -> String {
        let Some(creds) = &self.credentials else {
            return self.url.clone();
        };
        match self.url.split_once("://") {
            Some((scheme, rest)) if !rest.contains('@') => {
                format!("{}://{}:{}@{}", scheme, creds.username, creds.password, rest)
            }
            _ => self.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_redacted_in_debug() {
        let def = StreamDefinition {
            credentials: Some(Credentials {
                username: "admin".to_string(),
                password: "hunter2".to_string(),
            }),
            ..StreamDefinition::new(
                Id::new(),
                "rtsp://cam.example.com/live",
                ProtocolKind::Rtsp,
                OutputMode::MjpegStream,
            )
        };

        let debug_output = format!("{:?}", def);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
    }

    #[test]
    fn url_userinfo_injection() {
        let mut def = StreamDefinition::new(
            Id::new(),
            "rtsp://cam.example.com/live",
            ProtocolKind::Rtsp,
            OutputMode::MjpegStream,
        );
        assert_eq!(def.url_with_credentials(), "rtsp://cam.example.com/live");

        def.credentials = Some(Credentials {
            username: "user".to_string(),
            password: "pw".to_string(),
        });
        assert_eq!(
            def.url_with_credentials(),
            "rtsp://user:pw@cam.example.com/live"
        );
    }

    #[test]
    fn url_with_existing_userinfo_is_untouched() {
        let mut def = StreamDefinition::new(
            Id::new(),
            "rtsp://a:b@cam.example.com/live",
            ProtocolKind::Rtsp,
            OutputMode::MjpegStream,
        );
        def.credentials = Some(Credentials {
            username: "user".to_string(),
            password: "pw".to_string(),
        });
        assert_eq!(
            def.url_with_credentials(),
            "rtsp://a:b@cam.example.com/live"
        );
    }

    #[test]
    fn serde_roundtrip_uses_kebab_case() {
        let json = serde_json::to_string(&ProtocolKind::HttpMjpeg).unwrap();
        assert_eq!(json, "\"http-mjpeg\"");
        let back: ProtocolKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProtocolKind::HttpMjpeg);
    }
}
