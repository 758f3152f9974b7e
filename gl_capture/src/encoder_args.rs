//! ABOUTME: Builds the encoder argument vector for a stream definition
//! ABOUTME: Argv order is load-bearing: tag first, input options, output tokens last

use crate::{
    settings::CaptureSettings,
    stream_def::{HardwareAccel, OutputMode, ProtocolKind, StreamDefinition},
};
use gl_proc::EncoderCommand;
use uuid::Uuid;

/// Build the encoder invocation for one capture.
///
/// The reaper depends on the resulting command line carrying the tag
/// metadata pair and at least one output-mode token (`-f mjpeg` /
/// `pipe:1`) verbatim.
pub fn build_encoder_command(
    def: &StreamDefinition,
    settings: &CaptureSettings,
    tag: Uuid,
) -> EncoderCommand {
    let mut args: Vec<String> = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ];

    match def.hardware_accel {
        HardwareAccel::None => {}
        HardwareAccel::Vaapi => {
            args.extend(["-hwaccel".to_string(), "vaapi".to_string()]);
            args.extend(["-hwaccel_output_format".to_string(), "vaapi".to_string()]);
        }
        HardwareAccel::Cuda => {
            args.extend(["-hwaccel".to_string(), "cuda".to_string()]);
        }
        HardwareAccel::Qsv => {
            args.extend(["-hwaccel".to_string(), "qsv".to_string()]);
        }
        HardwareAccel::VideoToolbox => {
            args.extend(["-hwaccel".to_string(), "videotoolbox".to_string()]);
        }
    }

    if def.protocol == ProtocolKind::Rtsp {
        args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
        args.extend(["-rtsp_flags".to_string(), "prefer_tcp".to_string()]);
        args.extend(["-fflags".to_string(), "nobuffer".to_string()]);
        args.extend(["-flags".to_string(), "low_delay".to_string()]);
    }

    args.extend(["-i".to_string(), def.url_with_credentials()]);

    match def.output {
        OutputMode::MjpegStream => {
            args.extend(["-f".to_string(), "mjpeg".to_string()]);
            if let Some(fps) = def.max_fps {
                args.extend(["-r".to_string(), fps.to_string()]);
            }
        }
        OutputMode::Snapshot => {
            args.extend(["-vframes".to_string(), "1".to_string()]);
            args.extend(["-f".to_string(), "mjpeg".to_string()]);
        }
    }

    args.extend(["-q:v".to_string(), quality_scale(def.jpeg_quality)]);

    if let (Some(width), Some(height)) = (def.max_width, def.max_height) {
        args.extend([
            "-vf".to_string(),
            format!(
                "scale={}:{}:force_original_aspect_ratio=decrease",
                width, height
            ),
        ]);
    }

    // Output to stdout
    args.push("pipe:1".to_string());

    EncoderCommand::new(&settings.encoder_bin, tag).args(args)
}

/// Map quality 1-100 to the encoder's 2-31 scale (lower is better there)
fn quality_scale(quality: u8) -> String {
    ((31 * (100 - quality.min(100) as u32)) / 100 + 2).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gl_core::Id;
    use gl_proc::TAG_KEY;

    fn mjpeg_def(url: &str, protocol: ProtocolKind) -> StreamDefinition {
        StreamDefinition::new(Id::new(), url, protocol, OutputMode::MjpegStream)
    }

    #[test]
    fn tag_precedes_everything_else() {
        let tag = Uuid::new_v4();
        let cmd = build_encoder_command(
            &mjpeg_def("rtsp://cam/1", ProtocolKind::Rtsp),
            &CaptureSettings::default(),
            tag,
        );

        let argv = cmd.argv();
        assert_eq!(argv[0], "-metadata");
        assert_eq!(argv[1], format!("{}={}", TAG_KEY, tag));
    }

    #[test]
    fn mjpeg_output_tokens_present_and_last() {
        let cmd = build_encoder_command(
            &mjpeg_def("rtsp://cam/1", ProtocolKind::Rtsp),
            &CaptureSettings::default(),
            Uuid::new_v4(),
        );
        let argv = cmd.argv();

        assert!(argv.contains(&"-f".to_string()));
        assert!(argv.contains(&"mjpeg".to_string()));
        assert_eq!(argv.last().unwrap(), "pipe:1");
    }

    #[test]
    fn rtsp_transport_options() {
        let cmd = build_encoder_command(
            &mjpeg_def("rtsp://cam/1", ProtocolKind::Rtsp),
            &CaptureSettings::default(),
            Uuid::new_v4(),
        );
        let argv = cmd.argv();

        assert!(argv.contains(&"-rtsp_transport".to_string()));
        assert!(argv.contains(&"tcp".to_string()));
        assert!(argv.contains(&"prefer_tcp".to_string()));
        assert!(argv.contains(&"nobuffer".to_string()));
        assert!(argv.contains(&"low_delay".to_string()));
    }

    #[test]
    fn file_sources_skip_rtsp_options() {
        let cmd = build_encoder_command(
            &mjpeg_def("file:///tmp/sample.mp4", ProtocolKind::File),
            &CaptureSettings::default(),
            Uuid::new_v4(),
        );
        assert!(!cmd.argv().contains(&"-rtsp_transport".to_string()));
    }

    #[test]
    fn snapshot_mode_limits_to_one_frame() {
        let def = StreamDefinition::new(
            Id::new(),
            "file:///tmp/sample.mp4",
            ProtocolKind::File,
            OutputMode::Snapshot,
        );
        let cmd = build_encoder_command(&def, &CaptureSettings::default(), Uuid::new_v4());
        let argv = cmd.argv();

        assert!(argv.contains(&"-vframes".to_string()));
        assert!(argv.contains(&"1".to_string()));
        // Snapshot mode still carries both reaper tokens
        assert!(argv.contains(&"mjpeg".to_string()));
        assert_eq!(argv.last().unwrap(), "pipe:1");
    }

    #[test]
    fn fps_cap_only_when_requested() {
        let mut def = mjpeg_def("rtsp://cam/1", ProtocolKind::Rtsp);
        let cmd = build_encoder_command(&def, &CaptureSettings::default(), Uuid::new_v4());
        assert!(!cmd.argv().contains(&"-r".to_string()));

        def.max_fps = Some(12.5);
        let cmd = build_encoder_command(&def, &CaptureSettings::default(), Uuid::new_v4());
        assert!(cmd.argv().contains(&"-r".to_string()));
        assert!(cmd.argv().contains(&"12.5".to_string()));
    }

    #[test]
    fn scaling_filter_from_resolution_cap() {
        let mut def = mjpeg_def("rtsp://cam/1", ProtocolKind::Rtsp);
        def.max_width = Some(1280);
        def.max_height = Some(720);

        let cmd = build_encoder_command(&def, &CaptureSettings::default(), Uuid::new_v4());
        assert!(cmd
            .argv()
            .iter()
            .any(|arg| arg.contains("scale=1280:720")));
    }

    #[test]
    fn quality_mapping_matches_encoder_scale() {
        // High quality maps to a low -q:v value
        assert_eq!(quality_scale(100), "2");
        assert_eq!(quality_scale(85), "6");
        // Low quality maps to a high value
        assert_eq!(quality_scale(1), "32");
    }

    #[test]
    fn hardware_accel_flags() {
        let mut def = mjpeg_def("rtsp://cam/1", ProtocolKind::Rtsp);
        def.hardware_accel = HardwareAccel::Cuda;

        let cmd = build_encoder_command(&def, &CaptureSettings::default(), Uuid::new_v4());
        assert!(cmd.argv().contains(&"-hwaccel".to_string()));
        assert!(cmd.argv().contains(&"cuda".to_string()));
    }
}
