//! ABOUTME: Main binary for the glimpser capture service
//! ABOUTME: Reaps orphans, builds the pool, and serves the capture API

use actix_web::{web, App, HttpServer};
use clap::{Parser, Subcommand};
use gl_capture::{
    CaptureSettings, Credentials, OutputMode, ProcessPool, ProtocolKind, StreamDefinition,
};
use gl_config::{CaptureConfig, Config, StreamEntry};
use gl_core::{telemetry, Error, Id};
use gl_web::{configure_routes, AppState, CaptureManager};
use std::{process, sync::Arc, time::Duration};

#[derive(Parser)]
#[command(name = "glimpser")]
#[command(about = "Glimpser media capture service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default)
    Start,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    telemetry::init_tracing("development", "glimpser");

    // Load configuration - exit with non-zero if invalid
    let config = match Config::load() {
        Ok(config) => {
            tracing::debug!(?config, "Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            tracing::info!("glimpser capture service starting");
            if let Err(e) = start_server(config).await {
                tracing::error!("Failed to start server: {}", e);
                process::exit(1);
            }
        }
    }
}

fn capture_settings(config: &CaptureConfig) -> CaptureSettings {
    CaptureSettings {
        encoder_bin: config.encoder_bin.clone(),
        max_encoders: config.max_encoders,
        start_timeout: Duration::from_secs(config.start_timeout_secs),
        stall_timeout: Duration::from_secs(config.stall_timeout_secs),
        kill_grace: Duration::from_millis(config.kill_grace_ms),
        shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        frame_channel_capacity: config.frame_channel_capacity,
        stderr_tail_bytes: config.stderr_tail_bytes,
        kill_concurrency: config.kill_concurrency,
    }
}

/// Map a flat config entry onto a stream definition. Entries with ids
/// that are not ULIDs get a fresh one; the registration log line is the
/// operator's lookup table either way.
fn stream_definition(entry: &StreamEntry) -> Option<StreamDefinition> {
    let protocol = match entry.protocol.as_str() {
        "rtsp" => ProtocolKind::Rtsp,
        "http-mjpeg" => ProtocolKind::HttpMjpeg,
        "http-snapshot" => ProtocolKind::HttpSnapshot,
        "file" => ProtocolKind::File,
        other => {
            tracing::warn!(stream = %entry.id, protocol = %other, "Unknown protocol, skipping stream");
            return None;
        }
    };
    let output = match entry.output.as_str() {
        "mjpeg" => OutputMode::MjpegStream,
        "snapshot" => OutputMode::Snapshot,
        other => {
            tracing::warn!(stream = %entry.id, output = %other, "Unknown output mode, skipping stream");
            return None;
        }
    };

    let id = entry.id.parse::<Id>().unwrap_or_default();

    let mut def = StreamDefinition::new(id, entry.url.clone(), protocol, output);
    def.max_fps = entry.max_fps;
    def.max_width = entry.max_width;
    def.max_height = entry.max_height;
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        def.credentials = Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        });
    }
    Some(def)
}

async fn start_server(config: Config) -> gl_core::Result<()> {
    let settings = capture_settings(&config.capture);

    // Kill leftovers from a crashed run before any encoder can spawn
    let orphan_grace = Duration::from_millis(config.capture.orphan_kill_grace_ms);
    match gl_proc::reap_orphans(&settings.encoder_bin, orphan_grace).await {
        Ok(count) if count > 0 => {
            tracing::info!(count, "Reaped orphaned encoders from a previous run")
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Orphan reap failed, continuing"),
    }

    let pool = Arc::new(ProcessPool::new(settings));
    let manager = Arc::new(CaptureManager::new(Arc::clone(&pool)));

    for entry in &config.streams {
        if let Some(def) = stream_definition(entry) {
            tracing::info!(stream = %def.id, name = %entry.id, url = %def.url, "Stream registered");
            manager.register(def);
        }
    }

    let state = AppState::new(Arc::clone(&manager));
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(configure_routes)
    })
    .bind((config.server.host.as_str(), config.server.port))
    .map_err(Error::Io)?
    .run();

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "glimpser capture service listening"
    );

    let server_handle = server.handle();
    let serve = tokio::spawn(server);

    tokio::signal::ctrl_c().await.map_err(Error::Io)?;
    tracing::info!("Shutdown signal received");

    server_handle.stop(true).await;
    manager.shutdown().await;
    if let Ok(Err(e)) = serve.await {
        tracing::warn!(error = %e, "HTTP server exited with error");
    }

    tracing::info!("glimpser capture service stopped");
    Ok(())
}
