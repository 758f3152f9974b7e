//! ABOUTME: HTTP handlers for the per-stream capture endpoints
//! ABOUTME: snapshot, mjpeg, start, stop, and health under /api/stream/{id}

use crate::{error::ApiError, AppState};
use actix_web::{web, HttpResponse};
use gl_core::Id;
use tracing::instrument;

fn parse_id(raw: &str) -> Result<Id, ApiError> {
    raw.parse::<Id>()
        .map_err(|_| ApiError::bad_request(format!("invalid stream id: {}", raw)))
}

/// `GET /api/stream/{id}/snapshot` — one JPEG
#[instrument(skip(state))]
pub async fn snapshot(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let id = parse_id(&path)?;
    let jpeg = state.manager.snapshot(&id).await?;
    Ok(HttpResponse::Ok()
        .content_type("image/jpeg")
        .insert_header(("Cache-Control", "no-cache, no-store, must-revalidate"))
        .body(jpeg))
}

/// `GET /api/stream/{id}/mjpeg` — multipart MJPEG stream
#[instrument(skip(state))]
pub async fn mjpeg(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let id = parse_id(&path)?;
    let stream = state.manager.mjpeg(&id)?;

    Ok(HttpResponse::Ok()
        .content_type(stream.content_type())
        .insert_header(("Cache-Control", "no-cache, no-store, must-revalidate"))
        .insert_header(("Pragma", "no-cache"))
        .insert_header(("Connection", "keep-alive"))
        .streaming(stream))
}

/// `POST /api/stream/{id}/start` — 204, or 409/503/504
#[instrument(skip(state))]
pub async fn start(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let id = parse_id(&path)?;
    state.manager.start(&id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// `POST /api/stream/{id}/stop` — 204, or 409
#[instrument(skip(state))]
pub async fn stop(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let id = parse_id(&path)?;
    state.manager.stop(&id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// `GET /api/stream/{id}/health` — JSON health report
#[instrument(skip(state))]
pub async fn health(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let id = parse_id(&path)?;
    let report = state.manager.health(&id)?;
    Ok(HttpResponse::Ok().json(report))
}

/// Mount the stream endpoints
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/stream/{id}")
            .route("/snapshot", web::get().to(snapshot))
            .route("/mjpeg", web::get().to(mjpeg))
            .route("/start", web::post().to(start))
            .route("/stop", web::post().to(stop))
            .route("/health", web::get().to(health)),
    );
}
