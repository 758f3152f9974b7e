//! ABOUTME: HTTP surface of the capture subsystem
//! ABOUTME: Actix routes and the capture manager behind them

pub mod capture_manager;
pub mod error;
pub mod models;
pub mod routes;

pub use capture_manager::{CaptureManager, ManagerError};
pub use error::ApiError;
pub use models::ProblemDetails;

use actix_web::web;
use std::sync::Arc;

/// Shared application state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<CaptureManager>,
}

impl AppState {
    pub fn new(manager: Arc<CaptureManager>) -> Self {
        Self { manager }
    }
}

/// Mount all API routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    routes::stream::configure(cfg);
}
