//! ABOUTME: API error wrapper mapping capture outcomes to HTTP statuses
//! ABOUTME: 409 state conflicts, 503 pool capacity, 504 start timeout

use crate::capture_manager::ManagerError;
use crate::models::ProblemDetails;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use std::fmt;

/// API error carrying an RFC 7807 body and its status code
#[derive(Debug)]
pub struct ApiError {
    pub problem: ProblemDetails,
    pub status_code: u16,
}

impl ApiError {
    pub fn new(problem: ProblemDetails) -> Self {
        let status_code = problem.status.unwrap_or(500);
        Self {
            problem,
            status_code,
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(
            ProblemDetails::new(
                "https://datatracker.ietf.org/doc/html/rfc7231#section-6.5.1",
                "Bad Request",
            )
            .with_status(400)
            .with_detail(detail),
        )
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(
            ProblemDetails::new(
                "https://datatracker.ietf.org/doc/html/rfc7231#section-6.5.4",
                "Not Found",
            )
            .with_status(404)
            .with_detail(detail),
        )
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(
            ProblemDetails::new(
                "https://datatracker.ietf.org/doc/html/rfc7231#section-6.5.8",
                "Conflict",
            )
            .with_status(409)
            .with_detail(detail),
        )
    }

    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            ProblemDetails::new(
                "https://datatracker.ietf.org/doc/html/rfc7231#section-6.6.4",
                "Service Unavailable",
            )
            .with_status(503)
            .with_detail(detail),
        )
    }

    pub fn gateway_timeout(detail: impl Into<String>) -> Self {
        Self::new(
            ProblemDetails::new(
                "https://datatracker.ietf.org/doc/html/rfc7231#section-6.6.5",
                "Gateway Timeout",
            )
            .with_status(504)
            .with_detail(detail),
        )
    }

    pub fn bad_gateway(detail: impl Into<String>) -> Self {
        Self::new(
            ProblemDetails::new(
                "https://datatracker.ietf.org/doc/html/rfc7231#section-6.6.3",
                "Bad Gateway",
            )
            .with_status(502)
            .with_detail(detail),
        )
    }

    pub fn internal_server_error(detail: impl Into<String>) -> Self {
        Self::new(
            ProblemDetails::new(
                "https://datatracker.ietf.org/doc/html/rfc7231#section-6.6.1",
                "Internal Server Error",
            )
            .with_status(500)
            .with_detail(detail),
        )
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        match &err {
            ManagerError::UnknownStream(_) => Self::not_found(err.to_string()),
            ManagerError::AlreadyRunning(_) | ManagerError::NotRunning(_) => {
                Self::conflict(err.to_string())
            }
            ManagerError::AtCapacity { .. } => Self::service_unavailable(err.to_string()),
            ManagerError::StartTimeout(_) => Self::gateway_timeout(err.to_string()),
            ManagerError::SnapshotTimeout(_) => Self::gateway_timeout(err.to_string()),
            ManagerError::NotReady(_) => Self::conflict(err.to_string()),
            ManagerError::CaptureFailed(_) => Self::bad_gateway(err.to_string()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.problem.title,
            self.problem.detail.as_deref().unwrap_or("no details")
        )
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .content_type("application/problem+json")
            .json(&self.problem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_errors_map_to_documented_statuses() {
        let id = gl_core::Id::new();

        let err: ApiError = ManagerError::UnknownStream(id.clone()).into();
        assert_eq!(err.status_code, 404);

        let err: ApiError = ManagerError::AlreadyRunning(id.clone()).into();
        assert_eq!(err.status_code, 409);

        let err: ApiError = ManagerError::AtCapacity { max: 2 }.into();
        assert_eq!(err.status_code, 503);

        let err: ApiError = ManagerError::StartTimeout(id).into();
        assert_eq!(err.status_code, 504);
    }
}
