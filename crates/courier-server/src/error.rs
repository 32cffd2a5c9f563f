use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Lifecycle guards
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{operation} window of {window_ms}ms has expired")]
    WindowExpired {
        operation: &'static str,
        window_ms: i64,
    },
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    // Collaborators
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    // Auth
    #[error("invalid OTP")]
    InvalidOtp,
    #[error("sms gateway unavailable: {0}")]
    SmsUnavailable(String),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable name, used in response bodies and status reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Forbidden(_) => "forbidden",
            Error::WindowExpired { .. } => "window_expired",
            Error::ValidationFailed(_) => "validation_failed",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::TransportUnavailable(_) => "transport_unavailable",
            Error::InvalidOtp => "invalid_otp",
            Error::SmsUnavailable(_) => "sms_unavailable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) | Error::WindowExpired { .. } => StatusCode::FORBIDDEN,
            Error::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            Error::InvalidOtp => StatusCode::UNAUTHORIZED,
            Error::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::TransportUnavailable(_) | Error::SmsUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_errors_map_to_distinct_statuses() {
        assert_eq!(
            Error::NotFound("m1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Forbidden("not sender".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::WindowExpired {
                operation: "edit",
                window_ms: 60_000
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::ValidationFailed("empty".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn window_expired_message_names_operation() {
        let err = Error::WindowExpired {
            operation: "delete-for-everyone",
            window_ms: 1_800_000,
        };
        assert_eq!(err.kind(), "window_expired");
        assert!(err.to_string().contains("delete-for-everyone"));
    }
}
