use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Invalid test ID")]
    InvalidTestId,

    #[error("{0}")]
    BadRequest(String),

    #[error("Unknown test: {0}")]
    UnknownTest(String),

    #[error("Test archive has expired: {0}")]
    TestExpired(String),

    #[error("No queue available for location: {0}")]
    QueueUnavailable(String),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoordinatorError::InvalidTestId => StatusCode::BAD_REQUEST,
            CoordinatorError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::UnknownTest(_) => StatusCode::NOT_FOUND,
            CoordinatorError::TestExpired(_) => StatusCode::GONE,
            CoordinatorError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordinatorError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoordinatorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoordinatorError::Http(_) => StatusCode::BAD_GATEWAY,
            CoordinatorError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
