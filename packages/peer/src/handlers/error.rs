use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Request validation failures, reported before any socket upgrade.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing required query parameter: {0}")]
    MissingParam(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingParam(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
