use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The decision loop has not published this artifact yet.
    #[error("{0} not available yet")]
    NotReady(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body: ApiResponse<()> = ApiResponse::<()>::error(self.to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_maps_to_service_unavailable() {
        let response = ApiError::NotReady("plan").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
