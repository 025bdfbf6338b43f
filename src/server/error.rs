use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::QueryError;

/// 客户端主动断开或服务停止
const STATUS_CLIENT_CLOSED: u16 = 499;

/// API错误类型
pub struct AppError {
    pub status: StatusCode,
    pub error: anyhow::Error,
}

impl AppError {
    pub fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        Self { status, error: error.into() }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, anyhow::anyhow!(msg.into()))
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, anyhow::anyhow!("token 无效"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.error.to_string() }))).into_response()
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        let status = match &err {
            QueryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            QueryError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            QueryError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            QueryError::Cancelled => StatusCode::from_u16(STATUS_CLIENT_CLOSED)
                .unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
        };
        Self::new(status, err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
