mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::error::AppError;
pub use self::state::*;
pub use self::types::{AddRequest, SearchResponse};
use crate::ingest::{IngestReport, SkipReason};
use crate::model::{QueryMode, SearchResult, Signal};

#[derive(OpenApi)]
#[openapi(
    paths(api::search_handler, api::add_handler, api::metrics_handler),
    components(schemas(
        types::SearchForm,
        types::SearchResponse,
        types::AddRequest,
        SearchResult,
        Signal,
        QueryMode,
        IngestReport,
        SkipReason,
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/search", post(api::search_handler))
        .route("/api/add", post(api::add_handler))
        .route("/metrics", get(api::metrics_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        // 上传限制：10M
        .layer(RequestBodyLimitLayer::new(1024 * 1024 * 10))
        .with_state(state)
}
