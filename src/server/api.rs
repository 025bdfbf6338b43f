use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum_auth::AuthBearer;
use axum_typed_multipart::TypedMultipart;
use clap::ValueEnum;
use indicatif::ProgressBar;
use log::info;

use super::error::{AppError, Result};
use super::state::AppState;
use super::types::*;
use crate::ingest::{ImageSource, IngestReport, ingest};
use crate::metrics;
use crate::model::{QueryMode, QueryRequest};

const DEFAULT_TOP_K: usize = 10;

/// 搜索图片，支持向量、全文与混合查询
#[utoipa::path(
    post,
    path = "/api/search",
    request_body(content = SearchForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = SearchResponse),
        (status = 400, description = "请求参数错误"),
        (status = 502, description = "特征服务不可用"),
        (status = 503, description = "存储不可用"),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    TypedMultipart(data): TypedMultipart<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let mode = match &data.mode {
        Some(mode) => {
            <QueryMode as ValueEnum>::from_str(mode, true).map_err(AppError::bad_request)?
        }
        None => QueryMode::default(),
    };
    let request = QueryRequest {
        image: data.file.map(|file| file.to_vec()),
        text: data.text,
        top_k: data.top_k.unwrap_or(DEFAULT_TOP_K),
        mode,
        distance_threshold: data.distance_threshold,
        fusion_weight: data.fusion_weight,
    };

    let start = Instant::now();

    info!("正在搜索上传图片: mode = {:?}", mode);

    let cancel = state.shutdown.child_token();
    let result = state.engine.search(&request, &cancel).await?;

    Ok(Json(SearchResponse { time: start.elapsed().as_millis() as u64, mode, result }))
}

/// 导入服务器上的目录或归档文件，需要 bearer token
#[utoipa::path(
    post,
    path = "/api/add",
    request_body = AddRequest,
    responses(
        (status = 200, body = IngestReport),
        (status = 401, description = "token 无效"),
    )
)]
pub async fn add_handler(
    State(state): State<Arc<AppState>>,
    AuthBearer(token): AuthBearer,
    Json(data): Json<AddRequest>,
) -> Result<Json<IngestReport>> {
    if token != state.token {
        return Err(AppError::unauthorized());
    }
    let path = PathBuf::from(&data.path);
    if !path.exists() {
        return Err(AppError::bad_request(format!("路径不存在: {}", data.path)));
    }

    info!("开始导入: {}", data.path);
    let cancel = state.shutdown.child_token();
    let report = ingest(
        ImageSource::from_path(path),
        state.context(),
        &state.ingest,
        &cancel,
        ProgressBar::hidden(),
    )
    .await;
    Ok(Json(report))
}

/// prometheus 指标
#[utoipa::path(get, path = "/metrics", responses((status = 200, body = String)))]
pub async fn metrics_handler() -> String {
    metrics::gather_text()
}
