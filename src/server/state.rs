use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::ingest::IngestOptions;
use crate::provider::{ChatCaptioner, Embedder};
use crate::query::QueryEngine;
use crate::store::SqliteStore;

pub type AppEngine = QueryEngine<SqliteStore, Embedder, ChatCaptioner>;

/// 应用状态
pub struct AppState {
    /// 查询引擎
    pub engine: AppEngine,
    /// 导入接口使用的参数
    pub ingest: IngestOptions,
    /// 鉴权 token
    pub token: String,
    /// 服务停止时取消所有进行中的请求
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(
        engine: AppEngine,
        ingest: IngestOptions,
        token: String,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(AppState { engine, ingest, token, shutdown })
    }

    pub fn context(&self) -> &AppContext {
        self.engine.context()
    }
}
