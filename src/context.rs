use std::sync::Arc;

use log::info;

use crate::config::{CollectionOptions, ConfDir, ProviderOptions};
use crate::error::{Result, StorageError};
use crate::provider::{CaptionProvider, ChatCaptioner, Embedder, EmbeddingProvider};
use crate::retry::RetryPolicy;
use crate::schema::{CollectionSchema, SchemaManager};
use crate::store::{SqliteStore, StorageEngine};

/// 运行时依赖的集合：存储、集合管理、特征服务与重试策略
///
/// 构建一次后以句柄形式传递，克隆只增加引用计数
pub struct Context<S, E, C> {
    pub store: Arc<S>,
    pub embedder: Arc<E>,
    /// 为空时不生成图片描述，全文召回只能使用查询文本
    pub captioner: Option<Arc<C>>,
    pub schema: Arc<SchemaManager>,
    pub retry: RetryPolicy,
}

impl<S, E, C> Clone for Context<S, E, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            embedder: self.embedder.clone(),
            captioner: self.captioner.clone(),
            schema: self.schema.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<S, E, C> Context<S, E, C>
where
    S: StorageEngine,
    E: EmbeddingProvider,
    C: CaptionProvider,
{
    pub fn new(
        store: S,
        embedder: E,
        captioner: Option<C>,
        schema: CollectionSchema,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store: Arc::new(store),
            embedder: Arc::new(embedder),
            captioner: captioner.map(Arc::new),
            schema: Arc::new(SchemaManager::new(schema)),
            retry,
        }
    }

    /// 确保集合已就绪，返回实际生效的集合定义
    pub async fn ensure_ready(&self) -> Result<CollectionSchema> {
        self.schema.ensure_ready(self.store.as_ref()).await
    }
}

/// 命令行与 HTTP 服务使用的具体类型
pub type AppContext = Context<SqliteStore, Embedder, ChatCaptioner>;

impl AppContext {
    /// 根据命令行配置打开数据库并构建特征服务
    ///
    /// 所需的密钥缺失时在这里直接返回配置错误
    pub async fn open(
        conf_dir: &ConfDir,
        provider: &ProviderOptions,
        collection: &CollectionOptions,
    ) -> Result<Self> {
        let schema = collection.schema()?;
        let embedder = provider.embedder(schema.dimension)?;
        let captioner = provider.captioner()?;
        let retry = provider.retry_policy();

        std::fs::create_dir_all(conf_dir.path()).map_err(|e| {
            StorageError::Unavailable(format!("{}: {}", conf_dir.path().display(), e))
        })?;
        let store = SqliteStore::open(conf_dir.database(), &schema.name).await?;
        info!("使用集合 {} (dim = {})", schema.name, schema.dimension);

        Ok(Self::new(store, embedder, captioner, schema, retry))
    }
}
