use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use regex::Regex;

use crate::cli::*;
use crate::error::ConfigError;
use crate::fusion::{FusionConfig, FusionPlacement, FusionStrategy};
use crate::ingest::{DedupKey, IngestOptions};
use crate::provider::{
    ChatCaptioner, ChatCaptionerConfig, DEFAULT_CAPTION_MODEL, DEFAULT_CHAT_BASE_URL,
    DEFAULT_EMBEDDING_ENDPOINT, DEFAULT_EMBEDDING_MODEL, Embedder, LocalEmbedder, RemoteEmbedder,
    RemoteEmbedderConfig,
};
use crate::retry::RetryPolicy;
use crate::schema::{
    CollectionSchema, IndexAlgorithm, Metric, TextIndexConfig, Tokenizer, VectorIndexConfig,
};

static CONF_DIR: LazyLock<String> = LazyLock::new(|| {
    ProjectDirs::from("", "imhybrid", "imhybrid")
        .map(|dirs| dirs.config_dir().to_string_lossy().to_string())
        .unwrap_or_else(|| ".imhybrid".to_string())
});

fn default_config_dir() -> &'static str {
    CONF_DIR.as_str()
}

/// 向量服务
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    /// DashScope 多模态向量接口
    Remote,
    /// 本地特征哈希，不需要网络
    Local,
}

/// 图片描述服务
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionBackend {
    /// OpenAI 兼容的 chat completions 接口
    Chat,
    /// 不生成描述
    None,
}

#[derive(Parser, Debug, Clone)]
pub struct ProviderOptions {
    /// 向量服务
    #[arg(long, value_enum, env = "EMBEDDING_PROVIDER", default_value_t = EmbeddingBackend::Remote)]
    pub embedding_provider: EmbeddingBackend,
    /// 向量服务地址
    #[arg(long, env = "EMBEDDING_ENDPOINT", default_value = DEFAULT_EMBEDDING_ENDPOINT)]
    pub embedding_endpoint: String,
    /// 向量模型
    #[arg(long, env = "EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    pub embedding_model: String,
    /// 向量服务的 API key，未设置时使用 --api-key
    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    pub embedding_api_key: Option<String>,
    /// 图片描述服务
    #[arg(long, value_enum, env = "CAPTION_PROVIDER", default_value_t = CaptionBackend::Chat)]
    pub caption_provider: CaptionBackend,
    /// 图片描述服务的 base url
    #[arg(long, env = "BASE_URL", default_value = DEFAULT_CHAT_BASE_URL)]
    pub caption_base_url: String,
    /// 图片描述使用的视觉模型
    #[arg(long, env = "MODEL", default_value = DEFAULT_CAPTION_MODEL)]
    pub caption_model: String,
    /// 图片描述服务的 API key
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    /// 单次调用的超时时间，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,
    /// 临时错误的最大重试次数
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub max_retries: u32,
}

impl ProviderOptions {
    fn embedding_key(&self) -> Option<&str> {
        self.embedding_api_key.as_deref().or(self.api_key.as_deref()).filter(|k| !k.is_empty())
    }

    pub fn embedder(&self, dimension: usize) -> Result<Embedder, ConfigError> {
        match self.embedding_provider {
            EmbeddingBackend::Local => Ok(Embedder::Local(LocalEmbedder::new(dimension))),
            EmbeddingBackend::Remote => {
                let api_key = self.embedding_key().ok_or_else(|| {
                    ConfigError::missing(
                        "embedding-api-key",
                        "使用远程向量服务时必须设置 EMBEDDING_API_KEY 或 API_KEY",
                    )
                })?;
                let embedder = RemoteEmbedder::new(RemoteEmbedderConfig {
                    endpoint: self.embedding_endpoint.clone(),
                    model: self.embedding_model.clone(),
                    api_key: api_key.to_string(),
                    dimension,
                    timeout: self.call_timeout(),
                })?;
                Ok(Embedder::Remote(embedder))
            }
        }
    }

    pub fn captioner(&self) -> Result<Option<ChatCaptioner>, ConfigError> {
        match self.caption_provider {
            CaptionBackend::None => Ok(None),
            CaptionBackend::Chat => {
                let api_key = self.api_key.as_deref().filter(|k| !k.is_empty()).ok_or_else(|| {
                    ConfigError::missing("api-key", "生成图片描述时必须设置 API_KEY")
                })?;
                let captioner = ChatCaptioner::new(ChatCaptionerConfig {
                    base_url: self.caption_base_url.clone(),
                    model: self.caption_model.clone(),
                    api_key: api_key.to_string(),
                    timeout: self.call_timeout(),
                })?;
                Ok(Some(captioner))
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            timeout: self.call_timeout(),
            storage_timeout: self.call_timeout(),
            ..Default::default()
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }
}

#[derive(Parser, Debug, Clone)]
pub struct CollectionOptions {
    /// 集合名
    #[arg(long, env = "IMG_TABLE_NAME", default_value = "image_search")]
    pub collection: String,
    /// 向量维度，必须与向量模型的输出一致
    #[arg(long, env = "EMBEDDING_DIMENSION", default_value_t = 1024)]
    pub dimension: usize,
    /// 向量距离度量
    #[arg(long, value_enum, default_value_t = Metric::L2)]
    pub metric: Metric,
    /// 向量索引算法
    #[arg(long, value_enum, default_value_t = IndexAlgorithm::Hnsw)]
    pub index: IndexAlgorithm,
    /// 全文索引分词器
    #[arg(long, value_enum, default_value_t = Tokenizer::Unicode61)]
    pub tokenizer: Tokenizer,
    /// HNSW 每个节点的最大连接数
    #[arg(long, value_name = "M", default_value_t = 16)]
    pub hnsw_m: usize,
    /// HNSW 构建时的候选列表大小
    #[arg(long, value_name = "N", default_value_t = 200)]
    pub ef_construction: usize,
    /// HNSW 搜索时的候选列表大小
    #[arg(long, value_name = "N", default_value_t = 64)]
    pub ef_search: usize,
}

impl CollectionOptions {
    pub fn schema(&self) -> Result<CollectionSchema, ConfigError> {
        let schema = CollectionSchema {
            name: self.collection.clone(),
            dimension: self.dimension,
            vector_index: VectorIndexConfig {
                algorithm: self.index,
                metric: self.metric,
                max_connections: self.hnsw_m,
                ef_construction: self.ef_construction,
                ef_search: self.ef_search,
            },
            text_index: TextIndexConfig { tokenizer: self.tokenizer, ..Default::default() },
        };
        schema.validate()?;
        Ok(schema)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct FusionOptions {
    /// 混合查询的融合策略
    #[arg(long, value_enum, default_value_t = FusionStrategy::Weighted)]
    pub fusion: FusionStrategy,
    /// 加权融合时向量信号的权重，范围从 0 到 1
    #[arg(long, value_name = "W", default_value_t = 0.7)]
    pub fusion_weight: f32,
    /// RRF 平滑常数
    #[arg(long, value_name = "K", default_value_t = 60.)]
    pub rrf_k: f32,
    /// 每路召回的候选数量为 top_k 的倍数
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub candidate_factor: usize,
    /// 融合在查询引擎内执行还是交给存储引擎
    #[arg(long, value_enum, default_value_t = FusionPlacement::Engine)]
    pub fusion_at: FusionPlacement,
}

impl FusionOptions {
    pub fn config(&self) -> Result<FusionConfig, ConfigError> {
        if !(0.0..=1.0).contains(&self.fusion_weight) {
            return Err(ConfigError::invalid("fusion-weight", "权重必须在 0 到 1 之间"));
        }
        if !(self.rrf_k > 0.) {
            return Err(ConfigError::invalid("rrf-k", "RRF 常数必须大于 0"));
        }
        Ok(FusionConfig {
            strategy: self.fusion,
            weight: self.fusion_weight,
            k_const: self.rrf_k,
            candidate_factor: self.candidate_factor.max(1),
            placement: self.fusion_at,
        })
    }
}

#[derive(Parser, Debug, Clone)]
pub struct IngestArgs {
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png")]
    pub suffix: String,
    /// 每批写入的记录数量
    #[arg(short, long, default_value_t = 32)]
    pub batch_size: usize,
    /// 同时处理的图片数量
    #[arg(short, long, default_value_t = 8)]
    pub workers: usize,
    /// 判断图片是否已导入的依据
    #[arg(long, value_enum, default_value_t = DedupKey::Path)]
    pub dedup: DedupKey,
}

impl IngestArgs {
    pub fn options(&self) -> Result<IngestOptions, ConfigError> {
        let suffix = format!("(?i)^({})$", self.suffix.replace(',', "|"));
        let suffix = Regex::new(&suffix).map_err(|e| ConfigError::invalid("suffix", e.to_string()))?;
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch-size", "批大小必须大于 0"));
        }
        Ok(IngestOptions {
            suffix,
            batch_size: self.batch_size,
            workers: self.workers.max(1),
            dedup: self.dedup,
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "imhybrid", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// imhybrid 配置文件目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 创建集合并检查特征服务是否可用
    Init(InitCommand),
    /// 导入图片到集合
    Add(AddCommand),
    /// 从集合中搜索图片
    Search(SearchCommand),
    /// 启动 HTTP 搜索服务
    Server(ServerCommand),
    /// 显示集合信息
    Stats(StatsCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回数据库文件的路径
    pub fn database(&self) -> PathBuf {
        self.path.join("imhybrid.db")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}
