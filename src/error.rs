use std::time::Duration;

use thiserror::Error;

/// 配置错误，启动阶段即失败，不做重试
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("缺少配置 {option}: {reason}")]
    Missing { option: &'static str, reason: String },
    #[error("无效配置 {option}: {reason}")]
    Invalid { option: &'static str, reason: String },
    #[error("集合 {collection} 的 {field} 与已有定义不一致: 期望 {expected}, 实际 {actual}")]
    SchemaMismatch { collection: String, field: &'static str, expected: String, actual: String },
}

impl ConfigError {
    pub fn missing(option: &'static str, reason: impl Into<String>) -> Self {
        Self::Missing { option, reason: reason.into() }
    }

    pub fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { option, reason: reason.into() }
    }
}

/// 单条输入记录不合法，只影响该记录
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("不支持的文件格式: {path}")]
    UnsupportedFormat { path: String },
    #[error("图片已损坏或无法识别: {path}")]
    CorruptImage { path: String },
    #[error("向量维度不一致: 期望 {expected}, 实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// 特征服务（向量、描述）调用失败
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("请求超时")]
    Timeout,
    #[error("触发限流")]
    RateLimited { retry_after: Option<Duration> },
    #[error("服务暂不可用: {0}")]
    Unavailable(String),
    #[error("鉴权失败: {0}")]
    Auth(String),
    #[error("配额已耗尽: {0}")]
    QuotaExhausted(String),
    #[error("图片无法处理: {0}")]
    InvalidImage(String),
    #[error("无法解析的响应: {0}")]
    InvalidResponse(String),
    #[error("操作已取消")]
    Cancelled,
}

impl ProviderError {
    /// 是否为可重试的临时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited { .. } | Self::Unavailable(_))
    }

    /// 是否应当中止整个导入流程
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// 存储引擎错误
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("存储不可用: {0}")]
    Unavailable(String),
    #[error("存储操作超时")]
    Timeout,
    #[error("存储拒绝了请求: {0}")]
    Rejected(String),
    #[error("存储引擎不支持 {0}")]
    Unsupported(&'static str),
    #[error("存储操作已取消")]
    Cancelled,
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            _ => Self::Rejected(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Rejected(err.to_string())
    }
}

/// 查询错误，作用域为单次请求，引擎自身不做重试
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("无效请求: {0}")]
    InvalidRequest(String),
    #[error("特征服务不可用: {0}")]
    ProviderUnavailable(#[source] ProviderError),
    #[error("存储不可用: {0}")]
    StorageUnavailable(#[source] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("查询已取消")]
    Cancelled,
}

impl From<ProviderError> for QueryError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => Self::Cancelled,
            err => Self::ProviderUnavailable(err),
        }
    }
}

impl From<StorageError> for QueryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => Self::Cancelled,
            err => Self::StorageUnavailable(err),
        }
    }
}

impl From<Error> for QueryError {
    fn from(err: Error) -> Self {
        match err {
            Error::Config(e) => Self::Config(e),
            Error::Provider(e) => e.into(),
            Error::Storage(e) => e.into(),
            Error::Validation(e) => Self::InvalidRequest(e.to_string()),
        }
    }
}

/// 汇总错误类型，附带错误种类
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    #[error("校验错误: {0}")]
    Validation(#[from] ValidationError),
    #[error("特征服务错误: {0}")]
    Provider(#[from] ProviderError),
    #[error("存储错误: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
