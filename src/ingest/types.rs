use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::ValueEnum;
use regex::Regex;
use serde::{Serialize, Serializer};
use utoipa::ToSchema;

use crate::error::Error;
use crate::metrics;

/// 待导入的图片来源
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// 递归扫描目录
    Directory(PathBuf),
    /// 归档文件，格式由扩展名决定
    Archive(PathBuf),
    /// 已经在内存中的图片
    Memory(Vec<ImageData>),
}

impl ImageSource {
    /// 文件视为归档，其余视为目录
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_file() { Self::Archive(path) } else { Self::Directory(path) }
    }
}

/// 支持的归档格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Zip,
}

impl ArchiveFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        let format = match name.rsplit_once('.')?.1 {
            "tar" => Self::Tar,
            "gz" | "tgz" => Self::TarGz,
            "bz2" | "tbz" | "tbz2" => Self::TarBz2,
            "xz" | "txz" => Self::TarXz,
            "zip" => Self::Zip,
            _ => return None,
        };
        Some(format)
    }
}

/// 扫描得到的单张图片
#[derive(Debug, Clone)]
pub struct ImageData {
    /// 记录中保存的路径
    pub path: String,
    pub file_name: String,
    /// 为空时在处理阶段从 `path` 读取
    pub data: Option<Vec<u8>>,
}

impl ImageData {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        let path = path.into();
        let file_name = file_name_of(&path);
        Self { path, file_name, data: Some(data) }
    }
}

/// 取路径的最后一段作为文件名
pub fn file_name_of(path: &str) -> String {
    path.rsplit(['/', '\\', '!']).find(|s| !s.is_empty()).unwrap_or(path).to_string()
}

/// 通过过滤阶段、带有记录 ID 的图片
pub struct KeyedImage {
    pub id: String,
    pub image: ImageData,
}

/// 记录 ID 的来源
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupKey {
    /// 文件路径
    #[default]
    Path,
    /// 文件内容的哈希
    Content,
}

impl DedupKey {
    /// 计算记录 ID，返回 blake3 哈希的前 32 位十六进制
    pub fn record_id(self, image: &ImageData) -> Option<String> {
        let hash = match self {
            Self::Path => blake3::hash(image.path.as_bytes()),
            Self::Content => blake3::hash(image.data.as_deref()?),
        };
        Some(hash.to_hex()[..32].to_string())
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// 文件后缀名匹配规则
    pub suffix: Regex,
    pub batch_size: usize,
    pub workers: usize,
    pub dedup: DedupKey,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            suffix: Regex::new("(?i)^(jpg|jpeg|png)$").expect("failed to build regex"),
            batch_size: 32,
            workers: 8,
            dedup: DedupKey::default(),
        }
    }
}

/// 图片被跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// 后缀名不在支持的范围内
    UnsupportedFormat,
    /// 文件读取失败
    Unreadable,
    /// 文件头无法识别或已损坏
    InvalidImage,
    /// 已经导入过
    AlreadyIngested,
    /// 特征服务调用失败
    ProviderFailed,
    /// 向量维度与集合不一致
    DimensionMismatch,
    /// 写入存储失败
    FlushFailed,
}

impl SkipReason {
    pub const ALL: [SkipReason; 7] = [
        Self::UnsupportedFormat,
        Self::Unreadable,
        Self::InvalidImage,
        Self::AlreadyIngested,
        Self::ProviderFailed,
        Self::DimensionMismatch,
        Self::FlushFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedFormat => "unsupported_format",
            Self::Unreadable => "unreadable",
            Self::InvalidImage => "invalid_image",
            Self::AlreadyIngested => "already_ingested",
            Self::ProviderFailed => "provider_failed",
            Self::DimensionMismatch => "dimension_mismatch",
            Self::FlushFailed => "flush_failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 各阶段共享的计数器
#[derive(Default)]
pub struct Tally {
    scanned: AtomicUsize,
    accepted: AtomicUsize,
    batches: AtomicUsize,
    skipped: [AtomicUsize; SkipReason::ALL.len()],
}

impl Tally {
    pub fn scanned(&self) {
        self.scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self, n: usize) {
        self.accepted.fetch_add(n, Ordering::Relaxed);
        metrics::inc_ingest_count("accepted", n);
    }

    pub fn batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skip(&self, reason: SkipReason, n: usize) {
        self.skipped[reason as usize].fetch_add(n, Ordering::Relaxed);
        metrics::inc_ingest_count(reason.as_str(), n);
    }

    pub fn report(&self, cancelled: bool, fatal: Option<Error>) -> IngestReport {
        let skipped = SkipReason::ALL
            .into_iter()
            .map(|reason| (reason, self.skipped[reason as usize].load(Ordering::Relaxed)))
            .filter(|(_, n)| *n > 0)
            .collect();
        IngestReport {
            scanned: self.scanned.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            skipped,
            batches: self.batches.load(Ordering::Relaxed),
            cancelled,
            fatal,
        }
    }
}

/// 一次导入的结果
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct IngestReport {
    /// 扫描到的文件数量（不含隐藏文件）
    pub scanned: usize,
    /// 成功写入的记录数量
    pub accepted: usize,
    /// 按原因统计的跳过数量
    #[schema(value_type = Object)]
    pub skipped: BTreeMap<SkipReason, usize>,
    /// 成功写入的批次数量
    pub batches: usize,
    pub cancelled: bool,
    /// 导致导入中止的错误
    #[serde(serialize_with = "serialize_fatal")]
    #[schema(value_type = Option<String>)]
    pub fatal: Option<Error>,
}

impl IngestReport {
    pub fn skipped(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }
}

fn serialize_fatal<S: Serializer>(fatal: &Option<Error>, s: S) -> Result<S::Ok, S::Error> {
    match fatal {
        Some(err) => s.serialize_some(&err.to_string()),
        None => s.serialize_none(),
    }
}
