use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// 图片记录，导入后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    /// 稳定的记录 ID，由文件路径或内容哈希派生
    pub id: String,
    pub file_name: String,
    pub file_path: String,
    /// 自动生成的图片描述，用于全文检索
    pub caption: String,
    pub embedding: Vec<f32>,
}

/// 不含向量的图片信息，用于展示搜索结果
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct StoredImage {
    pub id: String,
    pub file_name: String,
    pub file_path: String,
    pub caption: String,
}

/// 召回阶段的单条结果
///
/// 向量召回时 `score` 为距离（越小越相似），全文召回时为相关度（越大越相关）
#[derive(Debug, Clone, PartialEq)]
pub struct RankedHit {
    pub record_id: String,
    pub score: f32,
    /// 从 1 开始的排名
    pub rank: usize,
}

impl RankedHit {
    pub fn new(record_id: impl Into<String>, score: f32, rank: usize) -> Self {
        Self { record_id: record_id.into(), score, rank }
    }
}

/// 按给定顺序重新编号
pub fn rerank(hits: &mut [RankedHit]) {
    for (i, hit) in hits.iter_mut().enumerate() {
        hit.rank = i + 1;
    }
}

/// 召回信号来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Vector,
    Text,
}

/// 查询模式
#[derive(
    ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// 仅向量召回
    Vector,
    /// 仅全文召回
    Text,
    /// 向量与全文融合
    #[default]
    Hybrid,
}

/// 融合后的单条结果
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct FusedHit {
    pub record_id: String,
    /// 向量模式下为距离，其余为融合得分
    pub score: f32,
    pub rank: usize,
    /// 向量距离，未出现在向量结果中时为空
    pub distance: Option<f32>,
    /// 全文相关度，未出现在全文结果中时为空
    pub text_score: Option<f32>,
    pub signals: Vec<Signal>,
}

/// 一次查询的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct FusionResult {
    pub mode: QueryMode,
    pub hits: Vec<FusedHit>,
}

impl FusionResult {
    /// 单一召回路径的结果直接转换
    pub fn single(mode: QueryMode, signal: Signal, hits: Vec<RankedHit>) -> Self {
        let hits = hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| FusedHit {
                record_id: hit.record_id,
                score: hit.score,
                rank: i + 1,
                distance: (signal == Signal::Vector).then_some(hit.score),
                text_score: (signal == Signal::Text).then_some(hit.score),
                signals: vec![signal],
            })
            .collect();
        Self { mode, hits }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.hits.iter().map(|hit| hit.record_id.as_str()).collect()
    }
}

/// 查询请求
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub image: Option<Vec<u8>>,
    pub text: Option<String>,
    pub top_k: usize,
    pub mode: QueryMode,
    pub distance_threshold: Option<f32>,
    /// 向量信号的权重，仅加权融合时使用
    pub fusion_weight: Option<f32>,
}

impl QueryRequest {
    pub fn with_image(image: Vec<u8>, top_k: usize, mode: QueryMode) -> Self {
        Self { image: Some(image), top_k, mode, ..Default::default() }
    }

    pub fn with_text(text: impl Into<String>, top_k: usize) -> Self {
        Self { text: Some(text.into()), top_k, mode: QueryMode::Text, ..Default::default() }
    }

    /// 非空的查询文本
    pub fn query_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// 搜索结果，附带图片信息
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SearchResult {
    pub file_name: String,
    pub file_path: String,
    pub caption: String,
    pub score: f32,
    pub distance: Option<f32>,
    pub signals: Vec<Signal>,
}
