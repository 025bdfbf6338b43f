use clap::ValueEnum;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ConfigError, Result};
use crate::store::StorageEngine;

/// 向量距离度量
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// 欧氏距离
    #[default]
    L2,
    /// 余弦距离，即 1 - cos
    Cosine,
}

impl Metric {
    pub fn distance(self, va: &[f32], vb: &[f32]) -> f32 {
        match self {
            Self::L2 => va.iter().zip(vb).map(|(a, b)| (a - b) * (a - b)).sum::<f32>().sqrt(),
            Self::Cosine => {
                let (mut dot, mut na, mut nb) = (0f32, 0f32, 0f32);
                for (a, b) in va.iter().zip(vb) {
                    dot += a * b;
                    na += a * a;
                    nb += b * b;
                }
                if na == 0. || nb == 0. {
                    return 1.;
                }
                (1. - dot / (na.sqrt() * nb.sqrt())).max(0.)
            }
        }
    }
}

/// 向量索引算法
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexAlgorithm {
    /// 精确暴力搜索
    Flat,
    /// HNSW 近似搜索
    #[default]
    Hnsw,
}

/// 全文索引分词器
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tokenizer {
    /// 按 unicode 单词切分
    #[default]
    Unicode61,
    /// 三元组切分，适合中日韩文本
    Trigram,
}

impl Tokenizer {
    pub fn as_fts5(self) -> &'static str {
        match self {
            Self::Unicode61 => "unicode61",
            Self::Trigram => "trigram",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexConfig {
    pub algorithm: IndexAlgorithm,
    pub metric: Metric,
    /// HNSW 每个节点的最大连接数
    pub max_connections: usize,
    /// HNSW 构建时的候选列表大小
    pub ef_construction: usize,
    /// HNSW 搜索时的候选列表大小
    pub ef_search: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            algorithm: IndexAlgorithm::default(),
            metric: Metric::default(),
            max_connections: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextIndexConfig {
    /// 建立全文索引的字段
    pub field: String,
    pub tokenizer: Tokenizer,
}

impl Default for TextIndexConfig {
    fn default() -> Self {
        Self { field: "caption".to_string(), tokenizer: Tokenizer::default() }
    }
}

/// 集合定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub dimension: usize,
    pub vector_index: VectorIndexConfig,
    pub text_index: TextIndexConfig,
}

impl CollectionSchema {
    /// 记录包含的字段
    pub const FIELDS: [&'static str; 5] = ["id", "file_name", "file_path", "caption", "embedding"];

    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
            vector_index: VectorIndexConfig::default(),
            text_index: TextIndexConfig::default(),
        }
    }

    /// 检查定义本身是否合法
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_name = !self.name.is_empty()
            && self.name.len() <= 64
            && self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !self.name.starts_with(|c: char| c.is_ascii_digit());
        if !valid_name {
            return Err(ConfigError::invalid(
                "collection",
                format!("集合名只能包含字母、数字和下划线，且不能以数字开头: {:?}", self.name),
            ));
        }
        if self.dimension == 0 {
            return Err(ConfigError::invalid("dimension", "向量维度必须大于 0"));
        }
        if self.text_index.field != "caption" {
            return Err(ConfigError::invalid(
                "text_index.field",
                format!("仅支持对 caption 建立全文索引，而不是 {}", self.text_index.field),
            ));
        }
        let vi = &self.vector_index;
        if vi.algorithm == IndexAlgorithm::Hnsw
            && (vi.max_connections == 0 || vi.ef_construction == 0 || vi.ef_search == 0)
        {
            return Err(ConfigError::invalid("vector_index", "HNSW 参数必须大于 0"));
        }
        Ok(())
    }

    /// 与已存在的集合定义对比，返回不兼容的字段
    pub fn check_compatible(&self, existing: &CollectionSchema) -> Result<(), ConfigError> {
        let mismatch = |field: &'static str, expected: String, actual: String| {
            ConfigError::SchemaMismatch { collection: self.name.clone(), field, expected, actual }
        };
        if self.dimension != existing.dimension {
            return Err(mismatch(
                "dimension",
                existing.dimension.to_string(),
                self.dimension.to_string(),
            ));
        }
        if self.vector_index.metric != existing.vector_index.metric {
            return Err(mismatch(
                "metric",
                format!("{:?}", existing.vector_index.metric),
                format!("{:?}", self.vector_index.metric),
            ));
        }
        if self.text_index != existing.text_index {
            return Err(mismatch(
                "text_index",
                format!("{:?}", existing.text_index),
                format!("{:?}", self.text_index),
            ));
        }
        Ok(())
    }
}

/// 确保集合及其索引存在
///
/// 同一进程内的调用会被串行化，成功一次后直接返回缓存的有效定义
pub struct SchemaManager {
    schema: CollectionSchema,
    ready: Mutex<Option<CollectionSchema>>,
}

impl SchemaManager {
    pub fn new(schema: CollectionSchema) -> Self {
        Self { schema, ready: Mutex::new(None) }
    }

    /// 期望的集合定义
    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    /// 确保集合已就绪，返回实际生效的集合定义
    ///
    /// 集合已存在时原样复用，不做任何迁移；维度或度量不一致时返回配置错误
    pub async fn ensure_ready<S: StorageEngine>(&self, store: &S) -> Result<CollectionSchema> {
        let mut ready = self.ready.lock().await;
        if let Some(schema) = ready.as_ref() {
            return Ok(schema.clone());
        }

        self.schema.validate()?;

        let effective = match store.describe_collection(&self.schema.name).await? {
            Some(existing) => {
                self.schema.check_compatible(&existing)?;
                if existing.vector_index != self.schema.vector_index {
                    warn!(
                        "集合 {} 的向量索引参数与配置不同，沿用已有参数: {:?}",
                        existing.name, existing.vector_index
                    );
                }
                info!("复用已存在的集合: {}", existing.name);
                existing
            }
            None => {
                info!("创建集合: {} (dim = {})", self.schema.name, self.schema.dimension);
                store.create_collection(&self.schema).await?;
                self.schema.clone()
            }
        };

        *ready = Some(effective.clone());
        Ok(effective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_l2() {
        let d = Metric::L2.distance(&[0., 0.], &[3., 4.]);
        assert!((d - 5.).abs() < 1e-6);
        assert_eq!(Metric::L2.distance(&[1., 2.], &[1., 2.]), 0.);
    }

    #[test]
    fn test_metric_cosine() {
        let d = Metric::Cosine.distance(&[1., 0.], &[2., 0.]);
        assert!(d.abs() < 1e-6);
        let d = Metric::Cosine.distance(&[1., 0.], &[0., 1.]);
        assert!((d - 1.).abs() < 1e-6);
        // 零向量视为完全不相似
        assert_eq!(Metric::Cosine.distance(&[0., 0.], &[0., 1.]), 1.);
    }

    #[test]
    fn test_schema_validate_name() {
        assert!(CollectionSchema::new("image_search", 8).validate().is_ok());
        assert!(CollectionSchema::new("image-search", 8).validate().is_err());
        assert!(CollectionSchema::new("1images", 8).validate().is_err());
        assert!(CollectionSchema::new("x; DROP TABLE y", 8).validate().is_err());
        assert!(CollectionSchema::new("", 8).validate().is_err());
    }

    #[test]
    fn test_schema_validate_dimension() {
        assert!(matches!(
            CollectionSchema::new("images", 0).validate(),
            Err(ConfigError::Invalid { option: "dimension", .. })
        ));
    }

    #[test]
    fn test_schema_compatible() {
        let a = CollectionSchema::new("images", 8);
        let mut b = a.clone();
        b.vector_index.algorithm = IndexAlgorithm::Flat;
        // 索引算法不同不影响兼容性
        assert!(a.check_compatible(&b).is_ok());

        b.dimension = 16;
        assert!(matches!(
            a.check_compatible(&b),
            Err(ConfigError::SchemaMismatch { field: "dimension", .. })
        ));

        let mut c = a.clone();
        c.vector_index.metric = Metric::Cosine;
        assert!(matches!(
            a.check_compatible(&c),
            Err(ConfigError::SchemaMismatch { field: "metric", .. })
        ));
    }
}
