//! 存储引擎

use std::collections::HashSet;
use std::future::Future;

mod crud;
mod sqlite;
mod vector;

pub use sqlite::SqliteStore;
pub use vector::VectorIndex;

use crate::error::StorageError;
use crate::fusion::FusionConfig;
use crate::model::{FusionResult, ImageRecord, RankedHit, StoredImage};
use crate::schema::CollectionSchema;

/// 交给存储引擎执行的混合查询
#[derive(Debug, Clone)]
pub struct HybridQuery<'a> {
    pub vector: &'a [f32],
    pub text: &'a str,
    pub top_k: usize,
    pub distance_threshold: Option<f32>,
    /// 向量信号的权重
    pub weight: f32,
    pub fusion: &'a FusionConfig,
}

/// 存储引擎需要提供的能力
///
/// 一个实例只服务于一个集合，集合名在打开时确定
pub trait StorageEngine: Send + Sync {
    /// 在一个事务内创建集合及其向量索引、全文索引，集合已存在时不做任何事
    fn create_collection(
        &self,
        schema: &CollectionSchema,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// 读取已存在的集合定义
    fn describe_collection(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<CollectionSchema>, StorageError>> + Send;

    /// 批量写入，已存在的 ID 会被忽略，返回实际新增的数量
    fn insert_batch(
        &self,
        records: &[ImageRecord],
    ) -> impl Future<Output = Result<usize, StorageError>> + Send;

    /// 返回给定 ID 中已经存在的部分
    fn contains(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<HashSet<String>, StorageError>> + Send;

    /// 按距离升序返回最多 `top_k` 条结果，距离相同时按 ID 排序
    fn vector_search(
        &self,
        vector: &[f32],
        top_k: usize,
        distance_threshold: Option<f32>,
    ) -> impl Future<Output = Result<Vec<RankedHit>, StorageError>> + Send;

    /// 按相关度降序返回最多 `top_k` 条结果，相关度相同时按 ID 排序
    fn text_search(
        &self,
        text: &str,
        top_k: usize,
    ) -> impl Future<Output = Result<Vec<RankedHit>, StorageError>> + Send;

    /// 由存储引擎完成召回与融合
    fn hybrid_search(
        &self,
        query: HybridQuery<'_>,
    ) -> impl Future<Output = Result<FusionResult, StorageError>> + Send {
        let _ = query;
        async { Err(StorageError::Unsupported("hybrid_search")) }
    }

    /// 按 ID 读取记录，不存在的 ID 会被忽略
    fn fetch_records(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<Vec<StoredImage>, StorageError>> + Send;

    fn count(&self) -> impl Future<Output = Result<usize, StorageError>> + Send;
}
