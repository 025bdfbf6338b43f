//! 查询引擎：向量、全文与混合查询

use std::collections::HashMap;
use std::time::Instant;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{ProviderError, QueryError};
use crate::fusion::{FusionConfig, FusionPlacement, restrict_to_threshold};
use crate::metrics;
use crate::model::*;
use crate::provider::{CaptionProvider, EmbeddingProvider};
use crate::store::{HybridQuery, StorageEngine};

pub struct QueryEngine<S, E, C> {
    ctx: Context<S, E, C>,
    fusion: FusionConfig,
}

impl<S, E, C> QueryEngine<S, E, C>
where
    S: StorageEngine,
    E: EmbeddingProvider,
    C: CaptionProvider,
{
    pub fn new(ctx: Context<S, E, C>, fusion: FusionConfig) -> Self {
        Self { ctx, fusion }
    }

    pub fn context(&self) -> &Context<S, E, C> {
        &self.ctx
    }

    pub fn fusion(&self) -> &FusionConfig {
        &self.fusion
    }

    /// 执行一次查询
    pub async fn query(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<FusionResult, QueryError> {
        let now = Instant::now();
        let result = self.run(request, cancel).await;
        let elapsed = now.elapsed().as_secs_f32();
        metrics::inc_query_count(request.mode, result.is_ok());
        metrics::observe_query_duration(request.mode, elapsed);
        match &result {
            Ok(result) => {
                debug!("{:?} 查询完成: {} 条结果, {:.3}s", request.mode, result.hits.len(), elapsed)
            }
            Err(err) => debug!("{:?} 查询失败: {}, {:.3}s", request.mode, err, elapsed),
        }
        result
    }

    /// 执行查询并补全图片信息
    pub async fn search(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, QueryError> {
        let result = self.query(request, cancel).await?;
        let ids = result.hits.iter().map(|hit| hit.record_id.clone()).collect::<Vec<_>>();
        let records =
            self.ctx.retry.storage_once(cancel, self.ctx.store.fetch_records(&ids)).await?;
        let records = records.iter().map(|r| (r.id.as_str(), r)).collect::<HashMap<_, _>>();

        Ok(result
            .hits
            .into_iter()
            .filter_map(|hit| {
                let record = records.get(hit.record_id.as_str())?;
                Some(SearchResult {
                    file_name: record.file_name.clone(),
                    file_path: record.file_path.clone(),
                    caption: record.caption.clone(),
                    score: hit.score,
                    distance: hit.distance,
                    signals: hit.signals,
                })
            })
            .collect())
    }

    async fn run(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<FusionResult, QueryError> {
        validate(request)?;
        let dimension = self.ctx.ensure_ready().await?.dimension;
        let top_k = request.top_k;

        match request.mode {
            QueryMode::Vector => {
                let image = request
                    .image
                    .as_deref()
                    .ok_or_else(|| QueryError::InvalidRequest("向量查询需要提供图片".to_string()))?;
                let vector = self.embed(image, dimension, cancel).await?;
                let hits =
                    self.vector_recall(&vector, top_k, request.distance_threshold, cancel).await?;
                Ok(FusionResult::single(QueryMode::Vector, Signal::Vector, hits))
            }
            QueryMode::Text => {
                let text = match (request.query_text(), request.image.as_deref()) {
                    (Some(text), _) => text.to_string(),
                    (None, Some(image)) => match &self.ctx.captioner {
                        Some(_) => self.caption(image, cancel).await?,
                        None => {
                            return Err(QueryError::InvalidRequest(
                                "未配置图片描述服务，请提供查询文本".to_string(),
                            ));
                        }
                    },
                    (None, None) => {
                        return Err(QueryError::InvalidRequest(
                            "文本查询需要提供文本或图片".to_string(),
                        ));
                    }
                };
                let hits = self.text_recall(&text, top_k, cancel).await?;
                Ok(FusionResult::single(QueryMode::Text, Signal::Text, hits))
            }
            QueryMode::Hybrid => {
                let image = request
                    .image
                    .as_deref()
                    .ok_or_else(|| QueryError::InvalidRequest("混合查询需要提供图片".to_string()))?;
                let text = async {
                    match (request.query_text(), &self.ctx.captioner) {
                        (Some(text), _) => Ok(text.to_string()),
                        (None, Some(_)) => self.caption(image, cancel).await,
                        (None, None) => Err(QueryError::InvalidRequest(
                            "未配置图片描述服务，混合查询需要提供查询文本".to_string(),
                        )),
                    }
                };
                let (vector, text) = tokio::try_join!(self.embed(image, dimension, cancel), text)?;
                self.hybrid(request, &vector, &text, cancel).await
            }
        }
    }

    async fn hybrid(
        &self,
        request: &QueryRequest,
        vector: &[f32],
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<FusionResult, QueryError> {
        let weight = request.fusion_weight.unwrap_or(self.fusion.weight);
        let top_k = request.top_k;

        if self.fusion.placement == FusionPlacement::Storage {
            let query = HybridQuery {
                vector,
                text,
                top_k,
                distance_threshold: request.distance_threshold,
                weight,
                fusion: &self.fusion,
            };
            let result =
                self.ctx.retry.storage_once(cancel, self.ctx.store.hybrid_search(query)).await?;
            return Ok(result);
        }

        let pool = self.fusion.candidate_pool(top_k);
        let (vector_hits, text_hits) = tokio::try_join!(
            self.vector_recall(vector, pool, request.distance_threshold, cancel),
            self.text_recall(text, pool, cancel),
        )?;
        let text_hits = restrict_to_threshold(&vector_hits, text_hits, request.distance_threshold);
        let hits = self.fusion.fuse(&vector_hits, &text_hits, weight, top_k);
        Ok(FusionResult { mode: QueryMode::Hybrid, hits })
    }

    async fn embed(
        &self,
        image: &[u8],
        dimension: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, QueryError> {
        let embedder = self.ctx.embedder.as_ref();
        let vector = self.ctx.retry.provider(cancel, "embed", move || embedder.embed(image)).await?;
        if vector.len() != dimension {
            return Err(ProviderError::InvalidResponse(format!(
                "向量维度不一致: 期望 {}, 实际 {}",
                dimension,
                vector.len()
            ))
            .into());
        }
        Ok(vector)
    }

    async fn caption(
        &self,
        image: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, QueryError> {
        let Some(captioner) = self.ctx.captioner.as_deref() else {
            return Ok(String::new());
        };
        let caption =
            self.ctx.retry.provider(cancel, "caption", move || captioner.caption(image)).await?;
        debug!("查询图片描述: {}", caption);
        Ok(caption)
    }

    async fn vector_recall(
        &self,
        vector: &[f32],
        top_k: usize,
        threshold: Option<f32>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RankedHit>, QueryError> {
        let hits = self
            .ctx
            .retry
            .storage_once(cancel, self.ctx.store.vector_search(vector, top_k, threshold))
            .await?;
        Ok(apply_threshold(hits, threshold, top_k))
    }

    async fn text_recall(
        &self,
        text: &str,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RankedHit>, QueryError> {
        if text.trim().is_empty() {
            return Ok(vec![]);
        }
        let mut hits =
            self.ctx.retry.storage_once(cancel, self.ctx.store.text_search(text, top_k)).await?;
        hits.truncate(top_k);
        rerank(&mut hits);
        Ok(hits)
    }
}

/// 单次查询最多返回的结果数
pub const MAX_TOP_K: usize = 10_000;

fn validate(request: &QueryRequest) -> Result<(), QueryError> {
    if request.top_k == 0 {
        return Err(QueryError::InvalidRequest("top_k 必须大于 0".to_string()));
    }
    if request.top_k > MAX_TOP_K {
        return Err(QueryError::InvalidRequest(format!(
            "top_k 不能超过 {}: {}",
            MAX_TOP_K, request.top_k
        )));
    }
    if let Some(w) = request.fusion_weight {
        if !(0. ..=1.).contains(&w) {
            return Err(QueryError::InvalidRequest(format!("fusion_weight 必须在 [0, 1] 内: {}", w)));
        }
    }
    if let Some(t) = request.distance_threshold {
        if t.is_nan() || t < 0. {
            return Err(QueryError::InvalidRequest(format!("distance_threshold 不能为负数: {}", t)));
        }
    }
    Ok(())
}

/// 丢弃距离超过阈值的结果并重新编号
fn apply_threshold(
    mut hits: Vec<RankedHit>,
    threshold: Option<f32>,
    top_k: usize,
) -> Vec<RankedHit> {
    if let Some(threshold) = threshold {
        hits.retain(|hit| hit.score <= threshold);
    }
    hits.truncate(top_k);
    rerank(&mut hits);
    hits
}
