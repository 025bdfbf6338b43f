use std::cmp::Ordering;

use hnsw_rs::prelude::*;
use rayon::prelude::*;

use crate::model::RankedHit;
use crate::schema::{IndexAlgorithm, Metric, VectorIndexConfig};

/// HNSW 最大层数
const MAX_LAYER: usize = 16;

pub struct MetricDist(pub Metric);

impl Distance<f32> for MetricDist {
    fn eval(&self, va: &[f32], vb: &[f32]) -> f32 {
        self.0.distance(va, vb)
    }
}

/// 进程内的向量索引，内部编号即插入顺序
pub enum VectorIndex {
    Flat {
        metric: Metric,
        dimension: usize,
        ids: Vec<String>,
        data: Vec<f32>,
    },
    Hnsw {
        index: Box<Hnsw<'static, f32, MetricDist>>,
        ids: Vec<String>,
        ef_search: usize,
    },
}

impl VectorIndex {
    pub fn new(config: &VectorIndexConfig, dimension: usize, capacity: usize) -> Self {
        match config.algorithm {
            IndexAlgorithm::Flat => Self::Flat {
                metric: config.metric,
                dimension,
                ids: Vec::with_capacity(capacity),
                data: Vec::with_capacity(capacity * dimension),
            },
            IndexAlgorithm::Hnsw => {
                let index = Hnsw::<f32, _>::new(
                    config.max_connections,
                    capacity.max(10_000),
                    MAX_LAYER,
                    config.ef_construction,
                    MetricDist(config.metric),
                );
                Self::Hnsw {
                    index: Box::new(index),
                    ids: Vec::with_capacity(capacity),
                    ef_search: config.ef_search,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Flat { ids, .. } | Self::Hnsw { ids, .. } => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 批量添加向量，调用方保证维度正确
    pub fn add(&mut self, items: Vec<(String, Vec<f32>)>) {
        match self {
            Self::Flat { ids, data, .. } => {
                for (id, vector) in items {
                    ids.push(id);
                    data.extend_from_slice(&vector);
                }
            }
            Self::Hnsw { index, ids, .. } => {
                let start = ids.len();
                let points: Vec<(&Vec<f32>, usize)> =
                    items.iter().enumerate().map(|(i, (_, v))| (v, start + i)).collect();
                index.parallel_insert(&points);
                ids.extend(items.into_iter().map(|(id, _)| id));
            }
        }
    }

    /// 返回距离升序的最近邻，距离相同时按 ID 排序
    pub fn search(&self, query: &[f32], top_k: usize, threshold: Option<f32>) -> Vec<RankedHit> {
        if top_k == 0 || self.is_empty() {
            return vec![];
        }
        let mut found: Vec<(f32, &str)> = match self {
            Self::Flat { metric, dimension, ids, data } => data
                .par_chunks(*dimension)
                .zip(ids.par_iter())
                .map(|(vector, id)| (metric.distance(query, vector), id.as_str()))
                .collect(),
            Self::Hnsw { index, ids, ef_search } => {
                // 搜索时按 ef 预分配候选堆，不能超过已有的数量
                let knbn = top_k.min(ids.len());
                index
                    .search(query, knbn, (*ef_search).max(knbn))
                    .into_iter()
                    .filter_map(|n| ids.get(n.d_id).map(|id| (n.distance, id.as_str())))
                    .collect()
            }
        };

        if let Some(threshold) = threshold {
            found.retain(|(d, _)| *d <= threshold);
        }
        found.sort_by(|a, b| {
            a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal).then_with(|| a.1.cmp(b.1))
        });
        found.truncate(top_k);

        found
            .into_iter()
            .enumerate()
            .map(|(i, (distance, id))| RankedHit::new(id, distance, i + 1))
            .collect()
    }
}
