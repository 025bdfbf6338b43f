//! 向量召回与全文召回的结果融合

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::model::{FusedHit, RankedHit, Signal, rerank};

/// RRF 的默认平滑常数
pub const RRF_K: f32 = 60.;

/// 融合策略
#[derive(
    ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum FusionStrategy {
    /// 归一化后按权重加权求和
    #[default]
    Weighted,
    /// 倒数排名融合
    Rrf,
}

/// 融合在哪里执行
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionPlacement {
    /// 查询引擎内部
    #[default]
    Engine,
    /// 交给存储引擎的 hybrid_search
    Storage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    pub strategy: FusionStrategy,
    /// 向量信号的默认权重
    pub weight: f32,
    pub k_const: f32,
    /// 混合召回时每路候选数量为 top_k 的倍数
    pub candidate_factor: usize,
    pub placement: FusionPlacement,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::default(),
            weight: 0.7,
            k_const: RRF_K,
            candidate_factor: 5,
            placement: FusionPlacement::default(),
        }
    }
}

impl FusionConfig {
    /// 每路召回的候选数量，不小于 top_k
    pub fn candidate_pool(&self, top_k: usize) -> usize {
        top_k.saturating_mul(self.candidate_factor).max(top_k)
    }

    /// 按配置的策略融合，`weight` 仅对加权融合有效
    pub fn fuse(
        &self,
        vector: &[RankedHit],
        text: &[RankedHit],
        weight: f32,
        top_k: usize,
    ) -> Vec<FusedHit> {
        match self.strategy {
            FusionStrategy::Weighted => weighted(vector, text, weight, top_k),
            FusionStrategy::Rrf => rrf(vector, text, self.k_const, top_k),
        }
    }
}

/// 设置了距离阈值时，全文结果只保留同时出现在向量结果中的记录
///
/// `vector` 必须已经按阈值过滤，不在其中的记录距离未知或超出阈值
pub fn restrict_to_threshold(
    vector: &[RankedHit],
    mut text: Vec<RankedHit>,
    threshold: Option<f32>,
) -> Vec<RankedHit> {
    if threshold.is_none() {
        return text;
    }
    let allowed = vector.iter().map(|hit| hit.record_id.as_str()).collect::<HashSet<_>>();
    text.retain(|hit| allowed.contains(hit.record_id.as_str()));
    rerank(&mut text);
    text
}

/// 同一条记录在两路结果中的信息
#[derive(Default)]
struct Candidate<'a> {
    id: &'a str,
    vector_rank: Option<usize>,
    text_rank: Option<usize>,
    distance: Option<f32>,
    text_score: Option<f32>,
    score: f32,
    signals: Vec<Signal>,
}

impl Candidate<'_> {
    fn into_hit(self) -> FusedHit {
        FusedHit {
            record_id: self.id.to_string(),
            score: self.score,
            rank: 0,
            distance: self.distance,
            text_score: self.text_score,
            signals: self.signals,
        }
    }
}

fn collect<'a>(vector: &'a [RankedHit], text: &'a [RankedHit]) -> HashMap<&'a str, Candidate<'a>> {
    let mut map: HashMap<&str, Candidate> = HashMap::new();
    for hit in vector {
        let c = map.entry(hit.record_id.as_str()).or_insert_with(|| Candidate {
            id: &hit.record_id,
            ..Default::default()
        });
        // 同一路中的重复记录只取排名最靠前的一次
        if c.vector_rank.is_none() {
            c.vector_rank = Some(hit.rank);
            c.distance = Some(hit.score);
        }
    }
    for hit in text {
        let c = map.entry(hit.record_id.as_str()).or_insert_with(|| Candidate {
            id: &hit.record_id,
            ..Default::default()
        });
        if c.text_rank.is_none() {
            c.text_rank = Some(hit.rank);
            c.text_score = Some(hit.score);
        }
    }
    map
}

fn finish(mut hits: Vec<FusedHit>, top_k: usize) -> Vec<FusedHit> {
    hits.truncate(top_k);
    for (i, hit) in hits.iter_mut().enumerate() {
        hit.rank = i + 1;
    }
    hits
}

/// 将一组值线性映射到 [0, 1]，`invert` 时越小越接近 1，所有值相等时均为 1
fn min_max(values: impl Iterator<Item = f32>, invert: bool) -> impl Fn(f32) -> f32 {
    let (min, max) =
        values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let range = max - min;
    move |v| {
        if range > 0. {
            let x = (v - min) / range;
            if invert { 1. - x } else { x }
        } else {
            1.
        }
    }
}

/// 加权融合
///
/// 两路结果分别在各自的候选集上做 min-max 归一化（距离越小得分越高），
/// 然后按 `weight * v + (1 - weight) * t` 合并，缺失的一侧记 0。
/// 权重为 0 的一路不提供候选，因此 `weight = 1` 与纯向量排序一致，`weight = 0` 与纯全文排序一致。
///
/// 得分相同时依次比较：权重较大一路中的排名、另一路中的排名、记录 ID。
pub fn weighted(
    vector: &[RankedHit],
    text: &[RankedHit],
    weight: f32,
    top_k: usize,
) -> Vec<FusedHit> {
    let weight = weight.clamp(0., 1.);
    let use_vector = weight > 0.;
    let use_text = weight < 1.;

    let norm_v = min_max(vector.iter().map(|h| h.score), true);
    let norm_t = min_max(text.iter().map(|h| h.score), false);

    let mut candidates: Vec<Candidate> = collect(vector, text)
        .into_values()
        .filter(|c| (use_vector && c.vector_rank.is_some()) || (use_text && c.text_rank.is_some()))
        .map(|mut c| {
            let v = c.distance.filter(|_| use_vector).map(&norm_v);
            let t = c.text_score.filter(|_| use_text).map(&norm_t);
            if v.is_some() {
                c.signals.push(Signal::Vector);
            }
            if t.is_some() {
                c.signals.push(Signal::Text);
            }
            c.score = weight * v.unwrap_or(0.) + (1. - weight) * t.unwrap_or(0.);
            c
        })
        .collect();

    let vector_heavier = weight >= 0.5;
    candidates.sort_by(|a, b| {
        let (a1, a2, b1, b2) = if vector_heavier {
            (a.vector_rank, a.text_rank, b.vector_rank, b.text_rank)
        } else {
            (a.text_rank, a.vector_rank, b.text_rank, b.vector_rank)
        };
        let rank = |r: Option<usize>| r.unwrap_or(usize::MAX);
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| rank(a1).cmp(&rank(b1)))
            .then_with(|| rank(a2).cmp(&rank(b2)))
            .then_with(|| a.id.cmp(b.id))
    });

    finish(candidates.into_iter().map(Candidate::into_hit).collect(), top_k)
}

/// 倒数排名融合：`Σ 1 / (k + rank)`
///
/// 得分相同时距离较小的在前（没有距离视为无穷大），再比较记录 ID。
pub fn rrf(vector: &[RankedHit], text: &[RankedHit], k: f32, top_k: usize) -> Vec<FusedHit> {
    let mut candidates: Vec<Candidate> = collect(vector, text)
        .into_values()
        .map(|mut c| {
            c.score = 0.;
            if let Some(rank) = c.vector_rank {
                c.score += 1. / (k + rank as f32);
                c.signals.push(Signal::Vector);
            }
            if let Some(rank) = c.text_rank {
                c.score += 1. / (k + rank as f32);
                c.signals.push(Signal::Text);
            }
            c
        })
        .collect();

    candidates.sort_by(|a, b| {
        let dist = |d: Option<f32>| d.unwrap_or(f32::INFINITY);
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                dist(a.distance).partial_cmp(&dist(b.distance)).unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.id.cmp(b.id))
    });

    finish(candidates.into_iter().map(Candidate::into_hit).collect(), top_k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(items: &[(&str, f32)]) -> Vec<RankedHit> {
        items.iter().enumerate().map(|(i, (id, s))| RankedHit::new(*id, *s, i + 1)).collect()
    }

    fn ids(hits: &[FusedHit]) -> Vec<&str> {
        hits.iter().map(|h| h.record_id.as_str()).collect()
    }

    #[test]
    fn test_weighted_extremes() {
        let vector = hits(&[("a", 0.1), ("b", 0.2), ("c", 0.2), ("d", 0.9)]);
        let text = hits(&[("d", 9.), ("e", 5.), ("a", 1.)]);

        let fused = weighted(&vector, &text, 1., 10);
        assert_eq!(ids(&fused), ["a", "b", "c", "d"]);
        assert!(fused.iter().all(|h| h.signals == [Signal::Vector]));

        let fused = weighted(&vector, &text, 0., 10);
        assert_eq!(ids(&fused), ["d", "e", "a"]);
        assert!(fused.iter().all(|h| h.signals == [Signal::Text]));
    }

    #[test]
    fn test_weighted_combines() {
        let vector = hits(&[("a", 0.), ("b", 1.)]);
        let text = hits(&[("b", 10.), ("c", 0.)]);
        let fused = weighted(&vector, &text, 0.5, 10);
        // a: 0.5 * 1 + 0 = 0.5, b: 0.5 * 0 + 0.5 * 1 = 0.5, c: 0
        // a 与 b 同分，按向量排名 a 在前
        assert_eq!(ids(&fused), ["a", "b", "c"]);
        assert_eq!(fused[1].signals, [Signal::Vector, Signal::Text]);
        assert_eq!(fused[1].distance, Some(1.));
        assert_eq!(fused[1].text_score, Some(10.));
        assert_eq!(fused[2].score, 0.);
    }

    #[test]
    fn test_weighted_single_value_lists() {
        // 只有一个值时归一化结果为 1
        let fused = weighted(&hits(&[("a", 3.)]), &hits(&[("b", 2.)]), 0.7, 10);
        assert_eq!(ids(&fused), ["a", "b"]);
        assert!((fused[0].score - 0.7).abs() < 1e-6);
        assert!((fused[1].score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_rrf_scores() {
        let vector = hits(&[("a", 0.1), ("b", 0.2), ("c", 0.3)]);
        let text = hits(&[("c", 3.), ("a", 2.), ("d", 1.)]);
        let fused = rrf(&vector, &text, 60., 10);

        assert_eq!(ids(&fused), ["a", "c", "b", "d"]);
        assert!((fused[0].score - (1. / 61. + 1. / 62.)).abs() < 1e-6);
        assert!(fused.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_rrf_tie_by_distance_then_id() {
        let vector = hits(&[("b", 0.5)]);
        let text = hits(&[("a", 1.)]);
        // 两者 RRF 分数相同，有距离的 b 在前
        assert_eq!(ids(&rrf(&vector, &text, 60., 10)), ["b", "a"]);
        // 两者都没有距离时按 ID
        assert_eq!(ids(&rrf(&[], &hits(&[("z", 1.)]), 60., 10)), ["z"]);
    }

    #[test]
    fn test_truncate_and_dedup() {
        let vector = hits(&[("a", 0.1), ("a", 0.2), ("b", 0.3)]);
        let text = hits(&[("b", 1.), ("c", 0.5)]);
        for fused in [rrf(&vector, &text, 60., 2), weighted(&vector, &text, 0.5, 2)] {
            assert_eq!(fused.len(), 2);
            assert_ne!(fused[0].record_id, fused[1].record_id);
            assert_eq!(fused.iter().map(|h| h.rank).collect::<Vec<_>>(), [1, 2]);
        }
    }

    #[test]
    fn test_restrict_to_threshold() {
        let vector = hits(&[("a", 0.1), ("b", 0.2)]);
        let text = hits(&[("d", 3.), ("b", 2.), ("e", 1.)]);

        let kept = restrict_to_threshold(&vector, text.clone(), Some(0.2));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].record_id, "b");
        assert_eq!(kept[0].rank, 1);

        assert_eq!(restrict_to_threshold(&vector, text.clone(), None), text);
        assert!(restrict_to_threshold(&[], text, Some(1.)).is_empty());

        // 融合结果里不再出现超出阈值的记录
        let text = restrict_to_threshold(&vector, hits(&[("d", 3.), ("b", 2.)]), Some(0.2));
        for fused in [rrf(&vector, &text, 60., 10), weighted(&vector, &text, 0.5, 10)] {
            assert_eq!(fused.len(), 2);
            assert!(fused.iter().all(|h| h.record_id != "d" && h.distance.is_some()));
        }
    }

    #[test]
    fn test_candidate_pool() {
        let config = FusionConfig::default();
        assert_eq!(config.candidate_pool(10), 50);
        let config = FusionConfig { candidate_factor: 0, ..Default::default() };
        assert_eq!(config.candidate_pool(10), 10);
    }
}
