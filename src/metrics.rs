use std::sync::LazyLock;

use prometheus::*;

use crate::model::QueryMode;

static METRIC_INGEST_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "imhybrid_ingest_count",
        "count of ingested images by outcome",
        &["outcome"]
    )
    .unwrap()
});

static METRIC_FLUSH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!("imhybrid_flush_duration", "duration of the per-batch flush in seconds")
        .unwrap()
});

static METRIC_PROVIDER_RETRY: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "imhybrid_provider_retry",
        "count of retried provider and storage calls",
        &["op"]
    )
    .unwrap()
});

static METRIC_QUERY_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("imhybrid_query_count", "count of queries", &["mode", "status"])
        .unwrap()
});

static METRIC_QUERY_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "imhybrid_query_duration",
        "duration of the per-query search in seconds",
        &["mode"]
    )
    .unwrap()
});

/// 按结果统计导入的图片，outcome 为 accepted 或跳过原因
pub fn inc_ingest_count(outcome: &str, n: usize) {
    METRIC_INGEST_COUNT.with_label_values(&[outcome]).inc_by(n as u64);
}

pub fn observe_flush_duration(duration: f32) {
    METRIC_FLUSH_DURATION.observe(duration as f64);
}

pub fn inc_retry(op: &str) {
    METRIC_PROVIDER_RETRY.with_label_values(&[op]).inc();
}

pub fn inc_query_count(mode: QueryMode, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    METRIC_QUERY_COUNT.with_label_values(&[mode_label(mode), status]).inc();
}

pub fn observe_query_duration(mode: QueryMode, duration: f32) {
    METRIC_QUERY_DURATION.with_label_values(&[mode_label(mode)]).observe(duration as f64);
}

/// 以文本格式导出当前进程的所有指标
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&gather()).unwrap_or_default()
}

fn mode_label(mode: QueryMode) -> &'static str {
    match mode {
        QueryMode::Vector => "vector",
        QueryMode::Text => "text",
        QueryMode::Hybrid => "hybrid",
    }
}
