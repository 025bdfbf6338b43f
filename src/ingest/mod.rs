//! 图片导入流程：扫描 → 去重 → 提取特征 → 批量写入

use std::sync::{Arc, OnceLock};

use indicatif::ProgressBar;
use log::{error, info};
use tokio_util::sync::CancellationToken;

mod tasks;
mod types;

use tasks::*;
pub use types::*;

use crate::context::Context;
use crate::provider::{CaptionProvider, EmbeddingProvider};
use crate::store::StorageEngine;

/// 将 `source` 中的图片导入集合
///
/// 单张图片的失败只会被计入跳过原因，鉴权失败与存储不可用会中止整个流程并记录在
/// [`IngestReport::fatal`] 中。取消后已写入的批次保持有效，尚未写入的记录会被丢弃，
/// 下次导入时重新处理。
pub async fn ingest<S, E, C>(
    source: ImageSource,
    ctx: &Context<S, E, C>,
    options: &IngestOptions,
    cancel: &CancellationToken,
    pb: ProgressBar,
) -> IngestReport
where
    S: StorageEngine + 'static,
    E: EmbeddingProvider + 'static,
    C: CaptionProvider + 'static,
{
    let schema = match ctx.ensure_ready().await {
        Ok(schema) => schema,
        Err(err) => {
            error!("集合初始化失败: {}", err);
            return Tally::default().report(cancel.is_cancelled(), Some(err));
        }
    };

    let pipeline = Arc::new(Pipeline {
        ctx: ctx.clone(),
        options: options.clone(),
        dimension: schema.dimension,
        tally: Tally::default(),
        pb,
        cancel: cancel.child_token(),
        fatal: OnceLock::new(),
    });

    let (t1, rx) = task_scan(source, pipeline.clone());
    let (t2, rx) = task_filter(rx, pipeline.clone());
    let (t3, rx) = task_derive(rx, pipeline.clone());
    let t4 = task_flush(rx, pipeline.clone());

    // 等待所有任务完成
    if let Err(err) = tokio::try_join!(t1, t2, t3, t4) {
        error!("导入任务异常退出: {}", err);
        pipeline.cancel.cancel();
    }

    let report = pipeline.tally.report(cancel.is_cancelled(), pipeline.fatal.get().cloned());
    info!(
        "导入完成：扫描 {} 张，写入 {} 张，跳过 {} 张，共 {} 批",
        report.scanned,
        report.accepted,
        report.total_skipped(),
        report.batches
    );
    report
}
