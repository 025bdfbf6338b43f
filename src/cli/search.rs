use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use crate::cli::{SubCommandExtend, cancel_on_ctrl_c};
use crate::config::{CollectionOptions, FusionOptions, Opts, ProviderOptions};
use crate::context::AppContext;
use crate::model::{QueryMode, QueryRequest, SearchResult};
use crate::query::QueryEngine;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub provider: ProviderOptions,
    #[command(flatten)]
    pub collection: CollectionOptions,
    #[command(flatten)]
    pub fusion: FusionOptions,
    /// 被搜索的图片路径
    pub image: Option<PathBuf>,
    /// 查询文本
    #[arg(short, long)]
    pub text: Option<String>,
    /// 查询模式
    #[arg(short, long, value_enum, default_value_t = QueryMode::Hybrid)]
    pub mode: QueryMode,
    /// 返回的结果数量
    #[arg(short = 'k', long, default_value_t = 10)]
    pub top_k: usize,
    /// 向量距离阈值，超过该值的结果会被丢弃
    #[arg(long, value_name = "DISTANCE")]
    pub distance_threshold: Option<f32>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", value_enum, default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let fusion = self.fusion.config()?;
        let image = match &self.image {
            Some(path) => Some(tokio::fs::read(path).await?),
            None => None,
        };

        let ctx = AppContext::open(&opts.conf_dir, &self.provider, &self.collection).await?;
        let engine = QueryEngine::new(ctx, fusion);
        let request = QueryRequest {
            image,
            text: self.text.clone(),
            top_k: self.top_k,
            mode: self.mode,
            distance_threshold: self.distance_threshold,
            fusion_weight: None,
        };

        let cancel = cancel_on_ctrl_c();
        let result = engine.search(&request, &cancel).await;
        engine.context().store.close().await;

        print_result(&result?, self.output_format)
    }
}

fn print_result(result: &[SearchResult], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for hit in result {
                println!("{:.4}\t{}\t{}", hit.score, hit.file_path, hit.caption);
            }
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}
