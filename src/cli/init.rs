use std::path::PathBuf;

use clap::Parser;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::cli::SubCommandExtend;
use crate::config::{CollectionOptions, Opts, ProviderOptions};
use crate::context::AppContext;
use crate::provider::{CaptionProvider, EmbeddingProvider};

#[derive(Parser, Debug, Clone)]
pub struct InitCommand {
    #[command(flatten)]
    pub provider: ProviderOptions,
    #[command(flatten)]
    pub collection: CollectionOptions,
    /// 用这张图片检查向量与描述服务是否可用
    #[arg(long, value_name = "IMAGE")]
    pub probe: Option<PathBuf>,
}

impl SubCommandExtend for InitCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let ctx = AppContext::open(&opts.conf_dir, &self.provider, &self.collection).await?;
        let schema = ctx.ensure_ready().await?;
        info!("集合 {} 已就绪", schema.name);
        println!("{}", serde_json::to_string_pretty(&schema)?);

        if let Some(path) = &self.probe {
            let image = tokio::fs::read(path).await?;
            let cancel = CancellationToken::new();

            let vector =
                ctx.retry.provider(&cancel, "embed", || ctx.embedder.embed(&image)).await?;
            println!("向量服务正常，维度 {}", vector.len());
            if vector.len() != schema.dimension {
                anyhow::bail!("向量维度 {} 与集合维度 {} 不一致", vector.len(), schema.dimension);
            }

            if let Some(captioner) = &ctx.captioner {
                let caption =
                    ctx.retry.provider(&cancel, "caption", || captioner.caption(&image)).await?;
                println!("描述服务正常: {}", caption);
            }
        }

        ctx.store.close().await;
        Ok(())
    }
}
