use std::path::PathBuf;

use anyhow::anyhow;
use clap::Parser;
use indicatif::ProgressBar;

use crate::cli::{SubCommandExtend, cancel_on_ctrl_c};
use crate::config::{CollectionOptions, IngestArgs, Opts, ProviderOptions};
use crate::context::AppContext;
use crate::ingest::{ImageSource, ingest};
use crate::utils::{pb_style, pb_style_speed};

#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub provider: ProviderOptions,
    #[command(flatten)]
    pub collection: CollectionOptions,
    #[command(flatten)]
    pub ingest: IngestArgs,
    /// 图片所在目录，也支持读取 tar、tar.gz、tar.bz2、tar.xz 与 zip 归档
    pub path: PathBuf,
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let options = self.ingest.options()?;
        let ctx = AppContext::open(&opts.conf_dir, &self.provider, &self.collection).await?;

        let source = ImageSource::from_path(&self.path);
        let style = match source {
            ImageSource::Archive(_) => pb_style_speed(),
            _ => pb_style(),
        };
        let pb = ProgressBar::no_length().with_style(style);
        let cancel = cancel_on_ctrl_c();

        let report = ingest(source, &ctx, &options, &cancel, pb.clone()).await;
        pb.finish_with_message("图片添加完成");
        ctx.store.close().await;

        println!("{}", serde_json::to_string_pretty(&report)?);

        match report.fatal {
            Some(err) => Err(anyhow!(err)),
            None => Ok(()),
        }
    }
}
