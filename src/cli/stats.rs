use clap::Parser;
use serde_json::json;

use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::store::{SqliteStore, StorageEngine};

#[derive(Parser, Debug, Clone)]
pub struct StatsCommand {
    /// 集合名
    #[arg(long, env = "IMG_TABLE_NAME", default_value = "image_search")]
    pub collection: String,
}

impl SubCommandExtend for StatsCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let store = SqliteStore::open(opts.conf_dir.database(), &self.collection).await?;
        let Some(schema) = store.describe_collection(&self.collection).await? else {
            store.close().await;
            anyhow::bail!("集合 {} 不存在，请先运行 init 或 add", self.collection);
        };
        let count = store.count().await?;
        store.close().await;

        println!("{}", serde_json::to_string_pretty(&json!({ "count": count, "schema": schema }))?);
        Ok(())
    }
}
