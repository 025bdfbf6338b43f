use clap::Parser;
use log::{error, info};
use prometheus::{BasicAuthentication, labels};
use rand::distr::{Alphanumeric, SampleString};
use tokio::net::TcpListener;
use tokio::task::spawn_blocking;
use tokio::time::{Duration, sleep};

use crate::cli::{SubCommandExtend, cancel_on_ctrl_c};
use crate::config::{CollectionOptions, FusionOptions, IngestArgs, Opts, ProviderOptions};
use crate::context::AppContext;
use crate::query::QueryEngine;
use crate::server;

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub provider: ProviderOptions,
    #[command(flatten)]
    pub collection: CollectionOptions,
    #[command(flatten)]
    pub fusion: FusionOptions,
    #[command(flatten)]
    pub ingest: IngestArgs,
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub addr: String,
    /// 导入接口的验证 token，不填则随机生成
    #[arg(long, default_value_t = String::new())]
    pub token: String,
    /// prometheus 主动推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME")]
    pub prometheus_instance: Option<String>,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH")]
    pub prometheus_auth: Option<String>,
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let fusion = self.fusion.config()?;
        let ingest = self.ingest.options()?;
        let auth = match &self.prometheus_auth {
            Some(s) => {
                let (username, password) = s
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("prometheus 认证信息格式应为 username:password"))?;
                Some((username.to_string(), password.to_string()))
            }
            None => None,
        };

        let ctx = AppContext::open(&opts.conf_dir, &self.provider, &self.collection).await?;
        let schema = ctx.ensure_ready().await?;
        info!("集合 {} 已就绪", schema.name);

        let token = if self.token.is_empty() {
            let token = Alphanumeric.sample_string(&mut rand::rng(), 32);
            info!("鉴权 token: {}", token);
            token
        } else {
            self.token.clone()
        };

        let shutdown = cancel_on_ctrl_c();

        // 创建应用状态
        let engine = QueryEngine::new(ctx, fusion);
        let state = server::AppState::new(engine, ingest, token, shutdown.clone());

        // 创建应用
        let app = server::create_app(state);

        if let Some(url) = self.prometheus_push.clone() {
            let instance = self.prometheus_instance.clone().unwrap_or_else(|| self.addr.clone());
            tokio::spawn(async move {
                loop {
                    let metric_families = prometheus::gather();
                    let url = url.clone();
                    let instance = instance.clone();
                    let auth = auth.clone();
                    let r = spawn_blocking(move || {
                        prometheus::push_metrics(
                            "imhybrid",
                            labels! {
                                "instance".to_string() => instance,
                            },
                            &url,
                            metric_families,
                            auth.map(|(username, password)| BasicAuthentication {
                                username,
                                password,
                            }),
                        )
                    })
                    .await;
                    match r {
                        Ok(Err(e)) => error!("推送指标失败: {e}"),
                        Err(e) => error!("推送指标失败: {e}"),
                        Ok(Ok(())) => {}
                    }
                    sleep(Duration::from_secs(30)).await;
                }
            });
        }

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("服务器已停止");
        Ok(())
    }
}
