mod add;
mod init;
mod search;
pub mod server;
mod stats;

pub use add::*;
pub use init::*;
pub use search::*;
pub use server::*;
pub use stats::*;

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// 收到 Ctrl-C 时取消返回的令牌
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在停止");
            token.cancel();
        }
    });
    cancel
}
