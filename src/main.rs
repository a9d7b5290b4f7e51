use anyhow::{Context, Result};
use dop_rd_automate::{logger, App, Config};
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    let log_tail = logger::init();

    // 加载配置
    let config = Config::load().context("加载配置失败")?;

    // 初始化并运行应用
    let report = App::initialize(config, log_tail).await?.run().await?;
    if let Some(reason) = report.halted {
        error!("本次运行提前结束: {}", reason);
    }

    Ok(())
}
