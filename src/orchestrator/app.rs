//! 应用入口 - 编排层
//!
//! ## 职责
//!
//! 1. **资源初始化**：加载状态表、启动控制面板与安全监控、连接浏览器
//! 2. **登录等待**：操作员手动登录门户后按回车
//! 3. **资源管理**：持有 Browser，确保生命周期覆盖整次运行
//! 4. **向下委托**：三个阶段交给 `PhaseCoordinator`

use anyhow::{Context, Result};
use chromiumoxide::Browser;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::browser;
use crate::config::Config;
use crate::dashboard;
use crate::infrastructure::JsExecutor;
use crate::logger::LogTail;
use crate::orchestrator::phase_coordinator::{PhaseCoordinator, RunReport};
use crate::services::{
    CheckpointStore, ChromiumPortal, ControlChannel, LopdfToolkit, OperatorPrompt,
    ReceiptMerger, SafetyLimits, SafetyMonitor, StdinPrompt, SysinfoProbe,
};
use crate::utils::logging::log_startup;

/// 应用主结构
pub struct App {
    _browser: Browser,
    coordinator: PhaseCoordinator,
    safety_poller: JoinHandle<()>,
    dashboard: Option<JoinHandle<()>>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config, log_tail: LogTail) -> Result<Self> {
        log_startup(&config);

        std::fs::create_dir_all(&config.download_dir).with_context(|| {
            format!("无法创建回单目录 {}", config.download_dir.display())
        })?;

        let channel = Arc::new(ControlChannel::new(config.delays));
        log_tail.attach(channel.clone());

        let store = CheckpointStore::open(
            &config.input_csv,
            &config.checkpoint_csv,
            &config.checkpoint_xlsx,
            &config.download_dir,
        )
        .with_context(|| format!("加载 LOT 表失败: {}", config.input_csv.display()))?;

        // 控制面板起不来不影响自动化
        let dashboard = dashboard::spawn(channel.clone(), config.dashboard_port)
            .await
            .map(|(_, handle)| handle);

        let safety = Arc::new(SafetyMonitor::new(
            SafetyLimits {
                memory_limit_mb: config.memory_limit_mb,
                global_timeout: config.global_timeout(),
            },
            Arc::new(SysinfoProbe::new()),
        ));
        let safety_poller = safety.clone().spawn_poller(
            channel.clone(),
            Duration::from_secs(config.safety_poll_secs.max(1)),
        );

        // 连接浏览器
        let (browser, page) =
            browser::connect_to_browser_and_page(config.browser_debug_port, &config.portal_url)
                .await
                .context("连接浏览器失败，请确认浏览器已用 --remote-debugging-port 启动")?;

        // 创建 JsExecutor（持有 page）
        let executor = JsExecutor::new(page);

        let prompt: Arc<dyn OperatorPrompt> = Arc::new(StdinPrompt);
        prompt
            .wait_for_enter("请在浏览器中登录门户，完成后按回车继续...")
            .await;
        info!("✓ 已确认登录");

        let driver = Arc::new(ChromiumPortal::new(executor, channel.delay_watch()));
        let coordinator = PhaseCoordinator::new(
            store,
            driver,
            channel,
            Some(safety),
            prompt,
            ReceiptMerger::new(Arc::new(LopdfToolkit)),
        )
        .with_selection(config.lot_selection.clone());

        Ok(Self {
            _browser: browser,
            coordinator,
            safety_poller,
            dashboard,
        })
    }

    /// 运行应用主逻辑
    pub async fn run(mut self) -> Result<RunReport> {
        let report = self
            .coordinator
            .run()
            .await
            .context("写入检查点失败，运行已停止")?;

        self.safety_poller.abort();
        if let Some(dashboard) = self.dashboard.take() {
            // 留给面板最后一次推送
            tokio::time::sleep(Duration::from_secs(1)).await;
            dashboard.abort();
        }

        info!("浏览器保持打开，完成后请手动关闭");
        Ok(report)
    }
}
