//! JS 执行器 - 基础设施层
//!
//! 持有唯一的 page 资源，只暴露"执行 JS"和少量页面级能力

use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{AppError, AppResult, BrowserError};

/// 页面上的对话框一律自动确认（门户在保存和付款时会弹 confirm）
const AUTO_ACCEPT_DIALOGS: &str = r#"
(() => {
    window.confirm = () => true;
    window.alert = () => {};
    return true;
})()
"#;

/// JS 执行器
///
/// 职责：
/// - 持有唯一的 Page 资源
/// - 暴露 eval() 能力
/// - 不认识 LOT / 回单
/// - 不处理业务流程
pub struct JsExecutor {
    page: Page,
}

impl JsExecutor {
    /// 创建新的 JS 执行器
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    /// 执行 JS 代码并返回 JSON 结果
    pub async fn eval(&self, js_code: impl Into<String>) -> AppResult<JsonValue> {
        let result = self.page.evaluate(js_code.into()).await?;
        let json_value = result.into_value()?;
        Ok(json_value)
    }

    /// 执行 JS 代码并反序列化为指定类型
    pub async fn eval_as<T: DeserializeOwned>(&self, js_code: impl Into<String>) -> AppResult<T> {
        let json_value = self.eval(js_code).await?;
        let typed_value = serde_json::from_value(json_value)?;
        Ok(typed_value)
    }

    /// 反复执行返回布尔值的 JS，直到为 true 或超时；返回最后一次结果
    pub async fn wait_until(&self, js_condition: &str, timeout: Duration) -> AppResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.eval_as::<bool>(js_condition).await.unwrap_or(false) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("等待条件超时 ({:?})", timeout);
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// 覆盖 confirm/alert，避免对话框卡住流程
    pub async fn auto_accept_dialogs(&self) -> AppResult<()> {
        self.eval(AUTO_ACCEPT_DIALOGS).await?;
        Ok(())
    }

    /// 允许下载并指定下载目录
    pub async fn allow_downloads_to(&self, dir: &Path) -> AppResult<()> {
        let params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(dir.display().to_string())
            .build()
            .map_err(|e| {
                AppError::Browser(BrowserError::ScriptExecutionFailed { source: e.into() })
            })?;
        self.page.execute(params).await?;
        debug!("下载目录已设置: {}", dir.display());
        Ok(())
    }
}
