//! 操作员确认 - 业务能力层
//!
//! 登录等待与阶段切换前的确认都是阻塞式的人工步骤。

use async_trait::async_trait;
use std::io::{self, BufRead, Write};
use tracing::warn;

/// 阻塞式人工确认
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// 询问是/否；只有明确回答 y/yes 才算同意
    async fn confirm(&self, question: &str) -> bool;
    /// 等待操作员按回车
    async fn wait_for_enter(&self, message: &str);
}

/// 终端标准输入
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompt;

impl StdinPrompt {
    async fn read_line(prompt: String) -> Option<String> {
        let result = tokio::task::spawn_blocking(move || {
            let mut stdout = io::stdout();
            let _ = write!(stdout, "{}", prompt);
            let _ = stdout.flush();
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match result {
            Ok(Ok(line)) => Some(line),
            Ok(Err(e)) => {
                warn!("读取标准输入失败: {}", e);
                None
            }
            Err(e) => {
                warn!("读取标准输入的任务异常: {}", e);
                None
            }
        }
    }
}

/// y / yes（不区分大小写）
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, question: &str) -> bool {
        Self::read_line(format!("{} (y/n): ", question))
            .await
            .map(|answer| is_affirmative(&answer))
            .unwrap_or(false)
    }

    async fn wait_for_enter(&self, message: &str) {
        Self::read_line(format!("{}\n按回车继续...", message)).await;
    }
}
