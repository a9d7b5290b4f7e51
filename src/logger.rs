//! 日志初始化
//!
//! 控制台输出之外，每条日志还会镜像到控制通道的日志尾部，供控制面板展示。
//! 控制通道创建得比日志晚，所以先返回一个 `LogTail`，之后再 `attach`。

use std::fmt::Debug;
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::services::{ControlChannel, EventRecord};

/// 日志尾部的接收端（延迟绑定到控制通道）
#[derive(Clone, Default)]
pub struct LogTail {
    channel: Arc<OnceLock<Arc<ControlChannel>>>,
}

impl LogTail {
    /// 绑定控制通道；之后的日志都会进入实时概览
    pub fn attach(&self, channel: Arc<ControlChannel>) {
        // 只绑定一次，重复调用忽略
        let _ = self.channel.set(channel);
    }
}

/// 初始化日志：`RUST_LOG` 优先，默认 `info`
pub fn init() -> LogTail {
    let tail = LogTail::default();

    let result = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(LogTailLayer { tail: tail.clone() })
        .try_init();
    if let Err(e) = result {
        eprintln!("日志初始化失败（可能已初始化）: {}", e);
    }

    tail
}

/// 把日志镜像到控制通道的 tracing layer
struct LogTailLayer {
    tail: LogTail,
}

impl<S: Subscriber> Layer<S> for LogTailLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(channel) = self.tail.channel.get() else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if visitor.message.trim().is_empty() {
            return;
        }

        channel.publish_event(EventRecord::Log {
            line: format_tail_line(&visitor.message),
        });
    }
}

/// 只取 `message` 字段
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

/// `HH:MM:SS  消息`，去掉横幅前面的空行
fn format_tail_line(message: &str) -> String {
    format!(
        "{}  {}",
        chrono::Local::now().format("%H:%M:%S"),
        message.trim_start_matches('\n')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_line_drops_leading_newlines() {
        let line = format_tail_line("\n====");
        assert!(line.ends_with("  ===="));
        assert_eq!(line.len(), "00:00:00  ====".len());
    }
}
