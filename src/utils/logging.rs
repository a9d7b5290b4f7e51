/// 日志工具模块
///
/// 提供横幅、阶段概览和统计输出的辅助函数
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{LotRecord, Phase};

/// 记录程序启动信息
///
/// # 参数
/// - `config`: 本次运行使用的配置
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - RD 分期付款自动化");
    info!("📄 输入表: {}", config.input_csv.display());
    info!("💾 检查点: {}", config.checkpoint_csv.display());
    info!("📁 回单目录: {}", config.download_dir.display());
    info!("🎯 LOT 范围: {}", config.lot_selection);
    info!(
        "🛡️ 内存上限 {} MB | 全局超时 {} 分钟",
        config.memory_limit_mb, config.global_timeout_minutes
    );
    info!("{}", "=".repeat(60));
}

/// 记录启动时的恢复概览
///
/// 每个 LOT 一行，已完成/已保存的会带上标记
pub fn log_resume_summary(records: &[LotRecord]) {
    let paid = records.iter().filter(|r| r.status.is_paid()).count();
    info!("✓ 找到 {} 个 LOT，其中 {} 个已付款", records.len(), paid);
    for record in records {
        info!(
            "  LOT {} → {} 个账号{}",
            record.lot_id,
            record.expected_count,
            record.status.resume_marker()
        );
    }
}

/// 记录阶段开始信息
///
/// # 参数
/// - `phase`: 阶段
/// - `total`: 本阶段工作集大小
pub fn log_phase_start(phase: Phase, total: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 {} - 共 {} 个 LOT", phase, total);
    info!("{}", "=".repeat(60));
}

/// 记录阶段完成信息
pub fn log_phase_complete(phase: Phase, success: usize, failed: usize, skipped: usize) {
    info!("\n{}", "─".repeat(60));
    info!(
        "✓ {} 完成: 成功 {} | 失败 {} | 跳过 {}",
        phase, success, failed, skipped
    );
    info!("{}", "─".repeat(60));
}

/// 记录有序退出的横幅
pub fn log_halt(reason: &str) {
    warn!("{}", "=".repeat(60));
    warn!("🛑 有序退出: {}", reason);
    warn!("💡 状态已保存，重新运行即可从下一个 LOT 继续");
    warn!("{}", "=".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `paid`: 本次付款成功数量
/// - `failed`: 失败数量
/// - `downloaded`: 下载回单数量
/// - `checkpoint`: 检查点文件路径
pub fn print_final_stats(paid: usize, failed: usize, downloaded: usize, checkpoint: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 付款成功: {}", paid);
    info!("❌ 失败: {}", failed);
    info!("📥 回单下载: {}", downloaded);
    info!("{}", "=".repeat(60));
    info!("\n状态已保存至: {}", checkpoint);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate_text("RD1,RD2", 80), "RD1,RD2");
        assert_eq!(truncate_text("账号账号账号", 2), "账号...");
    }
}
