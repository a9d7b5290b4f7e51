//! 安全监控 - 业务能力层
//!
//! 两个独立的看门狗：内存上限与全局超时。
//! 只在检查点被轮询，从不打断进行中的驱动调用；
//! 触发后要求有序退出（相当于"处理完当前 LOT 后停止"）。

use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::HaltReason;
use crate::services::control_channel::{ControlChannel, EventRecord};

/// 内存读数来源
pub trait MemoryProbe: Send + Sync {
    /// 当前常驻内存（MB）；无法测量时返回 None，不阻塞执行
    fn resident_mb(&self) -> Option<f64>;
}

/// 基于 sysinfo 的内存读数：本进程 + 带远程调试端口启动的浏览器进程
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_mb(&self) -> Option<f64> {
        let own_pid = sysinfo::get_current_pid().ok()?;
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes();

        let mut own_bytes = 0u64;
        let mut browser_bytes = 0u64;
        for (pid, process) in system.processes() {
            if *pid == own_pid {
                own_bytes += process.memory();
                continue;
            }
            let name = process.name().to_ascii_lowercase();
            let is_browser = name.contains("chrom") || name.contains("msedge");
            if is_browser
                && process
                    .cmd()
                    .iter()
                    .any(|arg| arg.starts_with("--remote-debugging-port"))
            {
                browser_bytes += process.memory();
            }
        }

        let to_mb = |bytes: u64| bytes as f64 / (1024.0 * 1024.0);
        debug!(
            "内存: 本进程 {:.0} MB | 浏览器 {:.0} MB",
            to_mb(own_bytes),
            to_mb(browser_bytes)
        );
        Some(to_mb(own_bytes + browser_bytes))
    }
}

/// 看门狗阈值
#[derive(Debug, Clone, Copy)]
pub struct SafetyLimits {
    pub memory_limit_mb: u64,
    pub global_timeout: Duration,
}

/// 看门狗触发详情
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SafetyBreach {
    Memory { used_mb: f64, limit_mb: u64 },
    Timeout { elapsed: Duration, limit: Duration },
}

impl SafetyBreach {
    pub fn halt_reason(&self) -> HaltReason {
        match self {
            SafetyBreach::Memory { .. } => HaltReason::MemoryLimitExceeded,
            SafetyBreach::Timeout { .. } => HaltReason::GlobalTimeoutExceeded,
        }
    }
}

/// 安全监控
pub struct SafetyMonitor {
    limits: SafetyLimits,
    started_at: Instant,
    probe: Arc<dyn MemoryProbe>,
    last_memory_mb: Mutex<f64>,
}

impl SafetyMonitor {
    /// 创建安全监控，计时从此刻开始
    pub fn new(limits: SafetyLimits, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            limits,
            started_at: Instant::now(),
            probe,
            last_memory_mb: Mutex::new(0.0),
        }
    }

    pub fn limits(&self) -> SafetyLimits {
        self.limits
    }

    /// 自启动以来经过的时间（暂停期间照常计时）
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 最近一次内存读数（MB）
    pub fn last_memory_mb(&self) -> f64 {
        *self
            .last_memory_mb
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 读取一次内存
    pub fn sample_memory(&self) -> Option<f64> {
        let used_mb = self.probe.resident_mb()?;
        *self
            .last_memory_mb
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = used_mb;
        Some(used_mb)
    }

    /// 检查两个看门狗；先看超时，再看内存
    pub fn check(&self) -> Option<SafetyBreach> {
        let elapsed = self.elapsed();
        if elapsed > self.limits.global_timeout {
            return Some(SafetyBreach::Timeout {
                elapsed,
                limit: self.limits.global_timeout,
            });
        }

        let used_mb = self.sample_memory()?;
        if used_mb > self.limits.memory_limit_mb as f64 {
            return Some(SafetyBreach::Memory {
                used_mb,
                limit_mb: self.limits.memory_limit_mb,
            });
        }
        None
    }

    /// 检查并把触发结果登记到控制通道；返回触发的停止原因
    pub fn enforce(&self, channel: &ControlChannel) -> Option<HaltReason> {
        let breach = self.check()?;
        let reason = breach.halt_reason();
        if channel.force_halt(reason) {
            log_breach(&breach);
        }
        Some(reason)
    }

    /// 在独立任务中定期轮询：发布内存读数，触发时登记有序退出
    pub fn spawn_poller(
        self: Arc<Self>,
        channel: Arc<ControlChannel>,
        every: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if self.enforce(&channel).is_some() {
                    channel.publish_event(EventRecord::MemorySample {
                        memory_mb: self.last_memory_mb(),
                    });
                    break;
                }
                channel.publish_event(EventRecord::MemorySample {
                    memory_mb: self.last_memory_mb(),
                });
            }
        })
    }
}

fn log_breach(breach: &SafetyBreach) {
    match breach {
        SafetyBreach::Memory { used_mb, limit_mb } => {
            warn!("{}", "=".repeat(60));
            warn!("⚠️ 内存警告: 已使用 {:.0} MB (上限 {} MB)", used_mb, limit_mb);
            warn!("当前 LOT 完成并保存后停止，防止系统卡死");
            warn!("{}", "=".repeat(60));
        }
        SafetyBreach::Timeout { elapsed, limit } => {
            warn!("{}", "=".repeat(60));
            warn!(
                "⏰ 已运行 {} 分钟，达到全局超时 ({} 分钟)",
                elapsed.as_secs() / 60,
                limit.as_secs() / 60
            );
            warn!("当前 LOT 完成并保存后停止，重新启动即可继续");
            warn!("{}", "=".repeat(60));
        }
    }
}
