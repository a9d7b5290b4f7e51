//! 运行期状态：阶段、进度、延迟参数

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ConfigError;
use crate::models::LotId;

/// 运行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Phase {
    #[default]
    Startup,
    Pay,
    Download,
    Merge,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Startup => "启动",
            Phase::Pay => "阶段 1: 付款",
            Phase::Download => "阶段 2: 下载回单",
            Phase::Merge => "阶段 3: 合并回单",
            Phase::Finished => "已结束",
        };
        f.write_str(name)
    }
}

/// 四个可调延迟的名称
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayKind {
    Short,
    Medium,
    Long,
    Checkbox,
}

/// 任何延迟的上限（秒）
pub const MAX_DELAY_SECS: f64 = 300.0;

impl DelayKind {
    /// 允许的最小值（秒）
    pub fn minimum(self) -> f64 {
        match self {
            DelayKind::Checkbox => 0.05,
            _ => 0.1,
        }
    }

    /// 截断到 [最小值, `MAX_DELAY_SECS`]；NaN 与无穷按最小值处理
    fn clamp(self, value: f64) -> f64 {
        if value.is_finite() {
            value.clamp(self.minimum(), MAX_DELAY_SECS)
        } else {
            self.minimum()
        }
    }
}

impl FromStr for DelayKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches("delay_").to_ascii_lowercase().as_str() {
            "short" => Ok(DelayKind::Short),
            "medium" => Ok(DelayKind::Medium),
            "long" => Ok(DelayKind::Long),
            "checkbox" => Ok(DelayKind::Checkbox),
            _ => Err(ConfigError::UnknownDelay {
                name: s.to_string(),
            }),
        }
    }
}

/// 节奏延迟（秒）
///
/// 门户是银行系统，所有动作之间都要留出间隔。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    pub short: f64,
    pub medium: f64,
    pub long: f64,
    pub checkbox: f64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            short: 1.5,
            medium: 3.0,
            long: 5.0,
            checkbox: 0.4,
        }
    }
}

impl DelayConfig {
    pub fn get(&self, kind: DelayKind) -> f64 {
        match kind {
            DelayKind::Short => self.short,
            DelayKind::Medium => self.medium,
            DelayKind::Long => self.long,
            DelayKind::Checkbox => self.checkbox,
        }
    }

    /// 设置某个延迟，截断到 [最小值, `MAX_DELAY_SECS`]；返回实际生效的值
    pub fn set(&mut self, kind: DelayKind, value: f64) -> f64 {
        let value = kind.clamp(value);
        match kind {
            DelayKind::Short => self.short = value,
            DelayKind::Medium => self.medium = value,
            DelayKind::Long => self.long = value,
            DelayKind::Checkbox => self.checkbox = value,
        }
        value
    }

    pub fn duration(&self, kind: DelayKind) -> Duration {
        Duration::from_secs_f64(kind.clamp(self.get(kind)))
    }
}

/// 本次运行的进度状态（由 PhaseCoordinator 独占写入）
#[derive(Debug, Clone)]
pub struct RunState {
    pub phase: Phase,
    /// 当前阶段内正在处理的序号（从 0 开始）
    pub current_index: usize,
    /// 当前阶段的工作总数
    pub phase_total: usize,
    pub current_lot: Option<LotId>,
    pub started_at: Instant,
    pub peak_memory_mb: f64,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Startup,
            current_index: 0,
            phase_total: 0,
            current_lot: None,
            started_at: Instant::now(),
            peak_memory_mb: 0.0,
        }
    }

    /// 进入新阶段
    pub fn enter_phase(&mut self, phase: Phase, total: usize) {
        self.phase = phase;
        self.phase_total = total;
        self.current_index = 0;
        self.current_lot = None;
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 当前阶段完成百分比
    pub fn percent_complete(&self) -> f64 {
        if self.phase_total == 0 {
            return 0.0;
        }
        (self.current_index as f64 / self.phase_total as f64 * 100.0).min(100.0)
    }

    pub fn observe_memory(&mut self, memory_mb: f64) {
        if memory_mb > self.peak_memory_mb {
            self.peak_memory_mb = memory_mb;
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_set_clamps_to_minimum() {
        let mut delays = DelayConfig::default();
        assert_eq!(delays.set(DelayKind::Short, 0.0), 0.1);
        assert_eq!(delays.set(DelayKind::Checkbox, 0.01), 0.05);
        assert_eq!(delays.set(DelayKind::Long, 8.0), 8.0);
        assert_eq!(delays.set(DelayKind::Medium, f64::NAN), 0.1);
        assert_eq!(delays.long, 8.0);
    }

    #[test]
    fn huge_delay_is_capped_and_still_converts() {
        let mut delays = DelayConfig::default();
        assert_eq!(delays.set(DelayKind::Long, 1e20), MAX_DELAY_SECS);
        assert_eq!(delays.duration(DelayKind::Long), Duration::from_secs(300));

        // 直接写字段绕过截断时也不会 panic
        delays.medium = 1e20;
        assert_eq!(delays.duration(DelayKind::Medium), Duration::from_secs(300));
        delays.short = -1.0;
        assert_eq!(delays.duration(DelayKind::Short), Duration::from_secs_f64(0.1));
    }

    #[test]
    fn delay_kind_accepts_dashboard_names() {
        assert_eq!("delay_short".parse::<DelayKind>().unwrap(), DelayKind::Short);
        assert_eq!("Checkbox".parse::<DelayKind>().unwrap(), DelayKind::Checkbox);
        assert!("fast".parse::<DelayKind>().is_err());
    }

    #[test]
    fn percent_complete_tracks_index() {
        let mut state = RunState::new();
        assert_eq!(state.percent_complete(), 0.0);
        state.enter_phase(Phase::Pay, 4);
        state.current_index = 1;
        assert_eq!(state.percent_complete(), 25.0);
    }
}
