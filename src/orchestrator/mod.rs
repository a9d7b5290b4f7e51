//! 编排层（Orchestration Layer）
//!
//! ## 模块划分
//!
//! ### `app` - 应用入口
//! - 管理应用生命周期（初始化、运行）
//! - 启动控制面板与安全监控的后台任务
//! - 管理浏览器资源（Browser、JsExecutor）
//! - 登录等待
//!
//! ### `phase_coordinator` - 阶段编排器
//! - 付款 → 下载回单 → 合并回单
//! - 每个 LOT 之后落盘，LOT 之间检查停止请求
//! - 输出各阶段统计
//!
//! ## 层次关系
//!
//! ```text
//! app (资源 + 生命周期)
//!     ↓
//! phase_coordinator (处理 Vec<LotRecord>)
//!     ↓
//! workflow::UnitProcessor (处理单个 LOT)
//!     ↓
//! services (能力层：portal / checkpoint / control / safety / merge)
//!     ↓
//! infrastructure (基础设施：JsExecutor)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：app 管资源，phase_coordinator 管阶段
//! 2. **资源隔离**：只有编排层持有 Browser
//! 3. **向下依赖**：编排层 → workflow → services → infrastructure

pub mod app;
pub mod phase_coordinator;

// 重新导出主要类型
pub use app::App;
pub use phase_coordinator::{PhaseCoordinator, RunReport};
