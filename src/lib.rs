//! # DOP RD Automate
//!
//! 一个用于 RD 分期批量付款的可恢复自动化程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（Page），只暴露能力
//! - `JsExecutor` - 唯一的 page owner，提供 eval() 能力
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"
//! - `PortalDriver` - 门户操作能力（查询、勾选、保存、付款、下载）
//! - `CheckpointStore` - 状态表持久化（CSV + XLSX）
//! - `ControlChannel` - 操作员信号与实时概览
//! - `SafetyMonitor` - 内存与全局超时看门狗
//! - `ReceiptMerger` - 单页回单合并
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个 LOT"的完整处理流程
//! - `LotCtx` - 上下文封装（lot_id + 位置）
//! - `UnitProcessor` - 状态推进（查询 → 核对 → 勾选 → 保存 → 付款 → 记录）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/app` - 资源与生命周期
//! - `orchestrator/phase_coordinator` - 付款 / 下载 / 合并三个阶段
//!
//! ## 模块结构

pub mod browser;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod infrastructure;
pub mod logger;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use browser::connect_to_browser_and_page;
pub use config::{Config, LotSelection};
pub use error::{AppError, AppResult, HaltReason, LotError};
pub use infrastructure::JsExecutor;
pub use models::{LotId, LotRecord, Status, StatusVector};
pub use orchestrator::{App, PhaseCoordinator, RunReport};
pub use workflow::{LotCtx, LotOutcome, UnitProcessor};
