//! LOT 处理流程 - 流程层
//!
//! 核心职责：定义"一个 LOT"的完整处理流程
//!
//! 状态严格按顺序推进，每一步之后都是检查点：
//! Start → Fetched → CountVerified → DueDateVerified → Selected →
//! SelectionVerified → Saved → Paid → Recorded
//!
//! 任何一步失败都会短路：记下到达的位置和原因，交回编排层，整次运行继续。

use chrono::{Datelike, Local, NaiveDate};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{AppResult, HaltReason, LotError};
use crate::models::{DelayKind, LotRecord, LotStage, Status, StatusVector};
use crate::services::{
    CheckpointStore, ControlChannel, ControlSignal, EventRecord, LotOutcomeKind, PortalDriver,
    SafetyMonitor, PAGINATION_CAP,
};
use crate::workflow::lot_ctx::LotCtx;

/// 暂停超过这个时长就提醒一次
const PAUSE_WARNING_EVERY: Duration = Duration::from_secs(5 * 60);

/// 暂停期间检查安全监控的间隔
const PAUSE_POLL: Duration = Duration::from_secs(1);

/// 单个 LOT 的结局
#[derive(Debug, Clone, PartialEq)]
pub enum LotOutcome {
    /// 付款成功并已记录
    Paid { reference_id: String },
    /// 某一步失败
    Failed { stage: LotStage, error: LotError },
    /// 操作员跳过
    Skipped { stage: LotStage },
    /// 中止（操作员中止，或暂停期间超过全局超时）
    Aborted { stage: LotStage, reason: HaltReason },
}

impl LotOutcome {
    pub fn kind(&self) -> LotOutcomeKind {
        match self {
            LotOutcome::Paid { .. } => LotOutcomeKind::Done,
            LotOutcome::Failed { .. } => LotOutcomeKind::Failed,
            LotOutcome::Skipped { .. } => LotOutcomeKind::Skipped,
            LotOutcome::Aborted { .. } => LotOutcomeKind::Interrupted,
        }
    }

    /// 是否已经动过门户（开始前就被中止的 LOT 不算）
    pub fn started(&self) -> bool {
        !matches!(
            self,
            LotOutcome::Aborted {
                stage: LotStage::Start,
                ..
            }
        )
    }

    /// 需要结束整次运行的原因
    pub fn halt_reason(&self) -> Option<HaltReason> {
        match self {
            LotOutcome::Aborted { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// 检查点上打断流程的原因
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Interrupt {
    Skip,
    Abort(HaltReason),
}

/// 流程短路的原因
enum Stop {
    Failed(LotError),
    Interrupted(Interrupt),
}

impl From<Interrupt> for Stop {
    fn from(interrupt: Interrupt) -> Self {
        Stop::Interrupted(interrupt)
    }
}

/// 到期日是否落在 `today` 所在的月份（`15-Oct-2026` 格式，无法解析视为不合格）
pub fn due_in_month(due_date: &str, today: NaiveDate) -> bool {
    NaiveDate::parse_from_str(due_date.trim(), "%d-%b-%Y")
        .map(|due| due.year() == today.year() && due.month() == today.month())
        .unwrap_or(false)
}

/// LOT 处理流程
///
/// - 编排单个 LOT 的完整处理流程
/// - 在每个检查点读取控制信号与安全监控
/// - 不持有页面资源，只依赖 `PortalDriver`
pub struct UnitProcessor {
    driver: Arc<dyn PortalDriver>,
    channel: Arc<ControlChannel>,
    safety: Option<Arc<SafetyMonitor>>,
    today: NaiveDate,
}

impl UnitProcessor {
    pub fn new(
        driver: Arc<dyn PortalDriver>,
        channel: Arc<ControlChannel>,
        safety: Option<Arc<SafetyMonitor>>,
    ) -> Self {
        Self {
            driver,
            channel,
            safety,
            today: Local::now().date_naive(),
        }
    }

    /// 指定"今天"（到期日校验用）
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// 处理一个 LOT 并把结果写入检查点
    ///
    /// 只有检查点写入失败才返回 Err（整次运行需要停止）。
    pub async fn run(
        &self,
        record: &LotRecord,
        ctx: &LotCtx,
        store: &mut CheckpointStore,
    ) -> AppResult<(StatusVector, LotOutcome)> {
        info!("{}", "─".repeat(60));
        info!(
            "{} 期望 {} 个账号 ({}/{})",
            ctx,
            ctx.expected_count,
            ctx.index + 1,
            ctx.total
        );
        info!(
            "{} RD 账号: {}",
            ctx,
            crate::utils::logging::truncate_text(&record.accounts_joined(), 80)
        );
        info!("{}", "─".repeat(60));

        let mut status = StatusVector::default();
        let mut stage = LotStage::Start;

        let outcome = match self.drive(record, ctx, &mut status, &mut stage).await {
            Ok(reference_id) => {
                status.remarks = format!("{}: 付款成功 (参考号 {})", LotStage::Recorded, reference_id);
                info!("✅ {} 全部完成，参考号: {}", ctx, reference_id);
                LotOutcome::Paid { reference_id }
            }
            Err(Stop::Failed(error)) => {
                status.remarks = format!("{}: {}", stage, error);
                warn!("❌ {} 在 {} 之后失败: {}", ctx, stage, error);
                LotOutcome::Failed { stage, error }
            }
            Err(Stop::Interrupted(Interrupt::Skip)) => {
                status.pay_status = Status::Skipped;
                status.remarks = format!("{}: 操作员跳过", stage);
                info!("⏭️ {} 已跳过 (停在 {})", ctx, stage);
                LotOutcome::Skipped { stage }
            }
            // 还没碰门户就被中止：保留上次运行的记录
            Err(Stop::Interrupted(Interrupt::Abort(reason))) if stage == LotStage::Start => {
                warn!("🛑 {} 开始前中止: {}", ctx, reason);
                return Ok((
                    record.status.clone(),
                    LotOutcome::Aborted { stage, reason },
                ));
            }
            Err(Stop::Interrupted(Interrupt::Abort(reason))) => {
                status.remarks = format!("{}: 运行中止 ({})", stage, reason);
                warn!("🛑 {} 在 {} 中止: {}", ctx, stage, reason);
                LotOutcome::Aborted { stage, reason }
            }
        };

        if let Err(e) = store.save(record.lot_id, &status) {
            error!("{} 保存检查点失败: {}", ctx, e);
            return Err(e.into());
        }
        self.channel.publish_event(EventRecord::StepReached {
            lot_id: Some(record.lot_id),
            step: LotStage::Recorded.to_string(),
        });

        Ok((status, outcome))
    }

    /// 依次推进各个状态；成功时返回参考号
    async fn drive(
        &self,
        record: &LotRecord,
        ctx: &LotCtx,
        status: &mut StatusVector,
        stage: &mut LotStage,
    ) -> Result<String, Stop> {
        let expected = record.expected_count;
        self.checkpoint(ctx, *stage).await?;

        // ========== 查询 ==========
        info!("{} 🔍 查询账号...", ctx);
        let fetched = match self.driver.fetch_accounts(&record.account_ids).await {
            Ok(0) => {
                status.fetch_status = Status::Fail;
                return Err(Stop::Failed(LotError::FetchFailure {
                    reason: "查询结果为空".to_string(),
                }));
            }
            Ok(count) => count,
            Err(e) => {
                status.fetch_status = Status::Fail;
                return Err(Stop::Failed(LotError::FetchFailure {
                    reason: e.to_string(),
                }));
            }
        };
        status.fetch_status = Status::Ok;
        *stage = LotStage::Fetched;
        self.pace(DelayKind::Short).await;
        self.checkpoint(ctx, *stage).await?;

        // ========== 数量核对 ==========
        info!("{} 门户结果 {} 个 | 期望 {} 个", ctx, fetched, expected);
        if fetched != expected {
            status.count_match = Status::Mismatch;
            return Err(Stop::Failed(LotError::CountMismatch {
                expected,
                actual: fetched,
            }));
        }
        status.count_match = Status::Ok;
        *stage = LotStage::CountVerified;
        self.checkpoint(ctx, *stage).await?;

        // ========== 到期日 ==========
        let month = self.today.format("%b %Y").to_string();
        info!("{} 📅 检查到期日 (应为 {})...", ctx, month);
        let due_dates = match self.driver.due_dates().await {
            Ok(rows) => rows,
            Err(e) => {
                status.due_date_check = Status::Fail;
                return Err(Stop::Failed(LotError::FetchFailure {
                    reason: format!("读取到期日失败: {}", e),
                }));
            }
        };
        let violations: Vec<String> = due_dates
            .iter()
            .filter(|row| !due_in_month(&row.due_date, self.today))
            .map(|row| {
                warn!("{}   {} → {}", ctx, row.account_id, row.due_date);
                row.account_id.clone()
            })
            .collect();
        if !violations.is_empty() {
            status.due_date_check = Status::Fail;
            return Err(Stop::Failed(LotError::DueDateViolation {
                month,
                accounts: violations,
            }));
        }
        status.due_date_check = Status::Ok;
        *stage = LotStage::DueDateVerified;
        self.pace(DelayKind::Short).await;
        self.checkpoint(ctx, *stage).await?;

        // ========== 勾选 ==========
        info!("{} ☑️ 勾选全部账号...", ctx);
        let selected = match self.select_all(expected).await {
            Ok(selected) => selected,
            Err(error) => {
                status.selected = Status::Fail;
                return Err(Stop::Failed(error));
            }
        };
        info!("{} 共勾选 {} 个", ctx, selected);
        status.selected = Status::Ok;
        *stage = LotStage::Selected;
        self.pace(DelayKind::Short).await;
        self.checkpoint(ctx, *stage).await?;

        // ========== 勾选核对 ==========
        let verified = match self.driver.selected_count().await {
            Ok(count) => count,
            Err(e) => {
                status.selection_verified = Status::Fail;
                return Err(Stop::Failed(LotError::SelectionUnverified {
                    reason: format!("已勾选 {} 个，复核读取失败: {}", selected, e),
                }));
            }
        };
        if verified != expected {
            status.selection_verified = Status::Mismatch;
            return Err(Stop::Failed(LotError::SelectionMismatch {
                selected: verified,
                expected,
            }));
        }
        status.selection_verified = Status::Ok;
        *stage = LotStage::SelectionVerified;
        self.checkpoint(ctx, *stage).await?;

        // ========== 保存 ==========
        info!("{} 💾 保存...", ctx);
        if let Err(e) = self.driver.save().await {
            status.save_status = Status::Fail;
            return Err(Stop::Failed(LotError::SaveFailure {
                reason: e.to_string(),
            }));
        }
        status.save_status = Status::Ok;
        *stage = LotStage::Saved;
        self.pace(DelayKind::Short).await;
        self.checkpoint(ctx, *stage).await?;

        // ========== 付款 ==========
        info!("{} 💳 Pay All Saved Installments...", ctx);
        let reference_id = match self.driver.pay_all().await {
            Ok(Some(reference_id)) if !reference_id.trim().is_empty() => {
                reference_id.trim().to_string()
            }
            Ok(_) => {
                status.pay_status = Status::Fail;
                return Err(Stop::Failed(LotError::PaymentFailure {
                    reason: "页面上没有参考号".to_string(),
                }));
            }
            Err(e) => {
                status.pay_status = Status::Fail;
                return Err(Stop::Failed(LotError::PaymentFailure {
                    reason: e.to_string(),
                }));
            }
        };
        status.pay_status = Status::Ok;
        status.reference_id = Some(reference_id.clone());
        *stage = LotStage::Paid;
        // 付款之后不再响应跳过或中止，先把结果记下来
        self.channel.publish_event(EventRecord::StepReached {
            lot_id: Some(ctx.lot_id),
            step: stage.to_string(),
        });

        Ok(reference_id)
    }

    /// 逐页勾选，最多翻 `PAGINATION_CAP` 页
    async fn select_all(&self, expected: u32) -> Result<u32, LotError> {
        let mismatch = |selected| LotError::SelectionMismatch { selected, expected };

        let mut selected = self.driver.select_page().await.map_err(|_| mismatch(0))?;
        let mut advances = 0;
        while selected < expected {
            if advances == PAGINATION_CAP {
                return Err(LotError::PaginationExceeded {
                    advances,
                    selected,
                    expected,
                });
            }
            match self.driver.next_page().await {
                Ok(true) => advances += 1,
                Ok(false) => break,
                Err(_) => return Err(mismatch(selected)),
            }
            selected += self
                .driver
                .select_page()
                .await
                .map_err(|_| mismatch(selected))?;
        }
        Ok(selected)
    }

    async fn checkpoint(&self, ctx: &LotCtx, stage: LotStage) -> Result<(), Interrupt> {
        self.boundary(Some(ctx), stage.as_str()).await
    }

    /// 检查点：发布进度、检查安全监控、处理控制信号
    ///
    /// 下载阶段也在每个回单之前经过这里。
    pub async fn boundary(&self, ctx: Option<&LotCtx>, step: &str) -> Result<(), Interrupt> {
        self.channel.publish_event(EventRecord::StepReached {
            lot_id: ctx.map(|c| c.lot_id),
            step: step.to_string(),
        });
        self.enforce_safety();

        let label = ctx.map(|c| c.to_string()).unwrap_or_default();
        loop {
            match self.channel.current_signal() {
                Some(ControlSignal::Abort) => {
                    return Err(Interrupt::Abort(HaltReason::OperatorAbort));
                }
                Some(ControlSignal::SkipCurrentLot) => return Err(Interrupt::Skip),
                Some(ControlSignal::Pause) => {
                    info!("⏸️ {} 已在 {} 暂停，等待继续...", label, step);
                    self.wait_while_paused(&label).await?;
                    info!("▶️ {} 继续执行", label);
                }
                _ => return Ok(()),
            }
        }
    }

    /// 暂停期间全局超时照常计时；超时则在此处中止
    async fn wait_while_paused(&self, label: &str) -> Result<(), Interrupt> {
        let paused_at = Instant::now();
        let mut next_warning = PAUSE_WARNING_EVERY;
        loop {
            if self.channel.wait_until_resumed(PAUSE_POLL).await {
                return Ok(());
            }
            if self.enforce_safety() == Some(HaltReason::GlobalTimeoutExceeded) {
                return Err(Interrupt::Abort(HaltReason::GlobalTimeoutExceeded));
            }
            if paused_at.elapsed() >= next_warning {
                warn!(
                    "⚠️ {} 已暂停 {} 分钟，仍在等待继续",
                    label,
                    paused_at.elapsed().as_secs() / 60
                );
                next_warning += PAUSE_WARNING_EVERY;
            }
        }
    }

    /// 检查安全监控；触发时登记有序退出
    pub fn enforce_safety(&self) -> Option<HaltReason> {
        self.safety.as_ref()?.enforce(&self.channel)
    }

    pub async fn pace(&self, kind: DelayKind) {
        tokio::time::sleep(self.channel.current_delays().duration(kind)).await;
    }
}
