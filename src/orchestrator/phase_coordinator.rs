//! 阶段编排器 - 编排层
//!
//! ## 职责
//!
//! 按顺序驱动三个阶段，每个 LOT 之后都落盘：
//!
//! 1. **付款**：按输入顺序处理选中的 LOT，已付款或被标记跳过的直接略过
//! 2. **下载回单**：需要操作员确认后才开始；每个已付款 LOT 下载 `<lot>_<ref>.pdf`
//! 3. **合并回单**：委托 `ReceiptMerger`
//!
//! 单个 LOT 的失败只记到 Remarks 里；安全监控或操作员要求的停止在 LOT 之间生效。

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::LotSelection;
use crate::error::{AppError, AppResult, HaltReason, LotError};
use crate::models::{DelayKind, LotId, LotRecord, Phase, RunState, StatusVector};
use crate::services::{
    CheckpointStore, ControlChannel, EventRecord, LotOutcomeKind, LotStatusRow, MergeReport,
    OperatorPrompt, PortalDriver, ReceiptMerger, SafetyMonitor,
};
use crate::utils::logging::{
    log_halt, log_phase_complete, log_phase_start, log_resume_summary, print_final_stats,
};
use crate::workflow::{Interrupt, LotCtx, LotOutcome, UnitProcessor};

/// 本次运行的统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// 本次付款成功的 LOT
    pub paid: Vec<LotId>,
    pub failed: Vec<LotId>,
    /// 操作员跳过（信号或标记）
    pub skipped: Vec<LotId>,
    /// 上次运行已付款，本次略过
    pub already_paid: Vec<LotId>,
    pub downloaded: Vec<LotId>,
    pub download_failed: Vec<LotId>,
    pub merge: Option<MergeReport>,
    /// 有序退出的原因
    pub halted: Option<HaltReason>,
}

/// 阶段编排器
pub struct PhaseCoordinator {
    store: CheckpointStore,
    driver: Arc<dyn PortalDriver>,
    channel: Arc<ControlChannel>,
    safety: Option<Arc<SafetyMonitor>>,
    prompt: Arc<dyn OperatorPrompt>,
    merger: ReceiptMerger,
    selection: LotSelection,
    state: RunState,
    processor: UnitProcessor,
}

impl PhaseCoordinator {
    pub fn new(
        store: CheckpointStore,
        driver: Arc<dyn PortalDriver>,
        channel: Arc<ControlChannel>,
        safety: Option<Arc<SafetyMonitor>>,
        prompt: Arc<dyn OperatorPrompt>,
        merger: ReceiptMerger,
    ) -> Self {
        let processor = UnitProcessor::new(driver.clone(), channel.clone(), safety.clone());
        Self {
            store,
            driver,
            channel,
            safety,
            prompt,
            merger,
            selection: LotSelection::All,
            state: RunState::new(),
            processor,
        }
    }

    /// 只处理选中的 LOT（付款阶段）
    pub fn with_selection(mut self, selection: LotSelection) -> Self {
        self.selection = selection;
        self
    }

    /// 指定到期日校验使用的日期
    pub fn with_today(mut self, today: chrono::NaiveDate) -> Self {
        self.processor = self.processor.with_today(today);
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// 运行全部阶段
    ///
    /// 只有检查点写入失败才返回 Err；其余问题都体现在 `RunReport` 里。
    pub async fn run(&mut self) -> AppResult<RunReport> {
        let mut report = RunReport::default();

        self.channel.publish_event(EventRecord::TableLoaded {
            lots: self
                .store
                .records()
                .iter()
                .map(|r| LotStatusRow {
                    lot_id: r.lot_id,
                    expected_count: r.expected_count,
                    status: r.status.clone(),
                })
                .collect(),
        });
        log_resume_summary(self.store.records());

        self.run_pay_phase(&mut report).await?;

        if report.halted.is_none() {
            self.run_post_payment(&mut report).await?;
        }

        if let Some(reason) = report.halted {
            log_halt(&reason.to_string());
        }

        info!(
            "⏱️ 用时 {} 秒 | 内存峰值 {:.0} MB",
            self.state.elapsed().as_secs(),
            self.state.peak_memory_mb
        );
        self.state.enter_phase(Phase::Finished, 0);
        self.channel.publish_event(EventRecord::RunFinished {
            halted: report.halted,
        });
        print_final_stats(
            report.paid.len(),
            report.failed.len(),
            report.downloaded.len(),
            &self.store.csv_path().display().to_string(),
        );

        Ok(report)
    }

    // ========== 阶段 1: 付款 ==========

    async fn run_pay_phase(&mut self, report: &mut RunReport) -> AppResult<()> {
        let work: Vec<LotRecord> = self
            .store
            .records()
            .iter()
            .filter(|r| self.selection.contains(r.lot_id))
            .cloned()
            .collect();
        let total = work.len();

        self.enter_phase(Phase::Pay, total);

        for (index, record) in work.iter().enumerate() {
            if let Some(reason) = self.halt_before_next() {
                report.halted = Some(reason);
                break;
            }

            self.state.current_index = index;
            self.state.current_lot = Some(record.lot_id);
            let ctx = LotCtx::new(record, index, total);

            if self.store.is_resumable(record.lot_id, Phase::Pay) {
                info!("⏭️ {} 已付款，跳过", ctx);
                report.already_paid.push(record.lot_id);
                self.publish_finished(record.lot_id, LotOutcomeKind::Skipped, &record.status);
                continue;
            }
            if self.channel.is_lot_skipped(record.lot_id) {
                info!("⏭️ {} 已被操作员标记跳过", ctx);
                report.skipped.push(record.lot_id);
                self.publish_finished(record.lot_id, LotOutcomeKind::Skipped, &record.status);
                continue;
            }

            self.channel.publish_event(EventRecord::LotStarted {
                lot_id: record.lot_id,
                index,
            });
            debug!("付款阶段进度 {:.0}%", self.state.percent_complete());

            self.channel.begin_lot();
            let (status, outcome) = self.processor.run(record, &ctx, &mut self.store).await?;
            if outcome.started() {
                self.publish_finished(record.lot_id, outcome.kind(), &status);
            }

            match &outcome {
                LotOutcome::Paid { .. } => report.paid.push(record.lot_id),
                LotOutcome::Failed { .. } => report.failed.push(record.lot_id),
                LotOutcome::Skipped { .. } => report.skipped.push(record.lot_id),
                LotOutcome::Aborted { .. } => {}
            }

            if let Some(reason) = outcome
                .halt_reason()
                .or_else(|| self.channel.halt_requested())
            {
                report.halted = Some(reason);
                break;
            }

            if index + 1 < total {
                self.processor.pace(DelayKind::Long).await;
            }
        }

        log_phase_complete(
            Phase::Pay,
            report.paid.len(),
            report.failed.len(),
            report.skipped.len() + report.already_paid.len(),
        );
        Ok(())
    }

    // ========== 阶段 2 + 3 ==========

    async fn run_post_payment(&mut self, report: &mut RunReport) -> AppResult<()> {
        let paid = self
            .store
            .records()
            .iter()
            .filter(|r| r.status.is_paid())
            .count();
        if paid == 0 {
            info!("没有带参考号的 LOT，跳过下载阶段");
            return Ok(());
        }

        info!("💡 {} 个 LOT 已有参考号，可以下载回单", paid);
        if !self.prompt.confirm("开始阶段 2（下载回单）?").await {
            info!("操作员选择不下载回单");
            return Ok(());
        }

        self.run_download_phase(report).await?;
        if report.halted.is_none() {
            self.run_merge_phase(report);
        }
        Ok(())
    }

    async fn run_download_phase(&mut self, report: &mut RunReport) -> AppResult<()> {
        let work: Vec<LotRecord> = self
            .store
            .records()
            .iter()
            .filter(|r| r.status.is_paid())
            .cloned()
            .collect();
        let total = work.len();

        self.enter_phase(Phase::Download, total);

        let dir = self.store.download_dir().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| AppError::io(dir.display().to_string(), e))?;

        if let Err(e) = self.driver.open_reports().await {
            warn!("⚠️ 无法自动打开报表页面: {}", e);
            self.prompt
                .wait_for_enter("请手动打开 Reports 页面后按回车继续...")
                .await;
        }

        let mut already_downloaded = 0;
        for (index, record) in work.iter().enumerate() {
            if let Some(reason) = self.halt_before_next() {
                report.halted = Some(reason);
                break;
            }

            self.state.current_index = index;
            self.state.current_lot = Some(record.lot_id);
            let ctx = LotCtx::new(record, index, total);

            self.channel.begin_lot();
            match self.processor.boundary(Some(&ctx), "Download").await {
                Ok(()) => {}
                Err(Interrupt::Skip) => {
                    info!("⏭️ {} 跳过下载", ctx);
                    self.publish_finished(record.lot_id, LotOutcomeKind::Skipped, &record.status);
                    continue;
                }
                Err(Interrupt::Abort(reason)) => {
                    report.halted = Some(reason);
                    break;
                }
            }

            let (Some(reference_id), Some(file_name)) =
                (record.status.reference_id.as_deref(), record.receipt_file_name())
            else {
                continue;
            };

            if self.store.is_resumable(record.lot_id, Phase::Download) {
                info!("⏭️ {} 回单已存在: {}", ctx, file_name);
                already_downloaded += 1;
                self.publish_finished(record.lot_id, LotOutcomeKind::Done, &record.status);
                continue;
            }

            info!("{} 📥 下载回单 (参考号 {})...", ctx, reference_id);
            match self
                .driver
                .download_receipt(reference_id, &dir.join(&file_name))
                .await
            {
                Ok(()) => {
                    info!("✅ {} 已保存: {}", ctx, file_name);
                    report.downloaded.push(record.lot_id);
                    self.publish_finished(record.lot_id, LotOutcomeKind::Done, &record.status);
                }
                Err(e) => {
                    let failure = LotError::DownloadFailure {
                        reason: e.to_string(),
                    };
                    warn!("❌ {} {}", ctx, failure);
                    let mut status = record.status.clone();
                    append_remark(&mut status, &format!("Download: {}", failure));
                    if let Err(e) = self.store.save(record.lot_id, &status) {
                        error!("{} 保存检查点失败: {}", ctx, e);
                        return Err(e.into());
                    }
                    report.download_failed.push(record.lot_id);
                    self.publish_finished(record.lot_id, LotOutcomeKind::Failed, &status);
                }
            }

            if index + 1 < total {
                self.processor.pace(DelayKind::Medium).await;
            }
        }

        log_phase_complete(
            Phase::Download,
            report.downloaded.len(),
            report.download_failed.len(),
            already_downloaded,
        );
        Ok(())
    }

    fn run_merge_phase(&mut self, report: &mut RunReport) {
        self.enter_phase(Phase::Merge, 1);

        match self
            .merger
            .merge(self.store.download_dir(), self.store.records())
        {
            Ok(merge) => {
                for (lot_id, reason) in &merge.skipped {
                    info!("  [LOT {}] 未合并: {:?}", lot_id, reason);
                }
                report.merge = Some(merge);
            }
            // 合并失败不影响已经保存的回单
            Err(e) => warn!("⚠️ 合并回单失败: {}", e),
        }
    }

    // ========== 辅助 ==========

    fn enter_phase(&mut self, phase: Phase, total: usize) {
        self.state.enter_phase(phase, total);
        self.channel.begin_lot();
        log_phase_start(phase, total);
        self.channel
            .publish_event(EventRecord::PhaseStarted { phase, total });
    }

    /// LOT 之间：先检查安全监控，再看是否有待执行的停止
    fn halt_before_next(&mut self) -> Option<HaltReason> {
        if self.channel.take_abort() {
            return Some(HaltReason::OperatorAbort);
        }
        self.processor.enforce_safety();
        if let Some(safety) = &self.safety {
            self.state.observe_memory(safety.last_memory_mb());
        }
        self.channel.halt_requested()
    }

    fn publish_finished(&self, lot_id: LotId, outcome: LotOutcomeKind, status: &StatusVector) {
        self.channel.publish_event(EventRecord::LotFinished {
            lot_id,
            outcome,
            status: status.clone(),
        });
    }
}

/// 追加一条备注（保留之前的内容）
fn append_remark(status: &mut StatusVector, remark: &str) {
    if status.remarks.is_empty() {
        status.remarks = remark.to_string();
    } else {
        status.remarks = format!("{} | {}", status.remarks, remark);
    }
}
