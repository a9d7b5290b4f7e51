//! 控制通道 - 业务能力层
//!
//! 工作线程与操作员之间唯一的交汇点：
//! - 入站：暂停/继续/跳过/停止/中止、实时调整延迟、标记跳过某个 LOT
//! - 出站：事件流 + 实时概览（阶段、进度、内存、日志尾部、每个 LOT 的状态）
//!
//! 每种信号只保留最新值（单槽信箱）：暂停类信号后写覆盖前写，
//! 跳过当前 LOT 与中止只会被消费一次。工作线程只在检查点读取这些标志，
//! 从不在驱动调用中途被打断。

use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::info;

use crate::error::HaltReason;
use crate::models::{DelayConfig, DelayKind, LotId, Phase, StatusVector};

/// 日志尾部保留的行数
const LOG_TAIL_CAPACITY: usize = 80;

/// 事件广播缓冲区大小
const EVENT_BUFFER_SIZE: usize = 256;

/// 操作员控制信号
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlSignal {
    Pause,
    Resume,
    SkipCurrentLot,
    StopAfterCurrent,
    Abort,
    SetDelay(DelayKind, f64),
    ToggleLotSkip(LotId, bool),
}

/// 单个 LOT 的结局分类（用于计数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LotOutcomeKind {
    Done,
    Failed,
    Skipped,
    Interrupted,
}

/// 概览表中的一行
#[derive(Debug, Clone, Serialize)]
pub struct LotStatusRow {
    pub lot_id: LotId,
    pub expected_count: u32,
    pub status: StatusVector,
}

/// 出站事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventRecord {
    TableLoaded { lots: Vec<LotStatusRow> },
    PhaseStarted { phase: Phase, total: usize },
    LotStarted { lot_id: LotId, index: usize },
    StepReached { lot_id: Option<LotId>, step: String },
    LotFinished {
        lot_id: LotId,
        outcome: LotOutcomeKind,
        status: StatusVector,
    },
    MemorySample { memory_mb: f64 },
    Log { line: String },
    RunFinished { halted: Option<HaltReason> },
}

/// 只读的实时概览
#[derive(Debug, Clone, Serialize)]
pub struct LiveFeed {
    pub phase: String,
    pub lot_id: Option<LotId>,
    pub step: String,
    pub percent_complete: f64,
    pub memory_usage_mb: f64,
    pub elapsed_seconds: u64,
    pub lots_total: usize,
    pub lots_done: usize,
    pub lots_failed: usize,
    pub lots_skipped: usize,
    pub is_paused: bool,
    pub is_finished: bool,
    pub halted: Option<HaltReason>,
    pub delays: DelayConfig,
    pub skip_lots: Vec<LotId>,
    pub lot_statuses: Vec<LotStatusRow>,
    pub log_tail: Vec<String>,
}

#[derive(Debug, Default)]
struct FeedState {
    phase: Phase,
    phase_total: usize,
    phase_index: usize,
    lot_id: Option<LotId>,
    step: String,
    memory_mb: f64,
    lots_done: usize,
    lots_failed: usize,
    lots_skipped: usize,
    is_finished: bool,
    halted: Option<HaltReason>,
    lot_statuses: Vec<LotStatusRow>,
    log_tail: VecDeque<String>,
}

impl FeedState {
    fn apply(&mut self, event: &EventRecord) {
        match event {
            EventRecord::TableLoaded { lots } => self.lot_statuses = lots.clone(),
            EventRecord::PhaseStarted { phase, total } => {
                self.phase = *phase;
                self.phase_total = *total;
                self.phase_index = 0;
                self.lot_id = None;
                self.step.clear();
            }
            EventRecord::LotStarted { lot_id, index } => {
                self.lot_id = Some(*lot_id);
                self.phase_index = *index;
            }
            EventRecord::StepReached { lot_id, step } => {
                if lot_id.is_some() {
                    self.lot_id = *lot_id;
                }
                self.step = step.clone();
            }
            EventRecord::LotFinished {
                lot_id,
                outcome,
                status,
            } => {
                match outcome {
                    LotOutcomeKind::Done => self.lots_done += 1,
                    LotOutcomeKind::Failed | LotOutcomeKind::Interrupted => self.lots_failed += 1,
                    LotOutcomeKind::Skipped => self.lots_skipped += 1,
                }
                self.phase_index += 1;
                self.lot_id = None;
                if let Some(row) = self.lot_statuses.iter_mut().find(|r| r.lot_id == *lot_id) {
                    row.status = status.clone();
                }
            }
            EventRecord::MemorySample { memory_mb } => self.memory_mb = *memory_mb,
            EventRecord::Log { line } => {
                if self.log_tail.len() == LOG_TAIL_CAPACITY {
                    self.log_tail.pop_front();
                }
                self.log_tail.push_back(line.clone());
            }
            EventRecord::RunFinished { halted } => {
                self.is_finished = true;
                self.halted = *halted;
                self.phase = Phase::Finished;
            }
        }
    }

    fn percent_complete(&self) -> f64 {
        if self.phase_total == 0 {
            return 0.0;
        }
        (self.phase_index as f64 / self.phase_total as f64 * 100.0).min(100.0)
    }
}

/// 控制通道
pub struct ControlChannel {
    paused: watch::Sender<bool>,
    delays: watch::Sender<DelayConfig>,
    skip_current: AtomicBool,
    stop_after_current: AtomicBool,
    abort: AtomicBool,
    forced_halt: Mutex<Option<HaltReason>>,
    skip_lots: Mutex<BTreeSet<LotId>>,
    feed: Mutex<FeedState>,
    events: broadcast::Sender<EventRecord>,
    started_at: Instant,
}

impl ControlChannel {
    /// 创建新的控制通道（初始为运行状态）
    pub fn new(delays: DelayConfig) -> Self {
        let (paused, _) = watch::channel(false);
        let (delays, _) = watch::channel(delays);
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            paused,
            delays,
            skip_current: AtomicBool::new(false),
            stop_after_current: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            forced_halt: Mutex::new(None),
            skip_lots: Mutex::new(BTreeSet::new()),
            feed: Mutex::new(FeedState::default()),
            events,
            started_at: Instant::now(),
        }
    }

    // ========== 入站 ==========

    /// 接收一个操作员信号
    pub fn send(&self, signal: ControlSignal) {
        match signal {
            ControlSignal::Pause => {
                self.paused.send_replace(true);
            }
            ControlSignal::Resume => {
                self.paused.send_replace(false);
            }
            ControlSignal::SkipCurrentLot => {
                self.skip_current.store(true, Ordering::SeqCst);
                self.paused.send_replace(false);
            }
            ControlSignal::StopAfterCurrent => {
                self.stop_after_current.store(true, Ordering::SeqCst);
            }
            ControlSignal::Abort => {
                self.abort.store(true, Ordering::SeqCst);
                self.paused.send_replace(false);
            }
            ControlSignal::SetDelay(kind, value) => {
                let mut applied = value;
                self.delays.send_modify(|delays| applied = delays.set(kind, value));
                info!("⚙️ 延迟 {:?} 已调整为 {:.2} 秒", kind, applied);
            }
            ControlSignal::ToggleLotSkip(lot_id, skip) => {
                let mut skip_lots = lock(&self.skip_lots);
                if skip {
                    skip_lots.insert(lot_id);
                } else {
                    skip_lots.remove(&lot_id);
                }
            }
        }
    }

    /// 由安全监控强制要求有序退出（第一个原因生效）；返回是否为新设置
    pub fn force_halt(&self, reason: HaltReason) -> bool {
        let mut forced = lock(&self.forced_halt);
        if forced.is_none() {
            *forced = Some(reason);
            return true;
        }
        false
    }

    // ========== 工作线程读取 ==========

    /// 非阻塞读取当前待处理的信号
    ///
    /// 优先级：中止 > 跳过当前 LOT > 暂停 > 处理完当前后停止。
    /// 中止与跳过在这里被消费。
    pub fn current_signal(&self) -> Option<ControlSignal> {
        if self.abort.swap(false, Ordering::SeqCst) {
            return Some(ControlSignal::Abort);
        }
        if self.skip_current.swap(false, Ordering::SeqCst) {
            return Some(ControlSignal::SkipCurrentLot);
        }
        if self.is_paused() {
            return Some(ControlSignal::Pause);
        }
        if self.stop_after_current.load(Ordering::SeqCst) {
            return Some(ControlSignal::StopAfterCurrent);
        }
        None
    }

    /// 新的 LOT 开始：丢弃针对上一个 LOT、但来不及生效的跳过请求
    pub fn begin_lot(&self) {
        if self.skip_current.swap(false, Ordering::SeqCst) {
            info!("上一个 LOT 已结束，忽略迟到的跳过请求");
        }
    }

    /// LOT 之间消费待处理的中止
    pub fn take_abort(&self) -> bool {
        self.abort.swap(false, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// 等待继续信号，最多等待 `max`；返回是否已经不再暂停
    pub async fn wait_until_resumed(&self, max: Duration) -> bool {
        let mut rx = self.paused.subscribe();
        let resumed = matches!(
            tokio::time::timeout(max, rx.wait_for(|paused| !*paused)).await,
            Ok(Ok(_))
        );
        resumed || !self.is_paused()
    }

    /// 是否有待执行的有序退出（安全监控优先于操作员的停止请求）
    pub fn halt_requested(&self) -> Option<HaltReason> {
        if let Some(reason) = *lock(&self.forced_halt) {
            return Some(reason);
        }
        if self.stop_after_current.load(Ordering::SeqCst) {
            return Some(HaltReason::OperatorStop);
        }
        None
    }

    /// 该 LOT 是否被操作员标记为跳过
    pub fn is_lot_skipped(&self, lot_id: LotId) -> bool {
        lock(&self.skip_lots).contains(&lot_id)
    }

    /// 当前延迟（总是最新值）
    pub fn current_delays(&self) -> DelayConfig {
        *self.delays.borrow()
    }

    /// 订阅延迟变化（驱动层使用）
    pub fn delay_watch(&self) -> watch::Receiver<DelayConfig> {
        self.delays.subscribe()
    }

    // ========== 出站 ==========

    /// 发布事件（发后不管）
    pub fn publish_event(&self, event: EventRecord) {
        lock(&self.feed).apply(&event);
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(event);
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    /// 当前实时概览
    pub fn snapshot(&self) -> LiveFeed {
        let delays = self.current_delays();
        let is_paused = self.is_paused();
        let skip_lots = lock(&self.skip_lots).iter().copied().collect();
        let feed = lock(&self.feed);
        LiveFeed {
            phase: feed.phase.to_string(),
            lot_id: feed.lot_id,
            step: feed.step.clone(),
            percent_complete: feed.percent_complete(),
            memory_usage_mb: (feed.memory_mb * 10.0).round() / 10.0,
            elapsed_seconds: self.started_at.elapsed().as_secs(),
            lots_total: feed.lot_statuses.len(),
            lots_done: feed.lots_done,
            lots_failed: feed.lots_failed,
            lots_skipped: feed.lots_skipped,
            is_paused,
            is_finished: feed.is_finished,
            halted: feed.halted,
            delays,
            skip_lots,
            lot_statuses: feed.lot_statuses.clone(),
            log_tail: feed.log_tail.iter().cloned().collect(),
        }
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new(DelayConfig::default())
    }
}

/// 取锁；持锁线程 panic 后仍继续使用内部数据
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_signals_are_consumed_once() {
        let channel = ControlChannel::default();
        channel.send(ControlSignal::SkipCurrentLot);
        assert_eq!(channel.current_signal(), Some(ControlSignal::SkipCurrentLot));
        assert_eq!(channel.current_signal(), None);

        channel.send(ControlSignal::Abort);
        channel.send(ControlSignal::Abort);
        assert_eq!(channel.current_signal(), Some(ControlSignal::Abort));
        assert_eq!(channel.current_signal(), None);
    }

    #[test]
    fn begin_lot_drops_stale_skip_but_keeps_abort() {
        let channel = ControlChannel::default();
        channel.send(ControlSignal::SkipCurrentLot);
        channel.send(ControlSignal::Abort);
        channel.begin_lot();
        assert!(channel.take_abort());
        assert!(!channel.take_abort());
        assert_eq!(channel.current_signal(), None);
    }

    #[test]
    fn finished_lot_is_no_longer_current() {
        let channel = ControlChannel::default();
        channel.publish_event(EventRecord::LotStarted { lot_id: 3, index: 0 });
        assert_eq!(channel.snapshot().lot_id, Some(3));
        channel.publish_event(EventRecord::LotFinished {
            lot_id: 3,
            outcome: LotOutcomeKind::Done,
            status: StatusVector::default(),
        });
        assert_eq!(channel.snapshot().lot_id, None);
    }

    #[test]
    fn pause_is_last_writer_wins() {
        let channel = ControlChannel::default();
        channel.send(ControlSignal::Pause);
        channel.send(ControlSignal::Pause);
        assert_eq!(channel.current_signal(), Some(ControlSignal::Pause));
        assert_eq!(channel.current_signal(), Some(ControlSignal::Pause));
        channel.send(ControlSignal::Resume);
        assert_eq!(channel.current_signal(), None);
    }

    #[test]
    fn skip_and_abort_release_pause() {
        let channel = ControlChannel::default();
        channel.send(ControlSignal::Pause);
        channel.send(ControlSignal::SkipCurrentLot);
        assert!(!channel.is_paused());

        channel.send(ControlSignal::Pause);
        channel.send(ControlSignal::Abort);
        assert!(!channel.is_paused());
    }

    #[test]
    fn stop_after_current_is_sticky() {
        let channel = ControlChannel::default();
        channel.send(ControlSignal::StopAfterCurrent);
        assert_eq!(channel.current_signal(), Some(ControlSignal::StopAfterCurrent));
        assert_eq!(channel.current_signal(), Some(ControlSignal::StopAfterCurrent));
        assert_eq!(channel.halt_requested(), Some(HaltReason::OperatorStop));
    }

    #[test]
    fn forced_halt_takes_precedence_and_first_reason_wins() {
        let channel = ControlChannel::default();
        channel.send(ControlSignal::StopAfterCurrent);
        assert!(channel.force_halt(HaltReason::MemoryLimitExceeded));
        assert!(!channel.force_halt(HaltReason::GlobalTimeoutExceeded));
        assert_eq!(channel.halt_requested(), Some(HaltReason::MemoryLimitExceeded));
    }

    #[test]
    fn set_delay_is_visible_immediately() {
        let channel = ControlChannel::default();
        let watcher = channel.delay_watch();
        channel.send(ControlSignal::SetDelay(DelayKind::Long, 9.5));
        channel.send(ControlSignal::SetDelay(DelayKind::Checkbox, 0.0));
        assert_eq!(channel.current_delays().long, 9.5);
        assert_eq!(channel.current_delays().checkbox, 0.05);
        assert_eq!(watcher.borrow().long, 9.5);
    }

    #[test]
    fn toggle_lot_skip_sets_explicit_value() {
        let channel = ControlChannel::default();
        channel.send(ControlSignal::ToggleLotSkip(4, true));
        assert!(channel.is_lot_skipped(4));
        channel.send(ControlSignal::ToggleLotSkip(4, false));
        assert!(!channel.is_lot_skipped(4));
    }

    #[test]
    fn snapshot_counts_outcomes_and_keeps_log_tail_bounded() {
        let channel = ControlChannel::default();
        channel.publish_event(EventRecord::TableLoaded {
            lots: vec![
                LotStatusRow {
                    lot_id: 1,
                    expected_count: 2,
                    status: StatusVector::default(),
                },
                LotStatusRow {
                    lot_id: 2,
                    expected_count: 3,
                    status: StatusVector::default(),
                },
            ],
        });
        channel.publish_event(EventRecord::PhaseStarted {
            phase: Phase::Pay,
            total: 2,
        });
        channel.publish_event(EventRecord::LotStarted { lot_id: 1, index: 0 });
        channel.publish_event(EventRecord::LotFinished {
            lot_id: 1,
            outcome: LotOutcomeKind::Done,
            status: StatusVector {
                remarks: "成功".into(),
                ..Default::default()
            },
        });
        for i in 0..100 {
            channel.publish_event(EventRecord::Log {
                line: format!("line {}", i),
            });
        }

        let feed = channel.snapshot();
        assert_eq!(feed.lots_total, 2);
        assert_eq!(feed.lots_done, 1);
        assert_eq!(feed.percent_complete, 50.0);
        assert_eq!(feed.lot_statuses[0].status.remarks, "成功");
        assert_eq!(feed.log_tail.len(), LOG_TAIL_CAPACITY);
        assert_eq!(feed.log_tail.last().map(String::as_str), Some("line 99"));
    }

    #[tokio::test]
    async fn wait_until_resumed_returns_on_resume() {
        let channel = std::sync::Arc::new(ControlChannel::default());
        channel.send(ControlSignal::Pause);
        assert!(!channel.wait_until_resumed(Duration::from_millis(10)).await);

        let resumer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resumer.send(ControlSignal::Resume);
        });
        assert!(channel.wait_until_resumed(Duration::from_secs(5)).await);
    }
}
