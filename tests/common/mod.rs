//! 集成测试共用的假门户、假 PDF 工具与假确认

#![allow(dead_code)]

use async_trait::async_trait;
use dop_rd_automate::error::{AppError, AppResult, BrowserError, ReceiptError};
use dop_rd_automate::models::{LotRecord, Status};
use dop_rd_automate::services::{
    AccountDueDate, CheckpointStore, MemoryProbe, OperatorPrompt, PdfToolkit, PortalDriver,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// 一个 LOT 在门户上的表现
#[derive(Clone, Debug)]
pub struct LotScript {
    /// 查询结果总数（None 表示查询报错）
    pub fetch_count: Option<u32>,
    pub due_date: String,
    /// 每页能勾选的数量；翻完后 `next_page` 返回 false
    pub pages: Vec<u32>,
    /// 无论如何都有下一页（用于翻页上限测试）
    pub endless_pages: bool,
    /// 复核勾选数量时报错
    pub recount_fails: bool,
    pub save_fails: bool,
    /// 付款结果：Ok(Some) 成功，Ok(None) 无参考号，Err 报错
    pub pay: Result<Option<String>, String>,
    pub download_fails: bool,
}

impl LotScript {
    /// 一切正常：一页勾完，付款得到 `reference_id`
    pub fn happy(count: u32, reference_id: &str) -> Self {
        Self {
            fetch_count: Some(count),
            due_date: "15-Oct-2026".to_string(),
            pages: vec![count],
            endless_pages: false,
            recount_fails: false,
            save_fails: false,
            pay: Ok(Some(reference_id.to_string())),
            download_fails: false,
        }
    }
}

type Hook = Box<dyn FnMut() + Send>;

/// 按脚本回答的门户；以 LOT 的第一个账号识别当前 LOT
#[derive(Default)]
pub struct MockPortal {
    scripts: HashMap<String, LotScript>,
    state: Mutex<PortalState>,
    hooks: Mutex<Vec<(String, Hook)>>,
}

#[derive(Default)]
struct PortalState {
    current: Option<String>,
    page: usize,
    selected: u32,
    calls: Vec<String>,
}

impl MockPortal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为第一个账号为 `first_account` 的 LOT 设置脚本
    pub fn script(mut self, first_account: &str, script: LotScript) -> Self {
        self.scripts.insert(first_account.to_string(), script);
        self
    }

    /// 某次调用（例如 `pay:A1`）发生时执行一次 `hook`
    pub fn on(&self, call: &str, hook: impl FnMut() + Send + 'static) {
        self.hooks
            .lock()
            .unwrap()
            .push((call.to_string(), Box::new(hook)));
    }

    /// 全部调用记录，例如 `fetch:A1`、`select:A1`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    /// 涉及某个 LOT（以第一个账号标识）的调用
    pub fn calls_for(&self, first_account: &str) -> Vec<String> {
        let suffix = format!(":{}", first_account);
        self.calls()
            .into_iter()
            .filter(|c| c.ends_with(&suffix))
            .collect()
    }

    fn record(&self, name: &str) -> (String, LotScript) {
        let (call, current) = {
            let mut state = self.state.lock().unwrap();
            let current = state.current.clone().unwrap_or_default();
            let call = format!("{}:{}", name, current);
            state.calls.push(call.clone());
            (call, current)
        };

        let mut hooks = self.hooks.lock().unwrap();
        if let Some(index) = hooks.iter().position(|(c, _)| *c == call) {
            let (_, mut hook) = hooks.remove(index);
            hook();
        }

        let script = self
            .scripts
            .get(&current)
            .cloned()
            .unwrap_or_else(|| LotScript::happy(1, "UNSCRIPTED"));
        (call, script)
    }
}

fn portal_error(reason: &str) -> AppError {
    AppError::element_not_found(reason)
}

#[async_trait]
impl PortalDriver for MockPortal {
    async fn fetch_accounts(&self, account_ids: &[String]) -> AppResult<u32> {
        {
            let mut state = self.state.lock().unwrap();
            state.current = account_ids.first().cloned();
            state.page = 0;
            state.selected = 0;
        }
        let (_, script) = self.record("fetch");
        script
            .fetch_count
            .ok_or_else(|| portal_error("Fetch 按钮"))
    }

    async fn due_dates(&self) -> AppResult<Vec<AccountDueDate>> {
        let (_, script) = self.record("due_dates");
        let current = self.state.lock().unwrap().current.clone().unwrap_or_default();
        Ok(vec![AccountDueDate {
            account_id: current,
            due_date: script.due_date,
        }])
    }

    async fn select_page(&self) -> AppResult<u32> {
        let (_, script) = self.record("select");
        let mut state = self.state.lock().unwrap();
        let on_page = if script.endless_pages {
            0
        } else {
            script.pages.get(state.page).copied().unwrap_or(0)
        };
        state.selected += on_page;
        Ok(on_page)
    }

    async fn next_page(&self) -> AppResult<bool> {
        let (_, script) = self.record("next");
        let mut state = self.state.lock().unwrap();
        if script.endless_pages || state.page + 1 < script.pages.len() {
            state.page += 1;
            return Ok(true);
        }
        Ok(false)
    }

    async fn selected_count(&self) -> AppResult<u32> {
        let (_, script) = self.record("selected_count");
        if script.recount_fails {
            return Err(portal_error("已勾选计数"));
        }
        Ok(self.state.lock().unwrap().selected)
    }

    async fn save(&self) -> AppResult<()> {
        let (_, script) = self.record("save");
        if script.save_fails {
            return Err(portal_error("Save 按钮"));
        }
        Ok(())
    }

    async fn pay_all(&self) -> AppResult<Option<String>> {
        let (_, script) = self.record("pay");
        script.pay.map_err(|reason| portal_error(&reason))
    }

    async fn open_reports(&self) -> AppResult<()> {
        self.state.lock().unwrap().current = None;
        self.record("open_reports");
        Ok(())
    }

    async fn download_receipt(&self, reference_id: &str, target: &Path) -> AppResult<()> {
        let failing = self
            .scripts
            .values()
            .any(|s| s.download_fails && s.pay == Ok(Some(reference_id.to_string())));
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("download:{}", reference_id));
        }
        if failing {
            return Err(AppError::Browser(BrowserError::DownloadTimeout {
                dir: target.display().to_string(),
                secs: 30,
            }));
        }
        fs::write(target, b"%PDF-mock").map_err(|e| AppError::io(target.display().to_string(), e))
    }
}

/// 页数按文件名给出（默认 1 页），合并时记录输入并写出目标文件
#[derive(Default)]
pub struct MockPdfToolkit {
    pub pages: HashMap<String, usize>,
    pub merged: Mutex<Vec<Vec<PathBuf>>>,
}

impl MockPdfToolkit {
    pub fn with_pages(pages: &[(&str, usize)]) -> Self {
        Self {
            pages: pages.iter().map(|(n, p)| (n.to_string(), *p)).collect(),
            merged: Mutex::new(Vec::new()),
        }
    }
}

impl PdfToolkit for MockPdfToolkit {
    fn page_count(&self, path: &Path) -> Result<usize, ReceiptError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(self.pages.get(&name).copied().unwrap_or(1))
    }

    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ReceiptError> {
        self.merged.lock().unwrap().push(inputs.to_vec());
        fs::write(output, b"%PDF-merged").unwrap();
        Ok(())
    }
}

/// 固定回答的操作员
pub struct ScriptedPrompt {
    pub answer: bool,
}

#[async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn confirm(&self, _question: &str) -> bool {
        self.answer
    }

    async fn wait_for_enter(&self, _message: &str) {}
}

/// 可在测试中调整的内存读数
pub struct AdjustableProbe(pub AtomicU64);

impl AdjustableProbe {
    pub fn new(memory_mb: u64) -> Self {
        Self(AtomicU64::new(memory_mb))
    }

    pub fn set(&self, memory_mb: u64) {
        self.0.store(memory_mb, Ordering::SeqCst);
    }
}

impl MemoryProbe for AdjustableProbe {
    fn resident_mb(&self) -> Option<f64> {
        Some(self.0.load(Ordering::SeqCst) as f64)
    }
}

/// LOT n 的账号为 `A{n}`、`A{n}-2`...，数量为 `count`
pub fn lot(lot_id: u32, count: u32) -> LotRecord {
    let mut accounts = vec![format!("A{}", lot_id)];
    for i in 2..=count {
        accounts.push(format!("A{}-{}", lot_id, i));
    }
    LotRecord::new(lot_id, accounts, count).unwrap()
}

/// 已付款的 LOT
pub fn paid_lot(lot_id: u32, count: u32, reference_id: &str) -> LotRecord {
    let mut record = lot(lot_id, count);
    record.status.fetch_status = Status::Ok;
    record.status.count_match = Status::Ok;
    record.status.due_date_check = Status::Ok;
    record.status.selected = Status::Ok;
    record.status.selection_verified = Status::Ok;
    record.status.save_status = Status::Ok;
    record.status.pay_status = Status::Ok;
    record.status.reference_id = Some(reference_id.to_string());
    record
}

/// 在临时目录里建一个检查点存储
pub fn store_in(dir: &Path, records: Vec<LotRecord>) -> CheckpointStore {
    CheckpointStore::from_records(
        records,
        dir.join("RD_Session.csv"),
        dir.join("RD_Session.xlsx"),
        dir.join("receipts"),
    )
}
