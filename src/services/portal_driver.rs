//! 门户驱动 - 业务能力层
//!
//! `PortalDriver` 描述"门户上能做的每一个动作"，不关心 LOT 流程顺序。
//! `ChromiumPortal` 通过 `JsExecutor` 在已登录的页面上执行这些动作。

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, BrowserError};
use crate::infrastructure::JsExecutor;
use crate::models::{DelayConfig, DelayKind};

/// 单次选择中最多翻页次数
pub const PAGINATION_CAP: u32 = 10;

/// 等待页面元素出现的上限
const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// 等待回单下载完成的上限
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// 结果表中一行的账号与到期日
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountDueDate {
    pub account_id: String,
    /// 门户原文，例如 `15-Oct-2026`
    pub due_date: String,
}

/// 门户动作
#[async_trait]
pub trait PortalDriver: Send + Sync {
    /// 输入账号并查询，返回门户显示的结果总数
    async fn fetch_accounts(&self, account_ids: &[String]) -> AppResult<u32>;
    /// 所有结果行的到期日（读完后回到第一页）
    async fn due_dates(&self) -> AppResult<Vec<AccountDueDate>>;
    /// 勾选当前页全部账号，返回本页勾选数
    async fn select_page(&self) -> AppResult<u32>;
    /// 翻到下一页；没有下一页时返回 false
    async fn next_page(&self) -> AppResult<bool>;
    /// 重新读取已勾选数量
    async fn selected_count(&self) -> AppResult<u32>;
    async fn save(&self) -> AppResult<()>;
    /// 付款，返回页面上的参考号（读不到时为 None）
    async fn pay_all(&self) -> AppResult<Option<String>>;
    /// 打开回单报表页面
    async fn open_reports(&self) -> AppResult<()>;
    /// 按参考号搜索并下载回单，保存为 `target`
    async fn download_receipt(&self, reference_id: &str, target: &Path) -> AppResult<()>;
}

// ========== 页面文本解析 ==========

/// 解析 `Displaying 1 - 7 of 7 results` → (1, 7, 7)
pub fn parse_display_count(text: &str) -> Option<(u32, u32, u32)> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"Displaying\s+(\d+)\s*-\s*(\d+)\s+of\s+(\d+)").ok())
        .as_ref()?;
    let caps = re.captures(text)?;
    Some((
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

/// 解析 `Page 1 of 16` → 16
pub fn parse_total_pages(text: &str) -> Option<u32> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"Page\s+\d+\s+of\s+(\d+)").ok())
        .as_ref()?;
    re.captures(text)?[1].parse().ok()
}

/// 从付款成功提示中提取参考号
///
/// `Payment successful. Your payment reference number is C320461082.` → `C320461082`
pub fn parse_reference_id(text: &str) -> Option<String> {
    static PRIMARY: OnceLock<Option<Regex>> = OnceLock::new();
    static FALLBACK: OnceLock<Option<Regex>> = OnceLock::new();
    let primary = PRIMARY
        .get_or_init(|| Regex::new(r"(?i)reference\s+number\s+is\s+([A-Za-z0-9]+)").ok())
        .as_ref()?;
    if let Some(caps) = primary.captures(text) {
        return Some(caps[1].to_string());
    }
    let fallback = FALLBACK
        .get_or_init(|| Regex::new(r"([A-Z]\d{6,})").ok())
        .as_ref()?;
    fallback.captures(text).map(|caps| caps[1].to_string())
}

// ========== JS 片段 ==========

/// 所有片段共用的 XPath 辅助函数
const JS_PRELUDE: &str = r#"
const $x = (xp, ctx) => document.evaluate(xp, ctx || document, null,
    XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
const $xa = (xp, ctx) => {
    const snap = document.evaluate(xp, ctx || document, null,
        XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
    const out = [];
    for (let i = 0; i < snap.snapshotLength; i++) out.push(snap.snapshotItem(i));
    return out;
};
const pagerLink = (label) => {
    const info = $x("//*[contains(text(), 'Page') and contains(text(), 'of')]");
    if (!info) return null;
    const parent = info.parentElement;
    const xp = ".//a[normalize-space(text())='" + label + "']";
    return $x(xp, parent) || (parent.parentElement && $x(xp, parent.parentElement));
};
"#;

fn js(body: &str) -> String {
    format!("(() => {{ {JS_PRELUDE}\n{body} }})()")
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

const DATA_CHECKBOXES: &str = "//table//td//input[@type='checkbox']";

/// 基于 chromiumoxide 的门户驱动
pub struct ChromiumPortal {
    executor: JsExecutor,
    delays: watch::Receiver<DelayConfig>,
    /// 之前各页已勾选的数量（查询时清零）
    selected_on_previous_pages: AtomicU32,
}

impl ChromiumPortal {
    pub fn new(executor: JsExecutor, delays: watch::Receiver<DelayConfig>) -> Self {
        Self {
            executor,
            delays,
            selected_on_previous_pages: AtomicU32::new(0),
        }
    }

    /// 按当前（可能已被实时调整的）延迟等待
    async fn pace(&self, kind: DelayKind) {
        let duration = self.delays.borrow().duration(kind);
        tokio::time::sleep(duration).await;
    }

    async fn click(&self, xpath: &str, what: &str) -> AppResult<()> {
        let clicked: bool = self
            .executor
            .eval_as(js(&format!(
                "const el = $x({}); if (!el) return false;
                 el.scrollIntoView({{block: 'center'}}); el.click(); return true;",
                js_string(xpath)
            )))
            .await?;
        if !clicked {
            return Err(AppError::element_not_found(what));
        }
        debug!("✓ 点击: {}", what);
        Ok(())
    }

    async fn text_of(&self, xpath: &str) -> AppResult<Option<String>> {
        self.executor
            .eval_as(js(&format!(
                "const el = $x({}); return el ? el.innerText.trim() : null;",
                js_string(xpath)
            )))
            .await
    }

    async fn wait_for_text(&self, needle: &str) -> AppResult<bool> {
        let condition = js(&format!(
            "return !!$x({});",
            js_string(&format!("//*[contains(text(), '{}')]", needle))
        ));
        self.executor.wait_until(&condition, WAIT_TIMEOUT).await
    }

    async fn display_text(&self) -> AppResult<Option<String>> {
        self.text_of("//*[contains(text(), 'Displaying')]").await
    }

    async fn total_pages(&self) -> AppResult<u32> {
        let text = self
            .text_of("//*[contains(text(), 'Page') and contains(text(), 'of')]")
            .await?;
        Ok(text.as_deref().and_then(parse_total_pages).unwrap_or(1))
    }

    async fn ensure_cash_mode(&self) -> AppResult<()> {
        let clicked: bool = self
            .executor
            .eval_as(js(
                "const radio = $x(\"//input[@type='radio' and @value='C']\")
                    || $x(\"//input[@type='radio']\");
                 if (!radio || radio.checked) return false;
                 radio.click(); return true;",
            ))
            .await?;
        if clicked {
            debug!("✓ 已选择现金模式");
            self.pace(DelayKind::Short).await;
        }
        Ok(())
    }

    async fn click_pager(&self, label: &str) -> AppResult<bool> {
        self.executor
            .eval_as(js(&format!(
                "const link = pagerLink({}); if (!link) return false; link.click(); return true;",
                js_string(label)
            )))
            .await
    }

    async fn go_to_first_page(&self) -> AppResult<()> {
        for _ in 0..PAGINATION_CAP {
            if !self.click_pager("<").await? {
                break;
            }
            self.pace(DelayKind::Medium).await;
        }
        Ok(())
    }

    async fn checked_on_page(&self) -> AppResult<u32> {
        self.executor
            .eval_as(js(&format!(
                "return $xa({}).filter(cb => cb.checked).length;",
                js_string(DATA_CHECKBOXES)
            )))
            .await
    }

    async fn pdf_files(dir: &Path) -> AppResult<(HashSet<PathBuf>, bool)> {
        let mut pdfs = HashSet::new();
        let mut downloading = false;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| AppError::io(dir.display().to_string(), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::io(dir.display().to_string(), e))?
        {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("pdf") => {
                    pdfs.insert(path);
                }
                Some("crdownload") => downloading = true,
                _ => {}
            }
        }
        Ok((pdfs, downloading))
    }
}

#[async_trait]
impl PortalDriver for ChromiumPortal {
    async fn fetch_accounts(&self, account_ids: &[String]) -> AppResult<u32> {
        self.ensure_cash_mode().await?;
        self.executor.auto_accept_dialogs().await?;

        let entered: bool = self
            .executor
            .eval_as(js(&format!(
                "const box = $x(\"//textarea | //input[contains(@name,'account') or contains(@name,'Account')]\");
                 if (!box) return false;
                 box.focus(); box.value = {};
                 box.dispatchEvent(new Event('input', {{bubbles: true}}));
                 box.dispatchEvent(new Event('change', {{bubbles: true}}));
                 return true;",
                js_string(&account_ids.join(","))
            )))
            .await?;
        if !entered {
            return Err(AppError::element_not_found("账号输入框"));
        }
        self.pace(DelayKind::Short).await;

        self.click("//input[@value='Fetch' or contains(@value,'Fetch')]", "Fetch 按钮")
            .await?;
        self.pace(DelayKind::Medium).await;
        if !self.wait_for_text("Displaying").await? {
            self.pace(DelayKind::Medium).await;
        }
        self.selected_on_previous_pages.store(0, Ordering::SeqCst);

        let text = self
            .display_text()
            .await?
            .ok_or_else(|| AppError::element_not_found("Displaying 结果计数"))?;
        debug!("门户显示: '{}'", text);
        let (_, _, total) = parse_display_count(&text)
            .ok_or_else(|| AppError::element_not_found(format!("无法解析结果计数: {}", text)))?;
        Ok(total)
    }

    async fn due_dates(&self) -> AppResult<Vec<AccountDueDate>> {
        let read_page = js(
            "return $xa('//table//tr[td]')
                .map(row => row.querySelectorAll('td'))
                .filter(cells => cells.length >= 6)
                .map(cells => ({
                    account_id: cells[1].innerText.trim(),
                    due_date: cells[5].innerText.trim(),
                }))
                .filter(r => r.due_date.length > 0);",
        );

        let mut rows: Vec<AccountDueDate> = self.executor.eval_as(read_page.as_str()).await?;
        let total_pages = self.total_pages().await?.min(PAGINATION_CAP + 1);
        if total_pages > 1 {
            for _ in 1..total_pages {
                if !self.click_pager(">").await? {
                    break;
                }
                self.pace(DelayKind::Medium).await;
                let page_rows: Vec<AccountDueDate> =
                    self.executor.eval_as(read_page.as_str()).await?;
                rows.extend(page_rows);
            }
            self.go_to_first_page().await?;
        }
        Ok(rows)
    }

    async fn select_page(&self) -> AppResult<u32> {
        let count: u32 = self
            .executor
            .eval_as(js(&format!(
                "return $xa({}).length;",
                js_string(DATA_CHECKBOXES)
            )))
            .await?;

        let mut selected = 0;
        for index in 0..count {
            let outcome: String = self
                .executor
                .eval_as(js(&format!(
                    "const cb = $xa({})[{}]; if (!cb) return 'missing';
                     if (cb.checked) return 'already';
                     cb.scrollIntoView({{block: 'center'}}); cb.click();
                     return cb.checked ? 'clicked' : 'failed';",
                    js_string(DATA_CHECKBOXES),
                    index
                )))
                .await?;
            match outcome.as_str() {
                "already" => selected += 1,
                "clicked" => {
                    selected += 1;
                    self.pace(DelayKind::Checkbox).await;
                }
                other => warn!("⚠️ 第 {} 个勾选框无法勾选: {}", index + 1, other),
            }
        }
        debug!("本页勾选 {} 个", selected);
        Ok(selected)
    }

    async fn next_page(&self) -> AppResult<bool> {
        let on_this_page = self.checked_on_page().await?;
        if !self.click_pager(">").await? {
            return Ok(false);
        }
        self.selected_on_previous_pages
            .fetch_add(on_this_page, Ordering::SeqCst);
        self.pace(DelayKind::Medium).await;
        Ok(true)
    }

    async fn selected_count(&self) -> AppResult<u32> {
        let current = self.checked_on_page().await?;
        Ok(self.selected_on_previous_pages.load(Ordering::SeqCst) + current)
    }

    async fn save(&self) -> AppResult<()> {
        self.executor.auto_accept_dialogs().await?;
        self.click("//input[@value='Save' or contains(@value,'Save')]", "Save 按钮")
            .await?;
        self.pace(DelayKind::Long).await;
        Ok(())
    }

    async fn pay_all(&self) -> AppResult<Option<String>> {
        if !self
            .wait_for_text("Selected Recurring Deposit Account List")
            .await?
        {
            warn!("⚠️ 未确认到已保存列表页面，继续尝试付款");
        }
        self.pace(DelayKind::Short).await;

        self.executor.auto_accept_dialogs().await?;
        self.click(
            "//input[@value='Pay All Saved Installments' or contains(@value,'Pay All Saved')]",
            "Pay All Saved Installments 按钮",
        )
        .await?;
        self.pace(DelayKind::Long).await;
        self.pace(DelayKind::Medium).await;

        let message = match self
            .text_of("//*[contains(text(), 'Payment successful') or contains(text(), 'payment reference')]")
            .await?
        {
            Some(text) => Some(text),
            None => {
                self.text_of("//*[contains(text(), 'reference number') or contains(text(), 'Reference')]")
                    .await?
            }
        };

        match message {
            Some(text) => {
                info!("门户提示: {}", text);
                Ok(parse_reference_id(&text))
            }
            None => {
                warn!("⚠️ 页面上没有找到付款成功提示");
                Ok(None)
            }
        }
    }

    async fn open_reports(&self) -> AppResult<()> {
        self.click("//a[contains(text(), 'Reports')]", "Reports 菜单")
            .await?;
        self.pace(DelayKind::Medium).await;
        if !self
            .wait_for_text("RECURRING DEPOSIT INSTALLMENT REPORT")
            .await?
        {
            return Err(AppError::element_not_found("回单报表页面"));
        }
        info!("✓ 已进入回单报表页面");
        Ok(())
    }

    async fn download_receipt(&self, reference_id: &str, target: &Path) -> AppResult<()> {
        let dir = target
            .parent()
            .ok_or_else(|| AppError::element_not_found("下载目录"))?;
        self.executor.allow_downloads_to(dir).await?;
        let (before, _) = Self::pdf_files(dir).await?;

        let entered: bool = self
            .executor
            .eval_as(js(&format!(
                "let input = $x(\"//input[contains(@name, 'referenceNo') or contains(@name, 'Reference') or contains(@name, 'listRef')]\");
                 if (!input) {{
                     const label = $x(\"//*[contains(text(), 'List Reference No')]\");
                     if (label) input = $x(\".//input[@type='text']\", label.parentElement);
                 }}
                 if (!input) return false;
                 input.focus(); input.value = {};
                 input.dispatchEvent(new Event('input', {{bubbles: true}}));
                 input.dispatchEvent(new Event('change', {{bubbles: true}}));
                 return true;",
                js_string(reference_id)
            )))
            .await?;
        if !entered {
            return Err(AppError::element_not_found("List Reference No 输入框"));
        }
        self.pace(DelayKind::Short).await;

        self.click("//input[@value='Search']", "Search 按钮").await?;
        self.pace(DelayKind::Medium).await;
        if !self.wait_for_text("Displaying").await? {
            self.pace(DelayKind::Medium).await;
        }
        if let Some(text) = self.display_text().await? {
            debug!("报表结果: '{}'", text);
        }

        self.executor
            .eval(js(
                "const sel = $x(\"//select[contains(@name,'download') or contains(@name,'format')]\");
                 if (!sel) return false;
                 const opt = Array.from(sel.options).find(o => o.text.trim() === 'PDF file');
                 if (!opt) return false;
                 sel.value = opt.value;
                 sel.dispatchEvent(new Event('change', {bubbles: true}));
                 return true;",
            ))
            .await?;
        self.executor.auto_accept_dialogs().await?;
        self.click("//input[@value='OK']", "OK 按钮").await?;
        self.pace(DelayKind::Medium).await;

        let deadline = tokio::time::Instant::now() + DOWNLOAD_TIMEOUT;
        loop {
            let (after, downloading) = Self::pdf_files(dir).await?;
            let newest = after
                .difference(&before)
                .filter(|p| p.as_path() != target)
                .max_by_key(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok());
            if let (Some(file), false) = (newest, downloading) {
                tokio::fs::rename(file, target)
                    .await
                    .map_err(|e| AppError::io(target.display().to_string(), e))?;
                info!("✓ 回单已保存: {}", target.display());
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::DownloadTimeout {
                    dir: dir.display().to_string(),
                    secs: DOWNLOAD_TIMEOUT.as_secs(),
                }
                .into());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
