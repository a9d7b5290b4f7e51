//! LOT 数据模型
//!
//! 一个 LOT 是一批 RD 账号，作为一个整体完成 查询 → 校验 → 勾选 → 保存 → 付款。

use serde::{Deserialize, Serialize};
use std::fmt;

/// LOT 编号（正整数，唯一）
pub type LotId = u32;

/// 状态表的完整列（CSV 与 XLSX 共用，顺序固定）
pub const TABLE_COLUMNS: [&str; 13] = [
    "LOT",
    "RD Numbers",
    "Count",
    "Timestamp",
    "Fetch_Status",
    "Count_Match",
    "Due_Date_Check",
    "Selected",
    "Selection_Verified",
    "Save_Status",
    "Pay_Status",
    "Reference_ID",
    "Remarks",
];

/// 单个校验字段的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Pending,
    Ok,
    Fail,
    Mismatch,
    Skipped,
}

impl Status {
    /// 写入表格时使用的文本
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "",
            Status::Ok => "OK",
            Status::Fail => "FAIL",
            Status::Mismatch => "MISMATCH",
            Status::Skipped => "SKIPPED",
        }
    }

    /// 从表格单元格解析
    ///
    /// 只看第一个词，兼容旧表格里的 `OK (7/7)`、`FAIL (2 bad)` 之类写法；
    /// 旧版 Selected 列里的纯数字按是否大于 0 处理。
    pub fn from_cell(cell: &str) -> Self {
        let word = cell
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        match word.as_str() {
            "" | "PENDING" => Status::Pending,
            "OK" => Status::Ok,
            "MISMATCH" => Status::Mismatch,
            "SKIPPED" => Status::Skipped,
            other => match other.parse::<u32>() {
                Ok(0) => Status::Fail,
                Ok(_) => Status::Ok,
                Err(_) => Status::Fail,
            },
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => f.write_str("PENDING"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// 单个 LOT 的状态向量（固定字段，每个字段一个枚举状态）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusVector {
    pub fetch_status: Status,
    pub count_match: Status,
    pub due_date_check: Status,
    pub selected: Status,
    pub selection_verified: Status,
    pub save_status: Status,
    pub pay_status: Status,
    /// 付款成功后才会写入
    pub reference_id: Option<String>,
    pub remarks: String,
}

impl StatusVector {
    /// 是否已经付款完成
    pub fn is_paid(&self) -> bool {
        self.pay_status == Status::Ok
    }

    /// 校验不变量：已付款 ⇒ 有参考号且勾选已核对
    pub fn check_invariant(&self) -> Result<(), String> {
        if !self.is_paid() {
            return Ok(());
        }
        if self.reference_id.as_deref().map_or(true, str::is_empty) {
            return Err("Pay_Status=OK 但缺少 Reference_ID".to_string());
        }
        if self.selection_verified != Status::Ok {
            return Err(format!(
                "Pay_Status=OK 但 Selection_Verified={}",
                self.selection_verified
            ));
        }
        Ok(())
    }

    /// 恢复标记（用于启动时的概览）
    pub fn resume_marker(&self) -> String {
        if self.is_paid() {
            match &self.reference_id {
                Some(reference_id) => format!(" (已完成 - 参考号: {})", reference_id),
                None => " (已完成)".to_string(),
            }
        } else if self.save_status == Status::Ok {
            " (已保存, 尚未付款)".to_string()
        } else {
            String::new()
        }
    }
}

/// 单个 LOT 在状态机中到达的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LotStage {
    Start,
    Fetched,
    CountVerified,
    DueDateVerified,
    Selected,
    SelectionVerified,
    Saved,
    Paid,
    Recorded,
}

impl LotStage {
    pub fn as_str(self) -> &'static str {
        match self {
            LotStage::Start => "Start",
            LotStage::Fetched => "Fetched",
            LotStage::CountVerified => "CountVerified",
            LotStage::DueDateVerified => "DueDateVerified",
            LotStage::Selected => "Selected",
            LotStage::SelectionVerified => "SelectionVerified",
            LotStage::Saved => "Saved",
            LotStage::Paid => "Paid",
            LotStage::Recorded => "Recorded",
        }
    }
}

impl fmt::Display for LotStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一行 LOT 记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LotRecord {
    pub lot_id: LotId,
    pub account_ids: Vec<String>,
    pub expected_count: u32,
    /// 输入表里的时间戳，原样保留
    pub timestamp: String,
    pub status: StatusVector,
}

impl LotRecord {
    /// 创建新的 LOT 记录
    ///
    /// 账号列表不能为空，编号与期望数量必须为正。
    pub fn new(
        lot_id: LotId,
        account_ids: Vec<String>,
        expected_count: u32,
    ) -> Result<Self, String> {
        if lot_id == 0 {
            return Err("LOT 编号必须为正整数".to_string());
        }
        if account_ids.is_empty() {
            return Err(format!("LOT {} 没有账号", lot_id));
        }
        if expected_count == 0 {
            return Err(format!("LOT {} 的 Count 必须大于 0", lot_id));
        }
        Ok(Self {
            lot_id,
            account_ids,
            expected_count,
            timestamp: String::new(),
            status: StatusVector::default(),
        })
    }

    /// 解析逗号分隔的账号列表
    pub fn parse_accounts(raw: &str) -> Vec<String> {
        raw.split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// 账号列表拼回逗号分隔文本
    pub fn accounts_joined(&self) -> String {
        self.account_ids.join(",")
    }

    /// 回单文件名 `<lotId>_<referenceId>.pdf`（未付款时为 None）
    pub fn receipt_file_name(&self) -> Option<String> {
        self.status
            .reference_id
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(|r| receipt_file_name(self.lot_id, r))
    }
}

/// 回单文件名 `<lotId>_<referenceId>.pdf`
pub fn receipt_file_name(lot_id: LotId, reference_id: &str) -> String {
    format!("{}_{}.pdf", lot_id, reference_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_cell_accepts_legacy_text() {
        assert_eq!(Status::from_cell(""), Status::Pending);
        assert_eq!(Status::from_cell("OK (7/7)"), Status::Ok);
        assert_eq!(Status::from_cell("MISMATCH (6/7)"), Status::Mismatch);
        assert_eq!(Status::from_cell("FAIL (2 bad)"), Status::Fail);
        assert_eq!(Status::from_cell("skipped"), Status::Skipped);
        assert_eq!(Status::from_cell("UNREADABLE"), Status::Fail);
        assert_eq!(Status::from_cell("7"), Status::Ok);
        assert_eq!(Status::from_cell("0"), Status::Fail);
    }

    #[test]
    fn paid_without_reference_breaks_invariant() {
        let mut status = StatusVector {
            pay_status: Status::Ok,
            selection_verified: Status::Ok,
            ..Default::default()
        };
        assert!(status.check_invariant().is_err());

        status.reference_id = Some("C320461082".to_string());
        assert!(status.check_invariant().is_ok());

        status.selection_verified = Status::Mismatch;
        assert!(status.check_invariant().is_err());
    }

    #[test]
    fn lot_record_rejects_empty_accounts() {
        assert!(LotRecord::new(1, vec![], 3).is_err());
        assert!(LotRecord::new(0, vec!["A".into()], 1).is_err());
        assert!(LotRecord::new(2, vec!["A".into()], 0).is_err());
        assert!(LotRecord::new(2, vec!["A".into()], 1).is_ok());
    }

    #[test]
    fn parse_accounts_ignores_blanks() {
        let accounts = LotRecord::parse_accounts(" 020012, 020013,,020014 ");
        assert_eq!(accounts, vec!["020012", "020013", "020014"]);
    }

    #[test]
    fn receipt_name_requires_reference() {
        let mut lot = LotRecord::new(4, vec!["A".into()], 1).unwrap();
        assert_eq!(lot.receipt_file_name(), None);
        lot.status.reference_id = Some("C1234567".into());
        assert_eq!(lot.receipt_file_name().as_deref(), Some("4_C1234567.pdf"));
    }
}
