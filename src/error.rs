use serde::Serialize;
use thiserror::Error;

use crate::models::LotId;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 浏览器相关错误
    #[error("浏览器错误: {0}")]
    Browser(#[from] BrowserError),
    /// 检查点读写错误
    #[error("检查点错误: {0}")]
    Checkpoint(#[from] CheckpointError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 回单（PDF）处理错误
    #[error("回单错误: {0}")]
    Receipt(#[from] ReceiptError),
    /// 文件操作错误
    #[error("文件错误 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 浏览器相关错误
#[derive(Debug, Error)]
pub enum BrowserError {
    /// 连接浏览器失败
    #[error("无法连接到浏览器 (端口: {port}): {source}")]
    ConnectionFailed {
        port: u16,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 执行脚本失败
    #[error("执行脚本失败: {source}")]
    ScriptExecutionFailed {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 页面上找不到元素
    #[error("页面元素未找到: {what}")]
    ElementNotFound { what: String },
    /// 等待下载超时
    #[error("等待下载超时 ({secs} 秒): {dir}")]
    DownloadTimeout { dir: String, secs: u64 },
}

/// 检查点读写错误
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// CSV 读取失败
    #[error("读取 CSV 失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: csv::Error,
    },
    /// CSV 写入失败
    #[error("写入 CSV 失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 表格（XLSX）写入失败
    #[error("写入表格失败 ({path}): {source}")]
    SpreadsheetFailed {
        path: String,
        #[source]
        source: rust_xlsxwriter::XlsxError,
    },
    /// 行数据无效
    #[error("第 {line} 行数据无效: {reason}")]
    InvalidRow { line: u64, reason: String },
    /// 同一个 LOT 出现多次
    #[error("LOT {lot_id} 重复出现")]
    DuplicateLot { lot_id: LotId },
    /// 已付款但缺少参考号等不一致状态
    #[error("LOT {lot_id} 状态不一致: {reason}")]
    InconsistentRow { lot_id: LotId, reason: String },
    #[error("LOT {lot_id} 不在状态表中")]
    UnknownLot { lot_id: LotId },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    FileReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// LOT 选择表达式无效
    #[error("无效的 LOT 选择: '{value}' (应为 all / 1-5 / 1,3,5)")]
    InvalidLotSelection { value: String },
    /// 未知的延迟名称
    #[error("未知的延迟名称: {name}")]
    UnknownDelay { name: String },
}

/// 回单（PDF）处理错误
#[derive(Debug, Error)]
pub enum ReceiptError {
    /// 读取页数失败
    #[error("无法读取页数 ({path}): {source}")]
    PageCountFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 合并失败
    #[error("合并失败 ({output}): {source}")]
    MergeFailed {
        output: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// 单个 LOT 范围内的失败
///
/// 只影响当前 LOT：记录到 Remarks 后继续处理下一个 LOT，从不自动重试。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LotError {
    #[error("查询失败: {reason}")]
    FetchFailure { reason: String },
    #[error("数量不符: 期望 {expected}, 实际 {actual}")]
    CountMismatch { expected: u32, actual: u32 },
    #[error("到期日不在 {month}: {}", .accounts.join(", "))]
    DueDateViolation { month: String, accounts: Vec<String> },
    #[error("翻页超过 {advances} 次仍未全选 (已选 {selected}/{expected})")]
    PaginationExceeded {
        advances: u32,
        selected: u32,
        expected: u32,
    },
    #[error("勾选数量不符: 已选 {selected}, 期望 {expected}")]
    SelectionMismatch { selected: u32, expected: u32 },
    #[error("无法复核勾选数量: {reason}")]
    SelectionUnverified { reason: String },
    #[error("保存失败: {reason}")]
    SaveFailure { reason: String },
    #[error("付款失败: {reason}")]
    PaymentFailure { reason: String },
    #[error("下载失败: {reason}")]
    DownloadFailure { reason: String },
}

/// 整次运行的停止原因
///
/// 都是有序退出：先保存检查点，下次启动可以继续。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    #[error("内存超出上限")]
    MemoryLimitExceeded,
    #[error("超过全局超时时间")]
    GlobalTimeoutExceeded,
    #[error("操作员中止")]
    OperatorAbort,
    #[error("操作员要求处理完当前 LOT 后停止")]
    OperatorStop,
}

// ========== 从常见错误类型转换 ==========

impl From<chromiumoxide::error::CdpError> for AppError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        AppError::Browser(BrowserError::ScriptExecutionFailed {
            source: Box::new(err),
        })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Browser(BrowserError::ScriptExecutionFailed {
            source: Box::new(err),
        })
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建文件错误
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::Io {
            path: path.into(),
            source,
        }
    }

    /// 创建元素未找到错误
    pub fn element_not_found(what: impl Into<String>) -> Self {
        AppError::Browser(BrowserError::ElementNotFound { what: what.into() })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
