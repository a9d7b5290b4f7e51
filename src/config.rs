use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::{DelayConfig, DelayKind, LotId};

/// 默认配置文件名
const DEFAULT_CONFIG_FILE: &str = "dop.toml";

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    /// 门户地址
    pub portal_url: String,
    /// 浏览器调试端口
    pub browser_debug_port: u16,
    /// 输入表
    pub input_csv: PathBuf,
    /// 检查点表（CSV）
    pub checkpoint_csv: PathBuf,
    /// 检查点表（XLSX，只写）
    pub checkpoint_xlsx: PathBuf,
    /// 回单下载目录
    pub download_dir: PathBuf,
    pub lot_selection: LotSelection,
    pub delays: DelayConfig,
    pub global_timeout_minutes: u64,
    pub memory_limit_mb: u64,
    /// 控制面板端口（被占用时向后探测）
    pub dashboard_port: u16,
    /// 安全监控后台轮询间隔
    pub safety_poll_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let today = chrono::Local::now().format("%Y-%m-%d");
        Self {
            portal_url: "https://dopagent.indiapost.gov.in/corp/Finacle".to_string(),
            browser_debug_port: 9222,
            input_csv: PathBuf::from("RD_Session.csv"),
            checkpoint_csv: PathBuf::from("RD_Session.csv"),
            checkpoint_xlsx: PathBuf::from("RD_Session.xlsx"),
            download_dir: PathBuf::from(format!("LOT_{}", today)),
            lot_selection: LotSelection::All,
            delays: DelayConfig::default(),
            global_timeout_minutes: 30,
            memory_limit_mb: 3500,
            dashboard_port: 5555,
            safety_poll_secs: 5,
        }
    }
}

/// TOML 文件中的可选键（与环境变量同名，小写）
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    portal_url: Option<String>,
    browser_debug_port: Option<u16>,
    input_csv: Option<PathBuf>,
    checkpoint_csv: Option<PathBuf>,
    checkpoint_xlsx: Option<PathBuf>,
    download_dir: Option<PathBuf>,
    lot_selection: Option<String>,
    delay_short: Option<f64>,
    delay_medium: Option<f64>,
    delay_long: Option<f64>,
    delay_checkbox: Option<f64>,
    global_timeout_minutes: Option<u64>,
    memory_limit_mb: Option<u64>,
    dashboard_port: Option<u16>,
    safety_poll_secs: Option<u64>,
}

impl Config {
    /// 全局超时；极端配置值截断而不是溢出
    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.global_timeout_minutes.saturating_mul(60))
    }

    /// 默认值 → TOML 文件（`DOP_CONFIG` 或 `dop.toml`，存在时）→ 环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let path = std::env::var("DOP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        if path.is_file() {
            config.apply_file(&path)?;
        }

        config.apply_env()?;
        Ok(config)
    }

    /// 读取 TOML 文件并覆盖对应字段
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        self.apply_toml(&text, path)
    }

    fn apply_toml(&mut self, text: &str, path: &Path) -> Result<(), ConfigError> {
        let file: FileConfig =
            toml::from_str(text).map_err(|source| ConfigError::TomlParseFailed {
                path: path.display().to_string(),
                source,
            })?;

        if let Some(v) = file.portal_url {
            self.portal_url = v;
        }
        if let Some(v) = file.browser_debug_port {
            self.browser_debug_port = v;
        }
        if let Some(v) = file.input_csv {
            self.input_csv = v;
        }
        if let Some(v) = file.checkpoint_csv {
            self.checkpoint_csv = v;
        }
        if let Some(v) = file.checkpoint_xlsx {
            self.checkpoint_xlsx = v;
        }
        if let Some(v) = file.download_dir {
            self.download_dir = v;
        }
        if let Some(v) = file.lot_selection {
            self.lot_selection = v.parse()?;
        }
        for (kind, value) in [
            (DelayKind::Short, file.delay_short),
            (DelayKind::Medium, file.delay_medium),
            (DelayKind::Long, file.delay_long),
            (DelayKind::Checkbox, file.delay_checkbox),
        ] {
            if let Some(v) = value {
                self.delays.set(kind, v);
            }
        }
        if let Some(v) = file.global_timeout_minutes {
            self.global_timeout_minutes = v;
        }
        if let Some(v) = file.memory_limit_mb {
            self.memory_limit_mb = v;
        }
        if let Some(v) = file.dashboard_port {
            self.dashboard_port = v;
        }
        if let Some(v) = file.safety_poll_secs {
            self.safety_poll_secs = v;
        }
        Ok(())
    }

    /// 环境变量覆盖（键名为大写，例如 `MEMORY_LIMIT_MB`）
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("PORTAL_URL") {
            self.portal_url = v;
        }
        if let Some(v) = env_parse("BROWSER_DEBUG_PORT", "u16")? {
            self.browser_debug_port = v;
        }
        if let Ok(v) = std::env::var("INPUT_CSV") {
            self.input_csv = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CHECKPOINT_CSV") {
            self.checkpoint_csv = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CHECKPOINT_XLSX") {
            self.checkpoint_xlsx = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LOT_SELECTION") {
            self.lot_selection = v.parse()?;
        }
        for (kind, var) in [
            (DelayKind::Short, "DELAY_SHORT"),
            (DelayKind::Medium, "DELAY_MEDIUM"),
            (DelayKind::Long, "DELAY_LONG"),
            (DelayKind::Checkbox, "DELAY_CHECKBOX"),
        ] {
            if let Some(v) = env_parse::<f64>(var, "f64")? {
                self.delays.set(kind, v);
            }
        }
        if let Some(v) = env_parse("GLOBAL_TIMEOUT_MINUTES", "u64")? {
            self.global_timeout_minutes = v;
        }
        if let Some(v) = env_parse("MEMORY_LIMIT_MB", "u64")? {
            self.memory_limit_mb = v;
        }
        if let Some(v) = env_parse("DASHBOARD_PORT", "u16")? {
            self.dashboard_port = v;
        }
        if let Some(v) = env_parse("SAFETY_POLL_SECS", "u64")? {
            self.safety_poll_secs = v;
        }
        Ok(())
    }
}

/// 未设置时返回 None，设置了但解析失败时报错
fn env_parse<T: FromStr>(var_name: &str, expected_type: &str) -> Result<Option<T>, ConfigError> {
    let Ok(value) = std::env::var(var_name) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>().ok();
    match parsed {
        Some(v) => Ok(Some(v)),
        None => Err(ConfigError::EnvVarParseFailed {
            var_name: var_name.to_string(),
            value,
            expected_type: expected_type.to_string(),
        }),
    }
}

/// 本次处理哪些 LOT：`all` | `a-b` | `a,b,c`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LotSelection {
    #[default]
    All,
    Range(LotId, LotId),
    List(BTreeSet<LotId>),
}

impl LotSelection {
    pub fn contains(&self, lot_id: LotId) -> bool {
        match self {
            LotSelection::All => true,
            LotSelection::Range(start, end) => (*start..=*end).contains(&lot_id),
            LotSelection::List(ids) => ids.contains(&lot_id),
        }
    }
}

impl FromStr for LotSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidLotSelection {
            value: s.to_string(),
        };
        let text = s.trim();

        if text.is_empty() || text.eq_ignore_ascii_case("all") {
            return Ok(LotSelection::All);
        }

        if let Some((start, end)) = text.split_once('-') {
            let start: LotId = start.trim().parse().map_err(|_| invalid())?;
            let end: LotId = end.trim().parse().map_err(|_| invalid())?;
            if start == 0 || start > end {
                return Err(invalid());
            }
            return Ok(LotSelection::Range(start, end));
        }

        let ids = text
            .split(',')
            .map(|part| part.trim().parse::<LotId>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|_| invalid())?;
        if ids.contains(&0) {
            return Err(invalid());
        }
        Ok(LotSelection::List(ids))
    }
}

impl fmt::Display for LotSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LotSelection::All => f.write_str("all"),
            LotSelection::Range(start, end) => write!(f, "{}-{}", start, end),
            LotSelection::List(ids) => {
                let parts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}
