//! 检查点存储 - 业务能力层
//!
//! 只负责"状态表持久化"能力：
//! - 启动时读取输入表，并与上次运行留下的检查点表按 LOT 编号合并
//! - 每个 LOT 处理完后整表写回 CSV 与 XLSX（同步落盘后才返回）
//! - 判断某个 LOT 在某个阶段是否可以跳过

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::CheckpointError;
use crate::models::{
    read_lot_table, write_lot_spreadsheet, write_lot_table, LotId, LotRecord, Phase,
    StatusVector,
};

/// 检查点存储
pub struct CheckpointStore {
    csv_path: PathBuf,
    xlsx_path: PathBuf,
    download_dir: PathBuf,
    records: Vec<LotRecord>,
}

impl CheckpointStore {
    /// 打开存储
    ///
    /// 输入表决定 LOT 顺序与账号；检查点表存在时，其中的状态按 LOT 编号覆盖输入表。
    /// 只出现在检查点表里的 LOT 追加在末尾，从不删除。
    pub fn open(
        input_csv: &Path,
        csv_path: impl Into<PathBuf>,
        xlsx_path: impl Into<PathBuf>,
        download_dir: impl Into<PathBuf>,
    ) -> Result<Self, CheckpointError> {
        let csv_path = csv_path.into();
        let mut records = read_lot_table(input_csv)?;
        info!("📄 输入表: {} 个 LOT ({})", records.len(), input_csv.display());

        if csv_path.exists() && csv_path != input_csv {
            let previous = read_lot_table(&csv_path)?;
            info!("♻️ 发现检查点表: {} 个 LOT ({})", previous.len(), csv_path.display());
            merge_previous(&mut records, previous);
        }

        Ok(Self {
            csv_path,
            xlsx_path: xlsx_path.into(),
            download_dir: download_dir.into(),
            records,
        })
    }

    /// 直接由记录构造（不读文件）
    pub fn from_records(
        records: Vec<LotRecord>,
        csv_path: impl Into<PathBuf>,
        xlsx_path: impl Into<PathBuf>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            csv_path: csv_path.into(),
            xlsx_path: xlsx_path.into(),
            download_dir: download_dir.into(),
            records,
        }
    }

    /// 所有 LOT 的当前状态
    pub fn load(&self) -> BTreeMap<LotId, StatusVector> {
        self.records
            .iter()
            .map(|r| (r.lot_id, r.status.clone()))
            .collect()
    }

    /// 按输入顺序的全部记录
    pub fn records(&self) -> &[LotRecord] {
        &self.records
    }

    pub fn record(&self, lot_id: LotId) -> Option<&LotRecord> {
        self.records.iter().find(|r| r.lot_id == lot_id)
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// 保存一个 LOT 的状态并同步写出 CSV 与 XLSX
    ///
    /// 按 LOT 编号原地覆盖；第一次保存时检查点表才会出现在磁盘上。
    pub fn save(&mut self, lot_id: LotId, status: &StatusVector) -> Result<(), CheckpointError> {
        status
            .check_invariant()
            .map_err(|reason| CheckpointError::InconsistentRow { lot_id, reason })?;

        let record = self
            .records
            .iter_mut()
            .find(|r| r.lot_id == lot_id)
            .ok_or(CheckpointError::UnknownLot { lot_id })?;
        record.status = status.clone();

        self.flush()?;
        debug!("💾 [LOT {}] 状态已保存", lot_id);
        Ok(())
    }

    /// 整表写回磁盘
    pub fn flush(&self) -> Result<(), CheckpointError> {
        write_lot_table(&self.csv_path, &self.records)?;
        write_lot_spreadsheet(&self.xlsx_path, &self.records)?;
        Ok(())
    }

    /// 该 LOT 在给定阶段是否已完成、可以跳过
    pub fn is_resumable(&self, lot_id: LotId, phase: Phase) -> bool {
        let Some(record) = self.record(lot_id) else {
            return false;
        };
        match phase {
            Phase::Pay => record.status.is_paid(),
            Phase::Download => record
                .receipt_file_name()
                .map(|name| self.download_dir.join(name).is_file())
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn merge_previous(records: &mut Vec<LotRecord>, previous: Vec<LotRecord>) {
    let mut by_id: BTreeMap<LotId, LotRecord> =
        previous.into_iter().map(|r| (r.lot_id, r)).collect();

    for record in records.iter_mut() {
        if let Some(saved) = by_id.remove(&record.lot_id) {
            record.status = saved.status;
            if record.timestamp.is_empty() {
                record.timestamp = saved.timestamp;
            }
        }
    }
    records.extend(by_id.into_values());
}
