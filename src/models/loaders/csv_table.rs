use crate::error::CheckpointError;
use crate::models::lot::{LotRecord, Status, StatusVector, TABLE_COLUMNS};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

/// CSV 中的一行（状态列都是可选的，首次运行的输入表只有前几列）
#[derive(Debug, Deserialize)]
struct CsvLotRow {
    #[serde(rename = "LOT")]
    lot: String,
    #[serde(rename = "RD Numbers")]
    rd_numbers: String,
    #[serde(rename = "Count")]
    count: String,
    #[serde(rename = "Timestamp", default)]
    timestamp: String,
    #[serde(rename = "Fetch_Status", default)]
    fetch_status: String,
    #[serde(rename = "Count_Match", default)]
    count_match: String,
    #[serde(rename = "Due_Date_Check", default)]
    due_date_check: String,
    #[serde(rename = "Selected", default)]
    selected: String,
    #[serde(rename = "Selection_Verified", default)]
    selection_verified: String,
    #[serde(rename = "Save_Status", default)]
    save_status: String,
    #[serde(rename = "Pay_Status", default)]
    pay_status: String,
    #[serde(rename = "Reference_ID", default)]
    reference_id: String,
    #[serde(rename = "Remarks", default)]
    remarks: String,
}

impl CsvLotRow {
    fn into_record(self) -> Result<LotRecord, String> {
        let lot_id = self
            .lot
            .trim()
            .parse()
            .map_err(|_| format!("LOT '{}' 不是正整数", self.lot))?;
        let expected_count = self
            .count
            .trim()
            .parse()
            .map_err(|_| format!("Count '{}' 不是正整数", self.count))?;

        let mut record =
            LotRecord::new(lot_id, LotRecord::parse_accounts(&self.rd_numbers), expected_count)?;
        record.timestamp = self.timestamp;

        let reference_id = self.reference_id.trim();
        record.status = StatusVector {
            fetch_status: Status::from_cell(&self.fetch_status),
            count_match: Status::from_cell(&self.count_match),
            due_date_check: Status::from_cell(&self.due_date_check),
            selected: Status::from_cell(&self.selected),
            selection_verified: Status::from_cell(&self.selection_verified),
            save_status: Status::from_cell(&self.save_status),
            pay_status: Status::from_cell(&self.pay_status),
            reference_id: (!reference_id.is_empty()).then(|| reference_id.to_string()),
            remarks: self.remarks,
        };
        Ok(record)
    }
}

/// 读取 LOT 表（输入表或上次运行留下的检查点表）
///
/// 拒绝重复的 LOT 编号以及"已付款但没有参考号"这类不一致的行：
/// 这种行不能当作已完成，也不能重新付款，只能人工处理。
pub fn read_lot_table(path: &Path) -> Result<Vec<LotRecord>, CheckpointError> {
    let display = path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CheckpointError::ReadFailed {
            path: display.clone(),
            source,
        })?;

    let mut records = Vec::new();
    let mut seen = HashSet::new();

    for (index, row) in reader.deserialize::<CsvLotRow>().enumerate() {
        let line = index as u64 + 2;
        let row = row.map_err(|source| CheckpointError::ReadFailed {
            path: display.clone(),
            source,
        })?;
        let record = row
            .into_record()
            .map_err(|reason| CheckpointError::InvalidRow { line, reason })?;

        if !seen.insert(record.lot_id) {
            return Err(CheckpointError::DuplicateLot {
                lot_id: record.lot_id,
            });
        }
        record
            .status
            .check_invariant()
            .map_err(|reason| CheckpointError::InconsistentRow {
                lot_id: record.lot_id,
                reason,
            })?;

        records.push(record);
    }

    Ok(records)
}

/// 一条记录对应的表格行（与 `TABLE_COLUMNS` 顺序一致）
pub fn table_row(record: &LotRecord) -> Vec<String> {
    let status = &record.status;
    vec![
        record.lot_id.to_string(),
        record.accounts_joined(),
        record.expected_count.to_string(),
        record.timestamp.clone(),
        status.fetch_status.as_str().to_string(),
        status.count_match.as_str().to_string(),
        status.due_date_check.as_str().to_string(),
        status.selected.as_str().to_string(),
        status.selection_verified.as_str().to_string(),
        status.save_status.as_str().to_string(),
        status.pay_status.as_str().to_string(),
        status.reference_id.clone().unwrap_or_default(),
        status.remarks.clone(),
    ]
}

/// 整表写回 CSV
///
/// 先写临时文件并 fsync，再 rename 覆盖，崩溃时磁盘上只会是旧表或新表。
pub fn write_lot_table(path: &Path, records: &[LotRecord]) -> Result<(), CheckpointError> {
    let display = path.display().to_string();
    let write_failed = |source: Box<dyn std::error::Error + Send + Sync>| {
        CheckpointError::WriteFailed {
            path: display.clone(),
            source,
        }
    };

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(TABLE_COLUMNS)
        .map_err(|e| write_failed(Box::new(e)))?;
    for record in records {
        writer
            .write_record(table_row(record))
            .map_err(|e| write_failed(Box::new(e)))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| write_failed(Box::new(e.into_error())))?;

    let tmp_path = path.with_extension("csv.tmp");
    let mut file = fs::File::create(&tmp_path).map_err(|e| write_failed(Box::new(e)))?;
    file.write_all(&bytes)
        .map_err(|e| write_failed(Box::new(e)))?;
    file.sync_all().map_err(|e| write_failed(Box::new(e)))?;
    drop(file);
    fs::rename(&tmp_path, path).map_err(|e| write_failed(Box::new(e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_minimal_input_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("input.csv");
        fs::write(
            &path,
            "LOT,RD Numbers,Count,Timestamp\n1,\"020001,020002\",2,2026-10-01\n2,020003,1,\n",
        )
        .unwrap();

        let records = read_lot_table(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].account_ids, vec!["020001", "020002"]);
        assert_eq!(records[0].timestamp, "2026-10-01");
        assert_eq!(records[1].status, StatusVector::default());
    }

    #[test]
    fn round_trips_status_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.csv");
        let mut record = LotRecord::new(3, vec!["A1".into(), "A2".into()], 2).unwrap();
        record.status.fetch_status = Status::Ok;
        record.status.count_match = Status::Ok;
        record.status.due_date_check = Status::Ok;
        record.status.selected = Status::Ok;
        record.status.selection_verified = Status::Ok;
        record.status.save_status = Status::Ok;
        record.status.pay_status = Status::Ok;
        record.status.reference_id = Some("C320461082".into());
        record.status.remarks = "成功".into();

        write_lot_table(&path, std::slice::from_ref(&record)).unwrap();
        let back = read_lot_table(&path).unwrap();
        assert_eq!(back, vec![record]);
    }

    #[test]
    fn rejects_paid_row_without_reference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(
            &path,
            "LOT,RD Numbers,Count,Selection_Verified,Pay_Status,Reference_ID\n5,A,1,OK,OK,\n",
        )
        .unwrap();

        let err = read_lot_table(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::InconsistentRow { lot_id: 5, .. }));
    }

    #[test]
    fn rejects_duplicate_lot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.csv");
        fs::write(&path, "LOT,RD Numbers,Count\n1,A,1\n1,B,1\n").unwrap();

        let err = read_lot_table(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::DuplicateLot { lot_id: 1 }));
    }
}
