use crate::error::CheckpointError;
use crate::models::loaders::csv_table::table_row;
use crate::models::lot::{LotRecord, TABLE_COLUMNS};
use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook, XlsxError};
use std::fs;
use std::path::Path;

/// Reference_ID 所在列
const REFERENCE_COLUMN: usize = 11;

/// 列宽（近似自动适配）
fn column_width(column: &str) -> f64 {
    match column {
        "LOT" => 6.0,
        "RD Numbers" => 60.0,
        "Count" => 7.0,
        "Timestamp" => 22.0,
        "Fetch_Status" | "Save_Status" => 13.0,
        "Count_Match" => 18.0,
        "Due_Date_Check" => 16.0,
        "Selected" => 10.0,
        "Selection_Verified" => 20.0,
        "Pay_Status" => 12.0,
        "Reference_ID" => 18.0,
        "Remarks" => 40.0,
        _ => 15.0,
    }
}

/// 写出带格式的 XLSX：蓝色表头、绿色参考号、冻结首行
pub fn write_lot_spreadsheet(path: &Path, records: &[LotRecord]) -> Result<(), CheckpointError> {
    let display = path.display().to_string();
    let failed = |source: XlsxError| CheckpointError::SpreadsheetFailed {
        path: display.clone(),
        source,
    };

    let header_format = Format::new()
        .set_bold()
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(0x4472C4))
        .set_align(FormatAlign::Center);
    let reference_format = Format::new()
        .set_bold()
        .set_background_color(Color::RGB(0x92D050));

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("RD Session").map_err(failed)?;

    for (col, name) in TABLE_COLUMNS.iter().enumerate() {
        let col = col as u16;
        worksheet
            .write_string_with_format(0, col, *name, &header_format)
            .map_err(failed)?;
        worksheet
            .set_column_width(col, column_width(name))
            .map_err(failed)?;
    }

    for (index, record) in records.iter().enumerate() {
        let row = index as u32 + 1;
        for (col, cell) in table_row(record).into_iter().enumerate() {
            if col == REFERENCE_COLUMN && !cell.is_empty() {
                worksheet
                    .write_string_with_format(row, col as u16, cell, &reference_format)
                    .map_err(failed)?;
            } else {
                worksheet
                    .write_string(row, col as u16, cell)
                    .map_err(failed)?;
            }
        }
    }

    worksheet.set_freeze_panes(1, 0).map_err(failed)?;

    let tmp_path = path.with_extension("xlsx.tmp");
    workbook.save(&tmp_path).map_err(failed)?;
    fs::rename(&tmp_path, path).map_err(|e| failed(XlsxError::IoError(e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_spreadsheet_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.xlsx");
        let mut record = LotRecord::new(1, vec!["A".into()], 1).unwrap();
        record.status.reference_id = Some("C1".into());

        write_lot_spreadsheet(&path, &[record]).unwrap();

        let metadata = fs::metadata(&path).unwrap();
        assert!(metadata.len() > 0);
        assert!(!dir.path().join("state.xlsx.tmp").exists());
    }
}
