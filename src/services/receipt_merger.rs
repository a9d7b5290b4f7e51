//! 回单合并 - 业务能力层
//!
//! 只合并单页回单；多页回单排除并报告。
//! 输出 `Merged_<最小LOT>-<最大LOT>.pdf`，目标文件已存在时整体跳过。

use lopdf::{Document, Object, ObjectId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ReceiptError;
use crate::models::{LotId, LotRecord};

/// 少于这个数量的合格回单不合并
const MIN_RECEIPTS_TO_MERGE: usize = 2;

/// PDF 工具
pub trait PdfToolkit: Send + Sync {
    fn page_count(&self, path: &Path) -> Result<usize, ReceiptError>;
    /// 按给定顺序把 `inputs` 合并为 `output`
    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ReceiptError>;
}

/// 某个回单没有参与合并的原因
#[derive(Debug, Clone, PartialEq)]
pub enum MergeSkipReason {
    /// 多页回单
    MultiPage { pages: usize },
    /// 文件不存在
    Missing,
    /// 无法读取页数
    Unreadable { reason: String },
}

/// 合并结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// 输出文件（没有合并时为 None）
    pub output: Option<PathBuf>,
    pub merged: Vec<LotId>,
    pub skipped: Vec<(LotId, MergeSkipReason)>,
    /// 目标文件已存在，本次没有写入
    pub already_existed: bool,
}

/// 回单合并服务
pub struct ReceiptMerger {
    toolkit: Arc<dyn PdfToolkit>,
}

impl ReceiptMerger {
    pub fn new(toolkit: Arc<dyn PdfToolkit>) -> Self {
        Self { toolkit }
    }

    /// 合并 `dir` 中所有已付款 LOT 的单页回单
    pub fn merge(&self, dir: &Path, records: &[LotRecord]) -> Result<MergeReport, ReceiptError> {
        let mut report = MergeReport::default();
        let mut eligible: Vec<(LotId, PathBuf)> = Vec::new();

        for record in records {
            let Some(name) = record.receipt_file_name() else {
                continue;
            };
            if !record.status.is_paid() {
                continue;
            }
            let path = dir.join(name);
            if !path.is_file() {
                report.skipped.push((record.lot_id, MergeSkipReason::Missing));
                continue;
            }

            match self.toolkit.page_count(&path) {
                Ok(1) => eligible.push((record.lot_id, path)),
                Ok(pages) => {
                    warn!(
                        "⚠️ [LOT {}] 回单有 {} 页，不参与合并: {}",
                        record.lot_id,
                        pages,
                        path.display()
                    );
                    report
                        .skipped
                        .push((record.lot_id, MergeSkipReason::MultiPage { pages }));
                }
                Err(e) => {
                    warn!("⚠️ [LOT {}] 无法读取回单: {}", record.lot_id, e);
                    report.skipped.push((
                        record.lot_id,
                        MergeSkipReason::Unreadable {
                            reason: e.to_string(),
                        },
                    ));
                }
            }
        }

        if eligible.len() < MIN_RECEIPTS_TO_MERGE {
            info!("合格的单页回单只有 {} 个，无需合并", eligible.len());
            return Ok(report);
        }

        eligible.sort_by_key(|(lot_id, _)| *lot_id);
        let lot_ids: Vec<LotId> = eligible.iter().map(|(lot_id, _)| *lot_id).collect();
        let output = dir.join(merged_file_name(&lot_ids));

        if output.exists() {
            info!("⏭️ {} 已存在，跳过合并", output.display());
            report.output = Some(output);
            report.already_existed = true;
            return Ok(report);
        }

        let inputs: Vec<PathBuf> = eligible.into_iter().map(|(_, path)| path).collect();
        self.toolkit.merge(&inputs, &output)?;
        info!(
            "✅ 已合并 {} 个回单 → {}",
            lot_ids.len(),
            output.display()
        );

        report.output = Some(output);
        report.merged = lot_ids;
        Ok(report)
    }
}

/// 合并文件名 `Merged_<min>-<max>.pdf`
pub fn merged_file_name(lot_ids: &[LotId]) -> String {
    let min = lot_ids.iter().min().copied().unwrap_or_default();
    let max = lot_ids.iter().max().copied().unwrap_or_default();
    format!("Merged_{}-{}.pdf", min, max)
}

/// 基于 lopdf 的实现
#[derive(Debug, Clone, Copy, Default)]
pub struct LopdfToolkit;

impl PdfToolkit for LopdfToolkit {
    fn page_count(&self, path: &Path) -> Result<usize, ReceiptError> {
        let document = Document::load(path).map_err(|e| ReceiptError::PageCountFailed {
            path: path.display().to_string(),
            source: Box::new(e),
        })?;
        Ok(document.get_pages().len())
    }

    fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ReceiptError> {
        let failed = |source: Box<dyn std::error::Error + Send + Sync>| ReceiptError::MergeFailed {
            output: output.display().to_string(),
            source,
        };

        let mut max_id = 1;
        let mut pages: BTreeMap<ObjectId, Object> = BTreeMap::new();
        let mut objects: BTreeMap<ObjectId, Object> = BTreeMap::new();

        for input in inputs {
            let mut doc = Document::load(input).map_err(|e| failed(Box::new(e)))?;
            doc.renumber_objects_with(max_id);
            max_id = doc.max_id + 1;

            for (_, page_id) in doc.get_pages() {
                let page = doc
                    .get_object(page_id)
                    .map_err(|e| failed(Box::new(e)))?
                    .to_owned();
                pages.insert(page_id, page);
            }
            objects.extend(doc.objects);
        }

        let mut document = Document::with_version("1.5");
        let mut catalog: Option<(ObjectId, Object)> = None;
        let mut pages_root: Option<(ObjectId, Object)> = None;

        for (object_id, object) in objects {
            match object.type_name().unwrap_or("") {
                "Catalog" => {
                    let id = catalog.as_ref().map_or(object_id, |(id, _)| *id);
                    catalog = Some((id, object));
                }
                "Pages" => {
                    if let Ok(dictionary) = object.as_dict() {
                        let mut dictionary = dictionary.clone();
                        if let Some((_, Object::Dictionary(previous))) = &pages_root {
                            dictionary.extend(previous);
                        }
                        let id = pages_root.as_ref().map_or(object_id, |(id, _)| *id);
                        pages_root = Some((id, Object::Dictionary(dictionary)));
                    }
                }
                "Page" | "Outlines" | "Outline" => {}
                _ => {
                    document.objects.insert(object_id, object);
                }
            }
        }

        let (Some((catalog_id, catalog)), Some((pages_id, pages_root))) = (catalog, pages_root)
        else {
            return Err(failed("输入文件缺少 Catalog 或 Pages".into()));
        };

        for (page_id, page) in &pages {
            if let Ok(dictionary) = page.as_dict() {
                let mut dictionary = dictionary.clone();
                dictionary.set("Parent", pages_id);
                document
                    .objects
                    .insert(*page_id, Object::Dictionary(dictionary));
            }
        }

        if let Ok(dictionary) = pages_root.as_dict() {
            let mut dictionary = dictionary.clone();
            dictionary.set("Count", pages.len() as i64);
            dictionary.set(
                "Kids",
                pages
                    .keys()
                    .map(|id| Object::Reference(*id))
                    .collect::<Vec<_>>(),
            );
            document
                .objects
                .insert(pages_id, Object::Dictionary(dictionary));
        }

        if let Ok(dictionary) = catalog.as_dict() {
            let mut dictionary = dictionary.clone();
            dictionary.set("Pages", pages_id);
            dictionary.remove(b"Outlines");
            document
                .objects
                .insert(catalog_id, Object::Dictionary(dictionary));
        }

        document.trailer.set("Root", catalog_id);
        document.max_id = document.objects.len() as u32;
        document.renumber_objects();
        document.compress();

        let tmp_path = output.with_extension("pdf.tmp");
        document
            .save(&tmp_path)
            .map_err(|e| failed(Box::new(e)))?;
        std::fs::rename(&tmp_path, output).map_err(|e| failed(Box::new(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Status;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// 页数由文件名决定，合并时只记录输入
    struct FakeToolkit {
        pages: HashMap<String, usize>,
        merged: Mutex<Vec<Vec<PathBuf>>>,
    }

    impl PdfToolkit for FakeToolkit {
        fn page_count(&self, path: &Path) -> Result<usize, ReceiptError> {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            Ok(self.pages.get(&name).copied().unwrap_or(1))
        }

        fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ReceiptError> {
            self.merged.lock().unwrap().push(inputs.to_vec());
            fs::write(output, b"%PDF-merged").unwrap();
            Ok(())
        }
    }

    fn paid_lot(lot_id: LotId, reference_id: &str) -> LotRecord {
        let mut record = LotRecord::new(lot_id, vec!["A".into()], 1).unwrap();
        record.status.selection_verified = Status::Ok;
        record.status.pay_status = Status::Ok;
        record.status.reference_id = Some(reference_id.to_string());
        record
    }

    #[test]
    fn merged_name_uses_min_and_max() {
        assert_eq!(merged_file_name(&[3, 1, 7]), "Merged_1-7.pdf");
    }

    #[test]
    fn single_receipt_is_not_merged() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("1_X.pdf"), b"%PDF").unwrap();
        let merger = ReceiptMerger::new(Arc::new(FakeToolkit {
            pages: HashMap::new(),
            merged: Mutex::new(Vec::new()),
        }));

        let report = merger.merge(dir.path(), &[paid_lot(1, "X")]).unwrap();
        assert_eq!(report.output, None);
        assert!(report.merged.is_empty());
    }

    #[test]
    fn existing_target_skips_merge() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("1_X.pdf"), b"%PDF").unwrap();
        fs::write(dir.path().join("2_Y.pdf"), b"%PDF").unwrap();
        fs::write(dir.path().join("Merged_1-2.pdf"), b"old").unwrap();
        let toolkit = Arc::new(FakeToolkit {
            pages: HashMap::new(),
            merged: Mutex::new(Vec::new()),
        });
        let merger = ReceiptMerger::new(toolkit.clone());

        let report = merger
            .merge(dir.path(), &[paid_lot(1, "X"), paid_lot(2, "Y")])
            .unwrap();
        assert!(report.already_existed);
        assert!(toolkit.merged.lock().unwrap().is_empty());
        assert_eq!(fs::read(dir.path().join("Merged_1-2.pdf")).unwrap(), b"old");
    }

    #[test]
    fn missing_receipt_is_reported() {
        let dir = tempdir().unwrap();
        let merger = ReceiptMerger::new(Arc::new(FakeToolkit {
            pages: HashMap::new(),
            merged: Mutex::new(Vec::new()),
        }));
        let report = merger.merge(dir.path(), &[paid_lot(5, "Z")]).unwrap();
        assert_eq!(report.skipped, vec![(5, MergeSkipReason::Missing)]);
    }
}
