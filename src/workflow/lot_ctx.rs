//! LOT 处理上下文
//!
//! 封装"我正在处理第几个 LOT"这一信息

use std::fmt::Display;

use crate::models::{LotId, LotRecord};

/// LOT 处理上下文
#[derive(Debug, Clone)]
pub struct LotCtx {
    pub lot_id: LotId,

    /// 在本阶段工作集中的位置（从 0 开始，仅用于日志和进度）
    pub index: usize,

    /// 本阶段工作集大小
    pub total: usize,

    pub expected_count: u32,
}

impl LotCtx {
    pub fn new(record: &LotRecord, index: usize, total: usize) -> Self {
        Self {
            lot_id: record.lot_id,
            index,
            total,
            expected_count: record.expected_count,
        }
    }
}

impl Display for LotCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[LOT {}]", self.lot_id)
    }
}
