pub mod loaders;
pub mod lot;
pub mod run_state;

pub use loaders::{read_lot_table, write_lot_spreadsheet, write_lot_table};
pub use lot::{receipt_file_name, LotId, LotRecord, LotStage, Status, StatusVector, TABLE_COLUMNS};
pub use run_state::{DelayConfig, DelayKind, Phase, RunState};
