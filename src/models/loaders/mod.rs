pub mod csv_table;
pub mod xlsx_table;

pub use csv_table::{read_lot_table, table_row, write_lot_table};
pub use xlsx_table::write_lot_spreadsheet;
