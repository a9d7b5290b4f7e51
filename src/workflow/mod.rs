pub mod lot_ctx;
pub mod unit_processor;

pub use lot_ctx::LotCtx;
pub use unit_processor::{due_in_month, Interrupt, LotOutcome, UnitProcessor};
