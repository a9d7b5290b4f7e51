pub mod checkpoint_store;
pub mod control_channel;
pub mod operator_prompt;
pub mod portal_driver;
pub mod receipt_merger;
pub mod safety_monitor;

pub use checkpoint_store::CheckpointStore;
pub use control_channel::{
    ControlChannel, ControlSignal, EventRecord, LiveFeed, LotOutcomeKind, LotStatusRow,
};
pub use operator_prompt::{OperatorPrompt, StdinPrompt};
pub use portal_driver::{AccountDueDate, ChromiumPortal, PortalDriver, PAGINATION_CAP};
pub use receipt_merger::{LopdfToolkit, MergeReport, MergeSkipReason, PdfToolkit, ReceiptMerger};
pub use safety_monitor::{MemoryProbe, SafetyBreach, SafetyLimits, SafetyMonitor, SysinfoProbe};
