// Data processing pipeline: ingestion, processing, storage and the run that ties them together

pub mod context;
pub mod ingestion;
pub mod orchestrator;
pub mod processing;
pub mod report;
pub mod storage;

// Re-export the entry points
pub use context::{CollapsedKey, RejectReason, Rejection, RunContext, Stage, StageCount};
pub use orchestrator::Pipeline;
pub use report::RunReport;
