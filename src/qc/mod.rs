//! Quality control over converted BIDS images.

pub mod report;
pub mod stats;
pub mod workflow;

pub use report::{QcReport, QcRun, discover_images, unique_clean_names};
pub use stats::{FdParams, FdSummary, Fwhm};
pub use workflow::{PipelineVariant, QcStats, QcWorkflow, Stage, WorkflowResult, WorkflowState};
