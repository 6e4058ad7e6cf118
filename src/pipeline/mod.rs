pub mod comparables;
pub mod fallback;
pub mod grounding;
pub mod insight;
pub mod orchestrator;
pub mod sources;
pub mod synthesize;
pub mod valuation;

pub use orchestrator::{ReportRequest, generate_report};
