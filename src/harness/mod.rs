//! Execution harnesses: the strategies that drive a scan's agent
//! conversation to termination.

pub mod streaming;
pub mod turn_loop;

pub use streaming::StreamingHarness;
pub use turn_loop::{AuxAnalyzer, TurnLoopHarness};

use crate::tools::Submission;

/// How a harness run ended. Terminal status is decided by the scan
/// entrypoint, not here.
#[derive(Debug)]
pub enum HarnessResult {
    /// The agent called `submit_findings`.
    Submitted(Submission),
    /// No structured submission; the report compiler takes over.
    NeedsCompilation { reason: String },
}
