//! Pluggable quality checks over a finished agent run.
//!
//! ```text
//! [[evaluators]] name = "agentic-judge:naming"
//!     |
//!     v
//! EvaluatorRegistry --create(name, config)--> Box<dyn Evaluator>
//!     |
//!     v
//! EvaluatorPipeline::run --> one EvaluationResult per configured name
//! ```

pub mod diff_summary;
pub mod expected_diff;
pub mod judge;
pub mod judge_parser;
pub mod pipeline;
pub mod registry;
pub mod trait_def;
pub mod types;

pub use diff_summary::DiffSummaryEvaluator;
pub use expected_diff::ExpectedDiffEvaluator;
pub use judge::JudgeEvaluator;
pub use pipeline::EvaluatorPipeline;
pub use registry::{EvaluatorRegistry, EvaluatorSetup};
pub use trait_def::Evaluator;
pub use types::{EvaluationContext, EvaluationResult, EvaluationStatus, RunSnapshot};
