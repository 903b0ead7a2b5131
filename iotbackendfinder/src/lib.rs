pub mod bulk;
pub mod catalog;
pub mod chase;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod domain_utils;
pub mod export;
pub mod extract;
pub mod fetch;
pub mod logger;
pub mod pipeline;
pub mod postprocess;
pub mod rate_limit;
pub mod record;

pub use catalog::PatternCatalog;
pub use checkpoint::{Checkpoint, ResumeMode};
pub use pipeline::{CancelFlag, Pipeline, RunOutcome};
pub use record::{Match, MatchSet};
