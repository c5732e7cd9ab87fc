pub mod commands;
pub mod output;

pub use commands::{BuildArgs, CliArgs, Commands, ConfigArgs, PlanArgs, RunArgs};
pub use output::{BuildSummary, OutputFormat, OutputFormatter};
