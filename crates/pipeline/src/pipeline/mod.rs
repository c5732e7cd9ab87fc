pub mod context;
pub mod orchestrator;
pub mod phase_trait;
pub mod phases;
pub mod state;

pub use context::BuildContext;
pub use orchestrator::PipelineOrchestrator;
pub use phase_trait::BuildStage;
pub use state::{BaseReady, DepsReady, Launchable, PipelineState, StageOutput, ToolReady};
