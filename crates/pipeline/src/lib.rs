//! The pinbox build pipeline: recipe, the four stages, the orchestrator that
//! runs them, build plans, and local launch of the result.

pub mod launch;
pub mod pipeline;
pub mod plan;
pub mod recipe;

#[cfg(test)]
pub(crate) mod testing;

pub use launch::{Launcher, LaunchError, ProcessSpawner, RecordingSpawner, TokioSpawner};
pub use pipeline::context::BuildContext;
pub use pipeline::orchestrator::PipelineOrchestrator;
pub use pipeline::state::{Launchable, PipelineState};
pub use plan::plan;
pub use recipe::{BuildRecipe, RecipeError, RECIPE_FILE};
