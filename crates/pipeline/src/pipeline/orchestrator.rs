use super::context::BuildContext;
use super::phase_trait::BuildStage;
use super::phases::{AssembleStage, BaseStage, DependencyStage, ToolStage};
use super::state::{Launchable, PipelineState, StageOutput};
use pinbox_core::error::{BuildError, Stage};
use pinbox_core::progress::ProgressEvent;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs the four stages in order. A stage starts only after the previous one
/// committed its layer; the first failure ends the build.
pub struct PipelineOrchestrator {
    cancel: CancellationToken,
}

impl Default for PipelineOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineOrchestrator {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Build the complete image.
    pub async fn build(&self, context: &BuildContext) -> Result<Launchable, BuildError> {
        match self.run_to(context, Stage::ApplicationAssembly).await? {
            PipelineState::Launchable(launchable) => Ok(*launchable),
            other => Err(BuildError::InvalidInput {
                stage: Stage::ApplicationAssembly,
                artifact: "pipeline".to_string(),
                reason: format!("stopped in state {}", other.name()),
            }),
        }
    }

    /// Run stages up to and including `last`.
    pub async fn run_to(
        &self,
        context: &BuildContext,
        last: Stage,
    ) -> Result<PipelineState, BuildError> {
        let start = Instant::now();
        info!(
            context = %context.context_dir().display(),
            target = %last,
            "Starting build pipeline"
        );
        context.report(ProgressEvent::PipelineStarted {
            context: context.context_dir().display().to_string(),
        });

        let result = self.run_stages(context, last).await;

        match &result {
            Ok(state) => {
                let image_digest = match state {
                    PipelineState::Launchable(launchable) => launchable.digest.to_string(),
                    other => other
                        .image()
                        .and_then(|image| image.digest().ok())
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                };
                info!(
                    state = state.name(),
                    image_digest = %image_digest,
                    total_time_ms = start.elapsed().as_millis(),
                    "Build complete"
                );
                context.report(ProgressEvent::PipelineCompleted {
                    image_digest,
                    total_time: start.elapsed(),
                });
            }
            Err(e) => {
                error!(
                    stage = %e.stage(),
                    kind = e.kind(),
                    error = %e,
                    "Build failed"
                );
                context.report(ProgressEvent::PipelineFailed {
                    stage: e.stage(),
                    error: e.to_string(),
                });
            }
        }

        result
    }

    async fn run_stages(
        &self,
        context: &BuildContext,
        last: Stage,
    ) -> Result<PipelineState, BuildError> {
        let base = self.run_stage(context, &BaseStage, ()).await?;
        if last == Stage::BaseProvisioning {
            return Ok(PipelineState::BaseReady(base));
        }

        let tool = self.run_stage(context, &ToolStage, base).await?;
        if last == Stage::ToolInjection {
            return Ok(PipelineState::ToolReady(tool));
        }

        let deps = self.run_stage(context, &DependencyStage, tool).await?;
        if last == Stage::DependencyResolution {
            return Ok(PipelineState::DepsReady(deps));
        }

        let launchable = self.run_stage(context, &AssembleStage, deps).await?;
        Ok(PipelineState::Launchable(Box::new(launchable)))
    }

    async fn run_stage<S>(
        &self,
        context: &BuildContext,
        stage: &S,
        input: S::Input,
    ) -> Result<S::Output, BuildError>
    where
        S: BuildStage,
        S::Output: StageOutput,
    {
        let name = stage.stage();
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled { stage: name });
        }

        info!(stage = %name, "Starting stage");
        context.report(ProgressEvent::StageStarted { stage: name });
        let stage_start = Instant::now();

        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BuildError::Cancelled { stage: name }),
            result = stage.execute(context, input) => result,
        }?;

        let layer_digest = output.committed_layer();
        info!(
            stage = %name,
            layer = %layer_digest,
            duration_ms = stage_start.elapsed().as_millis(),
            "Stage complete"
        );
        context.report(ProgressEvent::StageCompleted {
            stage: name,
            layer_digest,
            duration: stage_start.elapsed(),
        });

        Ok(output)
    }
}
