//! Logging-based progress handler

use super::{ProgressEvent, ProgressHandler};
use tracing::{debug, error, info};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PipelineStarted { context } => {
                info!(context = %context, "Starting build pipeline");
            }
            ProgressEvent::StageStarted { stage } => {
                info!(stage = %stage, "Starting stage");
            }
            ProgressEvent::StageCompleted {
                stage,
                layer_digest,
                duration,
            } => {
                info!(
                    stage = %stage,
                    layer = %layer_digest,
                    duration_ms = duration.as_millis(),
                    "Stage complete"
                );
            }
            ProgressEvent::ArtifactFetched {
                package,
                artifact,
                bytes,
            } => {
                debug!(package = %package, artifact = %artifact, bytes, "Artifact fetched");
            }
            ProgressEvent::PackageInstalled {
                name,
                version,
                files,
            } => {
                debug!(package = %name, version = %version, files, "Package installed");
            }
            ProgressEvent::PipelineCompleted {
                image_digest,
                total_time,
            } => {
                info!(
                    image = %image_digest,
                    total_time_ms = total_time.as_millis(),
                    "Build complete"
                );
            }
            ProgressEvent::PipelineFailed { stage, error } => {
                error!(stage = %stage, error = %error, "Build failed");
            }
        }
    }
}
