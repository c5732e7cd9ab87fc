//! Progress handler trait and events

use crate::error::Stage;
use std::sync::Mutex;
use std::time::Duration;

/// Events emitted while a build runs
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Pipeline started for a build context
    PipelineStarted { context: String },

    /// A stage began executing
    StageStarted { stage: Stage },

    /// A stage committed its layer
    StageCompleted {
        stage: Stage,
        layer_digest: String,
        duration: Duration,
    },

    /// An artifact named in the lock file was retrieved and verified
    ArtifactFetched {
        package: String,
        artifact: String,
        bytes: usize,
    },

    /// A locked package was unpacked into the dependency layer
    PackageInstalled {
        name: String,
        version: String,
        files: usize,
    },

    /// Pipeline reached the launchable state
    PipelineCompleted {
        image_digest: String,
        total_time: Duration,
    },

    /// Pipeline aborted
    PipelineFailed { stage: Stage, error: String },
}

/// Trait for handling progress events during a build
pub trait ProgressHandler: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &ProgressEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Keeps every event in memory; used by tests and by `--format json` summaries.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn started_stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::StageStarted { stage } => Some(stage),
                _ => None,
            })
            .collect()
    }

    pub fn completed_stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::StageCompleted { stage, .. } => Some(stage),
                _ => None,
            })
            .collect()
    }
}

impl ProgressHandler for RecordingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
