//! Typed stage outputs. Each state owns its predecessor by value, so a later
//! stage can read everything an earlier one produced but never change it.

use pinbox_deps::{InstallRecord, PythonVersion, ResolvedSet};
use pinbox_image::{Digest, Image, ImageRef};

/// Output shared by every committed stage: the image so far.
pub trait StageOutput {
    fn image(&self) -> &Image;

    /// Diff id of the layer this stage committed, or empty for a stage that
    /// only changed metadata.
    fn committed_layer(&self) -> String {
        self.image()
            .layers()
            .last()
            .map(|layer| layer.diff_id().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct BaseReady {
    pub image: Image,
    pub reference: ImageRef,
    pub digest: Digest,
}

#[derive(Debug, Clone)]
pub struct ToolReady {
    pub base: BaseReady,
    pub image: Image,
    pub tool: ImageRef,
    pub dest: String,
}

#[derive(Debug, Clone)]
pub struct DepsReady {
    pub tool: ToolReady,
    pub image: Image,
    pub python: PythonVersion,
    pub resolved: ResolvedSet,
    pub record: InstallRecord,
}

/// The finished image, ready to export and launch.
#[derive(Debug, Clone)]
pub struct Launchable {
    pub deps: DepsReady,
    pub image: Image,
    pub digest: Digest,
    pub command: Vec<String>,
}

impl Launchable {
    pub fn base(&self) -> &BaseReady {
        &self.deps.tool.base
    }

    pub fn installed(&self) -> &[String] {
        &self.deps.record.packages
    }
}

macro_rules! impl_stage_output {
    ($($state:ty),*) => {
        $(impl StageOutput for $state {
            fn image(&self) -> &Image {
                &self.image
            }
        })*
    };
}

impl_stage_output!(BaseReady, ToolReady, DepsReady, Launchable);

/// Coarse view of how far a build got, for reporting.
#[derive(Debug, Clone)]
pub enum PipelineState {
    Empty,
    BaseReady(BaseReady),
    ToolReady(ToolReady),
    DepsReady(DepsReady),
    Launchable(Box<Launchable>),
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Empty => "empty",
            PipelineState::BaseReady(_) => "base-ready",
            PipelineState::ToolReady(_) => "tool-ready",
            PipelineState::DepsReady(_) => "deps-ready",
            PipelineState::Launchable(_) => "launchable",
        }
    }

    pub fn image(&self) -> Option<&Image> {
        match self {
            PipelineState::Empty => None,
            PipelineState::BaseReady(s) => Some(&s.image),
            PipelineState::ToolReady(s) => Some(&s.image),
            PipelineState::DepsReady(s) => Some(&s.image),
            PipelineState::Launchable(s) => Some(&s.image),
        }
    }
}
