use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The four ordered build stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    BaseProvisioning,
    ToolInjection,
    DependencyResolution,
    ApplicationAssembly,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::BaseProvisioning,
        Stage::ToolInjection,
        Stage::DependencyResolution,
        Stage::ApplicationAssembly,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::BaseProvisioning => "base-provisioning",
            Stage::ToolInjection => "tool-injection",
            Stage::DependencyResolution => "dependency-resolution",
            Stage::ApplicationAssembly => "application-assembly",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fatal build failures. Every variant carries the stage that failed and the
/// artifact it failed on.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("[{stage}] image not found: {reference} ({reason})")]
    ImageNotFound {
        stage: Stage,
        reference: String,
        reason: String,
    },

    #[error("[{stage}] image {reference} changed upstream: pinned {expected}, resolved {actual}")]
    ImageDigestMismatch {
        stage: Stage,
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("[{stage}] tool source unavailable: {path} in {image} ({reason})")]
    ToolSourceUnavailable {
        stage: Stage,
        image: String,
        path: String,
        reason: String,
    },

    #[error("[{stage}] lock mismatch for {package}: {reason}")]
    LockMismatch {
        stage: Stage,
        package: String,
        reason: String,
    },

    #[error("[{stage}] fetch denied for {package} ({artifact}): {reason}")]
    FetchDenied {
        stage: Stage,
        package: String,
        artifact: String,
        reason: String,
    },

    #[error("[{stage}] entry point missing: {}", path.display())]
    EntryPointMissing { stage: Stage, path: PathBuf },

    #[error("[{stage}] build cancelled")]
    Cancelled { stage: Stage },

    #[error("[{stage}] invalid {artifact}: {reason}")]
    InvalidInput {
        stage: Stage,
        artifact: String,
        reason: String,
    },

    #[error("[{stage}] I/O error on {artifact}: {source}")]
    Io {
        stage: Stage,
        artifact: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn stage(&self) -> Stage {
        match self {
            BuildError::ImageNotFound { stage, .. }
            | BuildError::ImageDigestMismatch { stage, .. }
            | BuildError::ToolSourceUnavailable { stage, .. }
            | BuildError::LockMismatch { stage, .. }
            | BuildError::FetchDenied { stage, .. }
            | BuildError::EntryPointMissing { stage, .. }
            | BuildError::Cancelled { stage }
            | BuildError::InvalidInput { stage, .. }
            | BuildError::Io { stage, .. } => *stage,
        }
    }

    /// Short machine-readable kind, used in logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::ImageNotFound { .. } => "ImageNotFound",
            BuildError::ImageDigestMismatch { .. } => "ImageDigestMismatch",
            BuildError::ToolSourceUnavailable { .. } => "ToolSourceUnavailable",
            BuildError::LockMismatch { .. } => "LockMismatch",
            BuildError::FetchDenied { .. } => "FetchDenied",
            BuildError::EntryPointMissing { .. } => "EntryPointMissing",
            BuildError::Cancelled { .. } => "Cancelled",
            BuildError::InvalidInput { .. } => "InvalidInput",
            BuildError::Io { .. } => "Io",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::ImageNotFound { .. } => 10,
            BuildError::ImageDigestMismatch { .. } => 11,
            BuildError::ToolSourceUnavailable { .. } => 12,
            BuildError::LockMismatch { .. } => 13,
            BuildError::FetchDenied { .. } => 14,
            BuildError::EntryPointMissing { .. } => 15,
            BuildError::Cancelled { .. } => 130,
            BuildError::InvalidInput { .. } => 2,
            BuildError::Io { .. } => 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Cancelled { .. })
    }
}
