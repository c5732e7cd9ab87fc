use pinbox_image::LayerError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("failed to parse {file}: {reason}")]
pub struct ParseError {
    pub file: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            reason: reason.into(),
        }
    }
}

/// Manifest and lock file disagree, or the lock is not a complete resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock file has no entry for project '{project}'")]
    ProjectMissing { project: String },

    #[error("manifest declares {declared}, lock records {locked}")]
    RequiresDistDiffers {
        package: String,
        declared: String,
        locked: String,
    },

    #[error("'{package}' is declared but not locked")]
    MissingFromLock { package: String },

    #[error("locked {package}=={locked} does not satisfy '{specifier}'")]
    VersionUnsatisfied {
        package: String,
        locked: String,
        specifier: String,
    },

    #[error("'{from}' depends on '{package}', which is not locked")]
    DanglingDependency { from: String, package: String },

    #[error("'{package}' is locked but not reachable from the project")]
    Extraneous { package: String },

    #[error("'{package}' has no content-hashed artifact")]
    Unhashed { package: String },

    #[error("'{package}' is ambiguous in the lock file: {reason}")]
    Ambiguous { package: String, reason: String },

    #[error("pinned {package}=={pinned}, lock has {locked}")]
    PinnedVersionMismatch {
        package: String,
        pinned: String,
        locked: String,
    },

    #[error("pinned {package}=={pinned} is not in the lock file")]
    PinnedNotLocked { package: String, pinned: String },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl LockError {
    /// The package the mismatch is about.
    pub fn package(&self) -> &str {
        match self {
            LockError::ProjectMissing { project } => project,
            LockError::RequiresDistDiffers { package, .. }
            | LockError::MissingFromLock { package }
            | LockError::VersionUnsatisfied { package, .. }
            | LockError::DanglingDependency { package, .. }
            | LockError::Extraneous { package }
            | LockError::Unhashed { package }
            | LockError::Ambiguous { package, .. }
            | LockError::PinnedVersionMismatch { package, .. }
            | LockError::PinnedNotLocked { package, .. } => package,
            LockError::Parse(e) => &e.file,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{artifact} not found")]
    NotFound { artifact: String },

    #[error("fetching {artifact} timed out after {secs}s")]
    Timeout { artifact: String, secs: u64 },

    #[error("fetching {artifact} failed: {reason}")]
    Network { artifact: String, reason: String },

    #[error("{artifact} hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("{artifact}: {reason}")]
    Unsupported { artifact: String, reason: String },

    #[error("failed to read {artifact}: {source}")]
    Io {
        artifact: String,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{package}: invalid wheel: {reason}")]
    InvalidWheel { package: String, reason: String },

    #[error("{package}: wheel entry '{path}' escapes the install root")]
    UnsafePath { package: String, path: String },

    #[error("{package}: {source}")]
    Layer {
        package: String,
        #[source]
        source: LayerError,
    },
}
