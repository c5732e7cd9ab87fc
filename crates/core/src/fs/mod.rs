//! Build-context file access, swappable for an in-memory context in tests.

use anyhow::Result;
use std::path::Path;

mod mock;
mod real;

pub use mock::MockFileSystem;
pub use real::RealFileSystem;

/// Size and permission bits of a regular file in the build context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    /// Unix permission bits (`0o644` where the platform has none)
    pub mode: u32,
    pub is_dir: bool,
}

impl FileMetadata {
    pub fn is_executable(&self) -> bool {
        !self.is_dir && self.mode & 0o111 != 0
    }
}

/// Read-only view of the build context.
///
/// Stages only ever read the manifest pair and the entry point through this
/// trait, so a context can be served from memory in tests.
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// True for regular files only; directories and missing paths are false.
    fn is_file(&self, path: &Path) -> bool;

    fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    fn read(&self, path: &Path) -> Result<Vec<u8>>;
}
