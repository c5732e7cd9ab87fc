use super::{FileMetadata, FileSystem};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// In-memory build context. Relative paths resolve under `root`.
pub struct MockFileSystem {
    root: PathBuf,
    files: RwLock<BTreeMap<PathBuf, (Vec<u8>, u32)>>,
}

impl MockFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn with_file(self, path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Self {
        self.insert(path, content, 0o644);
        self
    }

    pub fn insert(&self, path: impl AsRef<Path>, content: impl AsRef<[u8]>, mode: u32) {
        let path = self.resolve(path.as_ref());
        if let Ok(mut files) = self.files.write() {
            files.insert(path, (content.as_ref().to_vec(), mode));
        }
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        let path = self.resolve(path.as_ref());
        if let Ok(mut files) = self.files.write() {
            files.remove(&path);
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn get(&self, path: &Path) -> Option<(Vec<u8>, u32)> {
        let path = self.resolve(path);
        self.files.read().ok()?.get(&path).cloned()
    }

    /// A directory is any proper prefix of a stored file.
    fn is_dir(&self, path: &Path) -> bool {
        let path = self.resolve(path);
        self.files
            .read()
            .map(|files| files.keys().any(|f| f != &path && f.starts_with(&path)))
            .unwrap_or(false)
    }
}

impl FileSystem for MockFileSystem {
    fn exists(&self, path: &Path) -> bool {
        self.is_file(path) || self.is_dir(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        if let Some((content, mode)) = self.get(path) {
            return Ok(FileMetadata {
                size: content.len() as u64,
                mode,
                is_dir: false,
            });
        }
        if self.is_dir(path) {
            return Ok(FileMetadata {
                size: 0,
                mode: 0o755,
                is_dir: true,
            });
        }
        Err(anyhow!("No such file: {}", path.display()))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.get(path)
            .map(|(content, _)| content)
            .ok_or_else(|| anyhow!("No such file: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_resolve_under_root() {
        let context = MockFileSystem::new("/ctx").with_file("pyproject.toml", "[project]\n");

        assert!(context.is_file(Path::new("/ctx/pyproject.toml")));
        assert!(context.exists(Path::new("/ctx")));
        assert!(!context.is_file(Path::new("/ctx")));
        assert_eq!(
            context.read(Path::new("pyproject.toml")).unwrap(),
            b"[project]\n"
        );
    }

    #[test]
    fn test_mode_is_kept() {
        let context = MockFileSystem::new("/ctx");
        context.insert("bin/tool", b"\x7fELF", 0o755);

        let meta = context.metadata(Path::new("bin/tool")).unwrap();
        assert_eq!(meta.mode, 0o755);
        assert_eq!(meta.size, 4);
        assert!(meta.is_executable());
        assert!(context.metadata(Path::new("bin")).unwrap().is_dir);
    }

    #[test]
    fn test_remove() {
        let context = MockFileSystem::new("/ctx").with_file("server.py", "");
        context.remove("server.py");
        assert!(!context.exists(Path::new("server.py")));
        assert!(context.read(Path::new("server.py")).is_err());
    }
}
