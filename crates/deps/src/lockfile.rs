//! The `uv.lock` lock file.

use crate::error::ParseError;
use crate::requirement::normalize_name;
use crate::version::Version;
use serde::Deserialize;
use std::collections::BTreeMap;

pub const LOCK_FILE: &str = "uv.lock";
const SUPPORTED_LOCK_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockFile {
    pub version: u32,
    #[serde(default)]
    pub revision: Option<u32>,
    #[serde(default)]
    pub requires_python: Option<String>,
    #[serde(default, rename = "package")]
    pub packages: Vec<LockedPackage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageSource {
    pub registry: Option<String>,
    #[serde(rename = "virtual")]
    pub virtual_path: Option<String>,
    pub editable: Option<String>,
    pub path: Option<String>,
    pub directory: Option<String>,
    pub url: Option<String>,
    pub git: Option<String>,
}

impl PackageSource {
    /// Whether this is the project itself (`virtual = "."` or `editable = "."`).
    pub fn is_project_root(&self) -> bool {
        matches!(self.virtual_path.as_deref(), Some(".") | Some("./"))
            || matches!(self.editable.as_deref(), Some(".") | Some("./"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockedDependency {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub extra: Vec<String>,
    #[serde(default)]
    pub marker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockedArtifact {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl LockedArtifact {
    /// File name of the artifact, from the explicit field, path or URL.
    pub fn file_name(&self) -> Option<String> {
        if let Some(name) = &self.filename {
            return Some(name.clone());
        }
        let location = self.path.as_deref().or(self.url.as_deref())?;
        let trimmed = location.split(['?', '#']).next().unwrap_or(location);
        trimmed
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    pub fn is_hashed(&self) -> bool {
        self.hash
            .as_deref()
            .map(|h| h.starts_with("sha256:") && h.len() > "sha256:".len())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RequiresDist {
    pub name: String,
    #[serde(default)]
    pub specifier: Option<String>,
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(default)]
    pub extras: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageMetadata {
    #[serde(default)]
    pub requires_dist: Vec<RequiresDist>,
    #[serde(default)]
    pub requires_dev: BTreeMap<String, Vec<RequiresDist>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockedPackage {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub source: PackageSource,
    #[serde(default)]
    pub dependencies: Vec<LockedDependency>,
    #[serde(default)]
    pub optional_dependencies: BTreeMap<String, Vec<LockedDependency>>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, Vec<LockedDependency>>,
    #[serde(default)]
    pub sdist: Option<LockedArtifact>,
    #[serde(default)]
    pub wheels: Vec<LockedArtifact>,
    #[serde(default)]
    pub metadata: PackageMetadata,
}

impl LockedPackage {
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    pub fn has_hashed_artifact(&self) -> bool {
        self.wheels.iter().any(LockedArtifact::is_hashed)
            || self.sdist.as_ref().map(LockedArtifact::is_hashed).unwrap_or(false)
    }

    /// Every outgoing edge: main, optional and dev groups.
    pub fn all_edges(&self) -> impl Iterator<Item = &LockedDependency> {
        self.dependencies
            .iter()
            .chain(self.optional_dependencies.values().flatten())
            .chain(self.dev_dependencies.values().flatten())
    }
}

impl LockFile {
    pub fn parse(content: &str) -> Result<Self, ParseError> {
        Self::parse_named(content, LOCK_FILE)
    }

    pub fn parse_named(content: &str, file: &str) -> Result<Self, ParseError> {
        let lock: LockFile =
            toml::from_str(content).map_err(|e| ParseError::new(file, e.to_string()))?;

        if lock.version != SUPPORTED_LOCK_VERSION {
            return Err(ParseError::new(
                file,
                format!(
                    "unsupported lock version {} (expected {})",
                    lock.version, SUPPORTED_LOCK_VERSION
                ),
            ));
        }

        for package in &lock.packages {
            if let Some(version) = &package.version {
                Version::parse(version).map_err(|e| {
                    ParseError::new(file, format!("package '{}': {}", package.name, e))
                })?;
            }
        }

        Ok(lock)
    }

    /// The project entry, matched by source and normalized name.
    pub fn project(&self, name: &str) -> Option<&LockedPackage> {
        let name = normalize_name(name);
        self.packages
            .iter()
            .find(|p| p.source.is_project_root() && p.normalized_name() == name)
    }

    /// All entries with the given name (more than one when the lock forks by marker).
    pub fn packages_named(&self, name: &str) -> Vec<&LockedPackage> {
        let name = normalize_name(name);
        self.packages
            .iter()
            .filter(|p| p.normalized_name() == name)
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::lock_a_b;
    use super::*;

    #[test]
    fn test_parse_lock() {
        let lock = LockFile::parse(&lock_a_b("1.0")).unwrap();
        assert_eq!(lock.version, 1);
        assert_eq!(lock.revision, Some(2));
        assert_eq!(lock.packages.len(), 5);

        let project = lock.project("App").unwrap();
        assert_eq!(project.metadata.requires_dist[0].name, "a");
        assert_eq!(project.dev_dependencies["dev"][0].name, "pytest");

        let a = lock.packages_named("A");
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].dependencies[1].marker.as_deref(), Some("sys_platform == 'win32'"));
        assert!(a[0].has_hashed_artifact());
    }

    #[test]
    fn test_artifact_file_name() {
        let artifact = LockedArtifact {
            url: Some("https://files.example/x/a-1.0-py3-none-any.whl?x=1".to_string()),
            path: None,
            filename: None,
            hash: Some("sha256:ab".to_string()),
            size: None,
        };
        assert_eq!(artifact.file_name().as_deref(), Some("a-1.0-py3-none-any.whl"));
        assert!(artifact.is_hashed());

        let unhashed = LockedArtifact {
            hash: Some("md5:ab".to_string()),
            ..artifact
        };
        assert!(!unhashed.is_hashed());
    }

    #[test]
    fn test_rejects_unknown_lock_version() {
        let content = lock_a_b("1.0").replacen("version = 1", "version = 9", 1);
        let err = LockFile::parse(&content).unwrap_err();
        assert!(err.reason.contains("unsupported lock version 9"));
    }

    #[test]
    fn test_rejects_invalid_package_version() {
        let err = LockFile::parse(&lock_a_b("not-a-version")).unwrap_err();
        assert!(err.reason.contains("package 'a'"));
    }

    #[test]
    fn test_project_requires_root_source() {
        let lock = LockFile::parse(&lock_a_b("1.0")).unwrap();
        assert!(lock.project("a").is_none());
    }
}
