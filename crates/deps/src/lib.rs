//! Python dependency handling for pinbox: PEP 440/508 parsing, the
//! `pyproject.toml` manifest, the `uv.lock` lock file, manifest/lock
//! consistency, wheel selection, artifact fetching and wheel installation.
//!
//! Nothing here re-solves dependencies. The lock file is the only source of
//! versions; this crate checks it and installs exactly what it names.

pub mod consistency;
pub mod error;
pub mod fetch;
pub mod install;
pub mod lockfile;
pub mod manifest;
pub mod marker;
pub mod python;
pub mod requirement;
pub mod version;
pub mod wheel;

pub use consistency::{verify, ResolvedPackage, ResolvedSet};
pub use error::{FetchError, InstallError, LockError, ParseError};
pub use fetch::{verify_hash, Artifact, ArtifactFetcher, ChainFetcher, UrlFetcher, WheelhouseFetcher};
pub use install::{InstallRecord, InstalledPackage, VenvLayout, WheelInstaller};
pub use lockfile::{LockFile, LOCK_FILE};
pub use manifest::{Manifest, MANIFEST_FILE};
pub use marker::MarkerEnvironment;
pub use python::PythonVersion;
pub use requirement::{normalize_name, Requirement};
pub use version::{SpecifierSet, Version};
pub use wheel::{TargetEnvironment, WheelFilename};
