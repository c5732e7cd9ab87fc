//! Verification that a lock file is a complete, consistent resolution of the
//! manifest, and extraction of the set of packages to install.

use crate::error::LockError;
use crate::lockfile::{LockFile, LockedArtifact, LockedDependency, LockedPackage, RequiresDist};
use crate::manifest::Manifest;
use crate::marker::{MarkerEnvironment, MarkerTree};
use crate::requirement::{normalize_name, Requirement};
use crate::version::{SpecifierSet, Version};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
    pub wheels: Vec<LockedArtifact>,
    pub sdist: Option<LockedArtifact>,
}

impl ResolvedPackage {
    pub fn pin(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }
}

/// Packages to install, sorted by name. The project itself is excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSet {
    pub project: String,
    pub packages: Vec<ResolvedPackage>,
}

impl ResolvedSet {
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedPackage> {
        let name = normalize_name(name);
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn pins(&self) -> Vec<String> {
        self.packages.iter().map(ResolvedPackage::pin).collect()
    }
}

fn requires_dist_key(entry: &RequiresDist) -> Result<(String, String), LockError> {
    let specifier = SpecifierSet::parse(entry.specifier.as_deref().unwrap_or("")).map_err(|e| {
        LockError::RequiresDistDiffers {
            package: normalize_name(&entry.name),
            declared: "a valid specifier".to_string(),
            locked: e.to_string(),
        }
    })?;
    let requirement = Requirement {
        name: normalize_name(&entry.name),
        extras: entry.extras.iter().map(|e| normalize_name(e)).collect(),
        specifier,
        url: entry.url.clone(),
        marker: None,
    };
    Ok((requirement.name.clone(), requirement.declaration_key()))
}

fn check_requires_dist(manifest: &Manifest, project: &LockedPackage) -> Result<(), LockError> {
    let declared: BTreeMap<String, String> = manifest
        .dependencies
        .iter()
        .chain(manifest.optional_dependencies.values().flatten())
        .map(|r| (r.declaration_key(), r.name.clone()))
        .collect();

    let mut locked: BTreeMap<String, String> = BTreeMap::new();
    for entry in &project.metadata.requires_dist {
        let (name, key) = requires_dist_key(entry)?;
        locked.insert(key, name);
    }

    let keys_named = |map: &BTreeMap<String, String>, name: &str| -> String {
        let keys: Vec<&str> = map
            .iter()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(k, _)| k.as_str())
            .collect();
        if keys.is_empty() {
            "nothing".to_string()
        } else {
            keys.join(", ")
        }
    };

    if let Some((key, name)) = declared.iter().find(|(k, _)| !locked.contains_key(*k)) {
        return Err(LockError::RequiresDistDiffers {
            package: name.clone(),
            declared: key.clone(),
            locked: keys_named(&locked, name),
        });
    }
    if let Some((key, name)) = locked.iter().find(|(k, _)| !declared.contains_key(*k)) {
        return Err(LockError::RequiresDistDiffers {
            package: name.clone(),
            declared: keys_named(&declared, name),
            locked: key.clone(),
        });
    }
    Ok(())
}

fn resolve_edge<'a>(
    lock: &'a LockFile,
    from: &LockedPackage,
    edge: &LockedDependency,
) -> Result<&'a LockedPackage, LockError> {
    let mut candidates = lock.packages_named(&edge.name);
    if let Some(version) = &edge.version {
        candidates.retain(|p| p.version.as_deref() == Some(version.as_str()));
    }
    match candidates.len() {
        0 => Err(LockError::DanglingDependency {
            from: from.normalized_name(),
            package: normalize_name(&edge.name),
        }),
        1 => Ok(candidates[0]),
        n => Err(LockError::Ambiguous {
            package: normalize_name(&edge.name),
            reason: format!("{} entries and the edge from '{}' names no version", n, from.name),
        }),
    }
}

fn edge_applies(edge: &LockedDependency, env: &MarkerEnvironment) -> Result<bool, LockError> {
    match &edge.marker {
        None => Ok(true),
        Some(raw) => MarkerTree::parse(raw)
            .map(|m| m.evaluate(env))
            .map_err(|e| LockError::Ambiguous {
                package: normalize_name(&edge.name),
                reason: e.to_string(),
            }),
    }
}

fn package_key(package: &LockedPackage) -> (String, String) {
    (
        package.normalized_name(),
        package.version.clone().unwrap_or_default(),
    )
}

/// Every package reachable from the project over any edge, ignoring markers.
fn reachable_all<'a>(
    lock: &'a LockFile,
    project: &'a LockedPackage,
) -> Result<BTreeSet<(String, String)>, LockError> {
    let mut seen = BTreeSet::from([package_key(project)]);
    let mut queue = VecDeque::from([project]);
    while let Some(package) = queue.pop_front() {
        for edge in package.all_edges() {
            let target = resolve_edge(lock, package, edge)?;
            if seen.insert(package_key(target)) {
                queue.push_back(target);
            }
        }
    }
    Ok(seen)
}

/// Packages the project needs at runtime on the target: main edges whose
/// markers hold, plus the optional groups named by edge extras.
fn reachable_runtime<'a>(
    lock: &'a LockFile,
    project: &'a LockedPackage,
    env: &MarkerEnvironment,
) -> Result<Vec<&'a LockedPackage>, LockError> {
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    let mut result = Vec::new();
    let mut queue: VecDeque<(&LockedPackage, &LockedDependency)> =
        project.dependencies.iter().map(|e| (project, e)).collect();

    while let Some((from, edge)) = queue.pop_front() {
        if !edge_applies(edge, env)? {
            debug!("Skipping {} -> {} (marker excludes target)", from.name, edge.name);
            continue;
        }
        let target = resolve_edge(lock, from, edge)?;
        let key = package_key(target);
        let first_visit = seen.insert(key);
        if first_visit {
            result.push(target);
            queue.extend(target.dependencies.iter().map(|e| (target, e)));
        }
        for extra in &edge.extra {
            if let Some(group) = target.optional_dependencies.get(&normalize_name(extra)) {
                queue.extend(group.iter().map(|e| (target, e)));
            }
        }
    }

    Ok(result)
}

/// Check `lock` against `manifest` and the pinned versions, then return the
/// set of packages to install on the target described by `env`.
///
/// Nothing is fetched; every failure here happens before any artifact is
/// requested.
pub fn verify(
    manifest: &Manifest,
    lock: &LockFile,
    pinned_versions: &BTreeMap<String, String>,
    env: &MarkerEnvironment,
) -> Result<ResolvedSet, LockError> {
    let project = lock
        .project(&manifest.name)
        .ok_or_else(|| LockError::ProjectMissing {
            project: manifest.name.clone(),
        })?;

    check_requires_dist(manifest, project)?;

    for requirement in manifest.dependencies.iter().filter(|r| r.applies_to(env)) {
        let candidates = lock.packages_named(&requirement.name);
        if candidates.is_empty() {
            return Err(LockError::MissingFromLock {
                package: requirement.name.clone(),
            });
        }
        let satisfied = candidates.iter().any(|p| {
            p.version
                .as_deref()
                .and_then(|v| Version::parse(v).ok())
                .map(|v| requirement.specifier.contains(&v))
                .unwrap_or(requirement.url.is_some())
        });
        if !satisfied {
            let locked: Vec<&str> = candidates
                .iter()
                .filter_map(|p| p.version.as_deref())
                .collect();
            return Err(LockError::VersionUnsatisfied {
                package: requirement.name.clone(),
                locked: locked.join(", "),
                specifier: requirement.specifier.to_string(),
            });
        }
    }

    let reachable = reachable_all(lock, project)?;
    if let Some(extraneous) = lock
        .packages
        .iter()
        .find(|p| !reachable.contains(&package_key(p)))
    {
        return Err(LockError::Extraneous {
            package: extraneous.normalized_name(),
        });
    }

    if let Some(unhashed) = lock
        .packages
        .iter()
        .filter(|p| !p.source.is_project_root())
        .find(|p| !p.has_hashed_artifact())
    {
        return Err(LockError::Unhashed {
            package: unhashed.normalized_name(),
        });
    }

    for (name, pinned) in pinned_versions {
        let name = normalize_name(name);
        let candidates = lock.packages_named(&name);
        if candidates.is_empty() {
            return Err(LockError::PinnedNotLocked {
                package: name,
                pinned: pinned.clone(),
            });
        }
        let pinned_version = Version::parse(pinned).ok();
        let matches = candidates.iter().any(|p| {
            match (&pinned_version, p.version.as_deref().map(Version::parse)) {
                (Some(want), Some(Ok(have))) => *want == have,
                _ => p.version.as_deref() == Some(pinned.as_str()),
            }
        });
        if !matches {
            return Err(LockError::PinnedVersionMismatch {
                package: name,
                pinned: pinned.clone(),
                locked: candidates
                    .iter()
                    .filter_map(|p| p.version.clone())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
    }

    let mut packages: Vec<ResolvedPackage> = reachable_runtime(lock, project, env)?
        .into_iter()
        .filter(|p| !p.source.is_project_root())
        .map(|p| ResolvedPackage {
            name: p.normalized_name(),
            version: p.version.clone().unwrap_or_default(),
            wheels: p.wheels.iter().filter(|w| w.is_hashed()).cloned().collect(),
            sdist: p.sdist.clone().filter(LockedArtifact::is_hashed),
        })
        .collect();
    packages.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));

    debug!(
        "Lock verified for {}: {} packages to install",
        project.name,
        packages.len()
    );

    Ok(ResolvedSet {
        project: project.normalized_name(),
        packages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockfile::fixtures::{lock_a_b, MANIFEST_A};
    use crate::python::PythonVersion;

    fn env() -> MarkerEnvironment {
        MarkerEnvironment::linux(PythonVersion::new(3, 12), "x86_64")
    }

    fn manifest(deps: &str) -> Manifest {
        Manifest::parse(&format!(
            "[project]\nname = \"app\"\nversion = \"0.1.0\"\ndependencies = [{}]\n",
            deps
        ))
        .unwrap()
    }

    fn no_pins() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn test_consistent_lock_resolves_runtime_set() {
        let manifest = Manifest::parse(MANIFEST_A).unwrap();
        let lock = LockFile::parse(&lock_a_b("1.0")).unwrap();

        let resolved = verify(&manifest, &lock, &no_pins(), &env()).unwrap();
        assert_eq!(resolved.project, "app");
        assert_eq!(resolved.pins(), vec!["a==1.0", "b==2.1.0"]);
        assert_eq!(resolved.get("A").unwrap().wheels.len(), 1);
        assert_eq!(resolved.get("b").unwrap().wheels.len(), 2);
    }

    #[test]
    fn test_manifest_version_differs_from_lock() {
        let lock = LockFile::parse(&lock_a_b("1.0")).unwrap();
        let err = verify(&manifest("\"A==2.0\""), &lock, &no_pins(), &env()).unwrap_err();

        assert_eq!(
            err,
            LockError::RequiresDistDiffers {
                package: "a".to_string(),
                declared: "a==2.0".to_string(),
                locked: "a==1.0".to_string(),
            }
        );
    }

    #[test]
    fn test_lock_entry_absent_from_manifest() {
        let lock = LockFile::parse(&lock_a_b("1.0")).unwrap();
        let err = verify(&manifest(""), &lock, &no_pins(), &env()).unwrap_err();
        assert_eq!(err.package(), "a");
        assert!(matches!(err, LockError::RequiresDistDiffers { .. }));
    }

    #[test]
    fn test_manifest_entry_absent_from_lock() {
        let lock = LockFile::parse(&lock_a_b("1.0")).unwrap();
        let err = verify(
            &manifest("\"a==1.0\", \"httpx\""),
            &lock,
            &no_pins(),
            &env(),
        )
        .unwrap_err();
        assert_eq!(err.package(), "httpx");
    }

    #[test]
    fn test_locked_version_must_satisfy_manifest() {
        let content = lock_a_b("1.0").replace(
            "requires-dist = [{ name = \"a\", specifier = \"==1.0\" }]",
            "requires-dist = [{ name = \"a\", specifier = \">=1.5\" }]",
        );
        let lock = LockFile::parse(&content).unwrap();
        let err = verify(&manifest("\"a>=1.5\""), &lock, &no_pins(), &env()).unwrap_err();
        assert_eq!(
            err,
            LockError::VersionUnsatisfied {
                package: "a".to_string(),
                locked: "1.0".to_string(),
                specifier: ">=1.5".to_string(),
            }
        );
    }

    #[test]
    fn test_project_missing() {
        let lock = LockFile::parse(&lock_a_b("1.0")).unwrap();
        let other = Manifest::parse("[project]\nname = \"other\"\n").unwrap();
        let err = verify(&other, &lock, &no_pins(), &env()).unwrap_err();
        assert!(matches!(err, LockError::ProjectMissing { .. }));
    }

    #[test]
    fn test_dangling_edge() {
        let content = lock_a_b("1.0").replace("{ name = \"b\" },", "{ name = \"c\" },");
        let lock = LockFile::parse(&content).unwrap();
        let err = verify(&Manifest::parse(MANIFEST_A).unwrap(), &lock, &no_pins(), &env())
            .unwrap_err();
        assert_eq!(
            err,
            LockError::DanglingDependency {
                from: "a".to_string(),
                package: "c".to_string(),
            }
        );
    }

    #[test]
    fn test_extraneous_entry() {
        let content = format!(
            "{}\n[[package]]\nname = \"stray\"\nversion = \"1.0\"\nsource = {{ registry = \"https://pypi.org/simple\" }}\nwheels = [{{ url = \"https://files.example/stray-1.0-py3-none-any.whl\", hash = \"sha256:{}\" }}]\n",
            lock_a_b("1.0"),
            "77".repeat(32)
        );
        let lock = LockFile::parse(&content).unwrap();
        let err = verify(&Manifest::parse(MANIFEST_A).unwrap(), &lock, &no_pins(), &env())
            .unwrap_err();
        assert_eq!(
            err,
            LockError::Extraneous {
                package: "stray".to_string()
            }
        );
    }

    #[test]
    fn test_unhashed_package() {
        let content = lock_a_b("1.0").replace(
            &format!("hash = \"sha256:{}\", size = 40", "55".repeat(32)),
            "size = 40",
        );
        let lock = LockFile::parse(&content).unwrap();
        let err = verify(&Manifest::parse(MANIFEST_A).unwrap(), &lock, &no_pins(), &env())
            .unwrap_err();
        assert_eq!(
            err,
            LockError::Unhashed {
                package: "pytest".to_string()
            }
        );
    }

    #[test]
    fn test_pinned_versions() {
        let manifest = Manifest::parse(MANIFEST_A).unwrap();
        let lock = LockFile::parse(&lock_a_b("1.0")).unwrap();

        let pins = BTreeMap::from([("B".to_string(), "2.1".to_string())]);
        assert!(verify(&manifest, &lock, &pins, &env()).is_ok());

        let pins = BTreeMap::from([("b".to_string(), "2.2".to_string())]);
        let err = verify(&manifest, &lock, &pins, &env()).unwrap_err();
        assert_eq!(
            err,
            LockError::PinnedVersionMismatch {
                package: "b".to_string(),
                pinned: "2.2".to_string(),
                locked: "2.1.0".to_string(),
            }
        );

        let pins = BTreeMap::from([("zzz".to_string(), "1".to_string())]);
        let err = verify(&manifest, &lock, &pins, &env()).unwrap_err();
        assert!(matches!(err, LockError::PinnedNotLocked { .. }));
    }

    #[test]
    fn test_marker_edges_follow_target_platform() {
        let manifest = Manifest::parse(MANIFEST_A).unwrap();
        let lock = LockFile::parse(&lock_a_b("1.0")).unwrap();
        let resolved = verify(&manifest, &lock, &no_pins(), &env()).unwrap();
        assert!(resolved.get("pywin32").is_none());
        assert!(resolved.get("pytest").is_none());
    }

    #[test]
    fn test_extras_pull_optional_groups() {
        let content = r#"version = 1

[[package]]
name = "app"
version = "0.1.0"
source = { virtual = "." }
dependencies = [{ name = "uvicorn", extra = ["standard"] }]

[package.metadata]
requires-dist = [{ name = "uvicorn", extras = ["standard"], specifier = ">=0.30" }]

[[package]]
name = "uvicorn"
version = "0.35.0"
source = { registry = "https://pypi.org/simple" }
wheels = [{ url = "https://f/uvicorn-0.35.0-py3-none-any.whl", hash = "sha256:aa" }]

[package.optional-dependencies]
standard = [{ name = "httptools" }]

[[package]]
name = "httptools"
version = "0.6.4"
source = { registry = "https://pypi.org/simple" }
wheels = [{ url = "https://f/httptools-0.6.4-cp312-cp312-manylinux_2_17_x86_64.whl", hash = "sha256:bb" }]
"#;
        let manifest = manifest("\"uvicorn[standard]>=0.30\"");
        let lock = LockFile::parse(content).unwrap();
        let resolved = verify(&manifest, &lock, &no_pins(), &env()).unwrap();
        assert_eq!(resolved.pins(), vec!["httptools==0.6.4", "uvicorn==0.35.0"]);
    }
}
