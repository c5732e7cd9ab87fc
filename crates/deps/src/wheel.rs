//! Wheel file names, platform tags and selection of the best artifact for
//! the target interpreter.

use crate::lockfile::LockedArtifact;
use crate::python::PythonVersion;
use crate::requirement::normalize_name;
use std::cmp::Ordering;
use thiserror::Error;

/// glibc of the Debian release behind the official slim Python images.
const TARGET_GLIBC_MINOR: u32 = 36;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid wheel file name '{0}'")]
pub struct WheelNameError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelFilename {
    pub name: String,
    pub version: String,
    pub build: Option<String>,
    pub python_tags: Vec<String>,
    pub abi_tags: Vec<String>,
    pub platform_tags: Vec<String>,
}

impl WheelFilename {
    pub fn parse(file_name: &str) -> Result<Self, WheelNameError> {
        let invalid = || WheelNameError(file_name.to_string());
        let stem = file_name.strip_suffix(".whl").ok_or_else(invalid)?;
        let parts: Vec<&str> = stem.split('-').collect();

        let (name, version, build, python, abi, platform) = match parts.as_slice() {
            [name, version, python, abi, platform] => (*name, *version, None, *python, *abi, *platform),
            [name, version, build, python, abi, platform] => {
                (*name, *version, Some(build.to_string()), *python, *abi, *platform)
            }
            _ => return Err(invalid()),
        };
        if name.is_empty() || version.is_empty() {
            return Err(invalid());
        }

        let split = |tags: &str| tags.split('.').map(String::from).collect::<Vec<_>>();
        Ok(Self {
            name: normalize_name(name),
            version: version.to_string(),
            build,
            python_tags: split(python),
            abi_tags: split(abi),
            platform_tags: split(platform),
        })
    }

    pub fn is_pure(&self) -> bool {
        self.platform_tags.iter().all(|t| t == "any")
    }
}

/// Interpreter and platform the image will run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEnvironment {
    pub python: PythonVersion,
    pub arch: String,
}

impl TargetEnvironment {
    pub fn new(python: PythonVersion, arch: impl Into<String>) -> Self {
        Self {
            python,
            arch: arch.into(),
        }
    }

    /// Rank of a platform tag, lower is better; `None` if it cannot run here.
    fn platform_rank(&self, tag: &str) -> Option<u32> {
        if tag == "any" {
            return Some(1000);
        }
        if tag == format!("linux_{}", self.arch) {
            return Some(500);
        }
        let glibc_minor = if let Some(rest) = tag.strip_prefix("manylinux_2_") {
            let (minor, arch) = rest.split_once('_')?;
            if arch != self.arch {
                return None;
            }
            minor.parse::<u32>().ok()?
        } else {
            let (legacy, arch) = tag.split_once('_')?;
            if arch != self.arch {
                return None;
            }
            match legacy {
                "manylinux2014" => 17,
                "manylinux2010" => 12,
                "manylinux1" => 5,
                _ => return None,
            }
        };
        if glibc_minor > TARGET_GLIBC_MINOR {
            return None;
        }
        Some(TARGET_GLIBC_MINOR - glibc_minor)
    }

    /// Rank of a python/abi pair, lower is better.
    fn interpreter_rank(&self, python: &str, abi: &str, pure_platform: bool) -> Option<u32> {
        let cp = self.python.cpython_tag();
        let py_major = format!("py{}", self.python.major);
        let py_minor_ok = |tag: &str| -> bool {
            tag == py_major
                || tag
                    .strip_prefix(&py_major)
                    .and_then(|m| m.parse::<u32>().ok())
                    .map(|m| m <= self.python.minor)
                    .unwrap_or(false)
        };

        let rank = if python == cp && abi == cp && !pure_platform {
            0
        } else if abi == "abi3" && !pure_platform {
            let minor = python
                .strip_prefix(&format!("cp{}", self.python.major))?
                .parse::<u32>()
                .ok()?;
            if minor > self.python.minor {
                return None;
            }
            1 + (self.python.minor - minor)
        } else if abi == "none" && python == cp {
            if pure_platform {
                300
            } else {
                100
            }
        } else if abi == "none" && py_minor_ok(python) {
            if pure_platform {
                400
            } else {
                200
            }
        } else {
            return None;
        };
        Some(rank)
    }

    /// Best (lowest) rank among the wheel's tag triples.
    pub fn rank(&self, wheel: &WheelFilename) -> Option<(u32, u32)> {
        let mut best: Option<(u32, u32)> = None;
        for python in &wheel.python_tags {
            for abi in &wheel.abi_tags {
                for platform in &wheel.platform_tags {
                    let Some(platform_rank) = self.platform_rank(platform) else {
                        continue;
                    };
                    let Some(interp_rank) =
                        self.interpreter_rank(python, abi, platform == "any")
                    else {
                        continue;
                    };
                    let candidate = (interp_rank, platform_rank);
                    if best.map(|b| candidate < b).unwrap_or(true) {
                        best = Some(candidate);
                    }
                }
            }
        }
        best
    }

    pub fn is_compatible(&self, wheel: &WheelFilename) -> bool {
        self.rank(wheel).is_some()
    }

    /// Compatible wheels of `version`, best first. Ties keep lock order.
    pub fn select<'a>(
        &self,
        wheels: &'a [LockedArtifact],
        version: &str,
    ) -> Vec<(&'a LockedArtifact, WheelFilename)> {
        let mut ranked: Vec<((u32, u32), usize, &LockedArtifact, WheelFilename)> = wheels
            .iter()
            .enumerate()
            .filter_map(|(index, artifact)| {
                let parsed = WheelFilename::parse(&artifact.file_name()?).ok()?;
                if !versions_match(&parsed.version, version) {
                    return None;
                }
                let rank = self.rank(&parsed)?;
                Some((rank, index, artifact, parsed))
            })
            .collect();
        ranked.sort_by(|a, b| match a.0.cmp(&b.0) {
            Ordering::Equal => a.1.cmp(&b.1),
            other => other,
        });
        ranked.into_iter().map(|(_, _, a, w)| (a, w)).collect()
    }
}

fn versions_match(wheel_version: &str, locked: &str) -> bool {
    use crate::version::Version;
    match (Version::parse(wheel_version), Version::parse(locked)) {
        (Ok(a), Ok(b)) => a == b,
        _ => wheel_version == locked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    fn target() -> TargetEnvironment {
        TargetEnvironment::new(PythonVersion::new(3, 12), "x86_64")
    }

    fn artifact(file: &str) -> LockedArtifact {
        LockedArtifact {
            url: Some(format!("https://files.example/{}", file)),
            path: None,
            filename: None,
            hash: Some(format!("sha256:{}", "ab".repeat(32))),
            size: None,
        }
    }

    #[test]
    fn test_parse_wheel_filename() {
        let wheel = WheelFilename::parse(
            "pydantic_core-2.33.2-cp312-cp312-manylinux_2_17_x86_64.manylinux2014_x86_64.whl",
        )
        .unwrap();
        assert_eq!(wheel.name, "pydantic-core");
        assert_eq!(wheel.version, "2.33.2");
        assert_eq!(wheel.python_tags, vec!["cp312"]);
        assert_eq!(
            wheel.platform_tags,
            vec!["manylinux_2_17_x86_64", "manylinux2014_x86_64"]
        );
        assert!(!wheel.is_pure());

        let with_build = WheelFilename::parse("a-1.0-1-py3-none-any.whl").unwrap();
        assert_eq!(with_build.build.as_deref(), Some("1"));
        assert!(with_build.is_pure());
    }

    #[test]
    fn test_parse_invalid_wheel_filename() {
        assert!(WheelFilename::parse("a-1.0.tar.gz").is_err());
        assert!(WheelFilename::parse("a-1.0-py3.whl").is_err());
    }

    #[parameterized(
        pure = { "a-1.0-py3-none-any.whl", true },
        cpython_manylinux = { "a-1.0-cp312-cp312-manylinux_2_17_x86_64.whl", true },
        legacy_manylinux = { "a-1.0-cp312-cp312-manylinux2014_x86_64.whl", true },
        too_new_glibc = { "a-1.0-cp312-cp312-manylinux_2_39_x86_64.whl", false },
        abi3 = { "a-1.0-cp38-abi3-manylinux_2_17_x86_64.whl", true },
        abi3_newer = { "a-1.0-cp313-abi3-manylinux_2_17_x86_64.whl", false },
        wrong_interpreter = { "a-1.0-cp311-cp311-manylinux_2_17_x86_64.whl", false },
        wrong_arch = { "a-1.0-cp312-cp312-manylinux_2_17_aarch64.whl", false },
        windows = { "a-1.0-cp312-cp312-win_amd64.whl", false },
        macos = { "a-1.0-cp312-cp312-macosx_11_0_arm64.whl", false },
        py2 = { "a-1.0-py2-none-any.whl", false },
        py312 = { "a-1.0-py312-none-any.whl", true },
        musl = { "a-1.0-cp312-cp312-musllinux_1_2_x86_64.whl", false },
    )]
    fn test_compatibility(file: &str, expected: bool) {
        let wheel = WheelFilename::parse(file).unwrap();
        assert_eq!(target().is_compatible(&wheel), expected, "{}", file);
    }

    #[test]
    fn test_select_prefers_specific_wheels() {
        let wheels = vec![
            artifact("a-1.0-py3-none-any.whl"),
            artifact("a-1.0-cp38-abi3-manylinux_2_17_x86_64.whl"),
            artifact("a-1.0-cp312-cp312-win_amd64.whl"),
            artifact("a-1.0-cp312-cp312-manylinux_2_17_x86_64.whl"),
            artifact("a-1.0-cp312-cp312-manylinux_2_28_x86_64.whl"),
        ];
        let selected: Vec<String> = target()
            .select(&wheels, "1.0")
            .into_iter()
            .map(|(a, _)| a.file_name().unwrap())
            .collect();

        assert_eq!(
            selected,
            vec![
                "a-1.0-cp312-cp312-manylinux_2_28_x86_64.whl",
                "a-1.0-cp312-cp312-manylinux_2_17_x86_64.whl",
                "a-1.0-cp38-abi3-manylinux_2_17_x86_64.whl",
                "a-1.0-py3-none-any.whl",
            ]
        );
    }

    #[test]
    fn test_select_ignores_other_versions() {
        let wheels = vec![
            artifact("a-2.0-py3-none-any.whl"),
            artifact("a-1.0.0-py3-none-any.whl"),
        ];
        let selected = target().select(&wheels, "1.0");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].1.version, "1.0.0");
    }

    #[test]
    fn test_aarch64_target() {
        let target = TargetEnvironment::new(PythonVersion::new(3, 12), "aarch64");
        let wheel = WheelFilename::parse("a-1.0-cp312-cp312-manylinux_2_17_aarch64.whl").unwrap();
        assert!(target.is_compatible(&wheel));
    }
}
