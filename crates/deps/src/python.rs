//! Target interpreter version, derived from the base image tag or the
//! manifest's `requires-python`.

use std::fmt;

pub const DEFAULT_PYTHON: PythonVersion = PythonVersion { major: 3, minor: 12 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
}

fn normalize_python_version(version_str: &str) -> Option<String> {
    let ver = version_str
        .trim()
        .trim_start_matches(">=")
        .trim_start_matches("==")
        .trim_start_matches('^')
        .trim_start_matches("~=")
        .trim_start_matches('~')
        .trim_start_matches("python")
        .trim()
        .split(|c: char| c == ',' || c.is_whitespace())
        .next()
        .unwrap_or_default()
        .split('.')
        .take(2)
        .collect::<Vec<_>>()
        .join(".");

    if !ver.is_empty() {
        Some(ver)
    } else {
        None
    }
}

impl PythonVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse `"3.12"`, `"3.12.4"` or `"3.12-slim"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let numeric: String = raw
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some(Self { major, minor })
    }

    /// Version implied by an image tag such as `3.12-slim-bookworm`.
    pub fn from_image_tag(tag: &str) -> Option<Self> {
        Self::parse(tag)
    }

    /// Lower bound of a `requires-python` value such as `>=3.11`.
    pub fn from_requires_python(requires: &str) -> Option<Self> {
        normalize_python_version(requires).and_then(|v| Self::parse(&v))
    }

    /// Base image tag first, then `requires-python`, then the default.
    pub fn resolve(image_tag: &str, requires_python: Option<&str>) -> Self {
        Self::from_image_tag(image_tag)
            .or_else(|| requires_python.and_then(Self::from_requires_python))
            .unwrap_or(DEFAULT_PYTHON)
    }

    /// CPython wheel tag, e.g. `cp312`.
    pub fn cpython_tag(&self) -> String {
        format!("cp{}{}", self.major, self.minor)
    }

    /// Interpreter location in the official Python base images.
    pub fn interpreter_path(&self) -> String {
        format!("/usr/local/bin/python{}.{}", self.major, self.minor)
    }
}

impl Default for PythonVersion {
    fn default() -> Self {
        DEFAULT_PYTHON
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
