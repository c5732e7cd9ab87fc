//! PEP 440 versions and version specifiers.

use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    #[error("invalid specifier '{0}'")]
    InvalidSpecifier(String),
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?ix)^
            v?
            (?:(?P<epoch>\d+)!)?
            (?P<release>\d+(?:\.\d+)*)
            (?:[-_.]?(?P<pre_l>alpha|a|beta|b|preview|pre|rc|c)[-_.]?(?P<pre_n>\d+)?)?
            (?:-(?P<post_n1>\d+)|[-_.]?(?:post|rev|r)[-_.]?(?P<post_n2>\d+)?(?P<post_mark>))?
            (?:[-_.]?dev[-_.]?(?P<dev_n>\d+)?(?P<dev_mark>))?
            (?:\+(?P<local>[a-z0-9]+(?:[-_.][a-z0-9]+)*))?
            $",
        )
        .expect("Invalid version regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreRelease {
    Alpha,
    Beta,
    Rc,
}

impl PreRelease {
    fn as_str(&self) -> &'static str {
        match self {
            PreRelease::Alpha => "a",
            PreRelease::Beta => "b",
            PreRelease::Rc => "rc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Version {
    epoch: u64,
    release: Vec<u64>,
    pre: Option<(PreRelease, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
    local: Option<String>,
}

impl Version {
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let trimmed = raw.trim();
        let caps = version_regex()
            .captures(trimmed)
            .ok_or_else(|| VersionError::InvalidVersion(raw.to_string()))?;
        let number = |name: &str| -> Result<Option<u64>, VersionError> {
            caps.name(name)
                .map(|m| m.as_str().parse::<u64>())
                .transpose()
                .map_err(|_| VersionError::InvalidVersion(raw.to_string()))
        };

        let release = caps
            .name("release")
            .map(|m| m.as_str())
            .unwrap_or_default()
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VersionError::InvalidVersion(raw.to_string()))?;

        let pre = match caps.name("pre_l") {
            Some(label) => {
                let kind = match label.as_str().to_ascii_lowercase().as_str() {
                    "a" | "alpha" => PreRelease::Alpha,
                    "b" | "beta" => PreRelease::Beta,
                    _ => PreRelease::Rc,
                };
                Some((kind, number("pre_n")?.unwrap_or(0)))
            }
            None => None,
        };

        let post = match (number("post_n1")?, caps.name("post_mark")) {
            (Some(n), _) => Some(n),
            (None, Some(_)) => Some(number("post_n2")?.unwrap_or(0)),
            (None, None) => None,
        };

        let dev = match caps.name("dev_mark") {
            Some(_) => Some(number("dev_n")?.unwrap_or(0)),
            None => None,
        };

        Ok(Self {
            epoch: number("epoch")?.unwrap_or(0),
            release,
            pre,
            post,
            dev,
            local: caps
                .name("local")
                .map(|m| m.as_str().to_ascii_lowercase().replace(['-', '_'], ".")),
        })
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// This version with the local segment removed.
    pub fn public(&self) -> Self {
        Self {
            local: None,
            ..self.clone()
        }
    }

    fn release_at(&self, index: usize) -> u64 {
        self.release.get(index).copied().unwrap_or(0)
    }

    fn release_prefix_matches(&self, prefix: &[u64]) -> bool {
        prefix
            .iter()
            .enumerate()
            .all(|(i, part)| self.release_at(i) == *part)
    }

    fn cmp_release(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        (0..len)
            .map(|i| self.release_at(i).cmp(&other.release_at(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    // Sort key for the suffix segments, following PEP 440 ordering:
    // X.devN < X.aN < X.bN < X.rcN < X < X.postN.
    fn suffix_key(&self) -> (u8, Option<(PreRelease, u64)>, Option<u64>, bool, u64) {
        let pre_rank = match (self.pre, self.post, self.dev) {
            (None, None, Some(_)) => 0,
            (Some(_), _, _) => 1,
            _ => 2,
        };
        (
            pre_rank,
            self.pre,
            self.post,
            self.dev.is_none(),
            self.dev.unwrap_or(0),
        )
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.cmp_release(other))
            .then_with(|| self.suffix_key().cmp(&other.suffix_key()))
            .then_with(|| self.local.cmp(&other.local))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}!", self.epoch)?;
        }
        let release: Vec<String> = self.release.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", release.join("."))?;
        if let Some((kind, n)) = self.pre {
            write!(f, "{}{}", kind.as_str(), n)?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{}", n)?;
        }
        if let Some(n) = self.dev {
            write!(f, ".dev{}", n)?;
        }
        if let Some(local) = &self.local {
            write!(f, "+{}", local)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
    Compatible,
    Arbitrary,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterEqual => ">=",
            Operator::LessEqual => "<=",
            Operator::Greater => ">",
            Operator::Less => "<",
            Operator::Compatible => "~=",
            Operator::Arbitrary => "===",
        }
    }

    // Longest operators first so that "===" is not read as "==".
    const PARSE_ORDER: [Operator; 8] = [
        Operator::Arbitrary,
        Operator::Equal,
        Operator::NotEqual,
        Operator::GreaterEqual,
        Operator::LessEqual,
        Operator::Compatible,
        Operator::Greater,
        Operator::Less,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specifier {
    operator: Operator,
    raw_version: String,
    version: Option<Version>,
    wildcard: bool,
}

impl Specifier {
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let trimmed = raw.trim();
        let invalid = || VersionError::InvalidSpecifier(raw.to_string());

        let operator = Operator::PARSE_ORDER
            .iter()
            .copied()
            .find(|op| trimmed.starts_with(op.as_str()))
            .ok_or_else(invalid)?;
        let rest = trimmed[operator.as_str().len()..].trim();
        if rest.is_empty() {
            return Err(invalid());
        }

        if operator == Operator::Arbitrary {
            return Ok(Self {
                operator,
                raw_version: rest.to_string(),
                version: None,
                wildcard: false,
            });
        }

        let (version_str, wildcard) = match rest.strip_suffix(".*") {
            Some(prefix) if matches!(operator, Operator::Equal | Operator::NotEqual) => {
                (prefix, true)
            }
            Some(_) => return Err(invalid()),
            None => (rest, false),
        };

        let version = Version::parse(version_str).map_err(|_| invalid())?;
        if operator == Operator::Compatible && version.release.len() < 2 {
            return Err(invalid());
        }

        Ok(Self {
            operator,
            raw_version: rest.to_string(),
            version: Some(version),
            wildcard,
        })
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn contains(&self, candidate: &Version) -> bool {
        let spec = match (&self.version, self.operator) {
            (_, Operator::Arbitrary) => {
                return candidate.to_string().eq_ignore_ascii_case(&self.raw_version)
            }
            (Some(spec), _) => spec,
            (None, _) => return false,
        };

        match self.operator {
            Operator::Equal => self.matches_equal(spec, candidate),
            Operator::NotEqual => !self.matches_equal(spec, candidate),
            Operator::GreaterEqual => candidate.public() >= *spec,
            Operator::LessEqual => candidate.public() <= *spec,
            Operator::Greater => {
                let candidate = candidate.public();
                candidate > *spec
                    && !(spec.post.is_none()
                        && candidate.post.is_some()
                        && candidate.cmp_release(spec).is_eq())
            }
            Operator::Less => {
                let candidate = candidate.public();
                candidate < *spec
                    && !(!spec.is_prerelease()
                        && candidate.is_prerelease()
                        && candidate.cmp_release(spec).is_eq())
            }
            Operator::Compatible => {
                let prefix = &spec.release[..spec.release.len() - 1];
                candidate.public() >= *spec
                    && candidate.epoch == spec.epoch
                    && candidate.release_prefix_matches(prefix)
            }
            Operator::Arbitrary => false,
        }
    }

    fn matches_equal(&self, spec: &Version, candidate: &Version) -> bool {
        if self.wildcard {
            return candidate.epoch == spec.epoch && candidate.release_prefix_matches(&spec.release);
        }
        if spec.local.is_none() {
            candidate.public() == *spec
        } else {
            candidate == spec
        }
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.version, self.wildcard) {
            (Some(v), true) => write!(f, "{}{}.*", self.operator.as_str(), v),
            (Some(v), false) => write!(f, "{}{}", self.operator.as_str(), v),
            (None, _) => write!(f, "{}{}", self.operator.as_str(), self.raw_version),
        }
    }
}

/// Comma-separated conjunction of specifiers. An empty set allows anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecifierSet {
    specifiers: Vec<Specifier>,
}

impl SpecifierSet {
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let specifiers = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Specifier::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { specifiers })
    }

    pub fn is_empty(&self) -> bool {
        self.specifiers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Specifier> {
        self.specifiers.iter()
    }

    pub fn contains(&self, candidate: &Version) -> bool {
        self.specifiers.iter().all(|s| s.contains(candidate))
    }

    /// Order-independent normalized form, used to compare declarations.
    pub fn canonical(&self) -> String {
        let mut parts: Vec<String> = self.specifiers.iter().map(|s| s.to_string()).collect();
        parts.sort();
        parts.dedup();
        parts.join(",")
    }
}

impl fmt::Display for SpecifierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.specifiers.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl FromStr for SpecifierSet {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
