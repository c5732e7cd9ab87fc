//! PEP 508 dependency specifications, as written in `[project].dependencies`.

use crate::marker::{MarkerEnvironment, MarkerTree};
use crate::version::SpecifierSet;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid requirement '{requirement}': {reason}")]
pub struct RequirementError {
    pub requirement: String,
    pub reason: String,
}

/// PEP 503 name normalization: lowercase, runs of `-`, `_` and `.` become `-`.
pub fn normalize_name(name: &str) -> String {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    SEPARATORS
        .get_or_init(|| Regex::new(r"[-_.]+").expect("Invalid name separator regex"))
        .replace_all(name.trim(), "-")
        .to_ascii_lowercase()
}

fn requirement_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?P<name>[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[(?P<extras>[^\]]*)\])?\s*(?P<rest>[^;]*?)\s*(?:;\s*(?P<marker>.*?))?\s*$",
        )
        .expect("Invalid requirement regex")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub extras: BTreeSet<String>,
    pub specifier: SpecifierSet,
    pub url: Option<String>,
    pub marker: Option<MarkerTree>,
}

impl Requirement {
    pub fn parse(raw: &str) -> Result<Self, RequirementError> {
        let error = |reason: String| RequirementError {
            requirement: raw.to_string(),
            reason,
        };

        let caps = requirement_regex()
            .captures(raw)
            .ok_or_else(|| error("expected a distribution name".to_string()))?;

        let name = caps
            .name("name")
            .map(|m| normalize_name(m.as_str()))
            .ok_or_else(|| error("expected a distribution name".to_string()))?;

        let extras = caps
            .name("extras")
            .map(|m| {
                m.as_str()
                    .split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(normalize_name)
                    .collect()
            })
            .unwrap_or_default();

        let rest = caps.name("rest").map(|m| m.as_str().trim()).unwrap_or("");
        let (specifier, url) = if let Some(url) = rest.strip_prefix('@') {
            let url = url.trim();
            if url.is_empty() {
                return Err(error("empty URL".to_string()));
            }
            (SpecifierSet::default(), Some(url.to_string()))
        } else {
            let inner = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .unwrap_or(rest);
            let specifier = SpecifierSet::parse(inner).map_err(|e| error(e.to_string()))?;
            (specifier, None)
        };

        let marker = match caps.name("marker").map(|m| m.as_str().trim()) {
            Some(m) if !m.is_empty() => {
                Some(MarkerTree::parse(m).map_err(|e| error(e.to_string()))?)
            }
            Some(_) => return Err(error("empty marker".to_string())),
            None => None,
        };

        Ok(Self {
            name,
            extras,
            specifier,
            url,
            marker,
        })
    }

    /// Whether this requirement applies to `env`.
    pub fn applies_to(&self, env: &MarkerEnvironment) -> bool {
        self.marker.as_ref().map(|m| m.evaluate(env)).unwrap_or(true)
    }

    /// Name, extras and version constraint in a stable form; markers excluded.
    pub fn declaration_key(&self) -> String {
        let mut key = self.name.clone();
        if !self.extras.is_empty() {
            let extras: Vec<&str> = self.extras.iter().map(String::as_str).collect();
            key.push_str(&format!("[{}]", extras.join(",")));
        }
        match &self.url {
            Some(url) => key.push_str(&format!(" @ {}", url)),
            None => key.push_str(&self.specifier.canonical()),
        }
        key
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.declaration_key())?;
        if let Some(marker) = &self.marker {
            write!(f, "; {}", marker)?;
        }
        Ok(())
    }
}

impl FromStr for Requirement {
    type Err = RequirementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
