//! Pinned image references: `[registry/]repository:tag[@sha256:digest]`.

use crate::digest::Digest;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

const FLOATING_TAG: &str = "latest";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("image reference is empty")]
    Empty,

    #[error("image reference '{0}' has no tag; a pinned version tag is required")]
    MissingTag(String),

    #[error("image reference '{0}' uses the floating 'latest' tag; pin an exact version")]
    FloatingTag(String),

    #[error("image reference '{reference}' is invalid: {reason}")]
    Invalid { reference: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    registry: Option<String>,
    repository: String,
    tag: String,
    digest: Option<Digest>,
}

impl ImageRef {
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (name_tag, digest) = match raw.split_once('@') {
            Some((name_tag, digest)) => {
                let digest = Digest::parse(digest).map_err(|e| ReferenceError::Invalid {
                    reference: raw.to_string(),
                    reason: e.to_string(),
                })?;
                (name_tag, Some(digest))
            }
            None => (raw, None),
        };

        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                (&name_tag[..split], &name_tag[split + 1..])
            }
            None => return Err(ReferenceError::MissingTag(raw.to_string())),
        };

        if tag.is_empty() {
            return Err(ReferenceError::MissingTag(raw.to_string()));
        }
        if tag == FLOATING_TAG {
            return Err(ReferenceError::FloatingTag(raw.to_string()));
        }
        if !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(ReferenceError::Invalid {
                reference: raw.to_string(),
                reason: format!("invalid tag '{}'", tag),
            });
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest.to_string())
            }
            _ => (None, name.to_string()),
        };

        if let Some(host) = &registry {
            if host.starts_with('.') || host.contains("..") {
                return Err(ReferenceError::Invalid {
                    reference: raw.to_string(),
                    reason: format!("invalid registry '{}'", host),
                });
            }
        }

        if !repository.split('/').all(valid_path_component) {
            return Err(ReferenceError::Invalid {
                reference: raw.to_string(),
                reason: format!("invalid repository '{}'", repository),
            });
        }

        Ok(Self {
            registry,
            repository,
            tag: tag.to_string(),
            digest,
        })
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// `[registry/]repository`
    pub fn name(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }

    /// `[registry/]repository:tag`, without the digest.
    pub fn tagged(&self) -> String {
        format!("{}:{}", self.name(), self.tag)
    }

    /// Relative directory of this reference inside a local image store.
    pub fn store_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        if let Some(registry) = &self.registry {
            path.push(registry.replace(':', "_"));
        }
        for part in self.repository.split('/') {
            path.push(part);
        }
        path.push(&self.tag);
        path
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tagged())?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageRef {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A repository path component: lowercase alphanumerics, separators inside.
/// Rules out empty, `.` and `..` components.
fn valid_path_component(component: &str) -> bool {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    component.starts_with(alnum)
        && component.ends_with(alnum)
        && component
            .chars()
            .all(|c| alnum(c) || matches!(c, '.' | '_' | '-'))
}
