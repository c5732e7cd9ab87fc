//! Fetching locked artifacts: local wheelhouse, `file://` and HTTP(S).

use crate::error::FetchError;
use crate::lockfile::LockedArtifact;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One locked artifact to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub package: String,
    pub version: String,
    pub file_name: String,
    pub url: Option<String>,
    pub path: Option<String>,
    pub hash: Option<String>,
    pub size: Option<u64>,
}

impl Artifact {
    pub fn from_locked(package: &str, version: &str, locked: &LockedArtifact) -> Option<Self> {
        Some(Self {
            package: package.to_string(),
            version: version.to_string(),
            file_name: locked.file_name()?,
            url: locked.url.clone(),
            path: locked.path.clone(),
            hash: locked.hash.clone(),
            size: locked.size,
        })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, artifact: &Artifact) -> Result<Vec<u8>, FetchError>;
}

/// Check `bytes` against the artifact's `sha256:` hash.
pub fn verify_hash(artifact: &Artifact, bytes: &[u8]) -> Result<(), FetchError> {
    let expected = artifact
        .hash
        .as_deref()
        .and_then(|h| h.strip_prefix("sha256:"))
        .ok_or_else(|| FetchError::Unsupported {
            artifact: artifact.file_name.clone(),
            reason: "no sha256 hash recorded".to_string(),
        })?;
    let actual = hex::encode(Sha256::digest(bytes));
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(FetchError::HashMismatch {
            artifact: artifact.file_name.clone(),
            expected: format!("sha256:{}", expected),
            actual: format!("sha256:{}", actual),
        });
    }
    Ok(())
}

async fn read_local(artifact: &Artifact, path: &Path) -> Result<Vec<u8>, FetchError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound {
            artifact: artifact.file_name.clone(),
        }),
        Err(source) => Err(FetchError::Io {
            artifact: artifact.file_name.clone(),
            source,
        }),
    }
}

/// A directory of wheel files, looked up by file name.
#[derive(Debug, Clone)]
pub struct WheelhouseFetcher {
    dir: PathBuf,
}

impl WheelhouseFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ArtifactFetcher for WheelhouseFetcher {
    async fn fetch(&self, artifact: &Artifact) -> Result<Vec<u8>, FetchError> {
        if artifact.file_name.contains('/') || artifact.file_name.contains("..") {
            return Err(FetchError::Unsupported {
                artifact: artifact.file_name.clone(),
                reason: "file name is not a plain file name".to_string(),
            });
        }
        let path = self.dir.join(&artifact.file_name);
        debug!("Looking up {} in wheelhouse {}", artifact.file_name, self.dir.display());
        read_local(artifact, &path).await
    }
}

/// Fetches by the artifact's recorded location: a lock-relative `path`, a
/// `file://` URL, or an HTTP(S) URL.
#[derive(Debug, Clone)]
pub struct UrlFetcher {
    client: reqwest::Client,
    base_dir: PathBuf,
    timeout: Duration,
}

impl UrlFetcher {
    pub fn new(base_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_dir: base_dir.into(),
            timeout,
        }
    }

    async fn fetch_http(&self, artifact: &Artifact, url: &str) -> Result<Vec<u8>, FetchError> {
        let network = |e: reqwest::Error| FetchError::Network {
            artifact: artifact.file_name.clone(),
            reason: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(network)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                artifact: artifact.file_name.clone(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Network {
                artifact: artifact.file_name.clone(),
                reason: format!("HTTP {}", status),
            });
        }
        let bytes = response.bytes().await.map_err(network)?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ArtifactFetcher for UrlFetcher {
    async fn fetch(&self, artifact: &Artifact) -> Result<Vec<u8>, FetchError> {
        let fetch = async {
            if let Some(path) = &artifact.path {
                return read_local(artifact, &self.base_dir.join(path)).await;
            }
            match artifact.url.as_deref() {
                Some(url) if url.starts_with("file://") => {
                    read_local(artifact, Path::new(&url["file://".len()..])).await
                }
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                    debug!("Downloading {}", url);
                    self.fetch_http(artifact, url).await
                }
                Some(url) => Err(FetchError::Unsupported {
                    artifact: artifact.file_name.clone(),
                    reason: format!("unsupported URL scheme in '{}'", url),
                }),
                None => Err(FetchError::NotFound {
                    artifact: artifact.file_name.clone(),
                }),
            }
        };

        tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| FetchError::Timeout {
                artifact: artifact.file_name.clone(),
                secs: self.timeout.as_secs(),
            })?
    }
}

/// Tries each fetcher in order until one has the artifact.
#[derive(Clone, Default)]
pub struct ChainFetcher {
    fetchers: Vec<Arc<dyn ArtifactFetcher>>,
}

impl ChainFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetchers.push(fetcher);
        self
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}

#[async_trait]
impl ArtifactFetcher for ChainFetcher {
    async fn fetch(&self, artifact: &Artifact) -> Result<Vec<u8>, FetchError> {
        let mut last_error = None;
        for fetcher in &self.fetchers {
            match fetcher.fetch(artifact).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_not_found() => {
                    last_error.get_or_insert(e);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| FetchError::NotFound {
            artifact: artifact.file_name.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(file: &str, content: &[u8]) -> Artifact {
        Artifact {
            package: "a".to_string(),
            version: "1.0".to_string(),
            file_name: file.to_string(),
            url: Some(format!("https://files.invalid/{}", file)),
            path: None,
            hash: Some(format!("sha256:{}", hex::encode(Sha256::digest(content)))),
            size: Some(content.len() as u64),
        }
    }

    #[test]
    fn test_verify_hash() {
        let a = artifact("a-1.0-py3-none-any.whl", b"wheel");
        assert!(verify_hash(&a, b"wheel").is_ok());
        assert!(matches!(
            verify_hash(&a, b"tampered"),
            Err(FetchError::HashMismatch { .. })
        ));

        let unhashed = Artifact { hash: None, ..a };
        assert!(matches!(
            verify_hash(&unhashed, b"wheel"),
            Err(FetchError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_wheelhouse_fetch() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a-1.0-py3-none-any.whl"), b"wheel").unwrap();
        let fetcher = WheelhouseFetcher::new(temp.path());

        let bytes = fetcher
            .fetch(&artifact("a-1.0-py3-none-any.whl", b"wheel"))
            .await
            .unwrap();
        assert_eq!(bytes, b"wheel");

        let err = fetcher
            .fetch(&artifact("b-1.0-py3-none-any.whl", b""))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = fetcher
            .fetch(&artifact("../a-1.0-py3-none-any.whl", b""))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_url_fetcher_file_and_path() {
        let temp = TempDir::new().unwrap();
        let wheel = temp.path().join("a-1.0-py3-none-any.whl");
        std::fs::write(&wheel, b"wheel").unwrap();
        let fetcher = UrlFetcher::new(temp.path(), Duration::from_secs(5));

        let by_url = Artifact {
            url: Some(format!("file://{}", wheel.display())),
            ..artifact("a-1.0-py3-none-any.whl", b"wheel")
        };
        assert_eq!(fetcher.fetch(&by_url).await.unwrap(), b"wheel");

        let by_path = Artifact {
            url: None,
            path: Some("a-1.0-py3-none-any.whl".to_string()),
            ..artifact("a-1.0-py3-none-any.whl", b"wheel")
        };
        assert_eq!(fetcher.fetch(&by_path).await.unwrap(), b"wheel");
    }

    #[tokio::test]
    async fn test_url_fetcher_rejects_unknown_scheme() {
        let temp = TempDir::new().unwrap();
        let fetcher = UrlFetcher::new(temp.path(), Duration::from_secs(5));
        let ftp = Artifact {
            url: Some("ftp://files.example/a.whl".to_string()),
            ..artifact("a.whl", b"")
        };
        assert!(matches!(
            fetcher.fetch(&ftp).await,
            Err(FetchError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_chain_falls_through_not_found() {
        let mut missing = MockArtifactFetcher::new();
        missing.expect_fetch().times(1).returning(|a| {
            Err(FetchError::NotFound {
                artifact: a.file_name.clone(),
            })
        });
        let mut present = MockArtifactFetcher::new();
        present
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(b"wheel".to_vec()));

        let chain = ChainFetcher::new()
            .with(Arc::new(missing))
            .with(Arc::new(present));
        let bytes = chain.fetch(&artifact("a.whl", b"wheel")).await.unwrap();
        assert_eq!(bytes, b"wheel");
    }

    #[tokio::test]
    async fn test_chain_reports_real_failure_over_not_found() {
        let mut failing = MockArtifactFetcher::new();
        failing.expect_fetch().returning(|a| {
            Err(FetchError::Timeout {
                artifact: a.file_name.clone(),
                secs: 30,
            })
        });
        let mut missing = MockArtifactFetcher::new();
        missing.expect_fetch().returning(|a| {
            Err(FetchError::NotFound {
                artifact: a.file_name.clone(),
            })
        });

        let chain = ChainFetcher::new()
            .with(Arc::new(failing))
            .with(Arc::new(missing));
        let err = chain.fetch(&artifact("a.whl", b"")).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { secs: 30, .. }));
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let err = ChainFetcher::new()
            .fetch(&artifact("a.whl", b""))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
