//! Shared fixtures for stage and pipeline tests.

use crate::pipeline::BuildContext;
use crate::recipe::BuildRecipe;
use async_trait::async_trait;
use pinbox_deps::error::FetchError;
use pinbox_deps::{Artifact, ArtifactFetcher, WheelhouseFetcher};
use pinbox_image::layer::{EXEC_MODE, FILE_MODE};
use pinbox_image::{ImageConfig, ImageRef, LayerBuilder, MemoryImageSource};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use zip::write::FileOptions;

pub const WHEEL_ANY: &str = "a-1.0-py3-none-any.whl";
pub const WHEEL_MANYLINUX: &str = "a-1.0-cp312-cp312-manylinux_2_17_x86_64.whl";

/// Stand-in for the `uv` binary: checks that the dependency is installed and
/// records the port and entry point it was handed.
pub const FAKE_UV: &str = r#"#!/bin/sh
[ "$1" = "run" ] || exit 64
[ -f "$VIRTUAL_ENV/lib/python3.12/site-packages/a/__init__.py" ] || exit 65
[ -f "$2" ] || exit 66
printf '%s %s\n' "$PORT" "$2" > launched
"#;

pub fn build_wheel(dist: &str, version: &str, tag: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let dist_info = format!("{}-{}.dist-info", dist, version);
    let wheel = format!(
        "Wheel-Version: 1.0\nRoot-Is-Purelib: true\nTag: {}\n",
        tag
    );
    let metadata = format!(
        "Metadata-Version: 2.1\nName: {}\nVersion: {}\n",
        dist, version
    );

    let mut entries: Vec<(String, Vec<u8>)> = files
        .iter()
        .map(|(path, data)| (path.to_string(), data.to_vec()))
        .collect();
    entries.push((format!("{}/METADATA", dist_info), metadata.into_bytes()));
    entries.push((format!("{}/WHEEL", dist_info), wheel.into_bytes()));

    for (path, data) in entries {
        writer
            .start_file(path, FileOptions::default().unix_permissions(0o644))
            .unwrap();
        writer.write_all(&data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn sha256(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn wheel_line(file_name: &str, bytes: &[u8]) -> String {
    format!(
        "    {{ url = \"https://files.invalid/{}\", hash = \"{}\", size = {} }},\n",
        file_name,
        sha256(bytes),
        bytes.len()
    )
}

/// A build context (`pyproject.toml`, `uv.lock`, `server.py`), a wheelhouse,
/// and an in-memory source holding the base and tool images. The lock always
/// pins `a==1.0`; the manifest declares `a==<manifest_version>`.
pub struct Fixture {
    temp: TempDir,
    pub source: Arc<MemoryImageSource>,
}

impl Fixture {
    pub fn new(manifest_version: &str) -> Self {
        Self::build(manifest_version, false)
    }

    /// Like `new`, but the lock also records a manylinux wheel that ranks
    /// above the pure one and is missing from the wheelhouse.
    pub fn with_platform_wheel(manifest_version: &str) -> Self {
        Self::build(manifest_version, true)
    }

    fn build(manifest_version: &str, platform_wheel: bool) -> Self {
        let temp = TempDir::new().unwrap();
        let context = temp.path().join("context");
        let wheelhouse = temp.path().join("wheels");
        std::fs::create_dir_all(&context).unwrap();
        std::fs::create_dir_all(&wheelhouse).unwrap();

        let pure = build_wheel("a", "1.0", "py3-none-any", &[("a/__init__.py", b"VALUE = 1\n")]);
        std::fs::write(wheelhouse.join(WHEEL_ANY), &pure).unwrap();

        let mut wheels = String::new();
        if platform_wheel {
            let native = build_wheel(
                "a",
                "1.0",
                "cp312-cp312-manylinux_2_17_x86_64",
                &[("a/__init__.py", b"VALUE = 2\n")],
            );
            wheels.push_str(&wheel_line(WHEEL_MANYLINUX, &native));
        }
        wheels.push_str(&wheel_line(WHEEL_ANY, &pure));

        let lock = format!(
            r#"version = 1
revision = 2
requires-python = ">=3.12"

[[package]]
name = "a"
version = "1.0"
source = {{ registry = "https://pypi.org/simple" }}
wheels = [
{wheels}]

[[package]]
name = "app"
version = "0.1.0"
source = {{ virtual = "." }}
dependencies = [
    {{ name = "a" }},
]

[package.metadata]
requires-dist = [{{ name = "a", specifier = "==1.0" }}]
"#,
            wheels = wheels
        );
        let manifest = format!(
            "[project]\nname = \"app\"\nversion = \"0.1.0\"\nrequires-python = \">=3.12\"\ndependencies = [\"a=={}\"]\n",
            manifest_version
        );

        std::fs::write(context.join("uv.lock"), lock).unwrap();
        std::fs::write(context.join("pyproject.toml"), manifest).unwrap();
        std::fs::write(context.join("server.py"), "print('serving')\n").unwrap();

        let fixture = Self {
            temp,
            source: Arc::new(MemoryImageSource::new()),
        };
        fixture.populate(&fixture.source);
        fixture
    }

    /// Insert the base and tool images into `source`.
    pub fn populate(&self, source: &MemoryImageSource) {
        let mut base = LayerBuilder::new();
        base.add_file("/usr/local/bin/python3.12", b"\x7fELF".to_vec(), EXEC_MODE)
            .unwrap();
        base.add_dir("/bin", 0o755).unwrap();
        base.add_file("/etc/os-release", b"ID=debian\n".to_vec(), FILE_MODE)
            .unwrap();
        source.insert(
            &ImageRef::parse("python:3.12-slim").unwrap(),
            vec![base.finish().unwrap()],
            ImageConfig {
                env: vec![
                    "PATH=/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
                    "LANG=C.UTF-8".to_string(),
                ],
                ..ImageConfig::default()
            },
        );

        let mut tool = LayerBuilder::new();
        tool.add_file("/uv", FAKE_UV.as_bytes().to_vec(), EXEC_MODE)
            .unwrap();
        source.insert(
            &ImageRef::parse("ghcr.io/astral-sh/uv:0.8.3").unwrap(),
            vec![tool.finish().unwrap()],
            ImageConfig::default(),
        );
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn context_dir(&self) -> PathBuf {
        self.temp.path().join("context")
    }

    pub fn wheelhouse_dir(&self) -> PathBuf {
        self.temp.path().join("wheels")
    }

    pub fn wheelhouse_fetcher(&self) -> WheelhouseFetcher {
        WheelhouseFetcher::new(self.wheelhouse_dir())
    }

    pub fn context(&self) -> BuildContext {
        BuildContext::new(
            self.context_dir(),
            BuildRecipe::default(),
            self.source.clone(),
            Arc::new(self.wheelhouse_fetcher()),
        )
        .with_fetch_timeout(Duration::from_secs(5))
    }
}

/// Counts fetches before delegating.
pub struct CountingFetcher<F> {
    inner: F,
    calls: AtomicUsize,
}

impl<F> CountingFetcher<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F: ArtifactFetcher> ArtifactFetcher for CountingFetcher<F> {
    async fn fetch(&self, artifact: &Artifact) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(artifact).await
    }
}

/// Answers every fetch only after `delay`.
pub struct SlowFetcher {
    pub delay: Duration,
}

#[async_trait]
impl ArtifactFetcher for SlowFetcher {
    async fn fetch(&self, _artifact: &Artifact) -> Result<Vec<u8>, FetchError> {
        tokio::time::sleep(self.delay).await;
        Ok(Vec::new())
    }
}
