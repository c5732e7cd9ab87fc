use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FROZEN: bool = true;
const DEFAULT_RETAIN_CACHE: bool = false;
const DEFAULT_PLATFORM: &str = "x86_64";
const SUPPORTED_PLATFORMS: &[&str] = &["x86_64", "aarch64"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },
}

/// Options recognized by the dependency stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BuildOptions {
    /// Disallow any deviation from the lock file's primary artifact.
    pub frozen: bool,
    /// Keep downloaded artifacts inside the image.
    pub retain_cache: bool,
    /// Extra pins checked against the lock file (normalized name -> version).
    pub pinned_versions: BTreeMap<String, String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            frozen: DEFAULT_FROZEN,
            retain_cache: DEFAULT_RETAIN_CACHE,
            pinned_versions: BTreeMap::new(),
        }
    }
}

impl BuildOptions {
    /// Apply `PINBOX_FROZEN` / `PINBOX_RETAIN_CACHE` on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(frozen) = env_bool("PINBOX_FROZEN") {
            self.frozen = frozen;
        }
        if let Some(retain) = env_bool("PINBOX_RETAIN_CACHE") {
            self.retain_cache = retain;
        }
        self
    }

    /// Parse a `name=version` pin as given on the command line.
    pub fn parse_pin(raw: &str) -> Result<(String, String), ConfigError> {
        let (name, version) = raw.split_once('=').ok_or_else(|| ConfigError::ParseError {
            field: "pin".to_string(),
            error: format!("expected name=version, got '{}'", raw),
        })?;
        let name = name.trim().trim_end_matches('=');
        let version = version.trim().trim_start_matches('=');
        if name.is_empty() || version.is_empty() {
            return Err(ConfigError::ParseError {
                field: "pin".to_string(),
                error: format!("expected name=version, got '{}'", raw),
            });
        }
        Ok((name.to_string(), version.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct PinboxConfig {
    pub log_level: String,
    pub image_store: Option<PathBuf>,
    pub wheelhouse: Option<PathBuf>,
    pub fetch_timeout_secs: u64,
    pub platform: String,
    pub options: BuildOptions,
}

impl Default for PinboxConfig {
    fn default() -> Self {
        let log_level = env::var("PINBOX_LOG_LEVEL")
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();

        let image_store = env::var("PINBOX_IMAGE_STORE").ok().map(PathBuf::from);
        let wheelhouse = env::var("PINBOX_WHEELHOUSE").ok().map(PathBuf::from);

        let fetch_timeout_secs = env::var("PINBOX_FETCH_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);

        let platform = env::var("PINBOX_PLATFORM")
            .unwrap_or_else(|_| DEFAULT_PLATFORM.to_string())
            .to_lowercase();

        Self {
            log_level,
            image_store,
            wheelhouse,
            fetch_timeout_secs,
            platform,
            options: BuildOptions::default().with_env_overrides(),
        }
    }
}

impl PinboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "Fetch timeout must be at least 1 second".to_string(),
            ));
        }
        if self.fetch_timeout_secs > 3600 {
            return Err(ConfigError::ValidationFailed(
                "Fetch timeout cannot exceed 1 hour".to_string(),
            ));
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        if !SUPPORTED_PLATFORMS.contains(&self.platform.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Unsupported platform: {}. Valid options: {}",
                self.platform,
                SUPPORTED_PLATFORMS.join(", ")
            )));
        }

        for (name, version) in &self.options.pinned_versions {
            if name.trim().is_empty() || version.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "Pinned version entries must be non-empty (got '{}' = '{}')",
                    name, version
                )));
            }
        }

        Ok(())
    }

    pub fn to_display_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();

        map.insert("log_level".to_string(), self.log_level.clone());
        if let Some(ref dir) = self.image_store {
            map.insert("image_store".to_string(), dir.display().to_string());
        }
        if let Some(ref dir) = self.wheelhouse {
            map.insert("wheelhouse".to_string(), dir.display().to_string());
        }
        map.insert(
            "fetch_timeout_secs".to_string(),
            self.fetch_timeout_secs.to_string(),
        );
        map.insert("platform".to_string(), self.platform.clone());
        map.insert("frozen".to_string(), self.options.frozen.to_string());
        map.insert(
            "retain_cache".to_string(),
            self.options.retain_cache.to_string(),
        );
        for (name, version) in &self.options.pinned_versions {
            map.insert(format!("pinned_versions.{}", name), version.clone());
        }

        map
    }
}

impl fmt::Display for PinboxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pinbox Configuration:")?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        match &self.image_store {
            Some(dir) => writeln!(f, "  Image Store: {}", dir.display())?,
            None => writeln!(f, "  Image Store: (none)")?,
        }
        match &self.wheelhouse {
            Some(dir) => writeln!(f, "  Wheelhouse: {}", dir.display())?,
            None => writeln!(f, "  Wheelhouse: (none)")?,
        }
        writeln!(f, "  Fetch Timeout: {}s", self.fetch_timeout_secs)?;
        writeln!(f, "  Platform: {}", self.platform)?;
        writeln!(f, "  Frozen: {}", self.options.frozen)?;
        writeln!(f, "  Retain Cache: {}", self.options.retain_cache)?;
        for (name, version) in &self.options.pinned_versions {
            writeln!(f, "  Pin: {}=={}", name, version)?;
        }
        Ok(())
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    struct EnvGuard {
        key: String,
        old_value: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let old_value = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                old_value,
            }
        }

        fn unset(key: &str) -> Self {
            let old_value = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                old_value,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.old_value {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn base_config() -> PinboxConfig {
        PinboxConfig {
            log_level: "info".to_string(),
            image_store: None,
            wheelhouse: None,
            fetch_timeout_secs: 30,
            platform: "x86_64".to_string(),
            options: BuildOptions::default(),
        }
    }

    #[test]
    #[serial]
    fn test_default_configuration() {
        let _guards = [
            EnvGuard::unset("PINBOX_LOG_LEVEL"),
            EnvGuard::unset("PINBOX_FETCH_TIMEOUT"),
            EnvGuard::unset("PINBOX_FROZEN"),
            EnvGuard::unset("PINBOX_RETAIN_CACHE"),
            EnvGuard::unset("PINBOX_PLATFORM"),
        ];

        let config = PinboxConfig::default();

        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.fetch_timeout_secs, DEFAULT_FETCH_TIMEOUT_SECS);
        assert_eq!(config.platform, DEFAULT_PLATFORM);
        assert!(config.options.frozen);
        assert!(!config.options.retain_cache);
        assert!(config.options.pinned_versions.is_empty());
    }

    #[test]
    #[serial]
    fn test_environment_variable_parsing() {
        let _guards = [
            EnvGuard::set("PINBOX_LOG_LEVEL", "DEBUG"),
            EnvGuard::set("PINBOX_FETCH_TIMEOUT", "90"),
            EnvGuard::set("PINBOX_FROZEN", "false"),
            EnvGuard::set("PINBOX_RETAIN_CACHE", "1"),
            EnvGuard::set("PINBOX_IMAGE_STORE", "/var/lib/pinbox/images"),
        ];

        let config = PinboxConfig::default();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.fetch_timeout_secs, 90);
        assert!(!config.options.frozen);
        assert!(config.options.retain_cache);
        assert_eq!(
            config.image_store,
            Some(PathBuf::from("/var/lib/pinbox/images"))
        );
    }

    #[test]
    #[serial]
    fn test_unparseable_bool_keeps_default() {
        let _guard = EnvGuard::set("PINBOX_FROZEN", "maybe");
        let options = BuildOptions::default().with_env_overrides();
        assert!(options.frozen);
    }

    #[test]
    fn test_configuration_validation_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_configuration_validation_invalid_timeout() {
        let config = PinboxConfig {
            fetch_timeout_secs: 0,
            ..base_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_configuration_validation_invalid_log_level() {
        let config = PinboxConfig {
            log_level: "loud".to_string(),
            ..base_config()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn test_configuration_validation_invalid_platform() {
        let config = PinboxConfig {
            platform: "riscv64".to_string(),
            ..base_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_pin() {
        assert_eq!(
            BuildOptions::parse_pin("fastapi==0.116.1").unwrap(),
            ("fastapi".to_string(), "0.116.1".to_string())
        );
        assert_eq!(
            BuildOptions::parse_pin("a=1.0").unwrap(),
            ("a".to_string(), "1.0".to_string())
        );
        assert!(BuildOptions::parse_pin("fastapi").is_err());
        assert!(BuildOptions::parse_pin("=1.0").is_err());
    }

    #[test]
    fn test_display_map_includes_pins() {
        let mut config = base_config();
        config
            .options
            .pinned_versions
            .insert("a".to_string(), "1.0".to_string());

        let map = config.to_display_map();
        assert_eq!(map.get("frozen").map(String::as_str), Some("true"));
        assert_eq!(map.get("pinned_versions.a").map(String::as_str), Some("1.0"));
    }

    #[test]
    fn test_config_display() {
        let display = format!("{}", base_config());
        assert!(display.contains("Pinbox Configuration:"));
        assert!(display.contains("Frozen: true"));
    }
}
