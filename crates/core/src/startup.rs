//! Typed startup configuration for the launched application process.

use std::env;
use thiserror::Error;

pub const PORT_ENV: &str = "PORT";
pub const DEFAULT_PORT: u16 = 8002;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartupError {
    #[error("{key} must be an integer between 1 and 65535, got '{value}'")]
    InvalidPort { key: String, value: String },
}

/// Values the hosting environment may override at container start.
///
/// Populated once at the process boundary and passed around by value; nothing
/// downstream reads the environment directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupConfig {
    pub port: u16,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

impl StartupConfig {
    pub fn from_env() -> Result<Self, StartupError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, falling back to `default_port`.
    pub fn from_lookup_with_default<F>(lookup: F, default_port: u16) -> Result<Self, StartupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup(PORT_ENV) {
            None => default_port,
            Some(raw) if raw.trim().is_empty() => default_port,
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(0) | Err(_) => {
                    return Err(StartupError::InvalidPort {
                        key: PORT_ENV.to_string(),
                        value: raw,
                    })
                }
                Ok(port) => port,
            },
        };

        Ok(Self { port })
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, StartupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup_with_default(lookup, DEFAULT_PORT)
    }

    pub fn env_pairs(&self) -> Vec<(String, String)> {
        vec![(PORT_ENV.to_string(), self.port.to_string())]
    }
}
