//! Configuration loading for the supervisor.
//!
//! Loads an optional `dexkeeper.toml` with per-section defaults. All
//! sections use `#[serde(default)]` so a minimal or empty config file is
//! valid, and running without any file yields the container defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::settings::file::DEFAULT_SETTINGS_PATH;

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DexkeeperConfig {
    /// Dex executable and config location.
    #[serde(default)]
    pub dex: DexConfig,

    /// TLS material locations.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Process shutdown timing.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Where settings snapshots are read from.
    #[serde(default)]
    pub settings: SettingsConfig,
}

/// How Dex is launched.
#[derive(Debug, Clone, Deserialize)]
pub struct DexConfig {
    /// Executable name or path, resolved on `PATH` at startup.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Arguments placed before the config path.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Where the rendered config is written.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
}

impl Default for DexConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
            config_path: default_config_path(),
        }
    }
}

/// Locations of mounted and persisted TLS material.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Mounted certificate used when present.
    #[serde(default = "default_source_cert")]
    pub source_cert: PathBuf,

    /// Mounted private key used when present.
    #[serde(default = "default_source_key")]
    pub source_key: PathBuf,

    /// Where the certificate is written for Dex.
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,

    /// Where the private key is written for Dex.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// Host names a generated certificate is valid for.
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            source_cert: default_source_cert(),
            source_key: default_source_key(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            hosts: default_hosts(),
        }
    }
}

/// Bounds on stopping Dex during a restart.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Seconds to wait after SIGTERM before killing Dex.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Location of the settings the Dex config is rendered from.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsConfig {
    /// Settings TOML file.
    #[serde(default = "default_settings_path")]
    pub path: PathBuf,

    /// Optional `.env` file with secrets referenced from the Dex config.
    #[serde(default)]
    pub secrets_path: Option<PathBuf>,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: default_settings_path(),
            secrets_path: None,
        }
    }
}

// Default value functions for serde

fn default_binary() -> String {
    "dex".to_owned()
}
fn default_args() -> Vec<String> {
    vec!["serve".to_owned()]
}
fn default_config_path() -> PathBuf {
    PathBuf::from("/tmp/dex.yaml")
}
fn default_source_cert() -> PathBuf {
    PathBuf::from("/tls/tls.crt")
}
fn default_source_key() -> PathBuf {
    PathBuf::from("/tls/tls.key")
}
fn default_cert_path() -> PathBuf {
    PathBuf::from("/tmp/tls.crt")
}
fn default_key_path() -> PathBuf {
    PathBuf::from("/tmp/tls.key")
}
fn default_hosts() -> Vec<String> {
    vec!["localhost".to_owned(), "dexserver".to_owned()]
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_settings_path() -> PathBuf {
    PathBuf::from(DEFAULT_SETTINGS_PATH)
}

/// Load the supervisor config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, cannot be parsed, or sets a
/// zero shutdown timeout.
pub fn load_config(path: &Path) -> anyhow::Result<DexkeeperConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: DexkeeperConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Load the config from `path` when given, otherwise use defaults.
///
/// # Errors
///
/// Returns an error under the same conditions as [`load_config`].
pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<DexkeeperConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(DexkeeperConfig::default()),
    }
}

fn validate(config: &DexkeeperConfig) -> anyhow::Result<()> {
    anyhow::ensure!(
        config.shutdown.timeout_secs > 0,
        "shutdown.timeout_secs must be greater than zero"
    );
    anyhow::ensure!(!config.dex.binary.is_empty(), "dex.binary must not be empty");
    Ok(())
}
