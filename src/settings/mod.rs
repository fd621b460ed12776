//! Settings snapshots and the sources that produce them.
//!
//! A [`Settings`] value is a point-in-time view of the state Dex is
//! configured from: the externally reachable URL, the user supplied Dex
//! config and the secrets it references. Sources hand out an initial
//! snapshot through [`SettingsSource::current`] and later ones through a
//! latest-wins [`Subscription`].

pub mod file;
pub mod secrets;
pub mod subscription;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};

pub use file::FileSettingsSource;
pub use secrets::{load_secrets, Secrets};
pub use subscription::{Publisher, Subscription};

/// Secret holding the server signing key the OAuth2 client secret derives from.
pub const SERVER_SECRET_KEY: &str = "server_secret_key";

/// Length of the derived OAuth2 client secret.
const CLIENT_SECRET_LEN: usize = 40;

/// Errors produced while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("failed to read settings at {path}: {source}")]
    Read {
        /// Settings file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not valid TOML for [`Settings`].
    #[error("failed to parse settings at {path}: {source}")]
    Parse {
        /// Settings file path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// The configured URL is not an absolute URL.
    #[error("invalid url '{url}': {source}")]
    InvalidUrl {
        /// The rejected value.
        url: String,
        /// Underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// The secrets file is missing, too permissive, or malformed.
    #[error("secrets file {path}: {detail}")]
    Secrets {
        /// Secrets file path.
        path: PathBuf,
        /// Error detail.
        detail: String,
    },
    /// The change watcher could not be started.
    #[error("failed to watch settings: {0}")]
    Watch(#[from] notify::Error),
}

impl SettingsError {
    pub(crate) fn secrets(path: &Path, detail: impl Into<String>) -> Self {
        Self::Secrets {
            path: path.to_path_buf(),
            detail: detail.into(),
        }
    }
}

/// A point-in-time view of the settings Dex is rendered from.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Externally reachable base URL of the application Dex fronts.
    #[serde(default)]
    pub url: String,

    /// Further base URLs that Dex must accept as redirect targets.
    #[serde(default)]
    pub additional_urls: Vec<String>,

    /// User supplied Dex configuration (YAML).
    #[serde(default)]
    pub dex_config: String,

    /// Secrets referenced from `dex_config` as `$name`.
    #[serde(skip)]
    pub secrets: Secrets,

    /// Monotonic counter assigned by the source; not part of the rendering.
    #[serde(skip)]
    pub generation: u64,
}

/// Only the connector list matters for deciding whether Dex is configured.
#[derive(Deserialize)]
struct ConnectorProbe {
    #[serde(default)]
    connectors: Vec<serde_yaml::Value>,
}

impl Settings {
    /// Parse settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid settings TOML or `url` is
    /// set but not an absolute URL.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let urls = std::iter::once(&self.url)
            .filter(|url| !url.is_empty())
            .chain(self.additional_urls.iter());
        for raw in urls {
            url::Url::parse(raw).map_err(|source| SettingsError::InvalidUrl {
                url: raw.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Dex is configured when a URL is set and the Dex config declares at
    /// least one connector.
    pub fn is_dex_configured(&self) -> bool {
        if self.url.is_empty() {
            return false;
        }
        match serde_yaml::from_str::<ConnectorProbe>(&self.dex_config) {
            Ok(probe) => !probe.connectors.is_empty(),
            Err(e) => {
                tracing::debug!(error = %e, "dex config is not parseable");
                false
            }
        }
    }

    fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    /// Issuer URL Dex advertises.
    pub fn issuer_url(&self) -> String {
        format!("{}/api/dex", self.base_url())
    }

    /// OAuth2 callback on the application.
    pub fn redirect_url(&self) -> String {
        format!("{}/auth/callback", self.base_url())
    }

    /// Callback Dex registers with upstream identity providers.
    pub fn dex_redirect_url(&self) -> String {
        format!("{}/api/dex/callback", self.base_url())
    }

    /// PKCE verification endpoint on the application.
    pub fn pkce_redirect_url(&self) -> String {
        format!("{}/pkce/verify", self.base_url())
    }

    /// OAuth2 callbacks for every additional URL.
    pub fn additional_redirect_urls(&self) -> Vec<String> {
        self.additional_urls
            .iter()
            .map(|url| format!("{}/auth/callback", url.trim_end_matches('/')))
            .collect()
    }

    /// Client secret the application uses against Dex.
    ///
    /// Derived from the server signing key so both sides agree without
    /// storing it separately.
    pub fn dex_oauth2_client_secret(&self) -> String {
        let key = self.secrets.get(SERVER_SECRET_KEY).unwrap_or_default();
        let digest = Sha256::digest(key.as_bytes());
        let mut encoded = base64::engine::general_purpose::URL_SAFE.encode(digest);
        encoded.truncate(CLIENT_SECRET_LEN);
        encoded
    }
}

/// Source of settings snapshots.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Fetch the current snapshot.
    async fn current(&self) -> Result<Settings, SettingsError>;

    /// Subscribe to subsequent snapshots.
    ///
    /// Delivery is single-slot: when the consumer falls behind, only the most
    /// recent snapshot is kept.
    fn subscribe(&self) -> Result<Subscription<Settings>, SettingsError>;
}
