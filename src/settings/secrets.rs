//! Secret values loaded from a `.env` style file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::SettingsError;

/// Secret values referenced by the settings, keyed by name.
///
/// Values never appear in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Secrets {
    /// Build secrets from a key-value map.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Returns a secret value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Substitute a `$name` reference with the named secret.
    ///
    /// Values that do not start with `$`, or that name an unknown secret,
    /// are returned unchanged.
    pub fn resolve<'a>(&'a self, value: &'a str) -> &'a str {
        match value.strip_prefix('$') {
            Some(name) => self.get(name.trim()).unwrap_or(value),
            None => value,
        }
    }
}

/// Load secrets from a `.env` file.
///
/// # Errors
///
/// Returns [`SettingsError::Secrets`] if the file does not exist, is readable
/// by group or others, or cannot be parsed.
pub fn load_secrets(path: &Path) -> Result<Secrets, SettingsError> {
    if !path.exists() {
        return Err(SettingsError::secrets(path, "file does not exist"));
    }

    validate_private_permissions(path)?;

    let mut vars = BTreeMap::new();
    let iter = dotenvy::from_path_iter(path)
        .map_err(|e| SettingsError::secrets(path, format!("failed to read: {e}")))?;

    for item in iter {
        let (key, value) = item.map_err(|e| {
            SettingsError::secrets(path, format!("failed to parse key-value entry: {e}"))
        })?;
        vars.insert(key, value);
    }

    Ok(Secrets { vars })
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> Result<(), SettingsError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .map_err(|e| SettingsError::secrets(path, format!("failed to inspect: {e}")))?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(SettingsError::secrets(
            path,
            format!("must be 0600, found {mode:o}"),
        ));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> Result<(), SettingsError> {
    Ok(())
}
