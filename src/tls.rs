//! TLS material for the Dex HTTPS listener.
//!
//! Uses a mounted certificate and key when both are present, otherwise
//! generates a self-signed certificate. Either way, the material is written
//! to the paths referenced from the rendered Dex config.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::files::{write_with_mode, PRIVATE_FILE_MODE};

/// Errors produced while provisioning TLS material.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A source file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A source file does not contain the expected PEM blocks.
    #[error("invalid PEM in {path}: {detail}")]
    InvalidPem {
        /// File path.
        path: PathBuf,
        /// Error detail.
        detail: String,
    },
    /// Self-signed certificate generation failed.
    #[error("failed to generate self-signed certificate: {0}")]
    Generate(#[from] rcgen::Error),
    /// Material could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// PEM encoded certificate chain and private key.
#[derive(Clone)]
pub struct TlsMaterial {
    /// PEM certificate chain.
    pub cert_pem: String,
    /// PEM private key.
    pub key_pem: String,
    /// Whether the material was generated rather than loaded.
    pub self_signed: bool,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key_pem", &"[REDACTED]")
            .field("self_signed", &self.self_signed)
            .finish()
    }
}

impl TlsMaterial {
    /// Write the certificate and key, both readable by the owner only.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Write`] if either file cannot be written.
    pub fn persist(&self, cert_path: &Path, key_path: &Path) -> Result<(), TlsError> {
        for (path, contents) in [(cert_path, &self.cert_pem), (key_path, &self.key_pem)] {
            write_with_mode(path, contents.as_bytes(), PRIVATE_FILE_MODE).map_err(|source| {
                TlsError::Write {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        }
        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            self_signed = self.self_signed,
            "tls material written"
        );
        Ok(())
    }
}

/// Load TLS material from `cert_path` and `key_path`, or generate a
/// self-signed certificate for `hosts` when either file is missing.
///
/// # Errors
///
/// Returns [`TlsError`] when existing files are unreadable or invalid, or
/// when generation fails.
pub fn provision(cert_path: &Path, key_path: &Path, hosts: &[String]) -> Result<TlsMaterial, TlsError> {
    if cert_path.is_file() && key_path.is_file() {
        info!(cert = %cert_path.display(), "loading tls certificate");
        return load(cert_path, key_path);
    }

    info!(hosts = ?hosts, "generating self-signed tls certificate");
    generate(hosts)
}

/// Generate a self-signed certificate valid for `hosts`.
///
/// # Errors
///
/// Returns [`TlsError::Generate`] if key or certificate generation fails.
pub fn generate(hosts: &[String]) -> Result<TlsMaterial, TlsError> {
    let certified = rcgen::generate_simple_self_signed(hosts.to_vec())?;
    Ok(TlsMaterial {
        cert_pem: certified.cert.pem(),
        key_pem: certified.key_pair.serialize_pem(),
        self_signed: true,
    })
}

/// Load and validate PEM material from disk.
///
/// # Errors
///
/// Returns [`TlsError`] if a file cannot be read, the certificate file holds
/// no certificate, or the key file holds no private key.
pub fn load(cert_path: &Path, key_path: &Path) -> Result<TlsMaterial, TlsError> {
    let cert_pem = read(cert_path)?;
    let key_pem = read(key_path)?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidPem {
            path: cert_path.to_path_buf(),
            detail: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::InvalidPem {
            path: cert_path.to_path_buf(),
            detail: "no certificate found".to_owned(),
        });
    }

    match rustls_pemfile::private_key(&mut key_pem.as_bytes()) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Err(TlsError::InvalidPem {
                path: key_path.to_path_buf(),
                detail: "no private key found".to_owned(),
            })
        }
        Err(e) => {
            return Err(TlsError::InvalidPem {
                path: key_path.to_path_buf(),
                detail: e.to_string(),
            })
        }
    }

    Ok(TlsMaterial {
        cert_pem,
        key_pem,
        self_signed: false,
    })
}

fn read(path: &Path) -> Result<String, TlsError> {
    std::fs::read_to_string(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}
