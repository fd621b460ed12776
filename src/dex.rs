//! Rendering of settings into a Dex configuration document.
//!
//! The user supplied `dex_config` provides connectors and optional extra
//! static clients. Everything the supervised Dex needs to run alongside the
//! application (issuer, listeners, storage, built-in clients, connector
//! callbacks) is filled in here. Output is YAML with sorted keys, so the
//! same input always renders to the same bytes.

use serde_json::{json, Map, Value};

use crate::settings::{Secrets, Settings};

/// HTTP(S) listener address.
pub const WEB_ADDR: &str = "0.0.0.0:5556";
/// gRPC API listener address.
pub const GRPC_ADDR: &str = "0.0.0.0:5557";
/// Telemetry listener address.
pub const TELEMETRY_ADDR: &str = "0.0.0.0:5558";

/// Static client used by the application server.
pub const SERVER_CLIENT_ID: &str = "argo-cd";
/// Public static client used by the command-line client.
pub const CLI_CLIENT_ID: &str = "argo-cd-cli";
/// Public static client used by the PKCE browser flow.
pub const PKCE_CLIENT_ID: &str = "argo-cd-pkce";

const CLI_REDIRECT_URIS: [&str; 2] = ["http://localhost", "http://localhost:8085/auth/callback"];

/// Errors produced while rendering a Dex config.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// `dex_config` is not a YAML mapping.
    #[error("failed to parse dex config: {0}")]
    Parse(#[source] serde_yaml::Error),
    /// `dex_config` parsed but has the wrong shape.
    #[error("malformed dex configuration: {0}")]
    Malformed(String),
    /// The rendered tree could not be serialized.
    #[error("failed to serialize dex config: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

/// Pure mapping from a settings snapshot to a config document.
///
/// An empty document means Dex is not configured and should not run.
pub trait Renderer: Send + Sync {
    /// Render `settings` into a config document.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError`] when the settings cannot be rendered.
    fn render(&self, settings: &Settings, disable_tls: bool) -> Result<Vec<u8>, RenderError>;
}

/// Renders Dex YAML configs.
#[derive(Debug, Clone)]
pub struct DexRenderer {
    log_level: String,
    log_format: String,
    tls_cert_path: String,
    tls_key_path: String,
}

impl Default for DexRenderer {
    fn default() -> Self {
        Self::new("info", "text")
    }
}

impl DexRenderer {
    /// Create a renderer that fills in the Dex logger with the given level
    /// and format unless the user config sets them.
    pub fn new(log_level: &str, log_format: &str) -> Self {
        Self {
            log_level: dex_log_level(log_level).to_owned(),
            log_format: log_format.to_owned(),
            tls_cert_path: "/tmp/tls.crt".to_owned(),
            tls_key_path: "/tmp/tls.key".to_owned(),
        }
    }

    /// Point the HTTPS listener at the given certificate and key paths.
    pub fn with_tls_paths(mut self, cert_path: &str, key_path: &str) -> Self {
        self.tls_cert_path = cert_path.to_owned();
        self.tls_key_path = key_path.to_owned();
        self
    }

    fn web_section(&self, disable_tls: bool) -> Value {
        if disable_tls {
            json!({ "http": WEB_ADDR })
        } else {
            json!({
                "https": WEB_ADDR,
                "tlsCert": self.tls_cert_path,
                "tlsKey": self.tls_key_path,
            })
        }
    }

    fn fill_logger(&self, dex: &mut Map<String, Value>) {
        match dex.get_mut("logger") {
            Some(Value::Object(logger)) => {
                logger
                    .entry("level")
                    .or_insert_with(|| json!(self.log_level));
                logger
                    .entry("format")
                    .or_insert_with(|| json!(self.log_format));
            }
            _ => {
                dex.insert(
                    "logger".to_owned(),
                    json!({ "level": self.log_level, "format": self.log_format }),
                );
            }
        }
    }
}

impl Renderer for DexRenderer {
    fn render(&self, settings: &Settings, disable_tls: bool) -> Result<Vec<u8>, RenderError> {
        if !settings.is_dex_configured() {
            return Ok(Vec::new());
        }

        let mut dex: Map<String, Value> =
            serde_yaml::from_str(&settings.dex_config).map_err(RenderError::Parse)?;

        dex.insert("issuer".to_owned(), json!(settings.issuer_url()));
        dex.insert("storage".to_owned(), json!({ "type": "memory" }));
        dex.insert("web".to_owned(), self.web_section(disable_tls));
        dex.insert("grpc".to_owned(), json!({ "addr": GRPC_ADDR }));
        dex.insert("telemetry".to_owned(), json!({ "http": TELEMETRY_ADDR }));
        self.fill_logger(&mut dex);
        fill_oauth2(&mut dex);

        let mut clients = builtin_clients(settings);
        match dex.remove("staticClients") {
            None | Some(Value::Null) => {}
            Some(Value::Array(user_clients)) => clients.extend(user_clients),
            Some(_) => {
                return Err(RenderError::Malformed(
                    "staticClients must be a list".to_owned(),
                ))
            }
        }
        dex.insert("staticClients".to_owned(), Value::Array(clients));

        inject_connector_callbacks(&mut dex, &settings.dex_redirect_url())?;

        let mut tree = Value::Object(dex);
        replace_secrets(&mut tree, &settings.secrets);

        serde_yaml::to_string(&tree)
            .map(String::into_bytes)
            .map_err(RenderError::Serialize)
    }
}

fn fill_oauth2(dex: &mut Map<String, Value>) {
    match dex.get_mut("oauth2") {
        Some(Value::Object(oauth2)) => {
            if !matches!(oauth2.get("skipApprovalScreen"), Some(Value::Bool(_))) {
                oauth2.insert("skipApprovalScreen".to_owned(), Value::Bool(true));
            }
        }
        _ => {
            dex.insert("oauth2".to_owned(), json!({ "skipApprovalScreen": true }));
        }
    }
}

fn builtin_clients(settings: &Settings) -> Vec<Value> {
    let mut server_redirects = vec![settings.redirect_url()];
    server_redirects.extend(settings.additional_redirect_urls());

    vec![
        json!({
            "id": SERVER_CLIENT_ID,
            "name": "Argo CD",
            "secret": settings.dex_oauth2_client_secret(),
            "redirectURIs": server_redirects,
        }),
        json!({
            "id": CLI_CLIENT_ID,
            "name": "Argo CD CLI",
            "public": true,
            "redirectURIs": CLI_REDIRECT_URIS,
        }),
        json!({
            "id": PKCE_CLIENT_ID,
            "name": "Argo CD PKCE",
            "public": true,
            "redirectURIs": [settings.pkce_redirect_url()],
        }),
    ]
}

/// Connector types that call back into Dex and need `redirectURI` set.
fn needs_redirect_uri(connector_type: &str) -> bool {
    matches!(
        connector_type,
        "oidc"
            | "saml"
            | "microsoft"
            | "linkedin"
            | "gitlab"
            | "github"
            | "bitbucket-cloud"
            | "openshift"
            | "gitea"
            | "google"
            | "oauth"
    )
}

fn inject_connector_callbacks(
    dex: &mut Map<String, Value>,
    redirect_uri: &str,
) -> Result<(), RenderError> {
    let Some(Value::Array(connectors)) = dex.get_mut("connectors") else {
        return Err(RenderError::Malformed(
            "connectors must be a list".to_owned(),
        ));
    };

    for (index, connector) in connectors.iter_mut().enumerate() {
        let Value::Object(connector) = connector else {
            return Err(RenderError::Malformed(format!(
                "connector {index} must be a map"
            )));
        };
        let Some(connector_type) = connector.get("type").and_then(Value::as_str) else {
            return Err(RenderError::Malformed(format!(
                "connector {index} has no type"
            )));
        };
        if !needs_redirect_uri(connector_type) {
            continue;
        }
        let Some(Value::Object(config)) = connector.get_mut("config") else {
            return Err(RenderError::Malformed(format!(
                "connector {index} has no config map"
            )));
        };
        config.insert("redirectURI".to_owned(), json!(redirect_uri));
    }

    Ok(())
}

/// Replace every `$name` string, in maps and lists alike, with its secret.
fn replace_secrets(tree: &mut Value, secrets: &Secrets) {
    match tree {
        Value::String(text) => {
            let resolved = secrets.resolve(text);
            if resolved != text.as_str() {
                *text = resolved.to_owned();
            }
        }
        Value::Object(map) => {
            for value in map.values_mut() {
                replace_secrets(value, secrets);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                replace_secrets(item, secrets);
            }
        }
        _ => {}
    }
}

/// Map a `tracing` level name onto the levels Dex understands.
fn dex_log_level(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}
