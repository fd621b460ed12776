//! Field-name based secret redaction over dynamic config trees.
//!
//! Rendered Dex configs are parsed into a [`serde_json::Value`] tree and
//! walked by [`iterate_string_fields`]. Every string that is the direct value
//! of a map key is offered to a callback, which may replace it. Two rule sets
//! share that walk: [`LOG_RULES`] for debug logging of the full document and
//! [`DISPLAY_RULES`] for the `gendexcfg` stdout dump.

use serde_json::Value;

/// Mask written over secrets in log output. Always eight characters.
pub const LOG_MASK: &str = "********";

/// Mask written over static client secrets in the stdout dump.
pub const DISPLAY_MASK: &str = "******";

/// Redaction used before the rendered config reaches the log.
pub const LOG_RULES: RedactionRules = RedactionRules {
    fields: &["clientSecret", "secret", "bindPW"],
    mask: LOG_MASK,
    scope: None,
};

/// Redaction used when printing the rendered config to stdout.
///
/// Only the `staticClients` section is touched.
pub const DISPLAY_RULES: RedactionRules = RedactionRules {
    fields: &["secret"],
    mask: DISPLAY_MASK,
    scope: Some("staticClients"),
};

/// Errors produced while redacting a serialized document.
#[derive(Debug, thiserror::Error)]
pub enum RedactError {
    /// The document is not a YAML/JSON tree with string keys.
    #[error("failed to parse document for redaction: {0}")]
    Parse(#[source] serde_yaml::Error),
    /// The redacted tree could not be serialized back to YAML.
    #[error("failed to serialize redacted document: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

/// A set of sensitive field names and the token that replaces their values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedactionRules {
    /// Exact, case-sensitive field names whose string values are masked.
    pub fields: &'static [&'static str],
    /// Replacement written over matched values.
    pub mask: &'static str,
    /// Top-level key the rules are limited to, or `None` for the whole tree.
    pub scope: Option<&'static str>,
}

impl RedactionRules {
    /// Returns `true` when `field` is one of the protected names.
    pub fn matches(&self, field: &str) -> bool {
        self.fields.contains(&field)
    }

    /// Mask every matching string leaf of `tree` in place.
    pub fn apply(&self, tree: &mut Value) {
        let mut mask_matching = |field: &str, _value: &str| {
            self.matches(field).then(|| self.mask.to_owned())
        };

        match self.scope {
            None => iterate_string_fields(tree, &mut mask_matching),
            Some(key) => {
                if let Some(section) = tree.get_mut(key) {
                    iterate_string_fields(section, &mut mask_matching);
                }
            }
        }
    }

    /// Parse a YAML document, mask it, and serialize it back to YAML.
    ///
    /// # Errors
    ///
    /// Returns [`RedactError`] when the document cannot be parsed or re-encoded.
    pub fn redact_document(&self, document: &[u8]) -> Result<String, RedactError> {
        let mut tree: Value = serde_yaml::from_slice(document).map_err(RedactError::Parse)?;
        self.apply(&mut tree);
        serde_yaml::to_string(&tree).map_err(RedactError::Serialize)
    }
}

/// Walk `tree` and offer every direct string child of a map to `callback`.
///
/// The callback receives `(field, value)` and returns a replacement, or
/// `None` to keep the value. Non-string map values and sequence elements are
/// descended into without carrying the parent key along, so a string inside
/// a list is never matched by the name of the list.
pub fn iterate_string_fields<F>(tree: &mut Value, callback: &mut F)
where
    F: FnMut(&str, &str) -> Option<String>,
{
    match tree {
        Value::Object(map) => {
            for (field, value) in map.iter_mut() {
                match value {
                    Value::String(text) => {
                        if let Some(replacement) = callback(field.as_str(), text.as_str()) {
                            *text = replacement;
                        }
                    }
                    other => iterate_string_fields(other, callback),
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                iterate_string_fields(item, callback);
            }
        }
        _ => {}
    }
}
