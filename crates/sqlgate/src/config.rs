//! Target configuration: schema, validation and snapshots
//!
//! The configuration source is a YAML (or JSON) document whose `connections`
//! field is either a list of descriptors or a mapping from label to
//! descriptor:
//!
//! ```yaml
//! connections:
//!   - label: staging
//!     host: db.internal
//!     user: reader
//!     password: ${STAGING_PW}
//!     database: app
//!   - label: prod
//!     url: postgres://app:${PROD_PW:-changeme}@prod:5432/app
//!     read_only: false
//!     ssl: { ca_cert: /etc/ssl/prod-ca.pem }
//! ```
//!
//! String values may reference process environment variables as `${NAME}`
//! or `${NAME:-fallback}`; an unset variable without a fallback becomes the
//! empty string. Placeholders are resolved after the document is parsed, so
//! a substituted value is taken verbatim and never read as YAML.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlgate_rdbc::connection::Endpoint;
use sqlgate_rdbc::tls::{TlsMode, TlsVerify};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;
use tracing::{debug, warn};
use validator::Validate;

use crate::error::{Error, FieldDiagnostic, Result};
use crate::types::SensitiveString;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Default PostgreSQL port
pub const DEFAULT_PORT: u16 = 5432;

/// Default pool size bound per target
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Largest pool size bound a target may request
pub const MAX_POOL_SIZE: usize = 50;

/// Expand placeholders against an arbitrary variable lookup
pub fn expand_with(content: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            lookup(var_name).unwrap_or_else(|| default.unwrap_or("").to_string())
        })
        .to_string()
}

/// Variable lookup against the process environment
fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Expand placeholders inside every string scalar of a parsed document.
/// Keys and non-string scalars are left alone.
fn expand_strings(value: &mut serde_yaml::Value, lookup: &dyn Fn(&str) -> Option<String>) {
    match value {
        serde_yaml::Value::String(s) if s.contains("${") => {
            *s = expand_with(s, lookup);
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                expand_strings(item, lookup);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                expand_strings(item, lookup);
            }
        }
        serde_yaml::Value::Tagged(tagged) => expand_strings(&mut tagged.value, lookup),
        _ => {}
    }
}

/// Transport security as written in the source: `false`, `true`, or a
/// verification block.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SslSetting {
    /// `false` disables TLS, `true` encrypts without certificate verification
    Flag(bool),
    /// Encrypt and verify
    Verify(SslVerifyConfig),
}

impl Default for SslSetting {
    fn default() -> Self {
        Self::Flag(false)
    }
}

/// Verification parameters for TLS
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslVerifyConfig {
    /// CA bundle (PEM); webpki roots when unset
    #[serde(default, alias = "caCert", alias = "ca")]
    pub ca_cert: Option<PathBuf>,
    /// Client certificate (PEM)
    #[serde(default, alias = "clientCert", alias = "cert")]
    pub client_cert: Option<PathBuf>,
    /// Client key (PEM)
    #[serde(default, alias = "clientKey", alias = "key")]
    pub client_key: Option<PathBuf>,
}

impl From<&SslSetting> for TlsMode {
    fn from(setting: &SslSetting) -> Self {
        match setting {
            SslSetting::Flag(false) => TlsMode::Disable,
            SslSetting::Flag(true) => TlsMode::Insecure,
            SslSetting::Verify(v) => TlsMode::Verify(TlsVerify {
                ca_cert_path: v.ca_cert.clone(),
                client_cert_path: v.client_cert.clone(),
                client_key_path: v.client_key.clone(),
            }),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One descriptor exactly as written in the source, before validation
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RawDescriptor {
    /// Caller-facing label; defaults to the mapping key
    #[serde(default)]
    #[validate(length(min = 1, max = 128, message = "must be 1 to 128 characters"))]
    pub label: Option<String>,

    /// Host name or address
    #[serde(default)]
    #[validate(length(min = 1, max = 255, message = "must be 1 to 255 characters"))]
    pub host: Option<String>,

    /// TCP port (default 5432)
    #[serde(default)]
    #[validate(range(min = 1, message = "must be between 1 and 65535"))]
    pub port: Option<u16>,

    /// Role name
    #[serde(default, alias = "username")]
    pub user: Option<String>,

    /// Role password
    #[serde(default)]
    pub password: Option<SensitiveString>,

    /// Target database
    #[serde(default, alias = "dbname")]
    pub database: Option<String>,

    /// Opaque connection string, instead of the structured endpoint
    #[serde(default, alias = "connection_string", alias = "connectionString")]
    pub url: Option<SensitiveString>,

    /// Transport security
    #[serde(default)]
    pub ssl: SslSetting,

    /// Whether calls run in read-only transactions (default true)
    #[serde(default = "default_true", alias = "readOnly")]
    pub read_only: bool,

    /// Upper bound on open connections (default 5, clamped to 1..=50)
    #[serde(default, alias = "poolSize", alias = "max_connections")]
    pub pool_size: Option<i64>,

    /// Disabled entries are dropped from the snapshot
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Free-form description shown by target listings
    #[serde(default)]
    #[validate(length(max = 1024, message = "must be at most 1024 characters"))]
    pub description: Option<String>,
}

/// How a target is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Opaque connection string
    Url(SensitiveString),
    /// Structured endpoint
    Params {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
        /// Role name
        user: Option<String>,
        /// Role password
        password: Option<SensitiveString>,
        /// Target database
        database: Option<String>,
    },
}

impl Target {
    /// Endpoint for the connection layer, secrets exposed
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::Url(url) => Endpoint::Url(url.expose_secret().to_string()),
            Self::Params {
                host,
                port,
                user,
                password,
                database,
            } => Endpoint::Params {
                host: host.clone(),
                port: *port,
                user: user.clone(),
                password: password.as_ref().map(|p| p.expose_secret().to_string()),
                database: database.clone(),
            },
        }
    }

    /// Credential-free endpoint summary
    pub fn redacted(&self) -> String {
        self.endpoint().redacted()
    }
}

/// One validated, enabled target. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Caller-facing label, unique within a snapshot
    pub label: String,
    /// How to reach the target
    pub target: Target,
    /// Transport security
    pub tls: TlsMode,
    /// Whether calls run in read-only transactions
    pub read_only: bool,
    /// Upper bound on open connections, already clamped
    pub pool_size: usize,
    /// Free-form description
    pub description: Option<String>,
}

impl ConnectionDescriptor {
    /// Summary for target listings; never contains credentials
    pub fn summary(&self) -> TargetSummary {
        TargetSummary {
            label: self.label.clone(),
            endpoint: self.target.redacted(),
            read_only: self.read_only,
            ssl: self.tls.as_str(),
            pool_size: self.pool_size,
            description: self.description.clone(),
        }
    }
}

/// Public view of one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSummary {
    /// Label
    pub label: String,
    /// Redacted endpoint
    pub endpoint: String,
    /// Read-only flag
    pub read_only: bool,
    /// Transport security variant
    pub ssl: &'static str,
    /// Pool size bound
    pub pool_size: usize,
    /// Description, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One immutable, fully validated view of every enabled, in-scope target
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    descriptors: Vec<Arc<ConnectionDescriptor>>,
    /// Last-modification time of the source this was loaded from
    pub source_modified: Option<SystemTime>,
    /// Wall-clock time of the load
    pub loaded_at: DateTime<Utc>,
    /// Monotonic load counter assigned by the loader
    pub generation: u64,
}

impl ConfigSnapshot {
    /// Create a snapshot from already validated descriptors
    pub fn new(descriptors: Vec<ConnectionDescriptor>) -> Self {
        Self {
            descriptors: descriptors.into_iter().map(Arc::new).collect(),
            source_modified: None,
            loaded_at: Utc::now(),
            generation: 0,
        }
    }

    /// Descriptor for `label`
    pub fn get(&self, label: &str) -> Option<&Arc<ConnectionDescriptor>> {
        self.descriptors.iter().find(|d| d.label == label)
    }

    /// Labels in source order
    pub fn labels(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.label.clone()).collect()
    }

    /// Descriptors in source order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ConnectionDescriptor>> {
        self.descriptors.iter()
    }

    /// Number of targets
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether there are no targets
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Parse, validate and filter configuration source text into a snapshot.
///
/// Any invalid entry fails the whole load. Duplicate labels keep the first
/// occurrence; disabled entries are dropped afterwards; `label_filter`, when
/// set, keeps only that label.
pub fn parse_snapshot(content: &str, label_filter: Option<&str>) -> Result<ConfigSnapshot> {
    parse_snapshot_with(content, label_filter, &env_lookup)
}

/// [`parse_snapshot`] with placeholders resolved through `lookup`
pub fn parse_snapshot_with(
    content: &str,
    label_filter: Option<&str>,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ConfigSnapshot> {
    let entries = parse_entries(content, lookup)?;

    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(entries.len());
    for (descriptor, enabled) in entries {
        if !seen.insert(descriptor.label.clone()) {
            warn!(label = %descriptor.label, "duplicate label ignored; first occurrence wins");
            continue;
        }
        if !enabled {
            debug!(label = %descriptor.label, "target disabled");
            continue;
        }
        if let Some(filter) = label_filter {
            if descriptor.label != filter {
                continue;
            }
        }
        descriptors.push(descriptor);
    }

    Ok(ConfigSnapshot::new(descriptors))
}

/// Validate every entry, returning each descriptor with its enabled flag
fn parse_entries(
    content: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Vec<(ConnectionDescriptor, bool)>> {
    let mut document: serde_yaml::Value = serde_yaml::from_str(content).map_err(|e| {
        Error::ConfigInvalid {
            diagnostics: vec![FieldDiagnostic::new("<document>", e.to_string())],
        }
    })?;
    expand_strings(&mut document, lookup);

    let connections = match &document {
        serde_yaml::Value::Mapping(map) => map.get("connections"),
        serde_yaml::Value::Null => None,
        _ => {
            return Err(Error::ConfigInvalid {
                diagnostics: vec![FieldDiagnostic::new("<document>", "expected a mapping")],
            })
        }
    };

    let raw_entries: Vec<(String, Option<String>, serde_yaml::Value)> = match connections {
        None => {
            return Err(Error::ConfigInvalid {
                diagnostics: vec![FieldDiagnostic::new("connections", "field is required")],
            })
        }
        Some(serde_yaml::Value::Null) => Vec::new(),
        Some(serde_yaml::Value::Sequence(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| (format!("connections[{i}]"), None, item.clone()))
            .collect(),
        Some(serde_yaml::Value::Mapping(map)) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, item) in map {
                let Some(key) = key.as_str() else {
                    return Err(Error::ConfigInvalid {
                        diagnostics: vec![FieldDiagnostic::new(
                            "connections",
                            "mapping keys must be strings",
                        )],
                    });
                };
                entries.push((format!("connections.{key}"), Some(key.to_string()), item.clone()));
            }
            entries
        }
        Some(_) => {
            return Err(Error::ConfigInvalid {
                diagnostics: vec![FieldDiagnostic::new(
                    "connections",
                    "expected a list or a mapping of connection descriptors",
                )],
            })
        }
    };

    let mut diagnostics = Vec::new();
    let mut descriptors = Vec::with_capacity(raw_entries.len());
    for (path, key, item) in raw_entries {
        match serde_yaml::from_value::<RawDescriptor>(item) {
            Ok(raw) => {
                if let Some(entry) = validate_descriptor(&path, key, raw, &mut diagnostics) {
                    descriptors.push(entry);
                }
            }
            Err(e) => diagnostics.push(FieldDiagnostic::new(path, e.to_string())),
        }
    }

    if diagnostics.is_empty() {
        Ok(descriptors)
    } else {
        Err(Error::ConfigInvalid { diagnostics })
    }
}

fn validate_descriptor(
    path: &str,
    key: Option<String>,
    raw: RawDescriptor,
    diagnostics: &mut Vec<FieldDiagnostic>,
) -> Option<(ConnectionDescriptor, bool)> {
    let before = diagnostics.len();

    if let Err(errors) = raw.validate() {
        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        for (field, errs) in fields {
            for err in errs {
                let message = err
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("failed '{}' validation", err.code));
                diagnostics.push(FieldDiagnostic::new(format!("{path}.{field}"), message));
            }
        }
    }

    let label = raw.label.clone().or(key);
    match &label {
        None => diagnostics.push(FieldDiagnostic::new(
            format!("{path}.label"),
            "field is required",
        )),
        Some(label) if label.trim().is_empty() => diagnostics.push(FieldDiagnostic::new(
            format!("{path}.label"),
            "must not be blank",
        )),
        Some(_) => {}
    }

    let target = match (&raw.url, &raw.host) {
        (Some(_), Some(_)) => {
            diagnostics.push(FieldDiagnostic::new(
                path,
                "url and host are mutually exclusive",
            ));
            None
        }
        (Some(url), None) => {
            let structured = [
                ("port", raw.port.is_some()),
                ("user", raw.user.is_some()),
                ("password", raw.password.is_some()),
                ("database", raw.database.is_some()),
            ];
            for (field, present) in structured {
                if present {
                    diagnostics.push(FieldDiagnostic::new(
                        format!("{path}.{field}"),
                        "cannot be combined with url",
                    ));
                }
            }
            if url.expose_secret().trim().is_empty() {
                diagnostics.push(FieldDiagnostic::new(
                    format!("{path}.url"),
                    "must not be empty",
                ));
            }
            Some(Target::Url(url.clone()))
        }
        (None, Some(host)) => Some(Target::Params {
            host: host.clone(),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            user: raw.user.clone(),
            password: raw.password.clone(),
            database: raw.database.clone(),
        }),
        (None, None) => {
            diagnostics.push(FieldDiagnostic::new(path, "either url or host is required"));
            None
        }
    };

    let tls = TlsMode::from(&raw.ssl);
    if let Err(message) = tls.validate() {
        diagnostics.push(FieldDiagnostic::new(format!("{path}.ssl"), message));
    }

    if diagnostics.len() > before {
        return None;
    }
    let (label, target) = (label?, target?);

    let pool_size = clamp_pool_size(&label, raw.pool_size);

    Some((
        ConnectionDescriptor {
            label,
            target,
            tls,
            read_only: raw.read_only,
            pool_size,
            description: raw.description,
        },
        raw.enabled,
    ))
}

fn clamp_pool_size(label: &str, requested: Option<i64>) -> usize {
    let Some(requested) = requested else {
        return DEFAULT_POOL_SIZE;
    };
    let clamped = requested.clamp(1, MAX_POOL_SIZE as i64) as usize;
    if clamped as i64 != requested {
        warn!(
            label,
            requested,
            clamped,
            "pool_size out of range; clamped"
        );
    }
    clamped
}
