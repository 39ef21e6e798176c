//! Error types for sqlgate
//!
//! Every operation fails with one of these kinds. Each carries a stable
//! [`Error::kind`] string that appears in error payloads, so callers can
//! branch on the kind without parsing messages.

use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for sqlgate
pub type Result<T> = std::result::Result<T, Error>;

/// One problem found while validating the configuration source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDiagnostic {
    /// Path of the offending field, e.g. `connections[1].port`
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldDiagnostic {
    /// Create a diagnostic
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Main error type for sqlgate
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration source does not exist
    #[error("configuration source not found: {}", .path.display())]
    ConfigMissing {
        /// Path that was probed
        path: PathBuf,
    },

    /// The configuration source failed validation
    #[error("invalid configuration: {}", join(.diagnostics, "; "))]
    ConfigInvalid {
        /// Every problem found, in document order
        diagnostics: Vec<FieldDiagnostic>,
    },

    /// No enabled, in-scope target carries this label
    #[error("{}", label_not_found_message(.label, .available, .reason.as_deref()))]
    LabelNotFound {
        /// Requested label
        label: String,
        /// Labels currently available
        available: Vec<String>,
        /// Why the lookup could not be made, when configuration is unavailable
        reason: Option<String>,
    },

    /// The statement classifier found more than one statement
    #[error("only a single SQL statement is allowed; found more content after the ';' at byte {boundary}")]
    MultiStatementRejected {
        /// Byte offset of the offending boundary
        boundary: usize,
    },

    /// Establishing a connection took too long
    #[error("connect timeout after {}ms", .timeout.as_millis())]
    ConnectTimeout {
        /// Configured connect timeout
        timeout: Duration,
    },

    /// The statement ran longer than the statement timeout
    #[error("statement timeout after {}ms", .timeout.as_millis())]
    StatementTimeout {
        /// Configured statement timeout
        timeout: Duration,
    },

    /// No pooled connection became available in time
    #[error("pool exhausted: {message}")]
    PoolExhausted {
        /// Details
        message: String,
    },

    /// The server is shutting down and accepts no new work
    #[error("server is shutting down")]
    ShuttingDown,

    /// The database reported a failure
    #[error("{message}")]
    Execution {
        /// Database message
        message: String,
        /// SQLSTATE, when the server reported one
        sqlstate: Option<String>,
    },

    /// Operation arguments are malformed
    #[error("invalid input: {message}")]
    InvalidInput {
        /// What is wrong
        message: String,
    },
}

fn join<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(sep)
}

fn label_not_found_message(label: &str, available: &[String], reason: Option<&str>) -> String {
    let available = if available.is_empty() {
        "(none)".to_string()
    } else {
        available.join(", ")
    };
    match reason {
        Some(reason) => format!(
            "unknown label '{label}'; available labels: {available} ({reason})"
        ),
        None => format!("unknown label '{label}'; available labels: {available}"),
    }
}

impl Error {
    /// Stable, machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigMissing { .. } => "config_missing",
            Self::ConfigInvalid { .. } => "config_invalid",
            Self::LabelNotFound { .. } => "label_not_found",
            Self::MultiStatementRejected { .. } => "multi_statement_rejected",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::StatementTimeout { .. } => "statement_timeout",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::ShuttingDown => "shutting_down",
            Self::Execution { .. } => "execution_error",
            Self::InvalidInput { .. } => "invalid_input",
        }
    }

    /// Whether the failure originates from the configuration source
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigMissing { .. } | Self::ConfigInvalid { .. })
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Render as the error payload returned at the operation boundary
    pub fn to_payload(&self) -> serde_json::Value {
        let mut error = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        match self {
            Self::ConfigInvalid { diagnostics } => {
                error["diagnostics"] = json!(diagnostics);
            }
            Self::LabelNotFound { available, .. } => {
                error["available"] = json!(available);
            }
            Self::Execution {
                sqlstate: Some(sqlstate),
                ..
            } => {
                error["sqlstate"] = json!(sqlstate);
            }
            _ => {}
        }
        json!({ "error": error })
    }
}

impl From<sqlgate_rdbc::Error> for Error {
    fn from(err: sqlgate_rdbc::Error) -> Self {
        use sqlgate_rdbc::Error as Rdbc;
        match err {
            Rdbc::ConnectTimeout { timeout } => Self::ConnectTimeout { timeout },
            Rdbc::StatementTimeout { timeout } => Self::StatementTimeout { timeout },
            Rdbc::PoolExhausted { message } => Self::PoolExhausted { message },
            Rdbc::PoolClosed => Self::PoolExhausted {
                message: "pool was retired while waiting for a connection".to_string(),
            },
            Rdbc::TypeConversion { message } => Self::InvalidInput { message },
            Rdbc::Query {
                message, sqlstate, ..
            } => Self::Execution { message, sqlstate },
            other => Self::Execution {
                message: other.to_string(),
                sqlstate: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_not_found_lists_available() {
        let err = Error::LabelNotFound {
            label: "staging".into(),
            available: vec!["prod".into(), "analytics".into()],
            reason: None,
        };
        assert_eq!(
            err.to_string(),
            "unknown label 'staging'; available labels: prod, analytics"
        );
        assert_eq!(err.kind(), "label_not_found");
        assert_eq!(err.to_payload()["error"]["available"][1], "analytics");
    }

    #[test]
    fn test_label_not_found_with_reason() {
        let err = Error::LabelNotFound {
            label: "prod".into(),
            available: vec![],
            reason: Some("configuration unavailable".into()),
        };
        assert!(err.to_string().contains("(none)"));
        assert!(err.to_string().ends_with("(configuration unavailable)"));
    }

    #[test]
    fn test_config_invalid_payload_carries_diagnostics() {
        let err = Error::ConfigInvalid {
            diagnostics: vec![
                FieldDiagnostic::new("connections[0].port", "must be between 1 and 65535"),
                FieldDiagnostic::new("connections[1]", "either url or host is required"),
            ],
        };
        assert!(err.is_config_error());
        assert!(err.to_string().contains("connections[0].port: must be between"));

        let payload = err.to_payload();
        assert_eq!(payload["error"]["kind"], "config_invalid");
        assert_eq!(payload["error"]["diagnostics"][1]["field"], "connections[1]");
    }

    #[test]
    fn test_rdbc_errors_map_to_taxonomy() {
        let err: Error = sqlgate_rdbc::Error::query_with_state(
            "cannot execute UPDATE in a read-only transaction",
            "25006",
        )
        .into();
        assert_eq!(err.kind(), "execution_error");
        assert_eq!(err.to_payload()["error"]["sqlstate"], "25006");

        let err: Error = sqlgate_rdbc::Error::StatementTimeout {
            timeout: Duration::from_secs(30),
        }
        .into();
        assert_eq!(err.kind(), "statement_timeout");

        let err: Error = sqlgate_rdbc::Error::type_conversion("parameter $1").into();
        assert_eq!(err.kind(), "invalid_input");

        let err: Error = sqlgate_rdbc::Error::connection("refused").into();
        assert_eq!(err.kind(), "execution_error");
    }
}
