//! Error types for sqlgate-rdbc
//!
//! Errors are classified so callers can report them precisely:
//! - Establishment failures (connection refused, TLS, connect timeout)
//! - Execution failures (database-reported, with SQLSTATE when available)
//! - Pool failures (exhausted, closed)
//!
//! Nothing in this crate retries.

use std::time::Duration;
use thiserror::Error;

/// Result type for sqlgate-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE raised by PostgreSQL when a statement is cancelled by `statement_timeout`
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";

/// SQLSTATE raised by PostgreSQL for a write inside a read-only transaction
pub const SQLSTATE_READ_ONLY_TRANSACTION: &str = "25006";

/// Main error type for sqlgate-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection could not be established or was lost
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Establishing a connection took longer than the connect timeout
    #[error("connect timeout after {}ms", .timeout.as_millis())]
    ConnectTimeout { timeout: Duration },

    /// A statement took longer than the statement timeout
    #[error("statement timeout after {}ms", .timeout.as_millis())]
    StatementTimeout { timeout: Duration },

    /// Query execution failed on the server
    #[error("query error: {message}")]
    Query {
        message: String,
        sqlstate: Option<String>,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction control statement failed
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// No connection became available within the acquire timeout
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// The pool has been retired and accepts no new borrows
    #[error("pool closed")]
    PoolClosed,

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl Error {
    /// SQLSTATE reported by the server, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Query { sqlstate, .. } => sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error carrying a SQLSTATE code
    pub fn query_with_state(message: impl Into<String>, sqlstate: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sqlstate: Some(sqlstate.into()),
            sql: None,
            source: None,
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Map a tokio-postgres error raised while running `sql`.
    ///
    /// Server-side cancellation by `statement_timeout` becomes
    /// [`Error::StatementTimeout`]; other database errors keep their SQLSTATE.
    pub fn from_pg(err: tokio_postgres::Error, sql: &str, statement_timeout: Duration) -> Self {
        let Some(db) = err.as_db_error() else {
            if err.is_closed() {
                return Self::connection_with_source("connection closed", err);
            }
            return Self::Query {
                message: err.to_string(),
                sqlstate: None,
                sql: Some(sql.to_string()),
                source: Some(Box::new(err)),
            };
        };

        let code = db.code().code().to_string();
        if code == SQLSTATE_QUERY_CANCELED {
            return Self::StatementTimeout {
                timeout: statement_timeout,
            };
        }

        let mut message = db.message().to_string();
        if let Some(detail) = db.detail() {
            message.push_str(": ");
            message.push_str(detail);
        }

        Self::Query {
            message,
            sqlstate: Some(code),
            sql: Some(sql.to_string()),
            source: Some(Box::new(err)),
        }
    }
}
