//! Connection traits for sqlgate-rdbc
//!
//! Core abstractions for database connectivity:
//! - Connection: a live session that can run statements and open transactions
//! - Transaction: an access-mode-scoped unit of work, ended by commit or rollback
//! - ConnectionFactory: opens connections from a [`ConnectionConfig`]

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::tls::TlsMode;
use crate::types::{ResultSet, Value};

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<ResultSet>;

    /// Execute a statement, returns affected row count
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Begin a transaction in the given access mode
    async fn begin(&self, mode: AccessMode) -> Result<Box<dyn Transaction>>;

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A database transaction
///
/// Dropping a transaction without calling [`commit`](Transaction::commit) or
/// [`rollback`](Transaction::rollback) leaves the session inside it; the
/// owning connection must then be discarded rather than reused.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// The access mode the transaction was opened with
    fn mode(&self) -> AccessMode;

    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<ResultSet>;

    /// Execute a statement that returns no rows
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Bound the run time of each following statement in this transaction
    async fn set_statement_timeout(&self, timeout: Duration) -> Result<()>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Transaction access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessMode {
    /// Writes are rejected by the server
    #[default]
    ReadOnly,
    /// Writes are allowed
    ReadWrite,
}

impl AccessMode {
    /// Pick the mode for a target's read-only flag
    #[inline]
    pub const fn from_read_only(read_only: bool) -> Self {
        if read_only {
            Self::ReadOnly
        } else {
            Self::ReadWrite
        }
    }

    /// Convert to the SQL access-mode clause
    pub const fn to_sql(self) -> &'static str {
        match self {
            Self::ReadOnly => "READ ONLY",
            Self::ReadWrite => "READ WRITE",
        }
    }

    /// The statement that opens a transaction in this mode
    pub const fn begin_sql(self) -> &'static str {
        match self {
            Self::ReadOnly => "BEGIN READ ONLY",
            Self::ReadWrite => "BEGIN READ WRITE",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_sql())
    }
}

/// Where and as whom to connect
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Opaque connection string (URL or key/value form)
    Url(String),
    /// Structured endpoint
    Params {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
        /// Role name
        user: Option<String>,
        /// Role password
        password: Option<String>,
        /// Target database
        database: Option<String>,
    },
}

impl Endpoint {
    /// Credential-free description suitable for logs and listings
    pub fn redacted(&self) -> String {
        match self {
            Self::Url(url) => redact_url(url),
            Self::Params {
                host,
                port,
                user,
                database,
                ..
            } => {
                let mut out = String::from("postgres://");
                if let Some(user) = user {
                    out.push_str(user);
                    out.push('@');
                }
                out.push_str(host);
                out.push(':');
                out.push_str(&port.to_string());
                if let Some(database) = database {
                    out.push('/');
                    out.push_str(database);
                }
                out
            }
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Strip the password and query string from a connection URL.
///
/// Strings that do not parse as URLs (libpq key/value form) are fully masked.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

/// Configuration for creating connections
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Endpoint and credential
    pub endpoint: Endpoint,
    /// Transport security
    pub tls: TlsMode,
    /// Upper bound on establishing one connection
    pub connect_timeout: Duration,
    /// Application name (shown in pg_stat_activity)
    pub application_name: Option<String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint.redacted())
            .field("tls", &self.tls)
            .field("connect_timeout_ms", &self.connect_timeout.as_millis())
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl ConnectionConfig {
    /// Create configuration from a connection string
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_endpoint(Endpoint::Url(url.into()))
    }

    /// Create configuration from an endpoint
    pub fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            tls: TlsMode::Disable,
            connect_timeout: Duration::from_secs(10),
            application_name: Some("sqlgate".into()),
        }
    }

    /// Set transport security
    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;
}
