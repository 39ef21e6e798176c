//! # sqlgate-rdbc
//!
//! Relational database connectivity for sqlgate.
//!
//! ## Features
//!
//! - **Statement Classifier**: lexical single-statement check for untrusted SQL
//! - **Connection Pooling**: lazy, bounded pools with health checks and explicit retirement
//! - **Access-Mode Transactions**: `BEGIN READ ONLY` / `BEGIN READ WRITE` with a per-transaction statement timeout
//! - **PostgreSQL Backend**: tokio-postgres with rustls, parameters coerced to server-inferred types
//! - **Value Model**: typed result values with a JSON rendering
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sqlgate_rdbc::prelude::*;
//! use sqlgate_rdbc::postgres::PgConnectionFactory;
//! use std::sync::Arc;
//!
//! let pool = ConnectionPool::new(
//!     PoolConfig::new("postgres://reader@localhost/app").with_max_size(5),
//!     Arc::new(PgConnectionFactory),
//! );
//!
//! let conn = pool.get().await?;
//! let tx = conn.begin(AccessMode::ReadOnly).await?;
//! let rows = tx.query("SELECT * FROM users WHERE id = $1", &[Value::Int64(1)]).await?;
//! tx.commit().await?;
//! conn.release().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod classifier;
pub mod connection;
pub mod error;
pub mod pool;
pub mod postgres;
pub mod security;
pub mod tls;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, Result};

    // Value and type system
    pub use crate::types::{ColumnInfo, ResultSet, Value};

    // Connection traits and config
    pub use crate::connection::{
        AccessMode, Connection, ConnectionConfig, ConnectionFactory, Endpoint, Transaction,
    };

    // Pool types
    pub use crate::pool::{AtomicPoolStats, ConnectionPool, PoolConfig, PoolStats, PooledConnection};

    // Classifier and identifiers
    pub use crate::classifier::{classify, is_single_statement, StatementShape};
    pub use crate::security::{quote_identifier, validate_sql_identifier};

    // TLS
    pub use crate::tls::{TlsMode, TlsVerify};
}

pub use error::{Error, Result};
