//! # sqlgate
//!
//! Remote-callable read operations against several labeled PostgreSQL
//! targets, selected per call, under a configuration that may change while
//! the process runs.
//!
//! ## Architecture
//!
//! ```text
//! caller ──▶ ToolTable ──▶ QueryExecutor ──▶ PoolRegistry ──▶ ConnectionPool ──▶ PostgreSQL
//!                              │                  │
//!                        classifier gate     ConfigLoader (TTL + mtime cache)
//! ```
//!
//! - [`ConfigLoader`] parses the descriptor source into immutable
//!   [`ConfigSnapshot`]s and re-reads it only when it changed.
//! - [`PoolRegistry`] keeps one pool per label and swaps it when the
//!   descriptor's [`PoolFingerprint`] changes.
//! - [`QueryExecutor`] rejects multi-statement text, then runs each statement
//!   in a read-only or read-write transaction per the target's flag.
//! - [`ToolTable`] maps operation names to handlers; [`transport`] speaks
//!   newline-delimited JSON-RPC on stdio.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod loader;
pub mod registry;
pub mod tools;
pub mod transport;
pub mod types;

pub use config::{ConfigSnapshot, ConnectionDescriptor, Target, TargetSummary};
pub use error::{Error, FieldDiagnostic, Result};
pub use executor::{ExecutorSettings, ExplainResult, QueryExecutor, QueryResult};
pub use fingerprint::PoolFingerprint;
pub use loader::ConfigLoader;
pub use registry::{PoolHandle, PoolRegistry, RegistrySettings, RegistryStats};
pub use tools::{Tool, ToolTable};
pub use types::SensitiveString;
