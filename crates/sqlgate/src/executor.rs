//! Query executor
//!
//! Every statement runs inside its own transaction on one borrowed
//! connection: `BEGIN READ ONLY` or `BEGIN READ WRITE` per the target's
//! flag, a server-side statement timeout, the statement itself, then commit
//! or rollback. A connection whose session state is unknown afterwards
//! (client-side timeout, failed commit or rollback) is discarded instead of
//! returned to the pool.

use serde::Serialize;
use sqlgate_rdbc::classifier::{classify, StatementShape};
use sqlgate_rdbc::connection::{AccessMode, Transaction};
use sqlgate_rdbc::pool::PooledConnection;
use sqlgate_rdbc::types::{ColumnInfo, ResultSet, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::registry::PoolRegistry;

/// Default server-side statement timeout
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound on a requested limit
pub const DEFAULT_MAX_ROWS: usize = 1000;

/// Executor limits
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Server-side statement timeout
    pub statement_timeout: Duration,
    /// Extra time the client waits past the statement timeout before
    /// abandoning the connection
    pub timeout_grace: Duration,
    /// Upper bound on a requested limit
    pub max_rows: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            timeout_grace: Duration::from_secs(2),
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

/// Result of one statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Result columns
    pub columns: Vec<ColumnInfo>,
    /// Returned rows, possibly truncated
    #[serde(serialize_with = "serialize_rows")]
    pub rows: Vec<Vec<Value>>,
    /// Returned rows for queries, affected rows for statements without a
    /// result set
    pub row_count: u64,
    /// Whether rows were dropped to honor the limit
    pub truncated: bool,
    /// Rows the statement produced before truncation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,
}

fn serialize_rows<S: serde::Serializer>(
    rows: &[Vec<Value>],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;
    let mut seq = serializer.serialize_seq(Some(rows.len()))?;
    for row in rows {
        let row: Vec<serde_json::Value> = row.iter().map(Value::to_json).collect();
        seq.serialize_element(&row)?;
    }
    seq.end()
}

impl QueryResult {
    /// Apply an optional `limit` to a result set; without one every row is kept
    pub fn from_result_set(rs: ResultSet, limit: Option<usize>) -> Self {
        let ResultSet {
            columns,
            mut rows,
            affected,
        } = rs;

        let total = rows.len() as u64;
        let truncated = limit.is_some_and(|limit| rows.len() > limit);
        if let Some(limit) = limit.filter(|_| truncated) {
            rows.truncate(limit);
        }
        let row_count = if columns.is_empty() {
            affected
        } else {
            rows.len() as u64
        };

        Self {
            columns,
            rows,
            row_count,
            truncated,
            total_rows: truncated.then_some(total),
        }
    }

    /// JSON payload
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "error": { "kind": "execution_error", "message": e.to_string() } })
        })
    }
}

/// Textual execution plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExplainResult {
    /// Plan text, one line per plan row
    pub plan: String,
    /// Whether the statement was actually run (`EXPLAIN ANALYZE`)
    pub analyzed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Commit,
    Rollback,
}

/// Runs statements against labeled targets
#[derive(Debug)]
pub struct QueryExecutor {
    registry: Arc<PoolRegistry>,
    settings: ExecutorSettings,
}

impl QueryExecutor {
    /// Create an executor over a registry
    pub fn new(registry: Arc<PoolRegistry>, settings: ExecutorSettings) -> Self {
        Self { registry, settings }
    }

    /// Registry used to resolve labels
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Executor limits
    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run one statement against `label` and commit.
    ///
    /// Multi-statement text is rejected before any connection is touched.
    /// Parameters are bound, never interpolated. When a `limit` is given
    /// (capped at the configured maximum), rows beyond it are dropped and
    /// the result is marked truncated.
    pub async fn execute(
        &self,
        label: &str,
        sql: &str,
        params: &[Value],
        limit: Option<usize>,
    ) -> Result<QueryResult> {
        admit(label, sql)?;
        let limit = self.effective_limit(limit)?;

        let rs = self.run(label, sql, params, None, Finish::Commit).await?;
        Ok(QueryResult::from_result_set(rs, limit))
    }

    /// Show the plan for one statement. Always rolls back, so `analyze`
    /// leaves no effects behind.
    pub async fn explain(
        &self,
        label: &str,
        sql: &str,
        params: &[Value],
        analyze: bool,
    ) -> Result<ExplainResult> {
        admit(label, sql)?;

        let statement = sql.trim().trim_end_matches(';').trim_end();
        if statement.is_empty() {
            return Err(Error::invalid_input("sql must not be empty"));
        }
        let explain_sql = if analyze {
            format!("EXPLAIN (ANALYZE) {statement}")
        } else {
            format!("EXPLAIN {statement}")
        };

        let rs = self
            .run(label, &explain_sql, params, None, Finish::Rollback)
            .await?;
        let plan = rs
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(Value::as_string))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ExplainResult {
            plan,
            analyzed: analyze,
        })
    }

    /// Run a fixed catalog query in a read-only transaction that is always
    /// rolled back, whatever the target's flag says
    pub async fn read_catalog(&self, label: &str, sql: &str, params: &[Value]) -> Result<ResultSet> {
        self.run(label, sql, params, Some(AccessMode::ReadOnly), Finish::Rollback)
            .await
    }

    fn effective_limit(&self, limit: Option<usize>) -> Result<Option<usize>> {
        match limit {
            Some(0) => Err(Error::invalid_input("limit must be a positive integer")),
            Some(limit) => Ok(Some(limit.min(self.settings.max_rows))),
            None => Ok(None),
        }
    }

    async fn run(
        &self,
        label: &str,
        sql: &str,
        params: &[Value],
        mode: Option<AccessMode>,
        finish: Finish,
    ) -> Result<ResultSet> {
        let (descriptor, handle) = self.registry.resolve(label).await?;

        let (descriptor, conn) = match handle.get().await {
            Ok(conn) => (descriptor, conn),
            // retired between resolution and borrow; the replacement is live now
            Err(sqlgate_rdbc::Error::PoolClosed) => {
                debug!(label, "pool retired before borrow; resolving again");
                let (descriptor, handle) = self.registry.resolve(label).await?;
                let conn = handle.get().await?;
                (descriptor, conn)
            }
            Err(e) => return Err(e.into()),
        };

        let mode = mode.unwrap_or(AccessMode::from_read_only(descriptor.read_only));
        let start = Instant::now();
        let (result, reusable) = self.run_in_transaction(&conn, mode, sql, params, finish).await;

        if reusable {
            conn.release().await;
        } else {
            conn.discard().await;
        }

        match &result {
            Ok(rs) => debug!(
                label,
                mode = %mode,
                rows = rs.rows.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "statement completed"
            ),
            Err(e) => debug!(
                label,
                mode = %mode,
                kind = e.kind(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "statement failed"
            ),
        }
        result
    }

    /// Returns the outcome and whether the connection may be reused
    async fn run_in_transaction(
        &self,
        conn: &PooledConnection,
        mode: AccessMode,
        sql: &str,
        params: &[Value],
        finish: Finish,
    ) -> (Result<ResultSet>, bool) {
        let tx = match conn.begin(mode).await {
            Ok(tx) => tx,
            Err(e) => return (Err(e.into()), false),
        };

        if let Err(e) = tx.set_statement_timeout(self.settings.statement_timeout).await {
            let reusable = rollback_quietly(tx).await;
            return (Err(e.into()), reusable);
        }

        let guard = self.settings.statement_timeout + self.settings.timeout_grace;
        let result = match tokio::time::timeout(guard, tx.query(sql, params)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = guard.as_millis() as u64,
                    "statement exceeded client-side guard; abandoning connection"
                );
                return (
                    Err(Error::StatementTimeout {
                        timeout: self.settings.statement_timeout,
                    }),
                    false,
                );
            }
        };

        match (result, finish) {
            (Ok(rs), Finish::Commit) => match tx.commit().await {
                Ok(()) => (Ok(rs), true),
                Err(e) => (Err(e.into()), false),
            },
            (Ok(rs), Finish::Rollback) => {
                let reusable = rollback_quietly(tx).await;
                (Ok(rs), reusable)
            }
            (Err(e), _) => {
                let reusable = rollback_quietly(tx).await;
                (Err(e.into()), reusable)
            }
        }
    }
}

/// Gate the statement text; runs before any label resolution or borrow
fn admit(label: &str, sql: &str) -> Result<()> {
    if let StatementShape::Multiple { boundary } = classify(sql) {
        warn!(label, boundary, "multi-statement text rejected");
        return Err(Error::MultiStatementRejected { boundary });
    }
    Ok(())
}

/// Roll back, logging instead of returning a failure so it never masks the
/// primary outcome. Returns whether the session is known to be clean.
async fn rollback_quietly(tx: Box<dyn Transaction>) -> bool {
    match tx.rollback().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "rollback failed; discarding connection");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(rows: usize) -> ResultSet {
        ResultSet::new(
            vec![ColumnInfo::new("n", "int4")],
            (0..rows).map(|i| vec![Value::Int32(i as i32)]).collect(),
        )
    }

    #[test]
    fn test_limit_truncates_and_reports_total() {
        let result = QueryResult::from_result_set(rs(10), Some(3));
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.row_count, 3);
        assert!(result.truncated);
        assert_eq!(result.total_rows, Some(10));
    }

    #[test]
    fn test_limit_at_or_above_row_count() {
        let result = QueryResult::from_result_set(rs(3), Some(3));
        assert!(!result.truncated);
        assert_eq!(result.total_rows, None);

        let json = result.to_json();
        assert_eq!(json["row_count"], 3);
        assert_eq!(json["rows"][2][0], 2);
        assert_eq!(json["columns"][0]["type_name"], "int4");
        assert!(json.get("total_rows").is_none());
    }

    #[test]
    fn test_no_limit_keeps_every_row() {
        let result = QueryResult::from_result_set(rs(5000), None);
        assert_eq!(result.rows.len(), 5000);
        assert!(!result.truncated);
        assert_eq!(result.total_rows, None);
    }

    #[test]
    fn test_statement_without_result_set_reports_affected() {
        let mut rs = ResultSet::default();
        rs.affected = 7;
        let result = QueryResult::from_result_set(rs, Some(100));
        assert_eq!(result.row_count, 7);
        assert!(!result.truncated);
    }

    #[test]
    fn test_admit() {
        assert!(admit("x", "SELECT 1;").is_ok());
        let err = admit("x", "SELECT 1; SELECT 2").unwrap_err();
        assert_eq!(err.kind(), "multi_statement_rejected");
    }
}
