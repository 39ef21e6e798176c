//! Operation table
//!
//! Every remote-callable operation is a [`Tool`]: it declares a name, a
//! description and a JSON Schema for its arguments, and turns validated
//! arguments into a JSON result. [`ToolTable`] is the fixed name → tool map
//! the transport dispatches through.
//!
//! # Example
//!
//! ```rust,ignore
//! let table = ToolTable::standard(executor);
//! let payload = table.call("run_query", json!({"label": "staging", "sql": "SELECT 1"})).await;
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as Json};
use sqlgate_rdbc::types::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::catalog;
use crate::error::{Error, Result};
use crate::executor::QueryExecutor;

/// One remote-callable operation
#[async_trait]
pub trait Tool: Send + Sync {
    /// Operation name used for dispatch
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// JSON Schema of the arguments object
    fn input_schema(&self) -> Json;

    /// Validate arguments, execute, and format the result
    async fn call(&self, args: Json) -> Result<Json>;
}

/// Fixed table of operations, keyed by name
#[derive(Default)]
pub struct ToolTable {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl ToolTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard operation set over one executor
    pub fn standard(executor: Arc<QueryExecutor>) -> Self {
        let mut table = Self::new();
        table.register(Arc::new(ListTargets {
            executor: Arc::clone(&executor),
        }));
        table.register(Arc::new(RunQuery {
            executor: Arc::clone(&executor),
        }));
        table.register(Arc::new(ExplainQuery {
            executor: Arc::clone(&executor),
        }));
        table.register(Arc::new(ListSchemas {
            executor: Arc::clone(&executor),
        }));
        table.register(Arc::new(ListTables {
            executor: Arc::clone(&executor),
        }));
        table.register(Arc::new(DescribeTable {
            executor: Arc::clone(&executor),
        }));
        table.register(Arc::new(HealthCheck { executor }));
        table
    }

    /// Register a tool under its own name, replacing any previous one
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    /// Look up a tool
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Whether a tool is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool descriptors in name order, for `tools/list`
    pub fn list(&self) -> Vec<Json> {
        self.tools
            .values()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.input_schema(),
                })
            })
            .collect()
    }

    /// Dispatch by name
    pub async fn dispatch(&self, name: &str, args: Json) -> Result<Json> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::invalid_input(format!("unknown operation '{name}'")))?;
        debug!(tool = name, "dispatching operation");
        tool.call(args).await
    }

    /// Dispatch by name, rendering failures as an error payload
    pub async fn call(&self, name: &str, args: Json) -> Json {
        match self.dispatch(name, args).await {
            Ok(payload) => payload,
            Err(e) => e.to_payload(),
        }
    }
}

impl std::fmt::Debug for ToolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

/// Deserialize an arguments object; a missing object counts as empty
fn parse_args<T: DeserializeOwned>(args: Json) -> Result<T> {
    let args = match args {
        Json::Null => json!({}),
        other => other,
    };
    serde_json::from_value(args).map_err(|e| Error::invalid_input(e.to_string()))
}

fn bind_params(params: Option<Vec<Json>>) -> Result<Vec<Value>> {
    params
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(i, p)| match p {
            Json::Array(_) | Json::Object(_) => Err(Error::invalid_input(format!(
                "params[{i}]: must be a string, number, boolean or null"
            ))),
            scalar => Ok(Value::from_json(scalar)),
        })
        .collect()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Json> {
    serde_json::to_value(value).map_err(|e| Error::Execution {
        message: format!("cannot encode result: {e}"),
        sqlstate: None,
    })
}

const PARAMS_SCHEMA: &str = "Positional parameters bound to $1, $2, ...";

struct ListTargets {
    executor: Arc<QueryExecutor>,
}

#[async_trait]
impl Tool for ListTargets {
    fn name(&self) -> &'static str {
        "list_targets"
    }

    fn description(&self) -> &'static str {
        "List the configured database targets with redacted endpoints and access flags"
    }

    fn input_schema(&self) -> Json {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn call(&self, _args: Json) -> Result<Json> {
        let targets = self.executor.registry().targets().await;
        Ok(json!({ "targets": targets }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunQueryArgs {
    label: String,
    sql: String,
    #[serde(default)]
    params: Option<Vec<Json>>,
    #[serde(default)]
    limit: Option<usize>,
}

struct RunQuery {
    executor: Arc<QueryExecutor>,
}

#[async_trait]
impl Tool for RunQuery {
    fn name(&self) -> &'static str {
        "run_query"
    }

    fn description(&self) -> &'static str {
        "Run one SQL statement against a target inside a transaction; read-only targets reject writes"
    }

    fn input_schema(&self) -> Json {
        json!({
            "type": "object",
            "properties": {
                "label": { "type": "string", "description": "Target label" },
                "sql": { "type": "string", "description": "A single SQL statement" },
                "params": {
                    "type": "array",
                    "description": PARAMS_SCHEMA,
                    "items": { "type": ["string", "number", "boolean", "null"] }
                },
                "limit": { "type": "integer", "minimum": 1, "description": "Maximum rows to return" }
            },
            "required": ["label", "sql"],
            "additionalProperties": false
        })
    }

    async fn call(&self, args: Json) -> Result<Json> {
        let args: RunQueryArgs = parse_args(args)?;
        let params = bind_params(args.params)?;
        let result = self
            .executor
            .execute(&args.label, &args.sql, &params, args.limit)
            .await?;
        Ok(result.to_json())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExplainQueryArgs {
    label: String,
    sql: String,
    #[serde(default)]
    params: Option<Vec<Json>>,
    #[serde(default)]
    analyze: bool,
}

struct ExplainQuery {
    executor: Arc<QueryExecutor>,
}

#[async_trait]
impl Tool for ExplainQuery {
    fn name(&self) -> &'static str {
        "explain_query"
    }

    fn description(&self) -> &'static str {
        "Show the execution plan of one SQL statement; always rolled back"
    }

    fn input_schema(&self) -> Json {
        json!({
            "type": "object",
            "properties": {
                "label": { "type": "string" },
                "sql": { "type": "string" },
                "params": {
                    "type": "array",
                    "description": PARAMS_SCHEMA,
                    "items": { "type": ["string", "number", "boolean", "null"] }
                },
                "analyze": { "type": "boolean", "default": false }
            },
            "required": ["label", "sql"],
            "additionalProperties": false
        })
    }

    async fn call(&self, args: Json) -> Result<Json> {
        let args: ExplainQueryArgs = parse_args(args)?;
        let params = bind_params(args.params)?;
        let result = self
            .executor
            .explain(&args.label, &args.sql, &params, args.analyze)
            .await?;
        to_json(&result)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LabelArgs {
    label: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaArgs {
    label: String,
    #[serde(default)]
    schema: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableArgs {
    label: String,
    table: String,
    #[serde(default)]
    schema: Option<String>,
}

fn label_only_schema() -> Json {
    json!({
        "type": "object",
        "properties": { "label": { "type": "string" } },
        "required": ["label"],
        "additionalProperties": false
    })
}

struct ListSchemas {
    executor: Arc<QueryExecutor>,
}

#[async_trait]
impl Tool for ListSchemas {
    fn name(&self) -> &'static str {
        "list_schemas"
    }

    fn description(&self) -> &'static str {
        "List user schemas on a target"
    }

    fn input_schema(&self) -> Json {
        label_only_schema()
    }

    async fn call(&self, args: Json) -> Result<Json> {
        let args: LabelArgs = parse_args(args)?;
        to_json(&catalog::list_schemas(&self.executor, &args.label).await?)
    }
}

struct ListTables {
    executor: Arc<QueryExecutor>,
}

#[async_trait]
impl Tool for ListTables {
    fn name(&self) -> &'static str {
        "list_tables"
    }

    fn description(&self) -> &'static str {
        "List tables and views in a schema (default public)"
    }

    fn input_schema(&self) -> Json {
        json!({
            "type": "object",
            "properties": {
                "label": { "type": "string" },
                "schema": { "type": "string", "default": catalog::DEFAULT_SCHEMA }
            },
            "required": ["label"],
            "additionalProperties": false
        })
    }

    async fn call(&self, args: Json) -> Result<Json> {
        let args: SchemaArgs = parse_args(args)?;
        to_json(&catalog::list_tables(&self.executor, &args.label, args.schema.as_deref()).await?)
    }
}

struct DescribeTable {
    executor: Arc<QueryExecutor>,
}

#[async_trait]
impl Tool for DescribeTable {
    fn name(&self) -> &'static str {
        "describe_table"
    }

    fn description(&self) -> &'static str {
        "Describe a table's columns: types, nullability, defaults and primary key"
    }

    fn input_schema(&self) -> Json {
        json!({
            "type": "object",
            "properties": {
                "label": { "type": "string" },
                "table": { "type": "string" },
                "schema": { "type": "string", "default": catalog::DEFAULT_SCHEMA }
            },
            "required": ["label", "table"],
            "additionalProperties": false
        })
    }

    async fn call(&self, args: Json) -> Result<Json> {
        let args: TableArgs = parse_args(args)?;
        let description = catalog::describe_table(
            &self.executor,
            &args.label,
            &args.table,
            args.schema.as_deref(),
        )
        .await?;
        to_json(&description)
    }
}

struct HealthCheck {
    executor: Arc<QueryExecutor>,
}

#[async_trait]
impl Tool for HealthCheck {
    fn name(&self) -> &'static str {
        "health_check"
    }

    fn description(&self) -> &'static str {
        "Check that a target answers and report server version, database and role"
    }

    fn input_schema(&self) -> Json {
        label_only_schema()
    }

    async fn call(&self, args: Json) -> Result<Json> {
        let args: LabelArgs = parse_args(args)?;
        to_json(&catalog::health_check(&self.executor, &args.label).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_params_rejects_nested_values() {
        let params = bind_params(Some(vec![json!(1), json!("a"), json!(null)])).unwrap();
        assert_eq!(params, vec![Value::Int64(1), Value::from("a"), Value::Null]);

        let err = bind_params(Some(vec![json!(1), json!([1, 2])])).unwrap_err();
        assert!(err.to_string().contains("params[1]"));

        assert!(bind_params(None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_args_reports_invalid_input() {
        let err = parse_args::<RunQueryArgs>(json!({ "label": "a" })).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.to_string().contains("sql"));

        let err = parse_args::<RunQueryArgs>(json!({ "label": "a", "sql": "x", "limit": -1 }))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");

        let err = parse_args::<LabelArgs>(json!({ "label": "a", "extra": 1 })).unwrap_err();
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn test_null_args_are_empty_object() {
        #[derive(Deserialize)]
        struct Empty {}
        assert!(parse_args::<Empty>(Json::Null).is_ok());
    }
}
