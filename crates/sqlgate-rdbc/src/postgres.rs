//! PostgreSQL backend implementation for sqlgate-rdbc
//!
//! Provides PostgreSQL-specific implementations:
//! - Connection and transaction over a shared tokio-postgres client
//! - Parameter binding coerced to the server-inferred parameter types
//! - Row conversion into [`Value`]s
//! - TLS via rustls (see [`crate::tls`])

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{pin_mut, TryStreamExt};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{FromSql, IsNull, Kind, ToSql, Type};
use tracing::{debug, warn};

use crate::connection::{
    AccessMode, Connection, ConnectionConfig, ConnectionFactory, Endpoint, Transaction,
};
use crate::error::{Error, Result};
use crate::tls::{make_tls_connector, TlsMode};
use crate::types::{ColumnInfo, ResultSet, Value};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// A typed SQL NULL accepted for any parameter type
#[derive(Debug)]
struct SqlNull;

impl ToSql for SqlNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    tokio_postgres::types::to_sql_checked!();
}

/// Placeholder for column types without a native mapping.
///
/// Enum labels travel as text, so they are recovered; anything else is
/// reported by type name.
struct Opaque(Option<String>);

impl<'a> FromSql<'a> for Opaque {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let text = match ty.kind() {
            Kind::Enum(_) => std::str::from_utf8(raw).ok().map(str::to_owned),
            _ => None,
        };
        Ok(Self(text))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Coerce a caller-supplied value to the type the server inferred for
/// parameter `$position`.
fn coerce_param(value: &Value, ty: &Type, position: usize) -> Result<BoxedParam> {
    if value.is_null() {
        return Ok(Box::new(SqlNull));
    }

    let mismatch = || {
        Error::type_conversion(format!(
            "parameter ${position}: cannot convert {} to {}",
            value.sql_type(),
            ty.name()
        ))
    };

    let boxed: BoxedParam = match *ty {
        Type::BOOL => Box::new(value.as_bool().ok_or_else(mismatch)?),
        Type::INT2 => Box::new(
            value
                .as_i64()
                .and_then(|n| i16::try_from(n).ok())
                .ok_or_else(mismatch)?,
        ),
        Type::INT4 => Box::new(
            value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(mismatch)?,
        ),
        Type::INT8 => Box::new(value.as_i64().ok_or_else(mismatch)?),
        Type::OID => Box::new(
            value
                .as_i64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(mismatch)?,
        ),
        Type::FLOAT4 => Box::new(value.as_f64().ok_or_else(mismatch)? as f32),
        Type::FLOAT8 => Box::new(value.as_f64().ok_or_else(mismatch)?),
        Type::NUMERIC => Box::new(to_decimal(value).ok_or_else(mismatch)?),
        Type::JSON | Type::JSONB => Box::new(to_json_param(value)),
        Type::UUID => Box::new(match value {
            Value::Uuid(u) => *u,
            other => other
                .as_str()
                .and_then(|s| uuid::Uuid::parse_str(s.trim()).ok())
                .ok_or_else(mismatch)?,
        }),
        Type::DATE => Box::new(match value {
            Value::Date(d) => *d,
            other => other
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
                .ok_or_else(mismatch)?,
        }),
        Type::TIME => Box::new(match value {
            Value::Time(t) => *t,
            other => other
                .as_str()
                .and_then(|s| NaiveTime::from_str(s.trim()).ok())
                .ok_or_else(mismatch)?,
        }),
        Type::TIMESTAMP => Box::new(match value {
            Value::DateTime(dt) => *dt,
            other => other
                .as_str()
                .and_then(parse_timestamp)
                .ok_or_else(mismatch)?,
        }),
        Type::TIMESTAMPTZ => Box::new(match value {
            Value::DateTimeTz(dt) => *dt,
            other => other
                .as_str()
                .and_then(parse_timestamptz)
                .ok_or_else(mismatch)?,
        }),
        Type::BYTEA => Box::new(match value {
            Value::Bytes(b) => b.clone(),
            Value::String(s) => s.clone().into_bytes(),
            _ => return Err(mismatch()),
        }),
        _ if <String as ToSql>::accepts(ty) => Box::new(value.as_string().ok_or_else(mismatch)?),
        _ => {
            return Err(Error::type_conversion(format!(
                "parameter ${position}: unsupported parameter type {}",
                ty.name()
            )))
        }
    };

    Ok(boxed)
}

fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Decimal(d) => Some(*d),
        Value::Float32(f) => Decimal::try_from(f64::from(*f)).ok(),
        Value::Float64(f) => Decimal::try_from(*f).ok(),
        Value::String(s) => {
            let s = s.trim();
            Decimal::from_str(s)
                .or_else(|_| Decimal::from_scientific(s))
                .ok()
        }
        other => other.as_i64().map(Decimal::from),
    }
}

fn to_json_param(value: &Value) -> serde_json::Value {
    match value {
        Value::Json(j) => j.clone(),
        // text that is not valid JSON becomes a JSON string
        Value::String(s) => {
            serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone()))
        }
        other => other.to_json(),
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::from_str(s)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

fn parse_timestamptz(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Coerce every parameter against the prepared statement's parameter types
fn bind_params(types: &[Type], params: &[Value]) -> Result<Vec<BoxedParam>> {
    if types.len() != params.len() {
        return Err(Error::type_conversion(format!(
            "statement expects {} parameter(s), {} supplied",
            types.len(),
            params.len()
        )));
    }

    params
        .iter()
        .zip(types)
        .enumerate()
        .map(|(i, (value, ty))| coerce_param(value, ty, i + 1))
        .collect()
}

fn get_value<'a, T, F>(row: &'a tokio_postgres::Row, idx: usize, f: F) -> Value
where
    T: FromSql<'a>,
    F: FnOnce(T) -> Value,
{
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(v)) => f(v),
        _ => Value::Null,
    }
}

fn json_array<T: Into<serde_json::Value>>(items: Vec<Option<T>>) -> Value {
    Value::Json(serde_json::Value::Array(
        items
            .into_iter()
            .map(|item| item.map(Into::into).unwrap_or(serde_json::Value::Null))
            .collect(),
    ))
}

/// Convert a PostgreSQL value to a [`Value`]
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => get_value(row, idx, Value::Bool),
        Type::INT2 => get_value(row, idx, Value::Int16),
        Type::INT4 => get_value(row, idx, Value::Int32),
        Type::INT8 => get_value(row, idx, Value::Int64),
        Type::OID => get_value(row, idx, |v: u32| Value::Int64(i64::from(v))),
        Type::CHAR => get_value(row, idx, |v: i8| {
            Value::String(char::from(v as u8).to_string())
        }),
        Type::FLOAT4 => get_value(row, idx, Value::Float32),
        Type::FLOAT8 => get_value(row, idx, Value::Float64),
        Type::NUMERIC => get_value(row, idx, Value::Decimal),
        Type::BYTEA => get_value(row, idx, Value::Bytes),
        Type::DATE => get_value(row, idx, Value::Date),
        Type::TIME => get_value(row, idx, Value::Time),
        Type::TIMESTAMP => get_value(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => get_value(row, idx, Value::DateTimeTz),
        Type::UUID => get_value(row, idx, Value::Uuid),
        Type::JSON | Type::JSONB => get_value(row, idx, Value::Json),
        Type::BOOL_ARRAY => get_value(row, idx, json_array::<bool>),
        Type::INT2_ARRAY => get_value(row, idx, json_array::<i16>),
        Type::INT4_ARRAY => get_value(row, idx, json_array::<i32>),
        Type::INT8_ARRAY => get_value(row, idx, json_array::<i64>),
        Type::FLOAT8_ARRAY => get_value(row, idx, json_array::<f64>),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::NAME_ARRAY => {
            get_value(row, idx, json_array::<String>)
        }
        _ if <String as FromSql>::accepts(pg_type) => get_value(row, idx, Value::String),
        _ => get_value(row, idx, |v: Opaque| {
            Value::String(v.0.unwrap_or_else(|| format!("<{}>", pg_type.name())))
        }),
    }
}

fn column_infos(columns: &[tokio_postgres::Column]) -> Vec<ColumnInfo> {
    columns
        .iter()
        .map(|c| ColumnInfo::new(c.name(), c.type_().name()))
        .collect()
}

/// Prepare, bind and run `sql`, collecting every row and the affected count
async fn run_query(
    client: &tokio_postgres::Client,
    sql: &str,
    params: &[Value],
    statement_timeout: Duration,
) -> Result<ResultSet> {
    let stmt = client
        .prepare(sql)
        .await
        .map_err(|e| Error::from_pg(e, sql, statement_timeout))?;
    let bound = bind_params(stmt.params(), params)?;
    let param_refs: Vec<&(dyn ToSql + Sync)> = bound
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect();

    let stream = client
        .query_raw(&stmt, param_refs)
        .await
        .map_err(|e| Error::from_pg(e, sql, statement_timeout))?;
    pin_mut!(stream);

    let mut rows = Vec::new();
    while let Some(row) = stream
        .try_next()
        .await
        .map_err(|e| Error::from_pg(e, sql, statement_timeout))?
    {
        let values = row
            .columns()
            .iter()
            .enumerate()
            .map(|(i, col)| pg_value_to_value(&row, i, col.type_()))
            .collect();
        rows.push(values);
    }

    let affected = stream.rows_affected().unwrap_or(rows.len() as u64);
    Ok(ResultSet {
        columns: column_infos(stmt.columns()),
        rows,
        affected,
    })
}

async fn run_execute(
    client: &tokio_postgres::Client,
    sql: &str,
    params: &[Value],
    statement_timeout: Duration,
) -> Result<u64> {
    let stmt = client
        .prepare(sql)
        .await
        .map_err(|e| Error::from_pg(e, sql, statement_timeout))?;
    let bound = bind_params(stmt.params(), params)?;
    let param_refs: Vec<&(dyn ToSql + Sync)> = bound
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect();

    client
        .execute(&stmt, &param_refs)
        .await
        .map_err(|e| Error::from_pg(e, sql, statement_timeout))
}

fn transaction_error(e: tokio_postgres::Error) -> Error {
    Error::Transaction {
        message: e.to_string(),
        source: Some(Box::new(e)),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        self.ensure_open()?;
        run_query(&self.client, sql, params, Duration::ZERO).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        run_execute(&self.client, sql, params, Duration::ZERO).await
    }

    async fn begin(&self, mode: AccessMode) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;

        self.client
            .batch_execute(mode.begin_sql())
            .await
            .map_err(transaction_error)?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
            mode,
            statement_timeout_ms: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
    mode: AccessMode,
    statement_timeout_ms: AtomicU64,
    finished: AtomicBool,
}

impl PgTransaction {
    fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    fn mode(&self) -> AccessMode {
        self.mode
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        run_query(&self.client, sql, params, self.statement_timeout()).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.client, sql, params, self.statement_timeout()).await
    }

    async fn set_statement_timeout(&self, timeout: Duration) -> Result<()> {
        let setting = format!("{}ms", timeout.as_millis());
        self.client
            .query(
                "SELECT set_config('statement_timeout', $1, true)",
                &[&setting],
            )
            .await
            .map_err(transaction_error)?;
        self.statement_timeout_ms.store(
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finished.store(true, Ordering::Relaxed);
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(transaction_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finished.store(true, Ordering::Relaxed);
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(transaction_error)
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Relaxed) {
            debug!(mode = %self.mode, "transaction dropped without commit or rollback");
        }
    }
}

/// Build the tokio-postgres config and the TLS mode to connect with.
///
/// A connection string that asks for `sslmode=require` on a target without
/// its own TLS settings gets encryption without certificate verification,
/// matching libpq.
fn pg_config(config: &ConnectionConfig) -> Result<(tokio_postgres::Config, TlsMode)> {
    let mut pg = match &config.endpoint {
        Endpoint::Url(url) => url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::config(format!("invalid connection string: {e}")))?,
        Endpoint::Params {
            host,
            port,
            user,
            password,
            database,
        } => {
            let mut pg = tokio_postgres::Config::new();
            pg.host(host.as_str()).port(*port);
            if let Some(user) = user {
                pg.user(user.as_str());
            }
            if let Some(password) = password {
                pg.password(password.as_str());
            }
            if let Some(database) = database {
                pg.dbname(database.as_str());
            }
            pg
        }
    };

    pg.connect_timeout(config.connect_timeout);
    if pg.get_application_name().is_none() {
        if let Some(name) = &config.application_name {
            pg.application_name(name.as_str());
        }
    }

    let tls = match (&config.tls, pg.get_ssl_mode()) {
        (TlsMode::Disable, SslMode::Require) => TlsMode::Insecure,
        (TlsMode::Disable, _) => TlsMode::Disable,
        (mode, _) => {
            pg.ssl_mode(SslMode::Require);
            mode.clone()
        }
    };

    Ok((pg, tls))
}

async fn establish(pg: tokio_postgres::Config, tls: &TlsMode) -> Result<tokio_postgres::Client> {
    match make_tls_connector(tls)? {
        Some(connector) => {
            let (client, connection) = pg
                .connect(connector)
                .await
                .map_err(|e| Error::connection_with_source("failed to connect", e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "postgres connection error");
                }
            });
            Ok(client)
        }
        None => {
            let (client, connection) = pg
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(|e| Error::connection_with_source("failed to connect", e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "postgres connection error");
                }
            });
            Ok(client)
        }
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let (pg, tls) = pg_config(config)?;
        let timeout = config.connect_timeout;

        let client = tokio::time::timeout(timeout, establish(pg, &tls))
            .await
            .map_err(|_| Error::ConnectTimeout { timeout })??;

        debug!(endpoint = %config.endpoint.redacted(), tls = %tls, "postgres connection established");
        Ok(Box::new(PgConnection::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coerce_ok(value: Value, ty: &Type) -> bool {
        coerce_param(&value, ty, 1).is_ok()
    }

    #[test]
    fn test_coerce_numbers() {
        assert!(coerce_ok(Value::Int64(42), &Type::INT4));
        assert!(coerce_ok(Value::String("42".into()), &Type::INT8));
        assert!(coerce_ok(Value::Float64(3.0), &Type::INT2));
        assert!(!coerce_ok(Value::Int64(i64::from(i32::MAX) + 1), &Type::INT4));
        assert!(!coerce_ok(Value::Float64(1.5), &Type::INT4));
        assert!(coerce_ok(Value::Int64(1), &Type::FLOAT8));
        assert!(coerce_ok(Value::String("1.25".into()), &Type::NUMERIC));
    }

    #[test]
    fn test_coerce_text_and_bool() {
        assert!(coerce_ok(Value::Int64(7), &Type::TEXT));
        assert!(coerce_ok(Value::Bool(true), &Type::VARCHAR));
        assert!(coerce_ok(Value::String("true".into()), &Type::BOOL));
        assert!(!coerce_ok(Value::String("maybe".into()), &Type::BOOL));
    }

    #[test]
    fn test_coerce_temporal_and_uuid() {
        assert!(coerce_ok(Value::String("2024-03-01".into()), &Type::DATE));
        assert!(coerce_ok(
            Value::String("2024-03-01 12:30:00".into()),
            &Type::TIMESTAMP
        ));
        assert!(coerce_ok(
            Value::String("2024-03-01T12:30:00Z".into()),
            &Type::TIMESTAMPTZ
        ));
        assert!(coerce_ok(
            Value::String("67e55044-10b1-426f-9247-bb680e5fe0c8".into()),
            &Type::UUID
        ));
        assert!(!coerce_ok(Value::String("not-a-date".into()), &Type::DATE));
    }

    #[test]
    fn test_null_binds_to_any_type() {
        assert!(coerce_ok(Value::Null, &Type::INT4));
        assert!(coerce_ok(Value::Null, &Type::UUID));
        assert!(coerce_ok(Value::Null, &Type::POINT));
    }

    #[test]
    fn test_mismatch_names_position() {
        let err = coerce_param(&Value::String("abc".into()), &Type::INT4, 3).unwrap_err();
        assert!(err.to_string().contains("$3"));
        assert!(err.to_string().contains("int4"));
    }

    #[test]
    fn test_bind_params_count_mismatch() {
        let err = bind_params(&[Type::INT4], &[]).unwrap_err();
        assert!(err.to_string().contains("expects 1 parameter"));
    }

    #[test]
    fn test_json_param_from_text() {
        assert_eq!(
            to_json_param(&Value::String("{\"a\":1}".into())),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            to_json_param(&Value::String("plain".into())),
            serde_json::json!("plain")
        );
    }

    #[test]
    fn test_url_sslmode_require_upgrades_to_tls() {
        let config = ConnectionConfig::new("postgres://app@db/app?sslmode=require");
        let (_, tls) = pg_config(&config).unwrap();
        assert_eq!(tls, TlsMode::Insecure);

        let config = ConnectionConfig::new("postgres://app@db/app");
        let (_, tls) = pg_config(&config).unwrap();
        assert_eq!(tls, TlsMode::Disable);
    }

    #[test]
    fn test_structured_endpoint_config() {
        let config = ConnectionConfig::with_endpoint(Endpoint::Params {
            host: "db.internal".into(),
            port: 5433,
            user: Some("reader".into()),
            password: Some("secret".into()),
            database: Some("app".into()),
        })
        .with_tls(TlsMode::Insecure);

        let (pg, tls) = pg_config(&config).unwrap();
        assert_eq!(pg.get_ports(), &[5433]);
        assert_eq!(pg.get_user(), Some("reader"));
        assert_eq!(pg.get_dbname(), Some("app"));
        assert_eq!(pg.get_application_name(), Some("sqlgate"));
        assert_eq!(pg.get_ssl_mode(), SslMode::Require);
        assert_eq!(tls, TlsMode::Insecure);
    }

    #[test]
    fn test_invalid_connection_string() {
        let config = ConnectionConfig::new("postgres://db:notaport/app");
        assert!(pg_config(&config).is_err());
    }
}
