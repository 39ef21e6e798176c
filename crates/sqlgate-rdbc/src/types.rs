//! Value types for sqlgate-rdbc
//!
//! A compact value model covering what PostgreSQL result sets and caller
//! parameters need:
//! - Primitive types (bool, integers, floats, decimal)
//! - Text and binary data
//! - Date/time types with timezone support
//! - UUID and JSON

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// SQL value type that can hold any supported database value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 32-bit floating point (REAL)
    Float32(f32),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT, CHAR, NAME)
    String(String),
    /// Binary data (BYTEA)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// JSON value (JSON, JSONB)
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int16(_) => "SMALLINT",
            Self::Int32(_) => "INTEGER",
            Self::Int64(_) => "BIGINT",
            Self::Float32(_) => "REAL",
            Self::Float64(_) => "DOUBLE PRECISION",
            Self::Decimal(_) => "NUMERIC",
            Self::String(_) => "TEXT",
            Self::Bytes(_) => "BYTEA",
            Self::Date(_) => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime(_) => "TIMESTAMP",
            Self::DateTimeTz(_) => "TIMESTAMPTZ",
            Self::Uuid(_) => "UUID",
            Self::Json(_) => "JSONB",
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Float32(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            Self::Float64(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float32(n) => Some(f64::from(*n)),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Convert to owned string representation
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Int16(n) => Some(n.to_string()),
            Self::Int32(n) => Some(n.to_string()),
            Self::Int64(n) => Some(n.to_string()),
            Self::Float32(n) => Some(n.to_string()),
            Self::Float64(n) => Some(n.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Uuid(u) => Some(u.to_string()),
            Self::Date(d) => Some(d.to_string()),
            Self::Time(t) => Some(t.to_string()),
            Self::DateTime(dt) => Some(dt.to_string()),
            Self::DateTimeTz(dt) => Some(dt.to_rfc3339()),
            Self::Json(j) => Some(j.to_string()),
            Self::Null | Self::Bytes(_) => None,
        }
    }

    /// Build a parameter value from a caller-supplied JSON scalar.
    ///
    /// Integers stay integral, other numbers become `Float64`; arrays and
    /// objects are passed through as JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int64(i),
                None => n.as_f64().map(Self::Float64).unwrap_or(Self::Null),
            },
            serde_json::Value::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    /// Render the value for a JSON result payload.
    ///
    /// NUMERIC is rendered as a string to keep its precision; BYTEA as a
    /// `\x`-prefixed hex string, the way psql prints it.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int16(n) => Json::from(*n),
            Self::Int32(n) => Json::from(*n),
            Self::Int64(n) => Json::from(*n),
            Self::Float32(n) => serde_json::Number::from_f64(f64::from(*n))
                .map(Json::Number)
                .unwrap_or_else(|| Json::String(n.to_string())),
            Self::Float64(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or_else(|| Json::String(n.to_string())),
            Self::Decimal(d) => Json::String(d.to_string()),
            Self::String(s) => Json::String(s.clone()),
            Self::Bytes(b) => {
                let mut hex = String::with_capacity(2 + b.len() * 2);
                hex.push_str("\\x");
                for byte in b {
                    hex.push_str(&format!("{byte:02x}"));
                }
                Json::String(hex)
            }
            Self::Date(d) => Json::String(d.to_string()),
            Self::Time(t) => Json::String(t.to_string()),
            Self::DateTime(dt) => Json::String(dt.to_string()),
            Self::DateTimeTz(dt) => Json::String(dt.to_rfc3339()),
            Self::Uuid(u) => Json::String(u.to_string()),
            Self::Json(j) => j.clone(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Name and server type of one result column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name as reported by the server
    pub name: String,
    /// Server type name (e.g. `int4`, `text`)
    pub type_name: String,
}

impl ColumnInfo {
    /// Create column info
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Rows returned by one statement, with column metadata that is present
/// even when no rows came back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Result columns in order
    pub columns: Vec<ColumnInfo>,
    /// Rows, each with one value per column
    pub rows: Vec<Vec<Value>>,
    /// Affected row count reported by the server (equals `rows.len()` for queries)
    pub affected: u64,
}

impl ResultSet {
    /// Create a result set from columns and rows
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<Value>>) -> Self {
        let affected = rows.len() as u64;
        Self {
            columns,
            rows,
            affected,
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows were returned
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Position of a column by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Value at `row` for column `name`
    pub fn get(&self, row: usize, name: &str) -> Option<&Value> {
        let idx = self.column_index(name)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_keeps_integers_integral() {
        assert_eq!(Value::from_json(&json!(42)), Value::Int64(42));
        assert_eq!(Value::from_json(&json!(1.5)), Value::Float64(1.5));
        assert_eq!(Value::from_json(&json!(null)), Value::Null);
        assert_eq!(Value::from_json(&json!("x")), Value::String("x".into()));
        assert_eq!(Value::from_json(&json!(true)), Value::Bool(true));
        assert_eq!(
            Value::from_json(&json!({"a": 1})),
            Value::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_to_json_rendering() {
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_json(), json!("\\xdead"));
        assert_eq!(
            Value::Decimal(Decimal::new(12345, 2)).to_json(),
            json!("123.45")
        );
        assert_eq!(Value::Float64(f64::NAN).to_json(), json!("NaN"));
        assert_eq!(Value::Int32(7).to_json(), json!(7));
    }

    #[test]
    fn test_as_i64_rejects_fractional_floats() {
        assert_eq!(Value::Float64(3.0).as_i64(), Some(3));
        assert_eq!(Value::Float64(3.5).as_i64(), None);
        assert_eq!(Value::String(" 12 ".into()).as_i64(), Some(12));
    }

    #[test]
    fn test_result_set_lookup() {
        let rs = ResultSet::new(
            vec![ColumnInfo::new("id", "int4"), ColumnInfo::new("name", "text")],
            vec![vec![Value::Int32(1), Value::from("alice")]],
        );

        assert_eq!(rs.len(), 1);
        assert_eq!(rs.affected, 1);
        assert_eq!(rs.column_names(), vec!["id", "name"]);
        assert_eq!(rs.get(0, "name").and_then(Value::as_str), Some("alice"));
        assert!(rs.get(0, "missing").is_none());
        assert!(rs.get(3, "id").is_none());
    }
}
