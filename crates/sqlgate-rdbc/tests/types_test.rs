//! Tests for sqlgate-rdbc value types

use rust_decimal::Decimal;
use serde_json::json;
use sqlgate_rdbc::prelude::*;
use std::str::FromStr;

#[test]
fn test_json_rendering_of_result_values() {
    assert_eq!(Value::Null.to_json(), json!(null));
    assert_eq!(Value::Int32(7).to_json(), json!(7));
    assert_eq!(Value::Bool(false).to_json(), json!(false));
    assert_eq!(
        Value::Decimal(Decimal::from_str("12.50").unwrap()).to_json(),
        json!("12.50")
    );
    assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_json(), json!("\\xdead"));
    assert_eq!(Value::Float64(f64::NAN).to_json(), json!("NaN"));
    assert_eq!(Value::Json(json!({"a": [1, 2]})).to_json(), json!({"a": [1, 2]}));
}

#[test]
fn test_parameters_from_json() {
    let params: Vec<Value> = [json!("abc"), json!(3), json!(2.5), json!(true), json!(null)]
        .iter()
        .map(Value::from_json)
        .collect();

    assert_eq!(
        params,
        vec![
            Value::String("abc".into()),
            Value::Int64(3),
            Value::Float64(2.5),
            Value::Bool(true),
            Value::Null,
        ]
    );
}

#[test]
fn test_result_set_lookup() {
    let rs = ResultSet::new(
        vec![ColumnInfo::new("id", "int4"), ColumnInfo::new("name", "text")],
        vec![
            vec![Value::Int32(1), Value::from("alice")],
            vec![Value::Int32(2), Value::from("bob")],
        ],
    );

    assert_eq!(rs.len(), 2);
    assert_eq!(rs.affected, 2);
    assert_eq!(rs.column_names(), vec!["id", "name"]);
    assert_eq!(rs.get(1, "name").and_then(Value::as_str), Some("bob"));
    assert_eq!(rs.get(0, "missing"), None);
    assert_eq!(rs.get(5, "id"), None);
}

#[test]
fn test_value_conversions() {
    assert_eq!(Value::String("42".into()).as_i64(), Some(42));
    assert_eq!(Value::Float64(2.0).as_i64(), Some(2));
    assert_eq!(Value::Float64(2.5).as_i64(), None);
    assert_eq!(Value::String("yes".into()).as_bool(), Some(true));
    assert_eq!(Value::from(Option::<i64>::None), Value::Null);
}
