//! Tests for the statement classifier against realistic query text

use sqlgate_rdbc::classifier::{classify, is_single_statement, StatementShape};

#[test]
fn test_edge_cases() {
    assert!(is_single_statement(""));
    assert!(is_single_statement(";"));
    assert!(is_single_statement("  "));
    assert!(!is_single_statement(";;"));
    assert!(!is_single_statement("; ;"));
}

#[test]
fn test_text_without_boundaries_is_single() {
    let queries = [
        "SELECT * FROM users",
        "SELECT count(*) FROM orders WHERE status = $1",
        "WITH recent AS (SELECT * FROM events WHERE ts > now() - interval '1 day') SELECT * FROM recent",
        "EXPLAIN SELECT 1",
        "UPDATE t SET x = 1",
        "select\n  a,\n  b\nfrom\n  t\n",
    ];
    for sql in queries {
        assert!(is_single_statement(sql), "{sql}");
    }
}

#[test]
fn test_trailing_boundary_with_whitespace_is_single() {
    for sql in ["SELECT 1;", "SELECT 1;   ", "SELECT 1;\n\n", "SELECT 1;\t\r\n"] {
        assert!(is_single_statement(sql), "{sql:?}");
    }
}

#[test]
fn test_stacked_statements_are_rejected() {
    let payloads = [
        "SELECT 1; DROP TABLE users",
        "SELECT 'x'; DROP TABLE users",
        "SELECT 1; SELECT 2",
        "SELECT 1;DELETE FROM t",
        "SELECT \"a\"; COMMIT",
        "SELECT 1 /* c */; ROLLBACK; UPDATE t SET x = 1",
        "SELECT $$body$$; SET TRANSACTION READ WRITE",
    ];
    for sql in payloads {
        assert!(!is_single_statement(sql), "{sql}");
    }
}

#[test]
fn test_boundaries_in_non_executable_contexts() {
    let queries = [
        "SELECT 'a;b' AS semi",
        "SELECT 'it''s; fine'",
        "SELECT \"col;name\" FROM t",
        "SELECT 1 -- ; DROP TABLE t",
        "SELECT 1 /* ; DROP TABLE t */",
        "SELECT 1 /* ; DROP TABLE t",
        "SELECT $$ ; $$",
        "SELECT $tag$ ; $tag$",
        "SELECT $tag$ ; DROP TABLE t",
        "DO $do$ BEGIN PERFORM 1; PERFORM 2; END $do$",
    ];
    for sql in queries {
        assert!(is_single_statement(sql), "{sql}");
    }
}

#[test]
fn test_function_body_with_inner_statements() {
    let sql = "CREATE FUNCTION f() RETURNS int AS $$\n  SELECT 1;\n  SELECT 2;\n$$ LANGUAGE sql;";
    assert!(is_single_statement(sql));
}

#[test]
fn test_boundary_offset_is_reported() {
    assert_eq!(classify("SELECT 1"), StatementShape::Single);
    assert_eq!(
        classify("SELECT ';'; x"),
        StatementShape::Multiple { boundary: 10 }
    );
}

#[test]
fn test_escape_string_literals() {
    // E'...' honors backslash escapes, so \' does not close the literal
    assert!(is_single_statement(r"SELECT E'it\'s; fine'"));
    assert!(is_single_statement(r"SELECT e'a\\b'"));
    assert!(!is_single_statement(r"SELECT E'a\\'; DROP TABLE t"));
    assert!(!is_single_statement(r"SELECT E'\''; DROP TABLE t; --'"));

    // a plain literal treats backslash as an ordinary character
    assert_eq!(
        classify(r"SELECT 'a\'; DROP TABLE t"),
        StatementShape::Multiple { boundary: 11 }
    );

    // a trailing E on an identifier is not a prefix
    assert!(!is_single_statement(r"SELECT name'\'; DROP TABLE t"));
}
