//! Security utilities for SQL identifiers.
//!
//! Catalog lookups bind schema and table names as parameters; these helpers
//! cover the places where a name has to appear in SQL text instead.

use crate::error::Error;

/// Validate a SQL identifier (schema, table names).
///
/// - Must not be empty
/// - Maximum 63 bytes (PostgreSQL's `NAMEDATALEN - 1`)
/// - Must not contain NUL
///
/// Anything else is legal once quoted with [`quote_identifier`].
///
/// # Examples
///
/// ```
/// use sqlgate_rdbc::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("users").is_ok());
/// assert!(validate_sql_identifier("Order Items").is_ok());
/// assert!(validate_sql_identifier("").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 63 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} bytes (max 63)",
            name.len()
        )));
    }

    if name.contains('\0') {
        return Err(Error::config("SQL identifier cannot contain NUL"));
    }

    Ok(())
}

/// Quote an identifier for PostgreSQL, doubling embedded double quotes.
///
/// # Examples
///
/// ```
/// use sqlgate_rdbc::security::quote_identifier;
///
/// assert_eq!(quote_identifier("users"), "\"users\"");
/// assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
/// ```
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified name (`schema.table`) part by part.
pub fn quote_qualified(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(name)),
        None => quote_identifier(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_limits() {
        assert!(validate_sql_identifier(&"a".repeat(63)).is_ok());
        assert!(validate_sql_identifier(&"a".repeat(64)).is_err());
        assert!(validate_sql_identifier("bad\0name").is_err());
    }

    #[test]
    fn test_quote_qualified() {
        assert_eq!(quote_qualified(Some("public"), "t"), "\"public\".\"t\"");
        assert_eq!(quote_qualified(None, "x; DROP"), "\"x; DROP\"");
    }
}
