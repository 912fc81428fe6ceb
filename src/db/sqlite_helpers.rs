//! SQLite helper utilities for binding and decoding
//!
//! SQLite is dynamically typed: booleans live in INTEGER cells, an expression
//! column may hand back an INTEGER where a REAL was declared. Values are read by
//! their storage class and then coerced to the domain the port expects.

use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, TypeInfo, Value as _, ValueRef};

use crate::port::value::{Domain, Identity, Scalar};

pub type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

// ============================================================================
// Identifiers
// ============================================================================

/// Quote an identifier (`order` is a keyword, so everything gets quoted)
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Qualified column reference `alias."column"`
#[inline]
pub fn qualified(alias: &str, column: &str) -> String {
    format!("{}.{}", alias, quote_ident(column))
}

// ============================================================================
// Binding
// ============================================================================

/// Bind an optional scalar to a query (None binds NULL)
pub fn bind_scalar<'q>(query: SqliteQuery<'q>, value: Option<&Scalar>) -> SqliteQuery<'q> {
    match value {
        Some(Scalar::Text(s)) => query.bind(s.clone()),
        Some(Scalar::Integer(i)) => query.bind(*i),
        Some(Scalar::Float(f)) => query.bind(*f),
        Some(Scalar::Bool(b)) => query.bind(bool_to_int(*b)),
        None => query.bind(None::<String>),
    }
}

/// Convert bool to SQLite integer (0 or 1)
#[inline]
pub fn bool_to_int(b: bool) -> i32 {
    if b { 1 } else { 0 }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode column `index` of a row and coerce it to `domain`.
pub fn decode_column(
    row: &SqliteRow,
    index: usize,
    domain: &Domain,
) -> Result<Option<Scalar>, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(None);
    }
    let storage = raw.type_info().name().to_string();
    let value = ValueRef::to_owned(&raw);
    let scalar = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => Scalar::Integer(value.try_decode::<i64>()?),
        "REAL" => Scalar::Float(value.try_decode::<f64>()?),
        "TEXT" => Scalar::Text(value.try_decode::<String>()?),
        other => {
            return Err(sqlx::Error::Decode(
                format!("unsupported storage class {} in column {}", other, index).into(),
            ));
        }
    };
    Ok(Some(domain.coerce(scalar)))
}

// ============================================================================
// JSON array helpers (used for IN-lists of identities)
// ============================================================================

/// Serialize identities into a JSON array bound as a single parameter
pub fn identities_to_json(identities: &[Identity]) -> String {
    let values: Vec<serde_json::Value> = identities.iter().map(Identity::to_json).collect();
    serde_json::Value::Array(values).to_string()
}

/// Build a SQL fragment testing membership in a JSON array parameter
/// Usage: json_array_in_sql("t0.\"order_id\"", "?3")
pub fn json_array_in_sql(expr: &str, placeholder: &str) -> String {
    format!("{} IN (SELECT value FROM json_each({}))", expr, placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("order"), "\"order\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("t0", "id"), "t0.\"id\"");
    }

    #[test]
    fn test_identities_to_json() {
        let ids = vec![Identity::Integer(1), Identity::Text("a".into())];
        assert_eq!(identities_to_json(&ids), r#"[1,"a"]"#);
    }

    #[test]
    fn test_json_array_in_sql() {
        assert_eq!(
            json_array_in_sql("t0.\"id\"", "?1"),
            "t0.\"id\" IN (SELECT value FROM json_each(?1))"
        );
    }

    #[tokio::test]
    async fn test_decode_column_by_storage_class() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let row = sqlx::query("SELECT 1, 2, 2.5, 'x', NULL")
            .fetch_one(&pool)
            .await
            .unwrap();

        assert_eq!(decode_column(&row, 0, &Domain::Boolean).unwrap(), Some(Scalar::Bool(true)));
        assert_eq!(decode_column(&row, 1, &Domain::Float).unwrap(), Some(Scalar::Float(2.0)));
        assert_eq!(decode_column(&row, 2, &Domain::Float).unwrap(), Some(Scalar::Float(2.5)));
        assert_eq!(decode_column(&row, 3, &Domain::Text).unwrap(), Some(Scalar::Text("x".into())));
        assert_eq!(decode_column(&row, 4, &Domain::Integer).unwrap(), None);
    }

    #[test]
    fn test_bool_conversion() {
        assert_eq!(bool_to_int(true), 1);
        assert_eq!(bool_to_int(false), 0);
    }
}
