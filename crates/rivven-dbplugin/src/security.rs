//! Guards for names interpolated into generated SQL.
//!
//! The probe query and the table-existence check are built as strings, so
//! table and column names coming from configuration are validated before
//! they reach a driver, and literal values are escaped.

use crate::error::Error;

/// Validate a single SQL identifier (table, schema or column name).
///
/// - Must not be empty
/// - Maximum 255 characters
/// - Must start with ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters, underscores and `$`
///
/// # Examples
///
/// ```
/// use rivven_dbplugin::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("users").is_ok());
/// assert!(validate_sql_identifier("my_table_123").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("123abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 255 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max 255)",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    // `$` shows up in Oracle system and generated names
    if let Some(c) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '$')) {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Validate a possibly schema-qualified table name (`table` or `schema.table`).
///
/// ```
/// use rivven_dbplugin::security::validate_table_name;
///
/// assert!(validate_table_name("public.users").is_ok());
/// assert!(validate_table_name("users").is_ok());
/// assert!(validate_table_name("a.b.c").is_err());
/// ```
pub fn validate_table_name(name: &str) -> crate::Result<()> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(Error::config(format!(
            "Invalid table name '{}': expected 'table' or 'schema.table'",
            name
        )));
    }
    parts.into_iter().try_for_each(validate_sql_identifier)
}

/// Split a table name into optional schema and table parts.
pub fn split_table_name(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

/// Escape a string value for a single-quoted SQL literal.
///
/// ```
/// use rivven_dbplugin::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("users"), "users");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

/// Number of non-empty statements in a `;`-separated script.
///
/// Separators inside quoted strings or quoted identifiers do not count.
pub fn statement_count(sql: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<char> = None;
    let mut pending = false;
    for c in sql.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => {
                quote = Some(c);
                pending = true;
            }
            (None, ';') => {
                if pending {
                    count += 1;
                }
                pending = false;
            }
            (None, c) if !c.is_whitespace() => pending = true,
            _ => {}
        }
    }
    count + usize::from(pending)
}
