//! SQL quoting helpers and statement classification.
//!
//! The wire driver exposes no escape call, so the MySQL string escaping
//! rules live here. Values pass through [`quote_value`] and friends before
//! being spliced into query text.

/// Value forms accepted by [`quote_value`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SqlParam<'a> {
    /// Renders as `NULL`.
    Null,
    /// Renders as `NOW()`.
    Now,
    Int(i64),
    /// Escaped and wrapped in single quotes.
    Text(&'a str),
}

/// Escapes a string for inclusion inside a quoted MySQL literal.
///
/// Handles NUL, newline, carriage return, backslash, both quote characters
/// and Ctrl-Z.
pub fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\u{1a}' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders a value as a MySQL literal.
pub fn quote_value(param: SqlParam<'_>) -> String {
    match param {
        SqlParam::Null => "NULL".to_string(),
        SqlParam::Now => "NOW()".to_string(),
        SqlParam::Int(n) => n.to_string(),
        SqlParam::Text(s) => format!("'{}'", escape_string(s)),
    }
}

/// Returns a comparison fragment usable after a field name.
///
/// `=` against a missing value becomes `IS NULL`, `!=` becomes
/// `IS NOT NULL`; anything else compares against the escaped literal.
pub fn quote_compare(op: &str, value: Option<&str>) -> String {
    match value {
        None if op == "=" => "IS NULL".to_string(),
        None if op == "!=" => "IS NOT NULL".to_string(),
        None => format!("{} NULL", op),
        Some(v) => format!("{} '{}'", op, escape_string(v)),
    }
}

/// Renders binary data as a MySQL hex literal (`X'AB12'`), or `NULL`.
pub fn quote_hex(value: Option<&[u8]>) -> String {
    match value {
        None => "NULL".to_string(),
        Some(bytes) => format!("X'{}'", hex::encode_upper(bytes)),
    }
}

/// Coarse statement classification. Gates the cache decorator: only
/// `Select` statements are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Modification,
    Other,
}

impl StatementKind {
    pub fn classify(sql: &str) -> Self {
        let head = sql.trim_start().to_uppercase();
        if head.starts_with("SELECT") {
            StatementKind::Select
        } else if head.starts_with("INSERT")
            || head.starts_with("UPDATE")
            || head.starts_with("DELETE")
            || head.starts_with("REPLACE")
        {
            StatementKind::Modification
        } else {
            StatementKind::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_plain_passthrough() {
        assert_eq!(escape_string("hello world"), "hello world");
    }

    #[test]
    fn test_escape_quotes_and_backslash() {
        assert_eq!(escape_string("it's"), "it\\'s");
        assert_eq!(escape_string(r#"say "hi""#), "say \\\"hi\\\"");
        assert_eq!(escape_string("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_escape_control_characters() {
        assert_eq!(escape_string("a\nb\rc"), "a\\nb\\rc");
        assert_eq!(escape_string("x\0y"), "x\\0y");
        assert_eq!(escape_string("z\u{1a}"), "z\\Z");
    }

    #[test]
    fn test_quote_value() {
        assert_eq!(quote_value(SqlParam::Null), "NULL");
        assert_eq!(quote_value(SqlParam::Now), "NOW()");
        assert_eq!(quote_value(SqlParam::Int(-42)), "-42");
        assert_eq!(quote_value(SqlParam::Text("o'brien")), "'o\\'brien'");
    }

    #[test]
    fn test_quote_compare_null_forms() {
        assert_eq!(quote_compare("=", None), "IS NULL");
        assert_eq!(quote_compare("!=", None), "IS NOT NULL");
        assert_eq!(quote_compare("<", Some("5")), "< '5'");
        assert_eq!(quote_compare("=", Some("a'b")), "= 'a\\'b'");
    }

    #[test]
    fn test_quote_hex() {
        assert_eq!(quote_hex(None), "NULL");
        assert_eq!(quote_hex(Some(&[0xab, 0x12])), "X'AB12'");
        assert_eq!(quote_hex(Some(&[])), "X''");
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            StatementKind::classify("  select * from t"),
            StatementKind::Select
        );
        assert_eq!(
            StatementKind::classify("INSERT INTO t VALUES (1)"),
            StatementKind::Modification
        );
        assert_eq!(
            StatementKind::classify("replace into t values (1)"),
            StatementKind::Modification
        );
        assert_eq!(
            StatementKind::classify("SHOW WARNINGS"),
            StatementKind::Other
        );
    }
}
