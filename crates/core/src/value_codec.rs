use serde_json::Value;

/// A column value encoded for use inside a generated SQL statement.
///
/// NULL is kept distinct from any literal token because it can never be
/// compared with `=`; predicate builders turn it into `IS NULL` and SET
/// clauses render it as the bare `NULL` keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedValue {
    Null,
    Literal(String),
}

impl EncodedValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Rendering for SET clauses, where NULL is a valid right-hand side.
    #[must_use]
    pub fn as_assignment_sql(&self) -> &str {
        match self {
            Self::Null => "NULL",
            Self::Literal(literal) => literal,
        }
    }
}

#[must_use]
pub fn encode(value: &Value) -> EncodedValue {
    match value {
        Value::Null => EncodedValue::Null,
        Value::Bool(true) => EncodedValue::Literal("TRUE".to_string()),
        Value::Bool(false) => EncodedValue::Literal("FALSE".to_string()),
        Value::Number(number) => EncodedValue::Literal(number.to_string()),
        Value::String(text) => EncodedValue::Literal(quote_text(text)),
        structured @ (Value::Array(_) | Value::Object(_)) => {
            EncodedValue::Literal(quote_text(&canonical_text(structured)))
        }
    }
}

/// Value equality as the edit buffer sees it: NULL matches NULL, everything
/// else compares structurally.
#[must_use]
pub fn values_equal(left: &Value, right: &Value) -> bool {
    left == right
}

#[must_use]
pub fn quote_text(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Canonical compact text form for structured (json/jsonb/array) values.
#[must_use]
pub fn canonical_text(value: &Value) -> String {
    value.to_string()
}

/// Human-readable cell rendering for result grids and log lines.
#[must_use]
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        structured @ (Value::Array(_) | Value::Object(_)) => canonical_text(structured),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{display_value, encode, values_equal, EncodedValue};

    #[test]
    fn null_encodes_as_null_not_a_literal() {
        assert_eq!(encode(&json!(null)), EncodedValue::Null);
        assert!(encode(&json!(null)).is_null());
        assert_eq!(encode(&json!(null)).as_assignment_sql(), "NULL");
    }

    #[test]
    fn numbers_and_booleans_encode_as_bare_tokens() {
        assert_eq!(encode(&json!(42)), EncodedValue::Literal("42".to_string()));
        assert_eq!(
            encode(&json!(-3.5)),
            EncodedValue::Literal("-3.5".to_string())
        );
        assert_eq!(
            encode(&json!(true)),
            EncodedValue::Literal("TRUE".to_string())
        );
        assert_eq!(
            encode(&json!(false)),
            EncodedValue::Literal("FALSE".to_string())
        );
    }

    #[test]
    fn text_is_single_quote_escaped() {
        assert_eq!(
            encode(&json!("ann's")),
            EncodedValue::Literal("'ann''s'".to_string())
        );
    }

    #[test]
    fn structured_values_encode_as_canonical_quoted_json() {
        assert_eq!(
            encode(&json!({"a": 1})),
            EncodedValue::Literal("'{\"a\":1}'".to_string())
        );
        assert_eq!(
            encode(&json!([1, "x'y"])),
            EncodedValue::Literal("'[1,\"x''y\"]'".to_string())
        );
    }

    #[test]
    fn value_equality_matches_null_with_null() {
        assert!(values_equal(&json!(null), &json!(null)));
        assert!(values_equal(&json!("a"), &json!("a")));
        assert!(!values_equal(&json!(null), &json!("a")));
        assert!(!values_equal(&json!(1), &json!("1")));
    }

    #[test]
    fn display_renders_cells_human_readable() {
        assert_eq!(display_value(&json!(null)), "NULL");
        assert_eq!(display_value(&json!("plain")), "plain");
        assert_eq!(display_value(&json!(7)), "7");
        assert_eq!(display_value(&json!({"k": true})), "{\"k\":true}");
    }
}
