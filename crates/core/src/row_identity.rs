use serde_json::Value;
use thiserror::Error;

use crate::sql::quote_ident;
use crate::table_view::ColumnDef;
use crate::value_codec::{encode, EncodedValue};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("row cannot be identified: no primary key and no non-null columns to match")]
pub struct AmbiguousRowError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonKind {
    Equals(String),
    IsNull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateClause {
    pub column: String,
    pub kind: ComparisonKind,
}

/// How trustworthy the derived predicate is. Anything below `PrimaryKey`
/// cannot guarantee it targets a single row, and mutation call sites must
/// treat it accordingly instead of silently trusting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PredicateConfidence {
    /// Built from the full declared primary key.
    PrimaryKey,
    /// A declared primary-key column was missing from the snapshot and its
    /// clause was skipped.
    PrimaryKeyPartial,
    /// No primary key; matched on every non-null column of the snapshot row.
    AllColumns,
}

impl PredicateConfidence {
    #[must_use]
    pub fn is_exact(self) -> bool {
        matches!(self, Self::PrimaryKey)
    }
}

/// The WHERE-equivalent condition that targets exactly one snapshot row for
/// UPDATE or DELETE. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIdentityPredicate {
    clauses: Vec<PredicateClause>,
    confidence: PredicateConfidence,
}

impl RowIdentityPredicate {
    /// Derives the predicate from the point-in-time snapshot row.
    ///
    /// With known primary-key columns every one of them contributes a clause;
    /// a NULL primary-key value still participates as `IS NULL`. Without a
    /// primary key the fallback matches all non-null columns and excludes
    /// NULLs entirely. An empty clause set is rejected before any statement
    /// can be built from it.
    pub fn for_row(
        columns: &[ColumnDef],
        row: &[Value],
        primary_key: Option<&[String]>,
    ) -> Result<Self, AmbiguousRowError> {
        match primary_key {
            Some(key_columns) if !key_columns.is_empty() => {
                Self::from_primary_key(columns, row, key_columns)
            }
            _ => Self::from_all_columns(columns, row),
        }
    }

    fn from_primary_key(
        columns: &[ColumnDef],
        row: &[Value],
        key_columns: &[String],
    ) -> Result<Self, AmbiguousRowError> {
        let mut clauses = Vec::with_capacity(key_columns.len());
        let mut skipped_key_column = false;

        for key_column in key_columns {
            let Some(index) = columns
                .iter()
                .position(|column| &column.name == key_column)
            else {
                skipped_key_column = true;
                continue;
            };
            let value = row.get(index).unwrap_or(&Value::Null);
            clauses.push(clause_for(key_column, value));
        }

        if clauses.is_empty() {
            return Err(AmbiguousRowError);
        }

        let confidence = if skipped_key_column {
            PredicateConfidence::PrimaryKeyPartial
        } else {
            PredicateConfidence::PrimaryKey
        };
        Ok(Self { clauses, confidence })
    }

    fn from_all_columns(columns: &[ColumnDef], row: &[Value]) -> Result<Self, AmbiguousRowError> {
        let clauses = columns
            .iter()
            .zip(row.iter())
            .filter(|(_, value)| !value.is_null())
            .map(|(column, value)| clause_for(&column.name, value))
            .collect::<Vec<_>>();

        if clauses.is_empty() {
            return Err(AmbiguousRowError);
        }
        Ok(Self {
            clauses,
            confidence: PredicateConfidence::AllColumns,
        })
    }

    #[must_use]
    pub fn clauses(&self) -> &[PredicateClause] {
        &self.clauses
    }

    #[must_use]
    pub fn confidence(&self) -> PredicateConfidence {
        self.confidence
    }

    #[must_use]
    pub fn to_sql(&self) -> String {
        self.clauses
            .iter()
            .map(|clause| match &clause.kind {
                ComparisonKind::Equals(literal) => {
                    format!("{} = {}", quote_ident(&clause.column), literal)
                }
                ComparisonKind::IsNull => format!("{} IS NULL", quote_ident(&clause.column)),
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

fn clause_for(column: &str, value: &Value) -> PredicateClause {
    let kind = match encode(value) {
        EncodedValue::Null => ComparisonKind::IsNull,
        EncodedValue::Literal(literal) => ComparisonKind::Equals(literal),
    };
    PredicateClause {
        column: column.to_string(),
        kind,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AmbiguousRowError, PredicateConfidence, RowIdentityPredicate};
    use crate::table_view::ColumnDef;

    fn columns(names: &[&str]) -> Vec<ColumnDef> {
        names
            .iter()
            .map(|name| ColumnDef {
                name: (*name).to_string(),
                data_type: "text".to_string(),
            })
            .collect()
    }

    #[test]
    fn primary_key_predicate_uses_only_key_columns() {
        let cols = columns(&["id", "name", "email"]);
        let row = vec![json!(42), json!("Ann"), json!(null)];
        let pk = vec!["id".to_string()];

        let predicate = RowIdentityPredicate::for_row(&cols, &row, Some(&pk))
            .expect("primary key row should be identifiable");

        assert_eq!(predicate.to_sql(), "\"id\" = 42");
        assert_eq!(predicate.confidence(), PredicateConfidence::PrimaryKey);
    }

    #[test]
    fn null_primary_key_value_becomes_is_null_clause() {
        let cols = columns(&["id", "note"]);
        let row = vec![json!(null), json!("x")];
        let pk = vec!["id".to_string()];

        let predicate = RowIdentityPredicate::for_row(&cols, &row, Some(&pk))
            .expect("null pk value should still build a predicate");

        assert_eq!(predicate.to_sql(), "\"id\" IS NULL");
        assert_eq!(predicate.confidence(), PredicateConfidence::PrimaryKey);
    }

    #[test]
    fn missing_primary_key_column_is_skipped_and_flagged_degraded() {
        let cols = columns(&["name", "tenant_id"]);
        let row = vec![json!("Ann"), json!(7)];
        let pk = vec!["id".to_string(), "tenant_id".to_string()];

        let predicate = RowIdentityPredicate::for_row(&cols, &row, Some(&pk))
            .expect("partial pk should still build a predicate");

        assert_eq!(predicate.to_sql(), "\"tenant_id\" = 7");
        assert_eq!(
            predicate.confidence(),
            PredicateConfidence::PrimaryKeyPartial
        );
        assert!(!predicate.confidence().is_exact());
    }

    #[test]
    fn fallback_predicate_excludes_null_columns() {
        let cols = columns(&["created_at", "note"]);
        let row = vec![json!("2024-01-01"), json!(null)];

        let predicate = RowIdentityPredicate::for_row(&cols, &row, None)
            .expect("non-null column should identify row");

        assert_eq!(predicate.to_sql(), "\"created_at\" = '2024-01-01'");
        assert_eq!(predicate.confidence(), PredicateConfidence::AllColumns);
    }

    #[test]
    fn all_null_row_without_primary_key_is_rejected() {
        let cols = columns(&["a", "b"]);
        let row = vec![json!(null), json!(null)];

        let err = RowIdentityPredicate::for_row(&cols, &row, None)
            .expect_err("all-null row must not be identifiable");
        assert_eq!(err, AmbiguousRowError);
    }

    #[test]
    fn fallback_joins_multiple_clauses_with_and() {
        let cols = columns(&["a", "b", "c"]);
        let row = vec![json!(1), json!(null), json!("z")];

        let predicate = RowIdentityPredicate::for_row(&cols, &row, None).expect("identifiable");
        assert_eq!(predicate.to_sql(), "\"a\" = 1 AND \"c\" = 'z'");
        assert_eq!(predicate.clauses().len(), 2);
    }
}
