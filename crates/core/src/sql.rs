use thiserror::Error;

use crate::row_identity::RowIdentityPredicate;
use crate::value_codec::EncodedValue;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlBuildError {
    #[error("schema name cannot be empty")]
    EmptySchemaName,
    #[error("table name cannot be empty")]
    EmptyTableName,
    #[error("column name cannot be empty")]
    EmptyColumnName,
    #[error("update requires at least one assignment")]
    EmptyAssignments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub column: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableTarget<'a> {
    pub schema: &'a str,
    pub table: &'a str,
}

impl<'a> TableTarget<'a> {
    pub fn new(schema: &'a str, table: &'a str) -> Result<Self, SqlBuildError> {
        if schema.trim().is_empty() {
            return Err(SqlBuildError::EmptySchemaName);
        }
        if table.trim().is_empty() {
            return Err(SqlBuildError::EmptyTableName);
        }
        Ok(Self { schema, table })
    }
}

#[must_use]
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn quote_sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn qualified_table_sql(target: &TableTarget<'_>) -> String {
    format!("{}.{}", quote_ident(target.schema), quote_ident(target.table))
}

/// One page of rows for a table view, with the view's optional sort applied.
pub fn page_select_sql(
    target: &TableTarget<'_>,
    sort: Option<&SortSpec>,
    limit: usize,
    offset: usize,
) -> Result<String, SqlBuildError> {
    let order_clause = match sort {
        Some(sort) => {
            if sort.column.trim().is_empty() {
                return Err(SqlBuildError::EmptyColumnName);
            }
            format!(
                " ORDER BY {} {}",
                quote_ident(&sort.column),
                sort.direction.keyword()
            )
        }
        None => String::new(),
    };

    Ok(format!(
        "SELECT * FROM {}{} LIMIT {} OFFSET {}",
        qualified_table_sql(target),
        order_clause,
        limit,
        offset
    ))
}

pub fn update_row_sql(
    target: &TableTarget<'_>,
    assignments: &[(String, EncodedValue)],
    predicate: &RowIdentityPredicate,
) -> Result<String, SqlBuildError> {
    if assignments.is_empty() {
        return Err(SqlBuildError::EmptyAssignments);
    }

    let mut set_clauses = Vec::with_capacity(assignments.len());
    for (column, value) in assignments {
        if column.trim().is_empty() {
            return Err(SqlBuildError::EmptyColumnName);
        }
        set_clauses.push(format!(
            "{} = {}",
            quote_ident(column),
            value.as_assignment_sql()
        ));
    }

    Ok(format!(
        "UPDATE {} SET {} WHERE {}",
        qualified_table_sql(target),
        set_clauses.join(", "),
        predicate.to_sql()
    ))
}

#[must_use]
pub fn delete_row_sql(target: &TableTarget<'_>, predicate: &RowIdentityPredicate) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        qualified_table_sql(target),
        predicate.to_sql()
    )
}

/// Cheap total-row estimate from the catalog instead of a full COUNT(*).
#[must_use]
pub fn row_estimate_sql(target: &TableTarget<'_>) -> String {
    format!(
        "SELECT COALESCE(c.reltuples::bigint, 0) AS estimated_rows \
         FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE n.nspname = {} AND c.relname = {}",
        quote_sql_string(target.schema),
        quote_sql_string(target.table)
    )
}

#[must_use]
pub fn drop_table_sql(target: &TableTarget<'_>) -> String {
    format!("DROP TABLE {}", qualified_table_sql(target))
}
