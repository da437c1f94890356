use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::row_identity::{AmbiguousRowError, PredicateConfidence, RowIdentityPredicate};
use crate::sql::{self, SqlBuildError, TableTarget};
use crate::table_view::{TableLocation, TableSnapshot};
use crate::value_codec::{encode, values_equal};

/// Pending cell edits keyed by `(row, column)` within one snapshot. Nothing
/// here touches the server; statements are produced by the planners below
/// and dispatched by the caller.
#[derive(Debug, Default)]
pub struct EditBuffer {
    cells: BTreeMap<(usize, usize), Value>,
}

impl EditBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an edit, or removes the pending entry when the new value
    /// equals the snapshot original again (a NULL written over a NULL is a
    /// no-op too).
    pub fn set_cell(&mut self, row: usize, column: usize, original: &Value, new_value: Value) {
        if values_equal(original, &new_value) {
            self.cells.remove(&(row, column));
        } else {
            self.cells.insert((row, column), new_value);
        }
    }

    #[must_use]
    pub fn cell(&self, row: usize, column: usize) -> Option<&Value> {
        self.cells.get(&(row, column))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn discard(&mut self) {
        self.cells.clear();
    }

    /// Edits grouped by row, each row's entries ordered by column index.
    #[must_use]
    pub fn pending_by_row(&self) -> BTreeMap<usize, Vec<(usize, &Value)>> {
        let mut by_row: BTreeMap<usize, Vec<(usize, &Value)>> = BTreeMap::new();
        for (&(row, column), value) in &self.cells {
            by_row.entry(row).or_default().push((column, value));
        }
        by_row
    }

    /// Drops every pending entry for `row`. Used after that row's statement
    /// has been applied server-side.
    pub fn clear_row(&mut self, row: usize) {
        self.cells.retain(|&(r, _), _| r != row);
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("row {row} is outside the current snapshot")]
    RowOutOfRange { row: usize },
    #[error("column {column} is outside the current snapshot")]
    ColumnOutOfRange { column: usize },
    #[error("row {row} cannot be safely targeted: {source}")]
    Ambiguous {
        row: usize,
        #[source]
        source: AmbiguousRowError,
    },
    #[error(transparent)]
    Sql(#[from] SqlBuildError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStatement {
    pub row: usize,
    pub sql: String,
    pub confidence: PredicateConfidence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationPlan {
    statements: Vec<PlannedStatement>,
}

impl MutationPlan {
    #[must_use]
    pub fn statements(&self) -> &[PlannedStatement] {
        &self.statements
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// The least trustworthy predicate in the plan; what a confirmation
    /// policy should judge the whole plan by.
    #[must_use]
    pub fn worst_confidence(&self) -> Option<PredicateConfidence> {
        self.statements
            .iter()
            .map(|statement| statement.confidence)
            .max()
    }
}

/// One UPDATE per dirty row: the predicate comes from the *original*
/// snapshot values, the SET clause from exactly the edited columns. Any row
/// that cannot be identified rejects the whole plan before dispatch.
pub fn plan_commit(
    location: &TableLocation,
    snapshot: &TableSnapshot,
    primary_key: Option<&[String]>,
    buffer: &EditBuffer,
) -> Result<MutationPlan, PlanError> {
    let target = TableTarget::new(&location.schema, &location.table)?;
    let mut statements = Vec::new();

    for (row, edits) in buffer.pending_by_row() {
        let original_row = snapshot
            .rows
            .get(row)
            .ok_or(PlanError::RowOutOfRange { row })?;

        let predicate =
            RowIdentityPredicate::for_row(&snapshot.columns, original_row, primary_key)
                .map_err(|source| PlanError::Ambiguous { row, source })?;

        let mut assignments = Vec::with_capacity(edits.len());
        for (column, new_value) in edits {
            let column_def = snapshot
                .columns
                .get(column)
                .ok_or(PlanError::ColumnOutOfRange { column })?;
            assignments.push((column_def.name.clone(), encode(new_value)));
        }

        let sql = sql::update_row_sql(&target, &assignments, &predicate)?;
        statements.push(PlannedStatement {
            row,
            sql,
            confidence: predicate.confidence(),
        });
    }

    Ok(MutationPlan { statements })
}

/// A single-row DELETE under the same identity rules as commits.
pub fn plan_delete(
    location: &TableLocation,
    snapshot: &TableSnapshot,
    primary_key: Option<&[String]>,
    row: usize,
) -> Result<PlannedStatement, PlanError> {
    let target = TableTarget::new(&location.schema, &location.table)?;
    let original_row = snapshot
        .rows
        .get(row)
        .ok_or(PlanError::RowOutOfRange { row })?;

    let predicate = RowIdentityPredicate::for_row(&snapshot.columns, original_row, primary_key)
        .map_err(|source| PlanError::Ambiguous { row, source })?;

    Ok(PlannedStatement {
        row,
        sql: sql::delete_row_sql(&target, &predicate),
        confidence: predicate.confidence(),
    })
}
