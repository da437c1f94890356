use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::session::ConnectionId;
use crate::table_view::ColumnDef;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct QueryError {
    message: String,
}

impl QueryError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub timing: Duration,
}

impl QueryOutcome {
    /// Convenience for single-cell results such as row-count estimates.
    #[must_use]
    pub fn scalar_i64(&self) -> Option<i64> {
        self.rows.first().and_then(|row| row.first()).and_then(Value::as_i64)
    }
}

/// Executes SQL against one live connection. Both paged table reads and
/// buffered-edit mutations flow through this single seam.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        connection: &ConnectionId,
        sql: &str,
    ) -> Result<QueryOutcome, QueryError>;
}
