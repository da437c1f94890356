use serde_json::Value;

use crate::edit_buffer::EditBuffer;
use crate::session::ConnectionId;
use crate::sql::SortSpec;

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpec {
    pub limit: usize,
    pub offset: usize,
}

impl Default for PageSpec {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

/// Fully qualifies the table a view is looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLocation {
    pub connection: ConnectionId,
    pub database: String,
    pub schema: String,
    pub table: String,
}

/// One immutable page of rows as the server returned it. Row indices in the
/// edit buffer are only meaningful against the snapshot they were taken from.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
    pub total_estimate: Option<i64>,
    pub page: PageSpec,
    pub sort: Option<SortSpec>,
}

/// Fetch token handed out by `begin_fetch`; only a snapshot carrying the
/// view's latest epoch may land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Epoch(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// A newer fetch superseded this one; the result was discarded.
    Stale,
}

#[derive(Debug)]
pub struct TableView {
    location: TableLocation,
    primary_key: Option<Vec<String>>,
    epoch: u64,
    snapshot: Option<TableSnapshot>,
    edits: EditBuffer,
}

impl TableView {
    #[must_use]
    pub fn new(location: TableLocation, primary_key: Option<Vec<String>>) -> Self {
        Self {
            location,
            primary_key,
            epoch: 0,
            snapshot: None,
            edits: EditBuffer::new(),
        }
    }

    #[must_use]
    pub fn location(&self) -> &TableLocation {
        &self.location
    }

    #[must_use]
    pub fn primary_key(&self) -> Option<&[String]> {
        self.primary_key.as_deref()
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<&TableSnapshot> {
        self.snapshot.as_ref()
    }

    #[must_use]
    pub fn edits(&self) -> &EditBuffer {
        &self.edits
    }

    #[must_use]
    pub fn edits_mut(&mut self) -> &mut EditBuffer {
        &mut self.edits
    }

    /// Starts a new fetch generation. Any snapshot applied with an older
    /// epoch is rejected as stale.
    pub fn begin_fetch(&mut self) -> Epoch {
        self.epoch += 1;
        Epoch(self.epoch)
    }

    /// Installs a fetched page if it still belongs to the latest fetch.
    /// An accepted snapshot discards pending edits: their row indices were
    /// scoped to the snapshot that just got replaced.
    pub fn apply_snapshot(&mut self, epoch: Epoch, snapshot: TableSnapshot) -> ApplyOutcome {
        if epoch.0 != self.epoch {
            return ApplyOutcome::Stale;
        }
        self.snapshot = Some(snapshot);
        self.edits.discard();
        ApplyOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ApplyOutcome, ColumnDef, PageSpec, TableLocation, TableSnapshot, TableView};
    use crate::session::ConnectionId;

    fn orders_location() -> TableLocation {
        TableLocation {
            connection: ConnectionId::from("conn-a"),
            database: "sales".to_string(),
            schema: "public".to_string(),
            table: "orders".to_string(),
        }
    }

    fn snapshot_with_rows(rows: Vec<Vec<serde_json::Value>>) -> TableSnapshot {
        TableSnapshot {
            columns: vec![
                ColumnDef {
                    name: "id".to_string(),
                    data_type: "bigint".to_string(),
                },
                ColumnDef {
                    name: "email".to_string(),
                    data_type: "text".to_string(),
                },
            ],
            rows,
            total_estimate: Some(1280),
            page: PageSpec::default(),
            sort: None,
        }
    }

    #[test]
    fn snapshot_with_current_epoch_is_applied() {
        let mut view = TableView::new(orders_location(), Some(vec!["id".to_string()]));
        let epoch = view.begin_fetch();

        let outcome = view.apply_snapshot(epoch, snapshot_with_rows(vec![vec![json!(1), json!("a@x")]]));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(view.snapshot().map(|s| s.rows.len()), Some(1));
    }

    #[test]
    fn superseded_fetch_result_is_discarded() {
        let mut view = TableView::new(orders_location(), Some(vec!["id".to_string()]));
        let first = view.begin_fetch();
        let second = view.begin_fetch();

        let stale = view.apply_snapshot(first, snapshot_with_rows(vec![vec![json!(1), json!("old")]]));
        assert_eq!(stale, ApplyOutcome::Stale);
        assert!(view.snapshot().is_none());

        let applied =
            view.apply_snapshot(second, snapshot_with_rows(vec![vec![json!(2), json!("new")]]));
        assert_eq!(applied, ApplyOutcome::Applied);
        assert_eq!(
            view.snapshot().and_then(|s| s.rows[0].first().cloned()),
            Some(json!(2))
        );
    }

    #[test]
    fn accepted_refresh_clears_pending_edits() {
        let mut view = TableView::new(orders_location(), Some(vec!["id".to_string()]));
        let epoch = view.begin_fetch();
        view.apply_snapshot(epoch, snapshot_with_rows(vec![vec![json!(1), json!("a@x")]]));

        view.edits_mut().set_cell(0, 1, &json!("a@x"), json!("b@x"));
        assert!(!view.edits().is_empty());

        let refresh = view.begin_fetch();
        view.apply_snapshot(refresh, snapshot_with_rows(vec![vec![json!(1), json!("b@x")]]));
        assert!(view.edits().is_empty());
    }

    #[test]
    fn stale_result_does_not_touch_pending_edits() {
        let mut view = TableView::new(orders_location(), None);
        let epoch = view.begin_fetch();
        view.apply_snapshot(epoch, snapshot_with_rows(vec![vec![json!(1), json!("a@x")]]));
        view.edits_mut().set_cell(0, 1, &json!("a@x"), json!("b@x"));

        let old = view.begin_fetch();
        let newer = view.begin_fetch();
        assert_eq!(
            view.apply_snapshot(old, snapshot_with_rows(Vec::new())),
            ApplyOutcome::Stale
        );
        assert!(!view.edits().is_empty());

        view.apply_snapshot(newer, snapshot_with_rows(Vec::new()));
        assert!(view.edits().is_empty());
    }
}
