use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;

use crate::catalog::{
    fetch_node, CatalogCache, CatalogError, CatalogPath, CatalogProvider, ColumnInfo, NodeData,
    TableDetailKind,
};
use crate::edit_buffer::{plan_commit, plan_delete, MutationPlan, PlanError, PlannedStatement};
use crate::executor::{QueryError, QueryExecutor};
use crate::mutation_guard::{ConfirmationToken, GuardDecision, GuardError, MutationGuard};
use crate::profiles::ConnectionProfile;
use crate::session::{
    ConnectionId, Connector, RegistryError, Session, SessionError, SessionRegistry,
};
use crate::sql::{self, SortSpec, SqlBuildError, TableTarget};
use crate::table_view::{
    ApplyOutcome, PageSpec, TableLocation, TableSnapshot, TableView,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Sql(#[from] SqlBuildError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("no session exists for connection `{0}`")]
    UnknownConnection(ConnectionId),
    #[error("no open view with id {0}")]
    UnknownView(ViewId),
    #[error("view has no snapshot to edit yet")]
    NoSnapshot,
    #[error("mutation cannot prove a single-row target; confirm to proceed")]
    ConfirmationRequired { token: ConfirmationToken },
    #[error("row {row} failed to apply: {source}")]
    Mutation {
        row: usize,
        #[source]
        source: QueryError,
    },
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// The request/response surface the UI talks to: tree expansion, table
/// views, buffered edits, and connection lifecycle, wired through one
/// registry, one catalog cache, and one executor.
pub struct Workspace<C: Connector, P: CatalogProvider, E: QueryExecutor> {
    registry: SessionRegistry<C>,
    provider: Arc<P>,
    executor: Arc<E>,
    cache: CatalogCache,
    guard: MutationGuard,
    views: Mutex<HashMap<ViewId, TableView>>,
    next_view: AtomicU64,
}

impl<C: Connector, P: CatalogProvider, E: QueryExecutor> Workspace<C, P, E> {
    #[must_use]
    pub fn new(connector: Arc<C>, provider: Arc<P>, executor: Arc<E>) -> Self {
        Self {
            registry: SessionRegistry::new(connector),
            provider,
            executor,
            cache: CatalogCache::new(),
            guard: MutationGuard::default(),
            views: Mutex::new(HashMap::new()),
            next_view: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry<C> {
        &self.registry
    }

    #[must_use]
    pub fn guard(&self) -> &MutationGuard {
        &self.guard
    }

    pub async fn connect(&self, profile: &ConnectionProfile) -> Result<ConnectionId, WorkspaceError> {
        let session = self.registry.connect(profile).await?;
        let connection = session.id().clone();
        self.registry.set_active(&connection)?;
        Ok(connection)
    }

    /// Tears down the session, its cached catalog subtree, and every view
    /// that was looking at it.
    pub async fn disconnect(&self, connection: &ConnectionId) {
        self.registry.disconnect(connection).await;
        self.cache.invalidate_connection(connection);
        self.views
            .lock()
            .expect("workspace views lock poisoned")
            .retain(|_, view| view.location().connection != *connection);
    }

    /// Tree expansion. Served from cache when possible; collapse is purely
    /// client-side, so re-expanding costs nothing here.
    pub async fn expand(&self, path: &CatalogPath) -> Result<Arc<NodeData>, WorkspaceError> {
        let session = self.session_for(path.connection())?;
        let node = self
            .cache
            .get_or_load(&session, path, || fetch_node(self.provider.as_ref(), path))
            .await?;
        Ok(node)
    }

    /// Forced reload of one node and its subtree.
    pub async fn refresh(&self, path: &CatalogPath) -> Result<Arc<NodeData>, WorkspaceError> {
        let session = self.session_for(path.connection())?;
        let node = self
            .cache
            .refresh(&session, path, || fetch_node(self.provider.as_ref(), path))
            .await?;
        Ok(node)
    }

    /// Opens an independent view on a table: primary key from the catalog,
    /// then the row estimate and first page in one database-scoped block.
    /// Opening the same table twice yields two unrelated views.
    pub async fn open_table(&self, location: TableLocation) -> Result<ViewId, WorkspaceError> {
        let columns_path = CatalogPath::TableDetail {
            connection: location.connection.clone(),
            database: location.database.clone(),
            schema: location.schema.clone(),
            table: location.table.clone(),
            kind: TableDetailKind::Columns,
        };
        let node = self.expand(&columns_path).await?;
        let primary_key = match node.as_ref() {
            NodeData::Columns(columns) => primary_key_of(columns),
            _ => None,
        };

        let snapshot = self
            .load_snapshot(&location, PageSpec::default(), None)
            .await?;

        let id = ViewId(self.next_view.fetch_add(1, Ordering::Relaxed));
        let mut view = TableView::new(location, primary_key);
        let epoch = view.begin_fetch();
        view.apply_snapshot(epoch, snapshot);
        self.views
            .lock()
            .expect("workspace views lock poisoned")
            .insert(id, view);
        Ok(id)
    }

    /// Re-fetches a view's page. A result that was superseded by a newer
    /// fetch on the same view lands as `Stale` and changes nothing.
    pub async fn fetch_page(
        &self,
        view: ViewId,
        page: PageSpec,
        sort: Option<SortSpec>,
    ) -> Result<ApplyOutcome, WorkspaceError> {
        let (location, epoch) = {
            let mut views = self.views.lock().expect("workspace views lock poisoned");
            let entry = views.get_mut(&view).ok_or(WorkspaceError::UnknownView(view))?;
            (entry.location().clone(), entry.begin_fetch())
        };

        let snapshot = self.load_snapshot(&location, page, sort).await?;

        let mut views = self.views.lock().expect("workspace views lock poisoned");
        let entry = views.get_mut(&view).ok_or(WorkspaceError::UnknownView(view))?;
        Ok(entry.apply_snapshot(epoch, snapshot))
    }

    /// Buffers a cell edit locally. Writing the original value back removes
    /// the pending edit.
    pub fn set_cell(
        &self,
        view: ViewId,
        row: usize,
        column: usize,
        value: Value,
    ) -> Result<(), WorkspaceError> {
        let mut views = self.views.lock().expect("workspace views lock poisoned");
        let entry = views.get_mut(&view).ok_or(WorkspaceError::UnknownView(view))?;
        let snapshot = entry.snapshot().ok_or(WorkspaceError::NoSnapshot)?;
        let original = snapshot
            .rows
            .get(row)
            .ok_or(WorkspaceError::Plan(PlanError::RowOutOfRange { row }))?
            .get(column)
            .ok_or(WorkspaceError::Plan(PlanError::ColumnOutOfRange { column }))?
            .clone();
        entry.edits_mut().set_cell(row, column, &original, value);
        Ok(())
    }

    #[must_use]
    pub fn pending_edits(&self, view: ViewId) -> usize {
        self.views
            .lock()
            .expect("workspace views lock poisoned")
            .get(&view)
            .map_or(0, |entry| entry.edits().len())
    }

    pub fn discard(&self, view: ViewId) -> Result<(), WorkspaceError> {
        let mut views = self.views.lock().expect("workspace views lock poisoned");
        let entry = views.get_mut(&view).ok_or(WorkspaceError::UnknownView(view))?;
        entry.edits_mut().discard();
        Ok(())
    }

    /// Commits every buffered edit of the view, one UPDATE per dirty row,
    /// all inside a single database-scoped block. On a row failure the
    /// already-applied rows leave the buffer, the failed and remaining rows
    /// stay pending, and the row index travels with the error. Full success
    /// clears the buffer and refreshes the page.
    pub async fn commit(
        &self,
        view: ViewId,
        confirmation: Option<ConfirmationToken>,
    ) -> Result<(), WorkspaceError> {
        let (location, plan, page, sort) = {
            let views = self.views.lock().expect("workspace views lock poisoned");
            let entry = views.get(&view).ok_or(WorkspaceError::UnknownView(view))?;
            let snapshot = entry.snapshot().ok_or(WorkspaceError::NoSnapshot)?;
            let plan = plan_commit(
                entry.location(),
                snapshot,
                entry.primary_key(),
                entry.edits(),
            )?;
            (
                entry.location().clone(),
                plan,
                snapshot.page,
                snapshot.sort.clone(),
            )
        };
        if plan.is_empty() {
            return Ok(());
        }

        self.clear_guard(&plan, confirmation)?;

        let (applied, failed) = self.execute_plan(&location, plan.statements()).await?;

        {
            let mut views = self.views.lock().expect("workspace views lock poisoned");
            if let Some(entry) = views.get_mut(&view) {
                for row in applied {
                    entry.edits_mut().clear_row(row);
                }
            }
        }

        if let Some((row, source)) = failed {
            return Err(WorkspaceError::Mutation { row, source });
        }

        self.fetch_page(view, page, sort).await?;
        Ok(())
    }

    /// Deletes one snapshot row under the same identity and guard rules as
    /// commits, then refreshes the page.
    pub async fn delete_row(
        &self,
        view: ViewId,
        row: usize,
        confirmation: Option<ConfirmationToken>,
    ) -> Result<(), WorkspaceError> {
        let (location, statement, page, sort) = {
            let views = self.views.lock().expect("workspace views lock poisoned");
            let entry = views.get(&view).ok_or(WorkspaceError::UnknownView(view))?;
            let snapshot = entry.snapshot().ok_or(WorkspaceError::NoSnapshot)?;
            let statement = plan_delete(entry.location(), snapshot, entry.primary_key(), row)?;
            (
                entry.location().clone(),
                statement,
                snapshot.page,
                snapshot.sort.clone(),
            )
        };

        let statements = vec![statement.sql.clone()];
        match confirmation {
            Some(token) => self.guard.confirm(token, &statements)?,
            None => match self.guard.check(Some(statement.confidence), &statements) {
                GuardDecision::Allowed => {}
                GuardDecision::ConfirmationRequired(token) => {
                    return Err(WorkspaceError::ConfirmationRequired { token });
                }
            },
        }

        let (_, failed) = self.execute_plan(&location, &[statement]).await?;
        if let Some((row, source)) = failed {
            return Err(WorkspaceError::Mutation { row, source });
        }

        self.fetch_page(view, page, sort).await?;
        Ok(())
    }

    /// DROP TABLE, then catalog invalidation for the table and the closing
    /// of every view that was looking at it.
    pub async fn drop_table(&self, location: &TableLocation) -> Result<(), WorkspaceError> {
        let session = self.session_for(&location.connection)?;
        let target = TableTarget::new(&location.schema, &location.table)?;
        let statement = sql::drop_table_sql(&target);

        let executor = Arc::clone(&self.executor);
        let connection = location.connection.clone();
        session
            .run_scoped(&location.database, || async move {
                executor.execute(&connection, &statement).await
            })
            .await??;

        tracing::debug!(
            connection = %location.connection,
            table = %location.table,
            "dropped table"
        );
        self.cache.invalidate_table(
            &location.connection,
            &location.database,
            &location.schema,
            &location.table,
        );
        self.views
            .lock()
            .expect("workspace views lock poisoned")
            .retain(|_, view| view.location() != location);
        Ok(())
    }

    pub fn close_view(&self, view: ViewId) {
        self.views
            .lock()
            .expect("workspace views lock poisoned")
            .remove(&view);
    }

    #[must_use]
    pub fn view_snapshot(&self, view: ViewId) -> Option<TableSnapshot> {
        self.views
            .lock()
            .expect("workspace views lock poisoned")
            .get(&view)
            .and_then(|entry| entry.snapshot().cloned())
    }

    #[must_use]
    pub fn open_views(&self) -> Vec<ViewId> {
        let mut ids: Vec<ViewId> = self
            .views
            .lock()
            .expect("workspace views lock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    fn session_for(&self, connection: &ConnectionId) -> Result<Arc<Session<C>>, WorkspaceError> {
        self.registry
            .session(connection)
            .ok_or_else(|| WorkspaceError::UnknownConnection(connection.clone()))
    }

    fn clear_guard(
        &self,
        plan: &MutationPlan,
        confirmation: Option<ConfirmationToken>,
    ) -> Result<(), WorkspaceError> {
        let statements: Vec<String> = plan
            .statements()
            .iter()
            .map(|statement| statement.sql.clone())
            .collect();
        match confirmation {
            Some(token) => Ok(self.guard.confirm(token, &statements)?),
            None => match self.guard.check(plan.worst_confidence(), &statements) {
                GuardDecision::Allowed => Ok(()),
                GuardDecision::ConfirmationRequired(token) => {
                    Err(WorkspaceError::ConfirmationRequired { token })
                }
            },
        }
    }

    /// Runs the plan's statements in order inside one database-scoped
    /// block, stopping at the first failure.
    async fn execute_plan(
        &self,
        location: &TableLocation,
        statements: &[PlannedStatement],
    ) -> Result<(Vec<usize>, Option<(usize, QueryError)>), WorkspaceError> {
        let session = self.session_for(&location.connection)?;
        let executor = Arc::clone(&self.executor);
        let connection = location.connection.clone();
        let batch: Vec<(usize, String)> = statements
            .iter()
            .map(|statement| (statement.row, statement.sql.clone()))
            .collect();

        let outcome = session
            .run_scoped(&location.database, || async move {
                let mut applied = Vec::with_capacity(batch.len());
                for (row, statement) in batch {
                    tracing::debug!(connection = %connection, row, "dispatching mutation");
                    match executor.execute(&connection, &statement).await {
                        Ok(_) => applied.push(row),
                        Err(error) => return (applied, Some((row, error))),
                    }
                }
                (applied, None)
            })
            .await?;
        Ok(outcome)
    }

    async fn load_snapshot(
        &self,
        location: &TableLocation,
        page: PageSpec,
        sort: Option<SortSpec>,
    ) -> Result<TableSnapshot, WorkspaceError> {
        let session = self.session_for(&location.connection)?;
        let target = TableTarget::new(&location.schema, &location.table)?;
        let page_sql = sql::page_select_sql(&target, sort.as_ref(), page.limit, page.offset)?;
        let estimate_sql = sql::row_estimate_sql(&target);

        let executor = Arc::clone(&self.executor);
        let connection = location.connection.clone();
        let (estimate, rows) = session
            .run_scoped(&location.database, || async move {
                let estimate = executor.execute(&connection, &estimate_sql).await;
                let rows = executor.execute(&connection, &page_sql).await;
                (estimate, rows)
            })
            .await?;

        let rows = rows?;
        // A missing estimate is cosmetic; the page itself is what matters.
        let total_estimate = estimate.ok().and_then(|outcome| outcome.scalar_i64());
        Ok(TableSnapshot {
            columns: rows.columns,
            rows: rows.rows,
            total_estimate,
            page,
            sort,
        })
    }
}

fn primary_key_of(columns: &[ColumnInfo]) -> Option<Vec<String>> {
    let mut key_columns: Vec<&ColumnInfo> = columns
        .iter()
        .filter(|column| column.is_primary_key)
        .collect();
    if key_columns.is_empty() {
        return None;
    }
    key_columns.sort_by_key(|column| column.ordinal);
    Some(
        key_columns
            .into_iter()
            .map(|column| column.name.clone())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;

    use super::{Workspace, WorkspaceError};
    use crate::catalog::tests::FakeCatalogProvider;
    use crate::catalog::CatalogPath;
    use crate::executor::{QueryError, QueryExecutor, QueryOutcome};
    use crate::session::tests::{sales_profile, FakeConnector};
    use crate::session::ConnectionId;
    use crate::table_view::{ApplyOutcome, ColumnDef, PageSpec, TableLocation};

    #[derive(Debug, Default)]
    struct FakeExecutor {
        calls: Mutex<Vec<String>>,
        fail_containing: Mutex<Option<String>>,
        barrier: tokio::sync::Mutex<()>,
    }

    impl FakeExecutor {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("call log poisoned").clone()
        }

        fn fail_statements_containing(&self, needle: &str) {
            *self.fail_containing.lock().expect("fail flag poisoned") = Some(needle.to_string());
        }
    }

    #[async_trait]
    impl QueryExecutor for FakeExecutor {
        async fn execute(
            &self,
            _connection: &ConnectionId,
            sql: &str,
        ) -> Result<QueryOutcome, QueryError> {
            let _barrier = self.barrier.lock().await;
            self.calls
                .lock()
                .expect("call log poisoned")
                .push(sql.to_string());

            let should_fail = self
                .fail_containing
                .lock()
                .expect("fail flag poisoned")
                .as_ref()
                .is_some_and(|needle| sql.contains(needle.as_str()));
            if should_fail {
                return Err(QueryError::new("constraint violation"));
            }

            if sql.contains("reltuples") {
                return Ok(QueryOutcome {
                    columns: vec![ColumnDef {
                        name: "estimated_rows".to_string(),
                        data_type: "bigint".to_string(),
                    }],
                    rows: vec![vec![json!(1280)]],
                    row_count: 1,
                    timing: std::time::Duration::from_millis(1),
                });
            }
            if sql.starts_with("SELECT * FROM") {
                return Ok(QueryOutcome {
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
                    rows: vec![
                        vec![json!(1), json!("ann@example.com")],
                        vec![json!(2), json!("bob@example.com")],
                    ],
                    row_count: 2,
                    timing: std::time::Duration::from_millis(2),
                });
            }
            Ok(QueryOutcome {
                columns: Vec::new(),
                rows: Vec::new(),
                row_count: 1,
                timing: std::time::Duration::from_millis(1),
            })
        }
    }

    type TestWorkspace = Workspace<FakeConnector, FakeCatalogProvider, FakeExecutor>;

    struct Rig {
        workspace: Arc<TestWorkspace>,
        connector: Arc<FakeConnector>,
        provider: Arc<FakeCatalogProvider>,
        executor: Arc<FakeExecutor>,
        connection: ConnectionId,
    }

    async fn connected_rig() -> Rig {
        let connector = Arc::new(FakeConnector::default());
        let provider = Arc::new(FakeCatalogProvider::default());
        let executor = Arc::new(FakeExecutor::default());
        let workspace = Arc::new(Workspace::new(
            Arc::clone(&connector),
            Arc::clone(&provider),
            Arc::clone(&executor),
        ));
        let connection = workspace
            .connect(&sales_profile())
            .await
            .expect("connect should succeed");
        Rig {
            workspace,
            connector,
            provider,
            executor,
            connection,
        }
    }

    fn orders_location(connection: &ConnectionId) -> TableLocation {
        TableLocation {
            connection: connection.clone(),
            database: "sales".to_string(),
            schema: "public".to_string(),
            table: "orders".to_string(),
        }
    }

    fn tables_path(connection: &ConnectionId) -> CatalogPath {
        CatalogPath::Tables {
            connection: connection.clone(),
            database: "sales".to_string(),
            schema: "public".to_string(),
        }
    }

    #[tokio::test]
    async fn expanding_down_to_a_table_costs_one_fetch_per_level() {
        let rig = connected_rig().await;
        let databases = CatalogPath::Databases {
            connection: rig.connection.clone(),
        };
        let schemas = CatalogPath::Schemas {
            connection: rig.connection.clone(),
            database: "sales".to_string(),
        };
        let tables = tables_path(&rig.connection);

        for path in [&databases, &schemas, &tables] {
            rig.workspace.expand(path).await.expect("expand should succeed");
        }
        // Collapse is client-side; re-expanding every level is free.
        for path in [&databases, &schemas, &tables] {
            rig.workspace.expand(path).await.expect("expand should succeed");
        }

        assert_eq!(rig.provider.database_calls.load(Ordering::Relaxed), 1);
        assert_eq!(rig.provider.schema_calls.load(Ordering::Relaxed), 1);
        assert_eq!(rig.provider.table_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn expand_on_another_database_switches_and_comes_back_on_demand() {
        let rig = connected_rig().await;
        let reporting = CatalogPath::Schemas {
            connection: rig.connection.clone(),
            database: "reporting".to_string(),
        };
        rig.workspace
            .expand(&reporting)
            .await
            .expect("expand should switch and succeed");

        let session = rig
            .workspace
            .registry()
            .session(&rig.connection)
            .expect("session should exist");
        assert_eq!(session.current_database().as_deref(), Some("reporting"));

        // Cached nodes from the previous database are still served.
        let sales = CatalogPath::Schemas {
            connection: rig.connection.clone(),
            database: "sales".to_string(),
        };
        rig.workspace.expand(&sales).await.expect("expand");
        rig.workspace.expand(&sales).await.expect("expand");
        assert_eq!(rig.provider.schema_calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn failed_switch_keeps_the_session_usable() {
        let rig = connected_rig().await;
        rig.connector.fail_switch.store(1, Ordering::Relaxed);

        let reporting = CatalogPath::Schemas {
            connection: rig.connection.clone(),
            database: "reporting".to_string(),
        };
        let err = rig
            .workspace
            .expand(&reporting)
            .await
            .expect_err("switch failure should surface");
        assert!(matches!(err, WorkspaceError::Catalog(_)));

        let session = rig
            .workspace
            .registry()
            .session(&rig.connection)
            .expect("session should exist");
        assert_eq!(session.current_database().as_deref(), Some("sales"));

        rig.workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("sales table should still open");
    }

    #[tokio::test]
    async fn open_table_captures_primary_key_and_first_page() {
        let rig = connected_rig().await;
        let view = rig
            .workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("open should succeed");

        let snapshot = rig
            .workspace
            .view_snapshot(view)
            .expect("snapshot should exist");
        assert_eq!(snapshot.rows.len(), 2);
        assert_eq!(snapshot.total_estimate, Some(1280));
        assert_eq!(rig.provider.column_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn two_opens_of_one_table_are_independent_views() {
        let rig = connected_rig().await;
        let first = rig
            .workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("open should succeed");
        let second = rig
            .workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("open should succeed");
        assert_ne!(first, second);

        rig.workspace
            .set_cell(first, 0, 1, json!("new@example.com"))
            .expect("edit should buffer");
        assert_eq!(rig.workspace.pending_edits(first), 1);
        assert_eq!(rig.workspace.pending_edits(second), 0);
    }

    #[tokio::test]
    async fn commit_updates_only_dirty_rows_and_refreshes() {
        let rig = connected_rig().await;
        let view = rig
            .workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("open should succeed");

        rig.workspace
            .set_cell(view, 0, 1, json!("ann@new.example"))
            .expect("edit should buffer");
        rig.workspace
            .commit(view, None)
            .await
            .expect("primary-key commit needs no confirmation");

        let calls = rig.executor.calls();
        assert!(calls.iter().any(|sql| sql
            == "UPDATE \"public\".\"orders\" SET \"email\" = 'ann@new.example' WHERE \"id\" = 1"));
        assert_eq!(rig.workspace.pending_edits(view), 0);
        // The refresh refetched the page after the mutation ran.
        let selects = calls
            .iter()
            .filter(|sql| sql.starts_with("SELECT * FROM"))
            .count();
        assert_eq!(selects, 2);
    }

    #[tokio::test]
    async fn reverted_edit_means_commit_issues_nothing() {
        let rig = connected_rig().await;
        let view = rig
            .workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("open should succeed");

        rig.workspace
            .set_cell(view, 0, 1, json!("ann@new.example"))
            .expect("edit should buffer");
        rig.workspace
            .set_cell(view, 0, 1, json!("ann@example.com"))
            .expect("revert should drop the edit");
        assert_eq!(rig.workspace.pending_edits(view), 0);

        rig.workspace
            .commit(view, None)
            .await
            .expect("empty commit is a no-op");
        assert!(!rig.executor.calls().iter().any(|sql| sql.starts_with("UPDATE")));
    }

    #[tokio::test]
    async fn failed_row_keeps_its_edits_pending_and_reports_the_row() {
        let rig = connected_rig().await;
        let view = rig
            .workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("open should succeed");

        rig.workspace
            .set_cell(view, 0, 1, json!("ann@new.example"))
            .expect("edit should buffer");
        rig.workspace
            .set_cell(view, 1, 1, json!("bob@new.example"))
            .expect("edit should buffer");
        rig.executor.fail_statements_containing("\"id\" = 2");

        let err = rig
            .workspace
            .commit(view, None)
            .await
            .expect_err("second row should fail");
        assert!(matches!(err, WorkspaceError::Mutation { row: 1, .. }));

        // Row 0 applied and left the buffer; row 1 is still pending.
        assert_eq!(rig.workspace.pending_edits(view), 1);
    }

    #[tokio::test]
    async fn mutations_without_a_primary_key_need_confirmation() {
        let rig = connected_rig().await;
        rig.provider.omit_primary_key.store(true, Ordering::Relaxed);
        let view = rig
            .workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("open should succeed");

        rig.workspace
            .set_cell(view, 0, 1, json!("ann@new.example"))
            .expect("edit should buffer");

        let err = rig
            .workspace
            .commit(view, None)
            .await
            .expect_err("weak identity should require confirmation");
        let WorkspaceError::ConfirmationRequired { token } = err else {
            panic!("expected a confirmation token, got {err:?}");
        };

        rig.workspace
            .commit(view, Some(token))
            .await
            .expect("confirmed commit should run");
        assert!(rig
            .executor
            .calls()
            .iter()
            .any(|sql| sql.starts_with("UPDATE") && sql.contains("\"email\" = 'ann@example.com'")));
    }

    #[tokio::test]
    async fn delete_row_targets_the_snapshot_row_and_refreshes() {
        let rig = connected_rig().await;
        let view = rig
            .workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("open should succeed");

        rig.workspace
            .delete_row(view, 1, None)
            .await
            .expect("primary-key delete needs no confirmation");

        assert!(rig
            .executor
            .calls()
            .iter()
            .any(|sql| sql == "DELETE FROM \"public\".\"orders\" WHERE \"id\" = 2"));
    }

    #[tokio::test]
    async fn superseded_page_fetch_is_discarded_silently() {
        let rig = connected_rig().await;
        let view = rig
            .workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("open should succeed");

        let barrier = rig.executor.barrier.lock().await;

        let first = {
            let workspace = Arc::clone(&rig.workspace);
            tokio::spawn(async move {
                workspace
                    .fetch_page(view, PageSpec { limit: 100, offset: 100 }, None)
                    .await
            })
        };
        // Let the first fetch claim its epoch before the second starts.
        tokio::task::yield_now().await;
        let second = {
            let workspace = Arc::clone(&rig.workspace);
            tokio::spawn(async move {
                workspace
                    .fetch_page(view, PageSpec { limit: 100, offset: 200 }, None)
                    .await
            })
        };
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        drop(barrier);

        let first = first
            .await
            .expect("task should finish")
            .expect("fetch should succeed");
        let second = second
            .await
            .expect("task should finish")
            .expect("fetch should succeed");
        assert_eq!(first, ApplyOutcome::Stale);
        assert_eq!(second, ApplyOutcome::Applied);

        let snapshot = rig
            .workspace
            .view_snapshot(view)
            .expect("snapshot should exist");
        assert_eq!(snapshot.page.offset, 200);
    }

    #[tokio::test]
    async fn drop_table_closes_views_and_invalidates_the_catalog() {
        let rig = connected_rig().await;
        let location = orders_location(&rig.connection);
        rig.workspace
            .expand(&tables_path(&rig.connection))
            .await
            .expect("expand should succeed");
        let first = rig
            .workspace
            .open_table(location.clone())
            .await
            .expect("open should succeed");
        let second = rig
            .workspace
            .open_table(location.clone())
            .await
            .expect("open should succeed");

        rig.workspace
            .drop_table(&location)
            .await
            .expect("drop should succeed");

        assert!(rig
            .executor
            .calls()
            .iter()
            .any(|sql| sql == "DROP TABLE \"public\".\"orders\""));
        assert!(rig.workspace.open_views().is_empty());
        assert!(matches!(
            rig.workspace.fetch_page(first, PageSpec::default(), None).await,
            Err(WorkspaceError::UnknownView(_))
        ));
        let _ = second;

        // The schema's table list was invalidated and refetches on demand.
        rig.workspace
            .expand(&tables_path(&rig.connection))
            .await
            .expect("expand should succeed");
        assert_eq!(rig.provider.table_calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn disconnect_tears_down_views_and_cache() {
        let rig = connected_rig().await;
        rig.workspace
            .open_table(orders_location(&rig.connection))
            .await
            .expect("open should succeed");

        rig.workspace.disconnect(&rig.connection).await;

        assert!(rig.workspace.open_views().is_empty());
        assert!(rig.workspace.registry().active().is_none());
        let err = rig
            .workspace
            .expand(&tables_path(&rig.connection))
            .await
            .expect_err("sessionless expand should fail");
        assert!(matches!(err, WorkspaceError::UnknownConnection(_)));
    }
}
