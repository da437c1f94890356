use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::session::{ConnectionId, Connector, Session, SessionError};

/// Which per-table detail node a path addresses. Each kind is fetched on
/// its own, so expanding "Columns" never pays for triggers or policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableDetailKind {
    Columns,
    Constraints,
    Indexes,
    Triggers,
    Rules,
    Policies,
}

/// Structured address of one catalog node. Paths are plain values: they
/// hash, compare, and carry a prefix relation for subtree invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CatalogPath {
    Databases {
        connection: ConnectionId,
    },
    Schemas {
        connection: ConnectionId,
        database: String,
    },
    Tables {
        connection: ConnectionId,
        database: String,
        schema: String,
    },
    TableDetail {
        connection: ConnectionId,
        database: String,
        schema: String,
        table: String,
        kind: TableDetailKind,
    },
}

impl CatalogPath {
    #[must_use]
    pub fn connection(&self) -> &ConnectionId {
        match self {
            Self::Databases { connection }
            | Self::Schemas { connection, .. }
            | Self::Tables { connection, .. }
            | Self::TableDetail { connection, .. } => connection,
        }
    }

    /// The database the fetch must run against; `None` for the database
    /// list itself, which is visible from any current database.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        match self {
            Self::Databases { .. } => None,
            Self::Schemas { database, .. }
            | Self::Tables { database, .. }
            | Self::TableDetail { database, .. } => Some(database),
        }
    }

    /// Whether `self` is `prefix` or lives underneath it. The database list
    /// is the root of a connection's subtree.
    #[must_use]
    pub fn starts_with(&self, prefix: &CatalogPath) -> bool {
        if self.connection() != prefix.connection() {
            return false;
        }
        match prefix {
            Self::Databases { .. } => true,
            Self::Schemas { database, .. } => self.database() == Some(database.as_str()),
            Self::Tables {
                database, schema, ..
            } => match self {
                Self::Tables {
                    database: own_database,
                    schema: own_schema,
                    ..
                }
                | Self::TableDetail {
                    database: own_database,
                    schema: own_schema,
                    ..
                } => own_database == database && own_schema == schema,
                Self::Databases { .. } | Self::Schemas { .. } => false,
            },
            Self::TableDetail { .. } => self == prefix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub owner: String,
    pub encoding: String,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub name: String,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub table_type: String,
    pub row_estimate: i64,
    pub total_size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    pub ordinal: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub name: String,
    pub constraint_type: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
    pub is_unique: bool,
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub name: String,
    pub timing: String,
    pub event: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleInfo {
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInfo {
    pub name: String,
    pub command: String,
    pub roles: Vec<String>,
    pub using_expression: Option<String>,
    pub check_expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeData {
    Databases(Vec<DatabaseInfo>),
    Schemas(Vec<SchemaInfo>),
    Tables(Vec<TableInfo>),
    Columns(Vec<ColumnInfo>),
    Constraints(Vec<ConstraintInfo>),
    Indexes(Vec<IndexInfo>),
    Triggers(Vec<TriggerInfo>),
    Rules(Vec<RuleInfo>),
    Policies(Vec<PolicyInfo>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CatalogFetchError {
    message: String,
}

impl CatalogFetchError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Read-only introspection against whatever database is current on the
/// connection. Database scoping is the session's job, not the provider's.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn databases(
        &self,
        connection: &ConnectionId,
    ) -> Result<Vec<DatabaseInfo>, CatalogFetchError>;
    async fn schemas(
        &self,
        connection: &ConnectionId,
    ) -> Result<Vec<SchemaInfo>, CatalogFetchError>;
    async fn tables(
        &self,
        connection: &ConnectionId,
        schema: &str,
    ) -> Result<Vec<TableInfo>, CatalogFetchError>;
    async fn columns(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, CatalogFetchError>;
    async fn constraints(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ConstraintInfo>, CatalogFetchError>;
    async fn indexes(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<IndexInfo>, CatalogFetchError>;
    async fn triggers(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<TriggerInfo>, CatalogFetchError>;
    async fn rules(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<RuleInfo>, CatalogFetchError>;
    async fn policies(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<PolicyInfo>, CatalogFetchError>;
}

/// The standard fetcher: exhaustive dispatch from a path to the provider
/// call that loads it.
pub async fn fetch_node<P: CatalogProvider + ?Sized>(
    provider: &P,
    path: &CatalogPath,
) -> Result<NodeData, CatalogFetchError> {
    match path {
        CatalogPath::Databases { connection } => {
            provider.databases(connection).await.map(NodeData::Databases)
        }
        CatalogPath::Schemas { connection, .. } => {
            provider.schemas(connection).await.map(NodeData::Schemas)
        }
        CatalogPath::Tables {
            connection, schema, ..
        } => provider
            .tables(connection, schema)
            .await
            .map(NodeData::Tables),
        CatalogPath::TableDetail {
            connection,
            schema,
            table,
            kind,
            ..
        } => match kind {
            TableDetailKind::Columns => provider
                .columns(connection, schema, table)
                .await
                .map(NodeData::Columns),
            TableDetailKind::Constraints => provider
                .constraints(connection, schema, table)
                .await
                .map(NodeData::Constraints),
            TableDetailKind::Indexes => provider
                .indexes(connection, schema, table)
                .await
                .map(NodeData::Indexes),
            TableDetailKind::Triggers => provider
                .triggers(connection, schema, table)
                .await
                .map(NodeData::Triggers),
            TableDetailKind::Rules => provider
                .rules(connection, schema, table)
                .await
                .map(NodeData::Rules),
            TableDetailKind::Policies => provider
                .policies(connection, schema, table)
                .await
                .map(NodeData::Policies),
        },
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog fetch failed: {0}")]
    Fetch(#[source] CatalogFetchError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("catalog fetch was abandoned before completing")]
    Abandoned,
}

#[derive(Debug)]
enum NodeSlot {
    Loaded(Arc<NodeData>),
    Loading(watch::Receiver<bool>),
    Error(String),
}

enum Step {
    Hit(Arc<NodeData>),
    Failed(String),
    Wait(watch::Receiver<bool>),
    Fetch(watch::Sender<bool>),
}

/// Lazy per-path node cache. Every path is fetched at most once while it
/// stays cached: concurrent callers on a never-loaded path share a single
/// in-flight fetch, and failed nodes stay failed until an explicit refresh.
#[derive(Debug, Default)]
pub struct CatalogCache {
    nodes: Mutex<HashMap<CatalogPath, NodeSlot>>,
}

impl CatalogCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached node, or loads it exactly once. Database-scoped
    /// fetches run through `Session::run_scoped`, so the right database is
    /// current for the whole fetch; the database list runs unscoped.
    pub async fn get_or_load<C, F, Fut>(
        &self,
        session: &Session<C>,
        path: &CatalogPath,
        fetch: F,
    ) -> Result<Arc<NodeData>, CatalogError>
    where
        C: Connector,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<NodeData, CatalogFetchError>> + Send,
    {
        let sender = loop {
            let step = {
                let mut nodes = self.nodes.lock().expect("catalog cache lock poisoned");
                match nodes.get(path) {
                    Some(NodeSlot::Loaded(data)) => Step::Hit(Arc::clone(data)),
                    Some(NodeSlot::Error(message)) => Step::Failed(message.clone()),
                    Some(NodeSlot::Loading(receiver)) => Step::Wait(receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(false);
                        nodes.insert(path.clone(), NodeSlot::Loading(receiver));
                        Step::Fetch(sender)
                    }
                }
            };

            match step {
                Step::Hit(data) => return Ok(data),
                Step::Failed(message) => {
                    return Err(CatalogError::Fetch(CatalogFetchError::new(message)))
                }
                Step::Wait(mut receiver) => {
                    if receiver.changed().await.is_err() {
                        // The fetching caller went away without completing.
                        // Drop the stale marker so the next caller retries,
                        // but only ours: the slot may already belong to a
                        // newer fetch on the same path.
                        let mut nodes =
                            self.nodes.lock().expect("catalog cache lock poisoned");
                        if let Some(NodeSlot::Loading(current)) = nodes.get(path) {
                            if current.same_channel(&receiver) {
                                nodes.remove(path);
                            }
                        }
                        return Err(CatalogError::Abandoned);
                    }
                }
                Step::Fetch(sender) => break sender,
            }
        };

        let fetched = match path.database() {
            Some(database) => session.run_scoped(database, fetch).await,
            None => session.run(fetch).await,
        };

        // The map must be updated before the wakeup goes out, so waiters
        // always observe the final slot.
        match fetched {
            Ok(Ok(data)) => {
                let data = Arc::new(data);
                self.nodes
                    .lock()
                    .expect("catalog cache lock poisoned")
                    .insert(path.clone(), NodeSlot::Loaded(Arc::clone(&data)));
                let _ = sender.send(true);
                Ok(data)
            }
            Ok(Err(error)) => {
                tracing::warn!(path = ?path, error = %error, "catalog fetch failed");
                self.nodes
                    .lock()
                    .expect("catalog cache lock poisoned")
                    .insert(path.clone(), NodeSlot::Error(error.to_string()));
                let _ = sender.send(true);
                Err(CatalogError::Fetch(error))
            }
            Err(session_error) => {
                // Session-level failures (a refused switch, a dropped
                // connection) are not node state; the node stays absent and
                // the next expand retries.
                self.nodes
                    .lock()
                    .expect("catalog cache lock poisoned")
                    .remove(path);
                drop(sender);
                Err(session_error.into())
            }
        }
    }

    /// Drops the node and everything underneath it.
    pub fn invalidate(&self, path: &CatalogPath) {
        self.nodes
            .lock()
            .expect("catalog cache lock poisoned")
            .retain(|cached, _| !cached.starts_with(path));
    }

    pub fn invalidate_connection(&self, connection: &ConnectionId) {
        self.nodes
            .lock()
            .expect("catalog cache lock poisoned")
            .retain(|cached, _| cached.connection() != connection);
    }

    /// After a structural change to one table: its detail nodes and the
    /// schema's table list are stale, the rest of the subtree is not.
    pub fn invalidate_table(
        &self,
        connection: &ConnectionId,
        database: &str,
        schema: &str,
        table: &str,
    ) {
        self.nodes
            .lock()
            .expect("catalog cache lock poisoned")
            .retain(|cached, _| match cached {
                CatalogPath::Tables {
                    connection: own_connection,
                    database: own_database,
                    schema: own_schema,
                } => {
                    !(own_connection == connection
                        && own_database == database
                        && own_schema == schema)
                }
                CatalogPath::TableDetail {
                    connection: own_connection,
                    database: own_database,
                    schema: own_schema,
                    table: own_table,
                    ..
                } => {
                    !(own_connection == connection
                        && own_database == database
                        && own_schema == schema
                        && own_table == table)
                }
                CatalogPath::Databases { .. } | CatalogPath::Schemas { .. } => true,
            });
    }

    /// Forced reload: drops the subtree, then loads the node again. The
    /// only way a failed node gets another fetch.
    pub async fn refresh<C, F, Fut>(
        &self,
        session: &Session<C>,
        path: &CatalogPath,
        fetch: F,
    ) -> Result<Arc<NodeData>, CatalogError>
    where
        C: Connector,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<NodeData, CatalogFetchError>> + Send,
    {
        self.invalidate(path);
        self.get_or_load(session, path, fetch).await
    }

    #[cfg(test)]
    fn install_loading(&self, path: &CatalogPath) -> watch::Sender<bool> {
        let (sender, receiver) = watch::channel(false);
        self.nodes
            .lock()
            .expect("catalog cache lock poisoned")
            .insert(path.clone(), NodeSlot::Loading(receiver));
        sender
    }

    #[cfg(test)]
    fn cached_paths(&self) -> Vec<CatalogPath> {
        self.nodes
            .lock()
            .expect("catalog cache lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
