use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::profiles::ConnectionProfile;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Identifies one connection across sessions, catalog nodes, and views.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConnectorError {
    message: String,
}

impl ConnectorError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The external collaborator that owns the wire protocol. A successful
/// `connect` binds the connection, server-side, to `profile.database`;
/// `switch_database` rebinds it.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn test_connection(&self, profile: &ConnectionProfile)
        -> Result<String, ConnectorError>;
    async fn connect(&self, profile: &ConnectionProfile) -> Result<(), ConnectorError>;
    async fn switch_database(
        &self,
        connection: &ConnectionId,
        database: &str,
    ) -> Result<(), ConnectorError>;
    async fn disconnect(&self, connection: &ConnectionId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected {
        database: String,
    },
    SwitchingDatabase {
        current: String,
        target: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        connection: ConnectionId,
        database: String,
    },
    DatabaseSwitched {
        connection: ConnectionId,
        database: String,
    },
    Disconnected {
        connection: ConnectionId,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connection(#[source] ConnectorError),
    #[error("failed to switch to database `{database}`: {source}")]
    SwitchDatabase {
        database: String,
        #[source]
        source: ConnectorError,
    },
    #[error("session is not connected")]
    NotConnected,
}

/// The live state of one open connection and its single server-side
/// "current database" pointer.
///
/// Every database-scoped operation goes through the gate: a switch in
/// flight blocks later scoped operations on the same session until it
/// resolves, so no fetch can ever observe a half-switched connection.
#[derive(Debug)]
pub struct Session<C: Connector> {
    id: ConnectionId,
    connector: Arc<C>,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl<C: Connector> Session<C> {
    fn new(
        id: ConnectionId,
        connector: Arc<C>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            id,
            connector,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(SessionState::Disconnected),
            events,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.lock().expect("session state lock poisoned").clone()
    }

    #[must_use]
    pub fn current_database(&self) -> Option<String> {
        match self.state() {
            SessionState::Connected { database } => Some(database),
            SessionState::Disconnected
            | SessionState::Connecting
            | SessionState::SwitchingDatabase { .. } => None,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SessionState::Connected { .. })
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().expect("session state lock poisoned") = next;
    }

    async fn connect(&self, profile: &ConnectionProfile) -> Result<(), SessionError> {
        let _gate = self.gate.lock().await;
        self.set_state(SessionState::Connecting);

        if let Err(source) = self.connector.connect(profile).await {
            self.set_state(SessionState::Disconnected);
            return Err(SessionError::Connection(source));
        }

        tracing::debug!(connection = %self.id, database = %profile.database, "session connected");
        self.set_state(SessionState::Connected {
            database: profile.database.clone(),
        });
        let _ = self.events.send(SessionEvent::Connected {
            connection: self.id.clone(),
            database: profile.database.clone(),
        });
        Ok(())
    }

    /// Switches the server-side current database. No-op when the target is
    /// already current; on failure the prior database stays current and its
    /// cached catalog nodes remain usable.
    pub async fn switch_database(&self, target: &str) -> Result<(), SessionError> {
        let _gate = self.gate.lock().await;
        self.switch_database_locked(target).await
    }

    /// Runs `operation` with `database` guaranteed current for its whole
    /// duration. Concurrent callers on the same session queue behind the
    /// gate in arrival order.
    pub async fn run_scoped<T, F, Fut>(&self, database: &str, operation: F) -> Result<T, SessionError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        let _gate = self.gate.lock().await;
        self.switch_database_locked(database).await?;
        Ok(operation().await)
    }

    /// Runs `operation` serialized through the gate without requiring any
    /// particular current database (database-list introspection).
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T, SessionError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
        T: Send,
    {
        let _gate = self.gate.lock().await;
        if !matches!(
            self.state(),
            SessionState::Connected { .. }
        ) {
            return Err(SessionError::NotConnected);
        }
        Ok(operation().await)
    }

    pub async fn disconnect(&self) {
        let _gate = self.gate.lock().await;
        if matches!(self.state(), SessionState::Disconnected) {
            return;
        }
        self.connector.disconnect(&self.id).await;
        self.set_state(SessionState::Disconnected);
        tracing::debug!(connection = %self.id, "session disconnected");
        let _ = self.events.send(SessionEvent::Disconnected {
            connection: self.id.clone(),
        });
    }

    // Caller must hold the gate.
    async fn switch_database_locked(&self, target: &str) -> Result<(), SessionError> {
        let current = match self.state() {
            SessionState::Connected { database } => database,
            SessionState::Disconnected
            | SessionState::Connecting
            | SessionState::SwitchingDatabase { .. } => return Err(SessionError::NotConnected),
        };
        if current == target {
            return Ok(());
        }

        self.set_state(SessionState::SwitchingDatabase {
            current: current.clone(),
            target: target.to_string(),
        });

        match self.connector.switch_database(&self.id, target).await {
            Ok(()) => {
                tracing::debug!(connection = %self.id, database = target, "switched database");
                self.set_state(SessionState::Connected {
                    database: target.to_string(),
                });
                let _ = self.events.send(SessionEvent::DatabaseSwitched {
                    connection: self.id.clone(),
                    database: target.to_string(),
                });
                Ok(())
            }
            Err(source) => {
                tracing::warn!(
                    connection = %self.id,
                    database = target,
                    error = %source,
                    "database switch failed; previous database remains current"
                );
                self.set_state(SessionState::Connected { database: current });
                Err(SessionError::SwitchDatabase {
                    database: target.to_string(),
                    source,
                })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a session already exists for connection `{connection}`")]
    AlreadyConnected { connection: ConnectionId },
    #[error("no session exists for connection `{connection}`")]
    UnknownConnection { connection: ConnectionId },
    #[error("connection `{connection}` is not in the Connected state")]
    NotConnected { connection: ConnectionId },
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Sole owner of all live sessions, keyed by connection id. "Active" is a
/// pointer into this registry, never a second source of truth.
#[derive(Debug)]
pub struct SessionRegistry<C: Connector> {
    connector: Arc<C>,
    sessions: Mutex<HashMap<ConnectionId, Arc<Session<C>>>>,
    active: Mutex<Option<ConnectionId>>,
    events: broadcast::Sender<SessionEvent>,
}

impl<C: Connector> SessionRegistry<C> {
    #[must_use]
    pub fn new(connector: Arc<C>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            events,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn session(&self, connection: &ConnectionId) -> Option<Arc<Session<C>>> {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .get(connection)
            .cloned()
    }

    /// Creates and connects the session for this profile. Exactly one
    /// session may exist per connection id at a time.
    pub async fn connect(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Arc<Session<C>>, RegistryError> {
        let connection = ConnectionId::new(profile.id.clone());
        let session = Arc::new(Session::new(
            connection.clone(),
            Arc::clone(&self.connector),
            self.events.clone(),
        ));

        {
            let mut sessions = self.sessions.lock().expect("session registry lock poisoned");
            if sessions.contains_key(&connection) {
                return Err(RegistryError::AlreadyConnected { connection });
            }
            sessions.insert(connection.clone(), Arc::clone(&session));
        }

        if let Err(error) = session.connect(profile).await {
            self.sessions
                .lock()
                .expect("session registry lock poisoned")
                .remove(&connection);
            return Err(error.into());
        }
        Ok(session)
    }

    /// Idempotent: disconnecting an unknown connection is a no-op.
    pub async fn disconnect(&self, connection: &ConnectionId) {
        let session = self
            .sessions
            .lock()
            .expect("session registry lock poisoned")
            .remove(connection);

        let Some(session) = session else {
            return;
        };
        session.disconnect().await;

        let mut active = self.active.lock().expect("active pointer lock poisoned");
        if active.as_ref() == Some(connection) {
            *active = None;
        }
    }

    #[must_use]
    pub fn active(&self) -> Option<ConnectionId> {
        self.active
            .lock()
            .expect("active pointer lock poisoned")
            .clone()
    }

    /// The active pointer may only name a session currently Connected.
    pub fn set_active(&self, connection: &ConnectionId) -> Result<(), RegistryError> {
        let session = self
            .session(connection)
            .ok_or_else(|| RegistryError::UnknownConnection {
                connection: connection.clone(),
            })?;
        if !session.is_connected() {
            return Err(RegistryError::NotConnected {
                connection: connection.clone(),
            });
        }
        *self.active.lock().expect("active pointer lock poisoned") = Some(connection.clone());
        Ok(())
    }

    pub fn clear_active(&self) {
        *self.active.lock().expect("active pointer lock poisoned") = None;
    }
}
