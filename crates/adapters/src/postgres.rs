use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use pgdeck_core::catalog::{
    CatalogFetchError, CatalogProvider, ColumnInfo, ConstraintInfo, DatabaseInfo, IndexInfo,
    PolicyInfo, RuleInfo, SchemaInfo, TableInfo, TriggerInfo,
};
use pgdeck_core::executor::{QueryError, QueryExecutor, QueryOutcome};
use pgdeck_core::profiles::{ConnectionProfile, PasswordSource};
use pgdeck_core::session::{ConnectionId, Connector, ConnectorError};
use pgdeck_core::table_view::ColumnDef;
use serde_json::Value;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, Row};

pub const PASSWORD_ENV_VAR: &str = "PGDECK_DB_PASSWORD";
const DEFAULT_KEYRING_SERVICE: &str = "pgdeck";

/// One tokio-postgres client per connection id. The same backend serves the
/// connector, catalog, and executor seams, so a database switch (which is a
/// reconnect in the Postgres wire model) is visible to all three at once.
#[derive(Default)]
pub struct PostgresBackend {
    clients: Mutex<HashMap<ConnectionId, Arc<Client>>>,
    profiles: Mutex<HashMap<ConnectionId, ConnectionProfile>>,
}

impl PostgresBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, connection: &ConnectionId) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .expect("client table poisoned")
            .get(connection)
            .cloned()
    }

    fn client_for_catalog(
        &self,
        connection: &ConnectionId,
    ) -> Result<Arc<Client>, CatalogFetchError> {
        self.client(connection).ok_or_else(|| {
            CatalogFetchError::new(format!("no live connection with id `{connection}`"))
        })
    }

    fn client_for_query(&self, connection: &ConnectionId) -> Result<Arc<Client>, QueryError> {
        self.client(connection)
            .ok_or_else(|| QueryError::new(format!("no live connection with id `{connection}`")))
    }
}

fn resolve_password(profile: &ConnectionProfile) -> Result<String, ConnectorError> {
    match profile.password_source {
        PasswordSource::EnvVar => std::env::var(PASSWORD_ENV_VAR).map_err(|_| {
            ConnectorError::new(format!("password env var {PASSWORD_ENV_VAR} is not set"))
        }),
        PasswordSource::Keyring => {
            let service = profile
                .keyring_service
                .as_deref()
                .unwrap_or(DEFAULT_KEYRING_SERVICE);
            let account = profile
                .keyring_account
                .as_deref()
                .unwrap_or(profile.user.as_str());
            let entry = keyring::Entry::new(service, account).map_err(|err| {
                ConnectorError::new(format!("failed to open keyring entry: {err}"))
            })?;
            entry.get_password().map_err(|err| {
                ConnectorError::new(format!("failed to read password from keyring: {err}"))
            })
        }
    }
}

fn connection_string(profile: &ConnectionProfile, database: &str, password: &str) -> String {
    format!(
        "host={} port={} dbname={} user={} password={}",
        profile.host, profile.port, database, profile.user, password
    )
}

/// Opens a client bound to `database` and parks the connection future on
/// its own task.
async fn open_client(
    profile: &ConnectionProfile,
    database: &str,
) -> Result<Client, ConnectorError> {
    let password = resolve_password(profile)?;
    let (client, connection) =
        tokio_postgres::connect(&connection_string(profile, database, &password), NoTls)
            .await
            .map_err(|err| ConnectorError::new(format!("connection failed: {err}")))?;

    let profile_id = profile.id.clone();
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::warn!(profile = %profile_id, error = %error, "connection task ended");
        }
    });

    Ok(client)
}

#[async_trait]
impl Connector for PostgresBackend {
    async fn test_connection(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<String, ConnectorError> {
        let client = open_client(profile, &profile.database).await?;
        let row = client
            .query_one("SELECT version()", &[])
            .await
            .map_err(|err| ConnectorError::new(format!("version check failed: {err}")))?;
        Ok(row.get(0))
    }

    async fn connect(&self, profile: &ConnectionProfile) -> Result<(), ConnectorError> {
        let client = open_client(profile, &profile.database).await?;
        let connection = ConnectionId::new(profile.id.clone());
        self.clients
            .lock()
            .expect("client table poisoned")
            .insert(connection.clone(), Arc::new(client));
        self.profiles
            .lock()
            .expect("profile table poisoned")
            .insert(connection, profile.clone());
        Ok(())
    }

    /// Postgres binds a connection to one database for its lifetime, so a
    /// switch is a reconnect against the target. The old client is only
    /// replaced once the new one is up.
    async fn switch_database(
        &self,
        connection: &ConnectionId,
        database: &str,
    ) -> Result<(), ConnectorError> {
        let profile = self
            .profiles
            .lock()
            .expect("profile table poisoned")
            .get(connection)
            .cloned()
            .ok_or_else(|| {
                ConnectorError::new(format!("no live connection with id `{connection}`"))
            })?;

        let client = open_client(&profile, database).await?;

        self.clients
            .lock()
            .expect("client table poisoned")
            .insert(connection.clone(), Arc::new(client));
        let mut profiles = self.profiles.lock().expect("profile table poisoned");
        if let Some(stored) = profiles.get_mut(connection) {
            stored.database = database.to_string();
        }
        Ok(())
    }

    async fn disconnect(&self, connection: &ConnectionId) {
        self.clients
            .lock()
            .expect("client table poisoned")
            .remove(connection);
        self.profiles
            .lock()
            .expect("profile table poisoned")
            .remove(connection);
    }
}

fn to_catalog_error(err: tokio_postgres::Error) -> CatalogFetchError {
    CatalogFetchError::new(err.to_string())
}

#[async_trait]
impl CatalogProvider for PostgresBackend {
    async fn databases(
        &self,
        connection: &ConnectionId,
    ) -> Result<Vec<DatabaseInfo>, CatalogFetchError> {
        let client = self.client_for_catalog(connection)?;
        let rows = client
            .query(
                "SELECT d.datname,
                        pg_get_userbyid(d.datdba) AS owner,
                        pg_encoding_to_char(d.encoding) AS encoding,
                        d.datname = current_database() AS is_current
                 FROM pg_database d
                 WHERE d.datistemplate = false
                 ORDER BY d.datname = current_database() DESC, d.datname",
                &[],
            )
            .await
            .map_err(to_catalog_error)?;

        Ok(rows
            .iter()
            .map(|row| DatabaseInfo {
                name: row.get(0),
                owner: row.get(1),
                encoding: row.get(2),
                is_current: row.get(3),
            })
            .collect())
    }

    async fn schemas(
        &self,
        connection: &ConnectionId,
    ) -> Result<Vec<SchemaInfo>, CatalogFetchError> {
        let client = self.client_for_catalog(connection)?;
        let rows = client
            .query(
                "SELECT schema_name, schema_owner
                 FROM information_schema.schemata
                 WHERE schema_name NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
                 ORDER BY schema_name",
                &[],
            )
            .await
            .map_err(to_catalog_error)?;

        Ok(rows
            .iter()
            .map(|row| SchemaInfo {
                name: row.get(0),
                owner: row.get(1),
            })
            .collect())
    }

    async fn tables(
        &self,
        connection: &ConnectionId,
        schema: &str,
    ) -> Result<Vec<TableInfo>, CatalogFetchError> {
        let client = self.client_for_catalog(connection)?;
        let rows = client
            .query(
                "SELECT
                    t.table_name,
                    t.table_type,
                    COALESCE(c.reltuples::bigint, 0) AS row_estimate,
                    COALESCE(pg_size_pretty(pg_total_relation_size(
                        quote_ident(t.table_schema) || '.' || quote_ident(t.table_name))),
                        '0 bytes') AS size
                 FROM information_schema.tables t
                 LEFT JOIN pg_class c ON c.relname = t.table_name
                 LEFT JOIN pg_namespace n
                    ON n.oid = c.relnamespace AND n.nspname = t.table_schema
                 WHERE t.table_schema = $1
                 ORDER BY t.table_name",
                &[&schema],
            )
            .await
            .map_err(to_catalog_error)?;

        Ok(rows
            .iter()
            .map(|row| TableInfo {
                name: row.get(0),
                table_type: row.get(1),
                row_estimate: row.get(2),
                total_size: row.get(3),
            })
            .collect())
    }

    async fn columns(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, CatalogFetchError> {
        let client = self.client_for_catalog(connection)?;
        let rows = client
            .query(
                "SELECT
                    c.column_name,
                    c.data_type,
                    c.is_nullable = 'YES' AS is_nullable,
                    c.column_default,
                    COALESCE(pk.is_pk, false) AS is_primary_key,
                    COALESCE(fk.is_fk, false) AS is_foreign_key,
                    c.ordinal_position::int
                 FROM information_schema.columns c
                 LEFT JOIN (
                    SELECT kcu.column_name, true AS is_pk
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                        AND tc.table_schema = $1
                        AND tc.table_name = $2
                 ) pk ON pk.column_name = c.column_name
                 LEFT JOIN (
                    SELECT kcu.column_name, true AS is_fk
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                    WHERE tc.constraint_type = 'FOREIGN KEY'
                        AND tc.table_schema = $1
                        AND tc.table_name = $2
                 ) fk ON fk.column_name = c.column_name
                 WHERE c.table_schema = $1 AND c.table_name = $2
                 ORDER BY c.ordinal_position",
                &[&schema, &table],
            )
            .await
            .map_err(to_catalog_error)?;

        Ok(rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get(0),
                data_type: row.get(1),
                is_nullable: row.get(2),
                default_value: row.get(3),
                is_primary_key: row.get(4),
                is_foreign_key: row.get(5),
                ordinal: row.get(6),
            })
            .collect())
    }

    async fn constraints(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ConstraintInfo>, CatalogFetchError> {
        let client = self.client_for_catalog(connection)?;
        let rows = client
            .query(
                "SELECT
                    con.conname,
                    CASE con.contype
                        WHEN 'p' THEN 'PRIMARY KEY'
                        WHEN 'f' THEN 'FOREIGN KEY'
                        WHEN 'u' THEN 'UNIQUE'
                        WHEN 'c' THEN 'CHECK'
                        WHEN 'x' THEN 'EXCLUSION'
                        ELSE con.contype::text
                    END AS constraint_type,
                    pg_get_constraintdef(con.oid, true) AS definition
                 FROM pg_constraint con
                 JOIN pg_class c ON c.oid = con.conrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1 AND c.relname = $2
                 ORDER BY con.contype, con.conname",
                &[&schema, &table],
            )
            .await
            .map_err(to_catalog_error)?;

        Ok(rows
            .iter()
            .map(|row| ConstraintInfo {
                name: row.get(0),
                constraint_type: row.get(1),
                definition: row.get(2),
            })
            .collect())
    }

    async fn indexes(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<IndexInfo>, CatalogFetchError> {
        let client = self.client_for_catalog(connection)?;
        let rows = client
            .query(
                "SELECT
                    i.relname AS index_name,
                    pg_get_indexdef(i.oid) AS definition,
                    ix.indisunique AS is_unique,
                    ix.indisprimary AS is_primary
                 FROM pg_index ix
                 JOIN pg_class i ON i.oid = ix.indexrelid
                 JOIN pg_class t ON t.oid = ix.indrelid
                 JOIN pg_namespace n ON n.oid = t.relnamespace
                 WHERE n.nspname = $1 AND t.relname = $2
                 ORDER BY i.relname",
                &[&schema, &table],
            )
            .await
            .map_err(to_catalog_error)?;

        Ok(rows
            .iter()
            .map(|row| IndexInfo {
                name: row.get(0),
                definition: row.get(1),
                is_unique: row.get(2),
                is_primary: row.get(3),
            })
            .collect())
    }

    async fn triggers(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<TriggerInfo>, CatalogFetchError> {
        let client = self.client_for_catalog(connection)?;
        let rows = client
            .query(
                "SELECT
                    t.tgname AS name,
                    CASE
                        WHEN t.tgtype::int & 2 = 2 THEN 'BEFORE'
                        WHEN t.tgtype::int & 64 = 64 THEN 'INSTEAD OF'
                        ELSE 'AFTER'
                    END AS timing,
                    array_to_string(ARRAY[]::text[]
                        || CASE WHEN t.tgtype::int & 4 = 4 THEN 'INSERT' END
                        || CASE WHEN t.tgtype::int & 8 = 8 THEN 'DELETE' END
                        || CASE WHEN t.tgtype::int & 16 = 16 THEN 'UPDATE' END
                        || CASE WHEN t.tgtype::int & 32 = 32 THEN 'TRUNCATE' END,
                        ' OR ') AS event,
                    pg_get_triggerdef(t.oid, true) AS definition
                 FROM pg_trigger t
                 JOIN pg_class c ON c.oid = t.tgrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1 AND c.relname = $2
                   AND NOT t.tgisinternal
                 ORDER BY t.tgname",
                &[&schema, &table],
            )
            .await
            .map_err(to_catalog_error)?;

        Ok(rows
            .iter()
            .map(|row| TriggerInfo {
                name: row.get(0),
                timing: row.get(1),
                event: row.get(2),
                definition: row.get(3),
            })
            .collect())
    }

    async fn rules(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<RuleInfo>, CatalogFetchError> {
        let client = self.client_for_catalog(connection)?;
        let rows = client
            .query(
                "SELECT r.rulename, pg_get_ruledef(r.oid, true) AS definition
                 FROM pg_rewrite r
                 JOIN pg_class c ON c.oid = r.ev_class
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1 AND c.relname = $2
                   AND r.rulename != '_RETURN'
                 ORDER BY r.rulename",
                &[&schema, &table],
            )
            .await
            .map_err(to_catalog_error)?;

        Ok(rows
            .iter()
            .map(|row| RuleInfo {
                name: row.get(0),
                definition: row.get(1),
            })
            .collect())
    }

    async fn policies(
        &self,
        connection: &ConnectionId,
        schema: &str,
        table: &str,
    ) -> Result<Vec<PolicyInfo>, CatalogFetchError> {
        let client = self.client_for_catalog(connection)?;
        let rows = client
            .query(
                "SELECT
                    pol.polname AS name,
                    CASE pol.polcmd
                        WHEN 'r' THEN 'SELECT'
                        WHEN 'a' THEN 'INSERT'
                        WHEN 'w' THEN 'UPDATE'
                        WHEN 'd' THEN 'DELETE'
                        WHEN '*' THEN 'ALL'
                        ELSE pol.polcmd::text
                    END AS command,
                    COALESCE(
                        (SELECT array_agg(r.rolname)
                         FROM unnest(pol.polroles) AS role_oid
                         JOIN pg_roles r ON r.oid = role_oid),
                        ARRAY['PUBLIC']::text[]
                    ) AS roles,
                    pg_get_expr(pol.polqual, pol.polrelid, true) AS using_expr,
                    pg_get_expr(pol.polwithcheck, pol.polrelid, true) AS check_expr
                 FROM pg_policy pol
                 JOIN pg_class c ON c.oid = pol.polrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = $1 AND c.relname = $2
                 ORDER BY pol.polname",
                &[&schema, &table],
            )
            .await
            .map_err(to_catalog_error)?;

        Ok(rows
            .iter()
            .map(|row| PolicyInfo {
                name: row.get(0),
                command: row.get(1),
                roles: row.get(2),
                using_expression: row.get(3),
                check_expression: row.get(4),
            })
            .collect())
    }
}

#[async_trait]
impl QueryExecutor for PostgresBackend {
    async fn execute(
        &self,
        connection: &ConnectionId,
        sql: &str,
    ) -> Result<QueryOutcome, QueryError> {
        let client = self.client_for_query(connection)?;
        let start = Instant::now();

        let statement = client
            .prepare(sql)
            .await
            .map_err(|err| QueryError::new(err.to_string()))?;
        let rows = client
            .query(&statement, &[])
            .await
            .map_err(|err| QueryError::new(err.to_string()))?;
        let timing = start.elapsed();

        let columns: Vec<ColumnDef> = statement
            .columns()
            .iter()
            .map(|column| ColumnDef {
                name: column.name().to_string(),
                data_type: pg_type_to_string(column.type_()),
            })
            .collect();

        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for (index, column) in statement.columns().iter().enumerate() {
                values.push(pg_value_to_json(row, index, column.type_()));
            }
            decoded.push(values);
        }

        let row_count = decoded.len();
        Ok(QueryOutcome {
            columns,
            rows: decoded,
            row_count,
            timing,
        })
    }
}

fn pg_type_to_string(pg_type: &Type) -> String {
    match *pg_type {
        Type::BOOL => "boolean".into(),
        Type::INT2 => "smallint".into(),
        Type::INT4 => "integer".into(),
        Type::INT8 => "bigint".into(),
        Type::FLOAT4 => "real".into(),
        Type::FLOAT8 => "double precision".into(),
        Type::NUMERIC => "numeric".into(),
        Type::VARCHAR => "varchar".into(),
        Type::TEXT => "text".into(),
        Type::BPCHAR => "char".into(),
        Type::TIMESTAMP => "timestamp".into(),
        Type::TIMESTAMPTZ => "timestamptz".into(),
        Type::DATE => "date".into(),
        Type::TIME => "time".into(),
        Type::UUID => "uuid".into(),
        Type::JSON => "json".into(),
        Type::JSONB => "jsonb".into(),
        Type::BYTEA => "bytea".into(),
        _ => pg_type.name().to_string(),
    }
}

/// Typed decode where the type is cheap to map, text fallback otherwise.
/// NULL and undecodable cells both land as JSON null.
fn pg_value_to_json(row: &Row, index: usize, pg_type: &Type) -> Value {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::Number(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::Number(v.into())),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::Number(v.into())),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(f64::from(v)))
            .map_or(Value::Null, Value::Number),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(index)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<Value>>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::String),
    }
}
