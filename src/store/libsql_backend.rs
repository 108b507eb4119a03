//! libSQL backend: `StateStore` over a local file or in-memory database.
//!
//! SQLite has no schemas, so tenancy is a table prefix (see
//! [`SchemaManager`]). One connection is shared by all callers; writes go
//! through a gate so a batch transaction never interleaves with a single-row
//! write on the same connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::DatabaseError;
use crate::store::schema::{Dialect, SchemaManager};
use crate::store::{
    Category, ConversationKey, RowWrite, StateKey, StateStore, parse_participant_key,
};

/// libSQL-backed state store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    schema: SchemaManager,
    write_gate: Arc<Mutex<()>>,
}

impl LibSqlStore {
    /// Open the database named by `config.path` (`:memory:` included).
    pub async fn open(config: &StoreConfig) -> Result<Self, DatabaseError> {
        if config.path.as_os_str() == ":memory:" {
            Self::new_memory(&config.schema, config.timestamp).await
        } else {
            Self::new_local(&config.path, &config.schema, config.timestamp).await
        }
    }

    /// Open (or create) a local database file.
    pub async fn new_local(
        path: &Path,
        schema: &str,
        timestamps: bool,
    ) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db, schema, timestamps)?;
        info!(path = %path.display(), schema, "libSQL database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(schema: &str, timestamps: bool) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, schema, timestamps)
    }

    fn from_database(
        db: LibSqlDatabase,
        schema: &str,
        timestamps: bool,
    ) -> Result<Self, DatabaseError> {
        let schema = SchemaManager::new(schema, Dialect::Sqlite, timestamps)?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            schema,
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Another store on the same database and connection, under a different
    /// schema name.
    pub fn with_schema(&self, schema: &str) -> Result<Self, DatabaseError> {
        Ok(Self {
            db: Arc::clone(&self.db),
            conn: self.conn.clone(),
            schema: SchemaManager::new(schema, Dialect::Sqlite, self.schema.timestamps())?,
            write_gate: Arc::clone(&self.write_gate),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    fn key_params(key: &StateKey) -> Vec<Value> {
        match key {
            StateKey::Conversation { name, key } => {
                vec![Value::Text(name.clone()), Value::Text(key.to_text())]
            }
            other => vec![Value::Integer(other.row_id().unwrap_or_default())],
        }
    }

    async fn execute_write(&self, conn: &Connection, write: &RowWrite) -> Result<(), DatabaseError> {
        match write {
            RowWrite::Upsert { key, value } => {
                let sql = self.schema.sql(key.category());
                let mut params = Self::key_params(key);
                params.push(Value::Blob(value.clone()));
                if self.schema.timestamps() {
                    params.push(Value::Text(now_timestamp()));
                }
                conn.execute(&sql.upsert, params)
                    .await
                    .map_err(|e| classify("upsert", e))?;
            }
            RowWrite::Delete { key } => {
                let sql = self.schema.sql(key.category());
                conn.execute(&sql.delete, Self::key_params(key))
                    .await
                    .map_err(|e| classify("delete", e))?;
            }
        }
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so text comparison matches time order.
fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Map a libSQL error onto the crate's error kinds.
fn classify(context: &str, e: libsql::Error) -> DatabaseError {
    match &e {
        libsql::Error::SqliteFailure(code, msg) => match *code & 0xff {
            // SQLITE_BUSY, SQLITE_LOCKED
            5 | 6 => DatabaseError::Connection(format!("{context}: {msg}")),
            // SQLITE_PERM, SQLITE_AUTH
            3 | 23 => DatabaseError::Authorization(format!("{context}: {msg}")),
            // SQLITE_CONSTRAINT
            19 => DatabaseError::Constraint(format!("{context}: {msg}")),
            _ => DatabaseError::Query(format!("{context}: {msg}")),
        },
        libsql::Error::ConnectionFailed(msg) => {
            DatabaseError::Connection(format!("{context}: {msg}"))
        }
        _ => DatabaseError::Query(format!("{context}: {e}")),
    }
}

fn schema_err(e: libsql::Error) -> DatabaseError {
    match classify("ensure_schema", e) {
        auth @ DatabaseError::Authorization(_) => auth,
        other => DatabaseError::Schema(other.to_string()),
    }
}

fn read_err(context: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("{context}: failed to read row: {e}"))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl StateStore for LibSqlStore {
    fn backend_name(&self) -> &'static str {
        "libsql"
    }

    fn schema(&self) -> &str {
        self.schema.schema()
    }

    async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let conn = self.conn();
        for stmt in self.schema.create_statements() {
            conn.execute(&stmt, ()).await.map_err(schema_err)?;
        }
        // Tables created before timestamps were switched on lack the columns
        for stmt in self.schema.add_timestamp_statements() {
            match conn.execute(&stmt, ()).await {
                Ok(_) => {}
                Err(e) if e.to_string().contains("duplicate column name") => {}
                Err(e) => return Err(schema_err(e)),
            }
        }
        debug!(schema = self.schema.schema(), "libSQL schema ensured");
        Ok(())
    }

    async fn fetch(&self, key: &StateKey) -> Result<Option<Vec<u8>>, DatabaseError> {
        let sql = self.schema.sql(key.category());
        let mut rows = self
            .conn()
            .query(&sql.select, Self::key_params(key))
            .await
            .map_err(|e| classify("fetch", e))?;

        match rows.next().await.map_err(|e| read_err("fetch", e))? {
            Some(row) => {
                let value: Vec<u8> = row.get(0).map_err(|e| read_err("fetch", e))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn fetch_category(
        &self,
        category: Category,
    ) -> Result<Vec<(StateKey, Vec<u8>)>, DatabaseError> {
        let sql = self.schema.sql(category);
        let mut rows = self
            .conn()
            .query(&sql.select_all, ())
            .await
            .map_err(|e| classify("fetch_category", e))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| read_err("fetch_category", e))? {
            if category == Category::Conversation {
                let name: String = row.get(0).map_err(|e| read_err("fetch_category", e))?;
                let text: String = row.get(1).map_err(|e| read_err("fetch_category", e))?;
                let value: Vec<u8> = row.get(2).map_err(|e| read_err("fetch_category", e))?;
                let key = parse_participant_key(&name, &text)?;
                out.push((StateKey::Conversation { name, key }, value));
            } else {
                let id: i64 = row.get(0).map_err(|e| read_err("fetch_category", e))?;
                let value: Vec<u8> = row.get(1).map_err(|e| read_err("fetch_category", e))?;
                if let Some(key) = StateKey::from_row_id(category, id) {
                    out.push((key, value));
                }
            }
        }
        Ok(out)
    }

    async fn fetch_conversations(
        &self,
        name: &str,
    ) -> Result<Vec<(ConversationKey, Vec<u8>)>, DatabaseError> {
        let sql = self.schema.sql(Category::Conversation);
        let Some(select) = sql.select_by_name.as_deref() else {
            return Ok(Vec::new());
        };
        let mut rows = self
            .conn()
            .query(select, vec![Value::Text(name.to_string())])
            .await
            .map_err(|e| classify("fetch_conversations", e))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| read_err("fetch_conversations", e))?
        {
            let text: String = row.get(0).map_err(|e| read_err("fetch_conversations", e))?;
            let value: Vec<u8> = row.get(1).map_err(|e| read_err("fetch_conversations", e))?;
            out.push((parse_participant_key(name, &text)?, value));
        }
        Ok(out)
    }

    async fn upsert(&self, key: &StateKey, value: &[u8]) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let write = RowWrite::Upsert {
            key: key.clone(),
            value: value.to_vec(),
        };
        self.execute_write(self.conn(), &write).await?;
        debug!(key = %key, bytes = value.len(), "Row upserted");
        Ok(())
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let sql = self.schema.sql(key.category());
        let affected = self
            .conn()
            .execute(&sql.delete, Self::key_params(key))
            .await
            .map_err(|e| classify("delete", e))?;
        debug!(key = %key, existed = affected > 0, "Row deleted");
        Ok(affected > 0)
    }

    async fn apply_batch(&self, writes: &[RowWrite]) -> Result<(), DatabaseError> {
        if writes.is_empty() {
            return Ok(());
        }
        let _gate = self.write_gate.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| classify("begin", e))?;

        let mut result = Ok(());
        for write in writes {
            if let Err(e) = self.execute_write(&tx, write).await {
                result = Err(e);
                break;
            }
        }

        match result {
            Ok(()) => {
                tx.commit().await.map_err(|e| classify("commit", e))?;
                debug!(rows = writes.len(), "Batch committed");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}
