//! PostgreSQL backend: `StateStore` over a `sqlx` connection pool.
//!
//! Tenancy is a real schema per deployment. The pool bounds concurrent
//! queries; callers queue for a connection up to the acquire timeout.

use std::str::FromStr;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::Row;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::query::Query;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::DatabaseError;
use crate::store::schema::{Dialect, SchemaManager};
use crate::store::{
    Category, ConversationKey, RowWrite, StateKey, StateStore, parse_participant_key,
};

type PgQuery<'q> = Query<'q, sqlx::Postgres, PgArguments>;

/// SQLSTATEs raised when two sessions race on `CREATE ... IF NOT EXISTS`.
const DDL_RACE_CODES: [&str; 3] = ["23505", "42P06", "42P07"];

/// PostgreSQL-backed state store.
pub struct PostgresStore {
    pool: PgPool,
    schema: SchemaManager,
}

impl PostgresStore {
    /// Build a pool from `config` (URL or discrete fields).
    pub async fn connect(config: &StoreConfig) -> Result<Self, DatabaseError> {
        let options = connect_options(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(|e| classify("connect", e))?;
        let store = Self::from_pool(pool, &config.schema, config.timestamp)?;
        info!(
            schema = %config.schema,
            max_connections = config.max_connections,
            "PostgreSQL pool ready"
        );
        Ok(store)
    }

    pub fn from_pool(pool: PgPool, schema: &str, timestamps: bool) -> Result<Self, DatabaseError> {
        Ok(Self {
            pool,
            schema: SchemaManager::new(schema, Dialect::Postgres, timestamps)?,
        })
    }

    /// Another store sharing this pool under a different schema name.
    pub fn with_schema(&self, schema: &str) -> Result<Self, DatabaseError> {
        Self::from_pool(self.pool.clone(), schema, self.schema.timestamps())
    }

    fn bind_key<'q>(query: PgQuery<'q>, key: &StateKey) -> PgQuery<'q> {
        match key {
            StateKey::Conversation { name, key } => query.bind(name.clone()).bind(key.to_text()),
            other => query.bind(other.row_id().unwrap_or_default()),
        }
    }

    fn write_query<'q>(&'q self, write: &RowWrite) -> PgQuery<'q> {
        match write {
            RowWrite::Upsert { key, value } => {
                let sql = self.schema.sql(key.category());
                Self::bind_key(sqlx::query(&sql.upsert), key).bind(value.clone())
            }
            RowWrite::Delete { key } => {
                let sql = self.schema.sql(key.category());
                Self::bind_key(sqlx::query(&sql.delete), key)
            }
        }
    }
}

/// Connection options from a URL when given, otherwise from the discrete fields.
pub fn connect_options(config: &StoreConfig) -> Result<PgConnectOptions, DatabaseError> {
    match &config.url {
        Some(url) => PgConnectOptions::from_str(url)
            .map_err(|e| DatabaseError::Query(format!("invalid connection url: {e}"))),
        None => Ok(PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(config.password.expose_secret())
            .database(&config.database)),
    }
}

/// Map a sqlx error onto the crate's error kinds using SQLSTATE classes.
fn classify(context: &str, e: sqlx::Error) -> DatabaseError {
    match &e {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            let msg = format!("{context}: {} (SQLSTATE {code})", db.message());
            match code.as_str() {
                // serialization_failure, deadlock_detected, query_canceled,
                // too_many_connections, admin_shutdown, cannot_connect_now
                "40001" | "40P01" | "57014" | "53300" | "57P01" | "57P03" => {
                    DatabaseError::Connection(msg)
                }
                "42501" => DatabaseError::Authorization(msg),
                c if c.starts_with("08") => DatabaseError::Connection(msg),
                c if c.starts_with("28") => DatabaseError::Authorization(msg),
                c if c.starts_with("23") => DatabaseError::Constraint(msg),
                c if c.starts_with("3F") || c.starts_with("42") => DatabaseError::Schema(msg),
                _ => DatabaseError::Query(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => DatabaseError::Connection(format!("{context}: {e}")),
        _ => DatabaseError::Query(format!("{context}: {e}")),
    }
}

fn is_ddl_race(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| DDL_RACE_CODES.contains(&&*code)),
        _ => false,
    }
}

fn read_err(context: &str, e: sqlx::Error) -> DatabaseError {
    DatabaseError::Query(format!("{context}: failed to read row: {e}"))
}

#[async_trait]
impl StateStore for PostgresStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn schema(&self) -> &str {
        self.schema.schema()
    }

    async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        let statements = self
            .schema
            .create_statements()
            .into_iter()
            .chain(self.schema.add_timestamp_statements());
        for stmt in statements {
            match sqlx::query(&stmt).execute(&self.pool).await {
                Ok(_) => {}
                Err(e) if is_ddl_race(&e) => {
                    debug!(statement = %stmt, "Concurrent DDL already applied");
                }
                Err(e) => {
                    return Err(match classify("ensure_schema", e) {
                        auth @ DatabaseError::Authorization(_) => auth,
                        conn @ DatabaseError::Connection(_) => conn,
                        other => DatabaseError::Schema(other.to_string()),
                    });
                }
            }
        }
        debug!(schema = self.schema.schema(), "PostgreSQL schema ensured");
        Ok(())
    }

    async fn fetch(&self, key: &StateKey) -> Result<Option<Vec<u8>>, DatabaseError> {
        let sql = self.schema.sql(key.category());
        let row = Self::bind_key(sqlx::query(&sql.select), key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify("fetch", e))?;
        row.map(|row| row.try_get::<Vec<u8>, _>(0).map_err(|e| read_err("fetch", e)))
            .transpose()
    }

    async fn fetch_category(
        &self,
        category: Category,
    ) -> Result<Vec<(StateKey, Vec<u8>)>, DatabaseError> {
        let sql = self.schema.sql(category);
        let rows = sqlx::query(&sql.select_all)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("fetch_category", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if category == Category::Conversation {
                let name: String = row.try_get(0).map_err(|e| read_err("fetch_category", e))?;
                let text: String = row.try_get(1).map_err(|e| read_err("fetch_category", e))?;
                let value: Vec<u8> = row.try_get(2).map_err(|e| read_err("fetch_category", e))?;
                let key = parse_participant_key(&name, &text)?;
                out.push((StateKey::Conversation { name, key }, value));
            } else {
                let id: i64 = row.try_get(0).map_err(|e| read_err("fetch_category", e))?;
                let value: Vec<u8> = row.try_get(1).map_err(|e| read_err("fetch_category", e))?;
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
        let rows = sqlx::query(select)
            .bind(name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify("fetch_conversations", e))?;

        rows.into_iter()
            .map(|row| {
                let text: String = row
                    .try_get(0)
                    .map_err(|e| read_err("fetch_conversations", e))?;
                let value: Vec<u8> = row
                    .try_get(1)
                    .map_err(|e| read_err("fetch_conversations", e))?;
                Ok((parse_participant_key(name, &text)?, value))
            })
            .collect()
    }

    async fn upsert(&self, key: &StateKey, value: &[u8]) -> Result<(), DatabaseError> {
        let write = RowWrite::Upsert {
            key: key.clone(),
            value: value.to_vec(),
        };
        self.write_query(&write)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("upsert", e))?;
        debug!(key = %key, bytes = value.len(), "Row upserted");
        Ok(())
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, DatabaseError> {
        let write = RowWrite::Delete { key: key.clone() };
        let result = self
            .write_query(&write)
            .execute(&self.pool)
            .await
            .map_err(|e| classify("delete", e))?;
        debug!(key = %key, existed = result.rows_affected() > 0, "Row deleted");
        Ok(result.rows_affected() > 0)
    }

    async fn apply_batch(&self, writes: &[RowWrite]) -> Result<(), DatabaseError> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| classify("begin", e))?;
        for write in writes {
            // dropping `tx` on error rolls the transaction back
            self.write_query(write)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify("batch", e))?;
        }
        tx.commit().await.map_err(|e| classify("commit", e))?;
        debug!(rows = writes.len(), "Batch committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Live tests run only against a database named by this variable.
    fn test_url() -> Option<String> {
        std::env::var("CHATSTATE_TEST_DATABASE_URL").ok()
    }

    #[test]
    fn options_from_discrete_fields() {
        let config = StoreConfig {
            host: "db.internal".into(),
            port: 6543,
            username: "bot".into(),
            database: "state".into(),
            ..StoreConfig::default()
        };
        let options = connect_options(&config).unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_username(), "bot");
        assert_eq!(options.get_database(), Some("state"));
    }

    #[test]
    fn url_takes_precedence() {
        let config = StoreConfig {
            host: "ignored".into(),
            url: Some("postgres://alice:pw@pg.example:5433/botdb".into()),
            ..StoreConfig::default()
        };
        let options = connect_options(&config).unwrap();
        assert_eq!(options.get_host(), "pg.example");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "alice");
        assert_eq!(options.get_database(), Some("botdb"));
    }

    #[test]
    fn pool_timeouts_are_transient() {
        assert!(classify("x", sqlx::Error::PoolTimedOut).is_transient());
        assert!(!classify("x", sqlx::Error::RowNotFound).is_transient());
    }

    async fn live_store(schema: &str) -> Option<PostgresStore> {
        let url = test_url()?;
        let config = StoreConfig {
            url: Some(url),
            schema: schema.to_string(),
            ..StoreConfig::default()
        };
        let store = PostgresStore::connect(&config).await.unwrap();
        store.ensure_schema().await.unwrap();
        Some(store)
    }

    #[tokio::test]
    async fn live_upsert_fetch_delete() {
        let Some(store) = live_store("chatstate_test_crud").await else {
            return;
        };
        let key = StateKey::Chat(100);
        store.upsert(&key, b"{\"a\":1}").await.unwrap();
        store.upsert(&key, b"{\"a\":2}").await.unwrap();
        assert_eq!(store.fetch(&key).await.unwrap().unwrap(), b"{\"a\":2}");
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(store.fetch(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_concurrent_ensure_schema() {
        let Some(store) = live_store("chatstate_test_race").await else {
            return;
        };
        let results =
            futures::future::join_all((0..4).map(|_| store.ensure_schema())).await;
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn live_schemas_are_isolated() {
        let Some(a) = live_store("chatstate_test_a").await else {
            return;
        };
        let b = a.with_schema("chatstate_test_b").unwrap();
        b.ensure_schema().await.unwrap();

        a.upsert(&StateKey::User(77), b"\"a\"").await.unwrap();
        b.delete(&StateKey::User(77)).await.unwrap();
        assert!(b.fetch(&StateKey::User(77)).await.unwrap().is_none());
        assert_eq!(a.fetch(&StateKey::User(77)).await.unwrap().unwrap(), b"\"a\"");
    }
}
