//! Test doubles for exercising retry, timeout and cache behavior.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::store::{Category, ConversationKey, LibSqlStore, RowWrite, StateKey, StateStore};

/// Wraps a store and injects failures or latency into writes and reads.
pub struct FaultyStore {
    inner: Arc<dyn StateStore>,
    failures_left: AtomicU32,
    failure: Mutex<DatabaseError>,
    write_delay: Mutex<Option<Duration>>,
    schema_failure: Mutex<Option<DatabaseError>>,
    pub schema_calls: AtomicU32,
    pub fetches: AtomicU32,
    pub writes: AtomicU32,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(0),
            failure: Mutex::new(DatabaseError::Connection("connection reset by peer".into())),
            write_delay: Mutex::new(None),
            schema_failure: Mutex::new(None),
            schema_calls: AtomicU32::new(0),
            fetches: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        }
    }

    /// A fresh in-memory libSQL store with its schema in place.
    pub async fn memory(schema: &str) -> Self {
        let store = LibSqlStore::new_memory(schema, true).await.unwrap();
        store.ensure_schema().await.unwrap();
        Self::new(Arc::new(store))
    }

    /// Fail the next `count` calls (reads and writes) with `error`.
    pub fn fail_next(&self, count: u32, error: DatabaseError) {
        *self.failure.lock().unwrap() = error;
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Make every later `ensure_schema` call fail with `error`.
    pub fn fail_schema(&self, error: DatabaseError) {
        *self.schema_failure.lock().unwrap() = Some(error);
    }

    pub fn delay_writes(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    fn injected(&self) -> Result<(), DatabaseError> {
        let took = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(self.failure.lock().unwrap().clone()),
            Err(_) => Ok(()),
        }
    }

    async fn before_write(&self) -> Result<(), DatabaseError> {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.injected()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl StateStore for FaultyStore {
    fn backend_name(&self) -> &'static str {
        "faulty"
    }

    fn schema(&self) -> &str {
        self.inner.schema()
    }

    async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.schema_failure.lock().unwrap().clone();
        if let Some(error) = failure {
            return Err(error);
        }
        self.inner.ensure_schema().await
    }

    async fn fetch(&self, key: &StateKey) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.injected()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(key).await
    }

    async fn fetch_category(
        &self,
        category: Category,
    ) -> Result<Vec<(StateKey, Vec<u8>)>, DatabaseError> {
        self.injected()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_category(category).await
    }

    async fn fetch_conversations(
        &self,
        name: &str,
    ) -> Result<Vec<(ConversationKey, Vec<u8>)>, DatabaseError> {
        self.injected()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_conversations(name).await
    }

    async fn upsert(&self, key: &StateKey, value: &[u8]) -> Result<(), DatabaseError> {
        self.before_write().await?;
        self.inner.upsert(key, value).await
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, DatabaseError> {
        self.before_write().await?;
        self.inner.delete(key).await
    }

    async fn apply_batch(&self, writes: &[RowWrite]) -> Result<(), DatabaseError> {
        self.before_write().await?;
        self.inner.apply_batch(writes).await
    }
}
