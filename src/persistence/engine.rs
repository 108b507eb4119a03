//! Cached, write-through (or buffered) implementation of [`BotPersistence`].
//!
//! Every key has its own FIFO lock, so writes to one key are applied in the
//! order they were issued while unrelated keys proceed in parallel. A writer
//! publishes its value to the cache before calling the store and rolls the
//! entry back if the store rejects it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::{BotPersistence, EngineOptions};
use crate::codec;
use crate::config::StoreConfig;
use crate::error::{DatabaseError, Error};
use crate::store::retry::{with_retry, with_timeout};
use crate::store::{self, Category, ConversationKey, RowWrite, StateKey, StateStore};

/// Lock table size above which idle per-key locks are pruned.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Cached state of one key. `value: None` means the row is known to be absent.
#[derive(Debug, Clone, PartialEq)]
struct CacheEntry {
    value: Option<Value>,
    dirty: bool,
}

impl CacheEntry {
    fn clean(value: Option<Value>) -> Self {
        Self {
            value,
            dirty: false,
        }
    }
}

pub struct PersistenceEngine {
    store: Arc<dyn StateStore>,
    options: EngineOptions,
    cache: RwLock<HashMap<StateKey, CacheEntry>>,
    key_locks: Mutex<HashMap<StateKey, Arc<Mutex<()>>>>,
    /// Writers hold it shared for their whole store round trip; flush takes it
    /// exclusively so it returns only after earlier writes are acknowledged.
    in_flight: RwLock<()>,
    flush_gate: Mutex<()>,
}

impl PersistenceEngine {
    /// Open the configured backend, create its tables and wrap it.
    pub async fn connect(config: &StoreConfig) -> Result<Self, Error> {
        config.validate()?;
        let store = with_retry(&config.retry, "connect", || store::connect(config)).await?;
        store.ensure_schema().await?;

        info!(
            backend = store.backend_name(),
            schema = store.schema(),
            on_flush = config.on_flush,
            "Persistence engine ready"
        );
        Ok(Self::with_store(store, EngineOptions::from(config)))
    }

    /// Wrap an already-initialized store.
    pub fn with_store(store: Arc<dyn StateStore>, options: EngineOptions) -> Self {
        Self {
            store,
            options,
            cache: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            in_flight: RwLock::new(()),
            flush_gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Drop the cached copy of `key` so the next read goes to storage.
    ///
    /// Buffered (unflushed) values are kept. Returns whether anything was evicted.
    pub async fn evict(&self, key: &StateKey) -> bool {
        let mut cache = self.cache.write().await;
        let evictable = cache.get(key).is_some_and(|entry| !entry.dirty);
        if evictable {
            cache.remove(key);
        }
        evictable
    }

    /// Drop every cached value except those still waiting for a flush.
    pub async fn clear_cache(&self) {
        self.cache.write().await.retain(|_, entry| entry.dirty);
    }

    async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        with_timeout(
            self.options.operation_timeout,
            with_retry(&self.options.retry, operation, op),
        )
        .await
    }

    async fn lock_key(&self, key: &StateKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().await;
            if locks.len() >= LOCK_TABLE_PRUNE_AT {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    async fn cached(&self, key: &StateKey) -> Option<Option<Value>> {
        self.cache.read().await.get(key).map(|entry| entry.value.clone())
    }

    async fn load(&self, key: &StateKey) -> Result<Option<Value>, DatabaseError> {
        let raw = self.run("fetch", || self.store.fetch(key)).await?;
        raw.map(|bytes| codec::decode(&key.to_string(), &bytes))
            .transpose()
    }

    async fn get(&self, key: StateKey) -> Result<Option<Value>, DatabaseError> {
        if let Some(value) = self.cached(&key).await {
            return Ok(value);
        }

        let _guard = self.lock_key(&key).await;
        // A writer holding the lock may have filled the cache meanwhile.
        if let Some(value) = self.cached(&key).await {
            return Ok(value);
        }

        let value = self.load(&key).await?;
        debug!(key = %key, found = value.is_some(), "Loaded state from store");
        self.cache
            .write()
            .await
            .insert(key, CacheEntry::clean(value.clone()));
        Ok(value)
    }

    async fn refresh(&self, key: StateKey) -> Result<Option<Value>, DatabaseError> {
        let _guard = self.lock_key(&key).await;
        {
            let mut cache = self.cache.write().await;
            if let Some(entry) = cache.get(&key) {
                if entry.dirty {
                    return Ok(entry.value.clone());
                }
            }
            cache.remove(&key);
        }

        let value = self.load(&key).await?;
        self.cache
            .write()
            .await
            .insert(key, CacheEntry::clean(value.clone()));
        Ok(value)
    }

    /// Replace (`Some`) or delete (`None`) the value stored under `key`.
    async fn put(&self, key: StateKey, value: Option<Value>) -> Result<(), DatabaseError> {
        if let Some(v) = &value {
            if self.options.skip_null && codec::is_empty_value(v) {
                debug!(key = %key, "Skipping empty value");
                return Ok(());
            }
        }

        let _in_flight = self.in_flight.read().await;
        let _guard = self.lock_key(&key).await;
        let previous = self.cache.read().await.get(&key).cloned();
        if previous.as_ref().is_some_and(|entry| entry.value == value) {
            return Ok(());
        }

        let name = key.to_string();
        let encoded = value
            .as_ref()
            .map(|v| codec::encode(&name, v))
            .transpose()?;

        self.cache.write().await.insert(
            key.clone(),
            CacheEntry {
                value,
                dirty: self.options.on_flush,
            },
        );
        if self.options.on_flush {
            debug!(key = %name, "Buffered state until flush");
            return Ok(());
        }

        let result = match &encoded {
            Some(bytes) => self.run("upsert", || self.store.upsert(&key, bytes)).await,
            None => self
                .run("delete", || self.store.delete(&key))
                .await
                .map(|_| ()),
        };

        if let Err(e) = &result {
            let mut cache = self.cache.write().await;
            match (e, previous) {
                // The write may or may not have landed.
                (DatabaseError::Timeout(_), _) | (_, None) => {
                    cache.remove(&key);
                }
                (_, Some(entry)) => {
                    cache.insert(key, entry);
                }
            }
            warn!(key = %name, error = %e, "State write failed");
        }
        result
    }

    /// Cache the stored rows of a bulk read, then overlay buffered writes.
    ///
    /// Keys already cached keep their entry: a writer publishes to the cache
    /// before its store call, so the cached value is never older than `stored`.
    async fn merge_bulk<F>(
        &self,
        mut stored: HashMap<StateKey, Value>,
        filter: F,
    ) -> HashMap<StateKey, Value>
    where
        F: Fn(&StateKey) -> bool,
    {
        let mut cache = self.cache.write().await;
        for (key, value) in &stored {
            cache
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::clean(Some(value.clone())));
        }
        for (key, entry) in cache.iter().filter(|(k, s)| s.dirty && filter(*k)) {
            match &entry.value {
                Some(value) => {
                    stored.insert(key.clone(), value.clone());
                }
                None => {
                    stored.remove(key);
                }
            }
        }
        stored
    }

    async fn get_all(&self, category: Category) -> Result<HashMap<i64, Value>, DatabaseError> {
        let rows = self
            .run("fetch_category", || self.store.fetch_category(category))
            .await?;

        let mut stored = HashMap::with_capacity(rows.len());
        for (key, bytes) in rows {
            let value = codec::decode(&key.to_string(), &bytes)?;
            stored.insert(key, value);
        }

        let merged = self
            .merge_bulk(stored, |key| key.category() == category)
            .await;
        Ok(merged
            .into_iter()
            .filter_map(|(key, value)| key.row_id().map(|id| (id, value)))
            .collect())
    }

    async fn flush_pending(&self) -> Result<(), DatabaseError> {
        let _gate = self.flush_gate.lock().await;
        let pending: Vec<(StateKey, Option<Value>)> = self
            .cache
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        if pending.is_empty() {
            debug!("Nothing to flush");
            return Ok(());
        }

        let writes = pending
            .iter()
            .map(|(key, value)| match value {
                Some(v) => codec::encode(&key.to_string(), v).map(|bytes| RowWrite::Upsert {
                    key: key.clone(),
                    value: bytes,
                }),
                None => Ok(RowWrite::Delete { key: key.clone() }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if let Err(e) = self.run("flush", || self.store.apply_batch(&writes)).await {
            warn!(rows = writes.len(), error = %e, "Flush failed, buffered state kept");
            return Err(e);
        }

        // Keys rewritten while the batch was in flight stay dirty.
        let mut cache = self.cache.write().await;
        for (key, value) in pending {
            if let Some(entry) = cache.get_mut(&key) {
                if entry.value == value {
                    entry.dirty = false;
                }
            }
        }
        info!(rows = writes.len(), "Flushed buffered state");
        Ok(())
    }
}

#[async_trait]
impl BotPersistence for PersistenceEngine {
    async fn get_bot_data(&self) -> Result<Option<Value>, DatabaseError> {
        self.get(StateKey::Bot).await
    }

    async fn get_chat_data(&self, chat_id: i64) -> Result<Option<Value>, DatabaseError> {
        self.get(StateKey::Chat(chat_id)).await
    }

    async fn get_all_chat_data(&self) -> Result<HashMap<i64, Value>, DatabaseError> {
        self.get_all(Category::Chat).await
    }

    async fn get_user_data(&self, user_id: i64) -> Result<Option<Value>, DatabaseError> {
        self.get(StateKey::User(user_id)).await
    }

    async fn get_all_user_data(&self) -> Result<HashMap<i64, Value>, DatabaseError> {
        self.get_all(Category::User).await
    }

    async fn get_callback_data(&self) -> Result<Option<Value>, DatabaseError> {
        self.get(StateKey::Callback).await
    }

    async fn get_conversation(
        &self,
        name: &str,
        key: &ConversationKey,
    ) -> Result<Option<Value>, DatabaseError> {
        self.get(StateKey::conversation(name, key.clone())).await
    }

    async fn get_conversations(
        &self,
        name: &str,
    ) -> Result<HashMap<ConversationKey, Value>, DatabaseError> {
        let rows = self
            .run("fetch_conversations", || self.store.fetch_conversations(name))
            .await?;

        let mut stored = HashMap::with_capacity(rows.len());
        for (participants, bytes) in rows {
            let key = StateKey::conversation(name, participants);
            let value = codec::decode(&key.to_string(), &bytes)?;
            stored.insert(key, value);
        }

        let merged = self
            .merge_bulk(stored, |key| {
                matches!(key, StateKey::Conversation { name: n, .. } if n == name)
            })
            .await;
        Ok(merged
            .into_iter()
            .filter_map(|(key, value)| match key {
                StateKey::Conversation { key, .. } => Some((key, value)),
                _ => None,
            })
            .collect())
    }

    async fn update_bot_data(&self, data: Value) -> Result<(), DatabaseError> {
        self.put(StateKey::Bot, Some(data)).await
    }

    async fn update_chat_data(&self, chat_id: i64, data: Value) -> Result<(), DatabaseError> {
        self.put(StateKey::Chat(chat_id), Some(data)).await
    }

    async fn update_user_data(&self, user_id: i64, data: Value) -> Result<(), DatabaseError> {
        self.put(StateKey::User(user_id), Some(data)).await
    }

    async fn update_callback_data(&self, data: Value) -> Result<(), DatabaseError> {
        self.put(StateKey::Callback, Some(data)).await
    }

    async fn update_conversation(
        &self,
        name: &str,
        key: ConversationKey,
        state: Option<Value>,
    ) -> Result<(), DatabaseError> {
        self.put(StateKey::conversation(name, key), state).await
    }

    async fn drop_chat_data(&self, chat_id: i64) -> Result<(), DatabaseError> {
        self.put(StateKey::Chat(chat_id), None).await
    }

    async fn drop_user_data(&self, user_id: i64) -> Result<(), DatabaseError> {
        self.put(StateKey::User(user_id), None).await
    }

    async fn refresh_bot_data(&self) -> Result<Option<Value>, DatabaseError> {
        self.refresh(StateKey::Bot).await
    }

    async fn refresh_chat_data(&self, chat_id: i64) -> Result<Option<Value>, DatabaseError> {
        self.refresh(StateKey::Chat(chat_id)).await
    }

    async fn refresh_user_data(&self, user_id: i64) -> Result<Option<Value>, DatabaseError> {
        self.refresh(StateKey::User(user_id)).await
    }

    async fn flush(&self) -> Result<(), DatabaseError> {
        let _drained = self.in_flight.write().await;
        if !self.options.on_flush {
            return Ok(());
        }
        self.flush_pending().await
    }
}
