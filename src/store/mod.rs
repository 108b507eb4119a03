//! Persistence layer: row-level storage of encoded bot state.
//!
//! [`StateStore`] is the capability set every relational backend provides.
//! The engine and the migration tool only ever talk to this trait; the
//! concrete backend is picked from [`StoreConfig`] by [`connect`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Backend, StoreConfig};
use crate::error::DatabaseError;

pub mod libsql_backend;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod retry;
pub mod schema;
#[cfg(test)]
pub(crate) mod testing;

pub use libsql_backend::LibSqlStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use schema::{Dialect, SchemaManager};

/// Row id used by the bot and callback singletons.
pub const SINGLETON_ID: i64 = 1;

/// One of the five kinds of persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Bot,
    Chat,
    User,
    Conversation,
    Callback,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Bot,
        Category::Chat,
        Category::User,
        Category::Conversation,
        Category::Callback,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Suffix of the `telegram_*` table holding this category.
    pub fn table_suffix(self) -> &'static str {
        match self {
            Category::Bot => "bot",
            Category::Chat => "chat",
            Category::User => "user",
            Category::Conversation => "conversations",
            Category::Callback => "callback",
        }
    }

    /// Top-level key of this category in a legacy snapshot.
    pub fn snapshot_name(self) -> &'static str {
        match self {
            Category::Bot => "bot_data",
            Category::Chat => "chat_data",
            Category::User => "user_data",
            Category::Conversation => "conversations",
            Category::Callback => "callback_data",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.snapshot_name())
    }
}

/// Participants of a conversation, e.g. `(chat_id, user_id)`.
///
/// Stored as canonical JSON text (`[100,7]`) in the `participant_key` column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey(pub Vec<i64>);

impl ConversationKey {
    pub fn new(parts: impl Into<Vec<i64>>) -> Self {
        Self(parts.into())
    }

    pub fn to_text(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        format!("[{}]", parts.join(","))
    }
}

impl FromStr for ConversationKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str::<Vec<i64>>(s)
            .map(ConversationKey)
            .map_err(|e| format!("invalid conversation key '{s}': {e}"))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<(i64, i64)> for ConversationKey {
    fn from((a, b): (i64, i64)) -> Self {
        Self(vec![a, b])
    }
}

/// Address of a single row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateKey {
    Bot,
    Chat(i64),
    User(i64),
    Conversation { name: String, key: ConversationKey },
    Callback,
}

impl StateKey {
    pub fn conversation(name: impl Into<String>, key: impl Into<ConversationKey>) -> Self {
        StateKey::Conversation {
            name: name.into(),
            key: key.into(),
        }
    }

    pub fn category(&self) -> Category {
        match self {
            StateKey::Bot => Category::Bot,
            StateKey::Chat(_) => Category::Chat,
            StateKey::User(_) => Category::User,
            StateKey::Conversation { .. } => Category::Conversation,
            StateKey::Callback => Category::Callback,
        }
    }

    /// Integer primary key for every category except conversations.
    pub fn row_id(&self) -> Option<i64> {
        match self {
            StateKey::Bot | StateKey::Callback => Some(SINGLETON_ID),
            StateKey::Chat(id) | StateKey::User(id) => Some(*id),
            StateKey::Conversation { .. } => None,
        }
    }

    /// Rebuild a key from an integer row id.
    pub fn from_row_id(category: Category, id: i64) -> Option<Self> {
        match category {
            Category::Bot => Some(StateKey::Bot),
            Category::Chat => Some(StateKey::Chat(id)),
            Category::User => Some(StateKey::User(id)),
            Category::Callback => Some(StateKey::Callback),
            Category::Conversation => None,
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKey::Bot => f.write_str("bot_data"),
            StateKey::Chat(id) => write!(f, "chat_data:{id}"),
            StateKey::User(id) => write!(f, "user_data:{id}"),
            StateKey::Conversation { name, key } => write!(f, "conversations:{name}:{key}"),
            StateKey::Callback => f.write_str("callback_data"),
        }
    }
}

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    Upsert { key: StateKey, value: Vec<u8> },
    Delete { key: StateKey },
}

impl RowWrite {
    pub fn key(&self) -> &StateKey {
        match self {
            RowWrite::Upsert { key, .. } | RowWrite::Delete { key } => key,
        }
    }
}

/// Backend-agnostic row storage.
///
/// Values are opaque bytes. Implementations must upsert (never append) and
/// treat deleting a missing row as success.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// The schema (tenancy) name this store reads and writes.
    fn schema(&self) -> &str;

    /// Idempotently create the schema and all five tables.
    async fn ensure_schema(&self) -> Result<(), DatabaseError>;

    /// Read one row's value.
    async fn fetch(&self, key: &StateKey) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Read every row of a category.
    async fn fetch_category(
        &self,
        category: Category,
    ) -> Result<Vec<(StateKey, Vec<u8>)>, DatabaseError>;

    /// Read every entry of one conversation handler.
    async fn fetch_conversations(
        &self,
        name: &str,
    ) -> Result<Vec<(ConversationKey, Vec<u8>)>, DatabaseError>;

    /// Insert or overwrite one row.
    async fn upsert(&self, key: &StateKey, value: &[u8]) -> Result<(), DatabaseError>;

    /// Delete one row. Returns whether a row existed.
    async fn delete(&self, key: &StateKey) -> Result<bool, DatabaseError>;

    /// Apply all writes in a single transaction: all or nothing.
    async fn apply_batch(&self, writes: &[RowWrite]) -> Result<(), DatabaseError>;
}

/// Open the backend described by `config`. Does not create the schema.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn StateStore>, DatabaseError> {
    match config.backend {
        Backend::Libsql => {
            let store = LibSqlStore::open(config).await?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        Backend::Postgres => {
            let store = PostgresStore::connect(config).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Backend::Postgres => Err(DatabaseError::Connection(
            "PostgreSQL support was not compiled in (enable the `postgres` feature)".into(),
        )),
    }
}

/// Parse the `participant_key` column of a stored conversation row.
pub(crate) fn parse_participant_key(
    name: &str,
    text: &str,
) -> Result<ConversationKey, DatabaseError> {
    text.parse().map_err(|reason| DatabaseError::Decoding {
        key: format!("conversations:{name}:{text}"),
        reason,
    })
}
