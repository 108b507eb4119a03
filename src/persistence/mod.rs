//! Bot-facing persistence: the operations a bot framework calls to load and
//! save its state, backed by a [`StateStore`](crate::store::StateStore).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{RetryConfig, StoreConfig};
use crate::error::DatabaseError;
use crate::store::ConversationKey;

mod engine;

pub use engine::PersistenceEngine;

/// Runtime switches for [`PersistenceEngine`].
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Ignore updates whose value is empty (`null`, `{}`, `[]`, `""`).
    pub skip_null: bool,
    /// Buffer writes in memory until [`BotPersistence::flush`].
    pub on_flush: bool,
    /// Upper bound on each store round trip, retries included.
    pub operation_timeout: Option<Duration>,
    pub retry: RetryConfig,
}

impl From<&StoreConfig> for EngineOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            skip_null: config.skip_null,
            on_flush: config.on_flush,
            operation_timeout: config.operation_timeout(),
            retry: config.retry.clone(),
        }
    }
}

/// Load/save contract between a bot framework and its state storage.
///
/// Reads return `None` (or an empty map) when nothing is stored. Writes
/// replace the whole value for their key.
#[async_trait]
pub trait BotPersistence: Send + Sync {
    async fn get_bot_data(&self) -> Result<Option<Value>, DatabaseError>;

    async fn get_chat_data(&self, chat_id: i64) -> Result<Option<Value>, DatabaseError>;

    async fn get_all_chat_data(&self) -> Result<HashMap<i64, Value>, DatabaseError>;

    async fn get_user_data(&self, user_id: i64) -> Result<Option<Value>, DatabaseError>;

    async fn get_all_user_data(&self) -> Result<HashMap<i64, Value>, DatabaseError>;

    async fn get_callback_data(&self) -> Result<Option<Value>, DatabaseError>;

    async fn get_conversation(
        &self,
        name: &str,
        key: &ConversationKey,
    ) -> Result<Option<Value>, DatabaseError>;

    /// Every stored state of one conversation handler.
    async fn get_conversations(
        &self,
        name: &str,
    ) -> Result<HashMap<ConversationKey, Value>, DatabaseError>;

    async fn update_bot_data(&self, data: Value) -> Result<(), DatabaseError>;

    async fn update_chat_data(&self, chat_id: i64, data: Value) -> Result<(), DatabaseError>;

    async fn update_user_data(&self, user_id: i64, data: Value) -> Result<(), DatabaseError>;

    async fn update_callback_data(&self, data: Value) -> Result<(), DatabaseError>;

    /// Store a conversation state. `None` means the conversation ended and
    /// its row is removed.
    async fn update_conversation(
        &self,
        name: &str,
        key: ConversationKey,
        state: Option<Value>,
    ) -> Result<(), DatabaseError>;

    async fn drop_chat_data(&self, chat_id: i64) -> Result<(), DatabaseError>;

    async fn drop_user_data(&self, user_id: i64) -> Result<(), DatabaseError>;

    /// Discard any cached copy and re-read from storage.
    async fn refresh_bot_data(&self) -> Result<Option<Value>, DatabaseError>;

    async fn refresh_chat_data(&self, chat_id: i64) -> Result<Option<Value>, DatabaseError>;

    async fn refresh_user_data(&self, user_id: i64) -> Result<Option<Value>, DatabaseError>;

    /// Persist everything still buffered. A no-op in write-through mode.
    async fn flush(&self) -> Result<(), DatabaseError>;
}
