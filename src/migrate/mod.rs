//! One-shot migration of a legacy snapshot into a relational store.
//!
//! Categories are migrated one after another, each in its own transaction,
//! so a bad category never takes the others down with it. Rows are upserted,
//! which makes re-running the tool against the same target harmless.

use std::path::Path;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{RetryConfig, StoreConfig};
use crate::error::{Error, MigrationError};
use crate::store::retry::{with_retry, with_timeout};
use crate::store::{self, Category, StateStore};

mod report;
mod snapshot;

pub use report::{CategoryOutcome, CategoryReport, MigrationReport, MigrationStatus};
pub use snapshot::{CategoryRows, RowError, Snapshot};

#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    /// Leave empty values out instead of writing them.
    pub skip_null: bool,
    pub retry: RetryConfig,
    /// Bound on each category's transaction, retries included.
    pub operation_timeout: Option<Duration>,
}

impl From<&StoreConfig> for MigrationOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            skip_null: config.skip_null,
            retry: config.retry.clone(),
            operation_timeout: config.operation_timeout(),
        }
    }
}

/// Load `snapshot_path` and migrate it into the store described by `config`.
pub async fn run(config: &StoreConfig, snapshot_path: &Path) -> Result<MigrationReport, Error> {
    config.validate()?;
    let snapshot = Snapshot::load(snapshot_path).await?;
    let store = with_retry(&config.retry, "connect", || store::connect(config))
        .await
        .map_err(MigrationError::from)?;
    info!(
        backend = store.backend_name(),
        schema = store.schema(),
        snapshot = %snapshot_path.display(),
        "Starting migration"
    );
    Ok(migrate(store.as_ref(), &snapshot, &MigrationOptions::from(config)).await?)
}

/// Migrate an already-parsed snapshot.
///
/// Only setup failures (creating the schema) are returned as errors; per
/// category problems end up in the report.
pub async fn migrate(
    store: &dyn StateStore,
    snapshot: &Snapshot,
    options: &MigrationOptions,
) -> Result<MigrationReport, MigrationError> {
    store.ensure_schema().await?;

    let mut report = MigrationReport {
        schema: store.schema().to_string(),
        categories: Vec::with_capacity(Category::ALL.len()),
        ignored: snapshot.ignored().to_vec(),
    };

    for category in Category::ALL {
        let outcome = migrate_category(store, snapshot, category, options).await;
        report.categories.push(CategoryReport { category, outcome });
    }

    let status = report.status();
    match status {
        MigrationStatus::Success => info!(rows = report.rows_written(), "Migration finished"),
        _ => warn!(rows = report.rows_written(), %status, "Migration finished with failures"),
    }
    Ok(report)
}

async fn migrate_category(
    store: &dyn StateStore,
    snapshot: &Snapshot,
    category: Category,
    options: &MigrationOptions,
) -> CategoryOutcome {
    if snapshot.category(category).is_none() {
        return CategoryOutcome::Empty;
    }

    let rows = match snapshot.rows(category, options.skip_null) {
        Ok(rows) => rows,
        Err(RowError { key, reason }) => {
            error!(%category, key = %key, error = %reason, "Category not migrated");
            return CategoryOutcome::Failed {
                key: Some(key),
                error: reason,
            };
        }
    };

    if rows.writes.is_empty() {
        if rows.skipped == 0 {
            return CategoryOutcome::Empty;
        }
        info!(%category, skipped = rows.skipped, "Nothing to write");
        return CategoryOutcome::Migrated {
            written: 0,
            skipped: rows.skipped,
        };
    }

    let written = rows.writes.len();
    let result = with_timeout(
        options.operation_timeout,
        with_retry(&options.retry, "apply_batch", || {
            store.apply_batch(&rows.writes)
        }),
    )
    .await;

    match result {
        Ok(()) => {
            info!(%category, written, skipped = rows.skipped, "Category migrated");
            CategoryOutcome::Migrated {
                written,
                skipped: rows.skipped,
            }
        }
        Err(e) => {
            error!(%category, error = %e, "Category rolled back");
            CategoryOutcome::Failed {
                key: None,
                error: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::error::DatabaseError;
    use crate::persistence::{BotPersistence, EngineOptions, PersistenceEngine};
    use crate::store::testing::FaultyStore;
    use crate::store::{ConversationKey, StateKey};

    fn options(skip_null: bool) -> MigrationOptions {
        MigrationOptions {
            skip_null,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 2,
            },
            operation_timeout: None,
        }
    }

    fn snapshot(value: serde_json::Value) -> Snapshot {
        Snapshot::from_json(&value.to_string()).unwrap()
    }

    #[tokio::test]
    async fn greeted_chat_is_readable_by_the_engine() {
        let store = Arc::new(FaultyStore::memory("default_schema").await);
        let snap = snapshot(json!({
            "chat_data": {"100": {"greeted": true}},
            "user_data": {},
        }));

        let report = migrate(store.as_ref(), &snap, &options(true)).await.unwrap();
        assert_eq!(report.status(), MigrationStatus::Success);
        assert_eq!(
            report.outcome(Category::Chat),
            Some(&CategoryOutcome::Migrated {
                written: 1,
                skipped: 0
            })
        );
        assert_eq!(report.outcome(Category::User), Some(&CategoryOutcome::Empty));
        assert_eq!(report.outcome(Category::Bot), Some(&CategoryOutcome::Empty));

        let engine = PersistenceEngine::with_store(store.clone(), EngineOptions::default());
        assert_eq!(
            engine.get_chat_data(100).await.unwrap(),
            Some(json!({"greeted": true}))
        );
        assert!(engine.get_all_user_data().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rerunning_is_idempotent() {
        let store = Arc::new(FaultyStore::memory("s").await);
        let snap = snapshot(json!({
            "bot_data": {"v": 1},
            "chat_data": {"1": {"a": 1}, "2": {"b": 2}},
            "conversations": {"order": {"[1, 2]": "ASK"}},
        }));

        let first = migrate(store.as_ref(), &snap, &options(false)).await.unwrap();
        let second = migrate(store.as_ref(), &snap, &options(false)).await.unwrap();
        assert_eq!(first, second);

        let chats = store.fetch_category(Category::Chat).await.unwrap();
        assert_eq!(chats.len(), 2);
        let engine = PersistenceEngine::with_store(store.clone(), EngineOptions::default());
        let conversations = engine.get_conversations("order").await.unwrap();
        assert_eq!(conversations[&ConversationKey::from((1, 2))], json!("ASK"));
    }

    #[tokio::test]
    async fn skip_null_controls_empty_rows() {
        let snap = snapshot(json!({"user_data": {"7": {}, "8": {"lang": "de"}}}));

        let store = Arc::new(FaultyStore::memory("s").await);
        let report = migrate(store.as_ref(), &snap, &options(true)).await.unwrap();
        assert_eq!(
            report.outcome(Category::User),
            Some(&CategoryOutcome::Migrated {
                written: 1,
                skipped: 1
            })
        );
        assert!(store.fetch(&StateKey::User(7)).await.unwrap().is_none());

        let store = Arc::new(FaultyStore::memory("s").await);
        migrate(store.as_ref(), &snap, &options(false)).await.unwrap();
        assert!(store.fetch(&StateKey::User(7)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bad_key_fails_only_its_category() {
        let store = Arc::new(FaultyStore::memory("s").await);
        let snap = snapshot(json!({
            "chat_data": {"1": {"a": 1}},
            "user_data": {"2": {"ok": true}, "two": {"ok": false}},
        }));

        let report = migrate(store.as_ref(), &snap, &options(false)).await.unwrap();
        assert_eq!(report.status(), MigrationStatus::PartialSuccess);
        assert_eq!(report.status().exit_code(), 2);
        match report.outcome(Category::User) {
            Some(CategoryOutcome::Failed { key, .. }) => assert_eq!(key.as_deref(), Some("two")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Nothing of the failed category was written, the rest was.
        assert!(store.fetch(&StateKey::User(2)).await.unwrap().is_none());
        assert!(store.fetch(&StateKey::Chat(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_per_category() {
        let store = Arc::new(FaultyStore::memory("s").await);
        let snap = snapshot(json!({"bot_data": {"v": 1}}));
        store.fail_next(2, DatabaseError::Connection("reset".into()));

        // Injected failures only hit reads and writes, so the batch absorbs both.
        let report = migrate(store.as_ref(), &snap, &options(false)).await.unwrap();
        assert_eq!(report.status(), MigrationStatus::Success);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn schema_failure_is_not_retried() {
        let store = Arc::new(FaultyStore::memory("s").await);
        store.fail_schema(DatabaseError::Connection("reset during DDL".into()));
        let snap = snapshot(json!({"bot_data": {"v": 1}}));

        let err = migrate(store.as_ref(), &snap, &options(false)).await.unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Database(DatabaseError::Connection(_))
        ));
        assert_eq!(store.schema_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn persistent_failure_marks_category_failed() {
        let store = Arc::new(FaultyStore::memory("s").await);
        let snap = snapshot(json!({"bot_data": {"v": 1}}));
        store.fail_next(3, DatabaseError::Connection("refused".into()));

        let report = migrate(store.as_ref(), &snap, &options(false)).await.unwrap();
        assert_eq!(report.status(), MigrationStatus::Failure);
        assert_eq!(report.status().exit_code(), 1);
        assert!(matches!(
            report.outcome(Category::Bot),
            Some(CategoryOutcome::Failed { key: None, .. })
        ));
    }

    #[tokio::test]
    async fn run_reports_missing_snapshot() {
        let config = StoreConfig {
            backend: crate::config::Backend::Libsql,
            path: ":memory:".into(),
            ..StoreConfig::default()
        };
        let err = run(&config, Path::new("/nonexistent/state.json"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Migration(MigrationError::SnapshotNotFound(_))
        ));
    }
}
