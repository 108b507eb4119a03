//! Legacy flat-file snapshot: the whole bot state in one JSON document.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::codec;
use crate::error::MigrationError;
use crate::store::{Category, ConversationKey, RowWrite, StateKey};

/// Parsed snapshot, one raw value per category present in the file.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    categories: BTreeMap<Category, Value>,
    ignored: Vec<String>,
}

/// Rows ready to be written for one category.
#[derive(Debug, Default)]
pub struct CategoryRows {
    pub writes: Vec<RowWrite>,
    pub skipped: usize,
}

/// Why a category could not be turned into rows.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub key: String,
    pub reason: String,
}

impl RowError {
    fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl Snapshot {
    /// Read and parse a snapshot file.
    pub async fn load(path: &Path) -> Result<Self, MigrationError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MigrationError::SnapshotNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), bytes = raw.len(), "Read snapshot");
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, MigrationError> {
        let root: Value = serde_json::from_str(raw)
            .map_err(|e| MigrationError::SnapshotFormat(format!("invalid JSON: {e}")))?;
        let Value::Object(root) = root else {
            return Err(MigrationError::SnapshotFormat(
                "top level must be an object".into(),
            ));
        };

        let mut snapshot = Snapshot::default();
        for (name, value) in root {
            match Category::ALL.iter().find(|c| c.snapshot_name() == name) {
                Some(category) => {
                    snapshot.categories.insert(*category, value);
                }
                None => {
                    warn!(category = %name, "Ignoring unknown snapshot category");
                    snapshot.ignored.push(name);
                }
            }
        }
        Ok(snapshot)
    }

    /// Raw value of a category, `None` when the file does not mention it.
    pub fn category(&self, category: Category) -> Option<&Value> {
        self.categories.get(&category)
    }

    /// Top-level names that are not a known category.
    pub fn ignored(&self) -> &[String] {
        &self.ignored
    }

    /// Encode every entry of `category` into row writes.
    ///
    /// The first bad key or value aborts the whole category.
    pub fn rows(&self, category: Category, skip_null: bool) -> Result<CategoryRows, RowError> {
        let mut rows = CategoryRows::default();
        let Some(value) = self.category(category) else {
            return Ok(rows);
        };

        match category {
            Category::Bot => push_row(&mut rows, StateKey::Bot, value, skip_null)?,
            Category::Callback => push_row(&mut rows, StateKey::Callback, value, skip_null)?,
            Category::Chat | Category::User => {
                for (id, data) in entries(category.snapshot_name(), value)? {
                    let id: i64 = id.trim().parse().map_err(|_| {
                        RowError::new(id.as_str(), format!("'{id}' is not an integer id"))
                    })?;
                    let key = StateKey::from_row_id(category, id)
                        .ok_or_else(|| RowError::new(id.to_string(), "unsupported key"))?;
                    push_row(&mut rows, key, data, skip_null)?;
                }
            }
            Category::Conversation => {
                for (name, states) in entries(category.snapshot_name(), value)? {
                    for (participants, state) in entries(name, states)? {
                        let parsed: ConversationKey = participants
                            .parse()
                            .map_err(|reason: String| {
                                RowError::new(format!("{name}:{participants}"), reason)
                            })?;
                        // An ended conversation has no state to carry over.
                        if state.is_null() {
                            rows.skipped += 1;
                            continue;
                        }
                        push_row(
                            &mut rows,
                            StateKey::conversation(name.as_str(), parsed),
                            state,
                            skip_null,
                        )?;
                    }
                }
            }
        }
        Ok(rows)
    }
}

fn entries<'a>(label: &str, value: &'a Value) -> Result<&'a Map<String, Value>, RowError> {
    static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(EMPTY.get_or_init(Map::new)),
        other => Err(RowError::new(
            label,
            format!("expected an object, found {}", kind(other)),
        )),
    }
}

fn push_row(
    rows: &mut CategoryRows,
    key: StateKey,
    value: &Value,
    skip_null: bool,
) -> Result<(), RowError> {
    if skip_null && codec::is_empty_value(value) {
        rows.skipped += 1;
        return Ok(());
    }
    let name = key.to_string();
    let bytes = codec::encode(&name, value).map_err(|e| RowError::new(name, e.to_string()))?;
    rows.writes.push(RowWrite::Upsert { key, value: bytes });
    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn snapshot(value: Value) -> Snapshot {
        Snapshot::from_json(&value.to_string()).unwrap()
    }

    #[test]
    fn missing_categories_are_empty_and_unknown_ones_ignored() {
        let snap = snapshot(json!({"chat_data": {"1": {}}, "extra": 5}));
        assert!(snap.category(Category::Bot).is_none());
        assert!(snap.category(Category::Chat).is_some());
        assert_eq!(snap.ignored(), ["extra".to_string()]);
        assert!(snap.rows(Category::User, false).unwrap().writes.is_empty());
    }

    #[test]
    fn rejects_non_object_documents() {
        assert!(matches!(
            Snapshot::from_json("[1, 2]"),
            Err(MigrationError::SnapshotFormat(_))
        ));
        assert!(matches!(
            Snapshot::from_json("{not json"),
            Err(MigrationError::SnapshotFormat(_))
        ));
    }

    #[test]
    fn chat_rows_respect_skip_null() {
        let snap = snapshot(json!({
            "chat_data": {"100": {"greeted": true}, "200": {}},
        }));

        let rows = snap.rows(Category::Chat, true).unwrap();
        assert_eq!(rows.writes.len(), 1);
        assert_eq!(rows.skipped, 1);
        assert_eq!(rows.writes[0].key(), &StateKey::Chat(100));

        let rows = snap.rows(Category::Chat, false).unwrap();
        assert_eq!(rows.writes.len(), 2);
        assert_eq!(rows.skipped, 0);
    }

    #[test]
    fn bad_chat_id_reports_the_key() {
        let snap = snapshot(json!({"user_data": {"7": {}, "seven": {}}}));
        let err = snap.rows(Category::User, false).unwrap_err();
        assert_eq!(err.key, "seven");
    }

    #[test]
    fn conversation_keys_are_parsed() {
        let snap = snapshot(json!({
            "conversations": {
                "order": {"[100, 7]": "ASK_SIZE", "[100, 8]": null},
                "survey": {"[5]": 2},
            }
        }));
        let rows = snap.rows(Category::Conversation, false).unwrap();
        assert_eq!(rows.writes.len(), 2);
        assert_eq!(rows.skipped, 1);
        assert!(
            rows.writes
                .iter()
                .any(|w| w.key() == &StateKey::conversation("order", (100, 7)))
        );

        let bad = snapshot(json!({"conversations": {"order": {"(1, 2)": "X"}}}));
        let err = bad.rows(Category::Conversation, false).unwrap_err();
        assert_eq!(err.key, "order:(1, 2)");
    }

    #[test]
    fn singleton_categories_take_the_whole_value() {
        let snap = snapshot(json!({"bot_data": {"v": 1}, "callback_data": null}));
        assert_eq!(snap.rows(Category::Bot, false).unwrap().writes.len(), 1);
        let callback = snap.rows(Category::Callback, true).unwrap();
        assert!(callback.writes.is_empty());
        assert_eq!(callback.skipped, 1);
    }

    #[test]
    fn wrong_shape_fails_the_category() {
        let snap = snapshot(json!({"chat_data": [1, 2]}));
        let err = snap.rows(Category::Chat, false).unwrap_err();
        assert_eq!(err.key, "chat_data");
        assert!(err.reason.contains("array"));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = Snapshot::load(Path::new("/nonexistent/snapshot.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::SnapshotNotFound(_)));
    }
}
