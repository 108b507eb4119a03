//! Schema management — table naming, DDL and per-category SQL.
//!
//! Every table is qualified by the configured schema name, which is the
//! tenancy boundary between bot deployments sharing one database:
//!
//! - PostgreSQL: a real schema, `"{schema}".telegram_{category}`
//! - SQLite/libSQL: no schemas, so the name becomes a table prefix,
//!   `"{schema}__telegram_{category}"`
//!
//! All DDL uses `IF NOT EXISTS` so several engines can start concurrently.

use crate::error::DatabaseError;
use crate::store::Category;

/// Postgres truncates identifiers beyond this length.
const MAX_SCHEMA_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// Schema names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_schema_name(name: &str) -> Result<(), DatabaseError> {
    if name.is_empty() {
        return Err(DatabaseError::Schema("schema name must not be empty".into()));
    }
    if name.len() > MAX_SCHEMA_NAME_LEN {
        return Err(DatabaseError::Schema(format!(
            "schema name '{name}' is longer than {MAX_SCHEMA_NAME_LEN} bytes"
        )));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(DatabaseError::Schema(format!(
            "schema name '{name}' must not start with a digit"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Schema(format!(
            "invalid schema name '{name}': must contain only ASCII alphanumeric characters and underscores"
        )));
    }
    Ok(())
}

/// Statements for one category's table.
#[derive(Debug, Clone)]
pub struct CategorySql {
    pub table: String,
    /// Fetch one row's value by key.
    pub select: String,
    /// Fetch every row: key column(s) then value.
    pub select_all: String,
    /// Conversation table only: fetch `participant_key, value` by name.
    pub select_by_name: Option<String>,
    pub upsert: String,
    pub delete: String,
}

/// Owns the table layout of one schema for one SQL dialect.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    schema: String,
    dialect: Dialect,
    timestamps: bool,
    sql: [CategorySql; 5],
}

impl SchemaManager {
    pub fn new(schema: &str, dialect: Dialect, timestamps: bool) -> Result<Self, DatabaseError> {
        validate_schema_name(schema)?;
        let sql = Category::ALL.map(|category| category_sql(schema, dialect, timestamps, category));
        Ok(Self {
            schema: schema.to_string(),
            dialect,
            timestamps,
            sql,
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn timestamps(&self) -> bool {
        self.timestamps
    }

    pub fn sql(&self, category: Category) -> &CategorySql {
        &self.sql[category.index()]
    }

    pub fn table(&self, category: Category) -> &str {
        &self.sql(category).table
    }

    /// DDL that brings an empty database up to the full layout.
    pub fn create_statements(&self) -> Vec<String> {
        let mut statements = Vec::with_capacity(6);
        if self.dialect == Dialect::Postgres {
            statements.push(format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema));
        }
        let (id_type, text_type, blob_type) = match self.dialect {
            Dialect::Postgres => ("BIGINT", "TEXT", "BYTEA"),
            Dialect::Sqlite => ("INTEGER", "TEXT", "BLOB"),
        };
        let timestamp_columns = if self.timestamps {
            match self.dialect {
                Dialect::Postgres => {
                    ", created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()"
                }
                Dialect::Sqlite => ", created_at TEXT NOT NULL, updated_at TEXT NOT NULL",
            }
        } else {
            ""
        };

        for category in Category::ALL {
            let table = self.table(category);
            let stmt = if category == Category::Conversation {
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} (\
                     conversation_name {text_type} NOT NULL, \
                     participant_key {text_type} NOT NULL, \
                     value {blob_type} NOT NULL{timestamp_columns}, \
                     PRIMARY KEY (conversation_name, participant_key))"
                )
            } else {
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} (\
                     id {id_type} NOT NULL PRIMARY KEY, \
                     value {blob_type} NOT NULL{timestamp_columns})"
                )
            };
            statements.push(stmt);
        }
        statements
    }

    /// Statements adding the timestamp columns to tables created without them.
    ///
    /// Postgres statements are idempotent. SQLite has no `ADD COLUMN IF NOT
    /// EXISTS`, so callers ignore its "duplicate column" failures.
    pub fn add_timestamp_statements(&self) -> Vec<String> {
        if !self.timestamps {
            return Vec::new();
        }
        let mut statements = Vec::with_capacity(10);
        for category in Category::ALL {
            let table = self.table(category);
            for column in ["created_at", "updated_at"] {
                statements.push(match self.dialect {
                    Dialect::Postgres => format!(
                        "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {column} TIMESTAMPTZ NOT NULL DEFAULT now()"
                    ),
                    // SQLite only accepts constant defaults here
                    Dialect::Sqlite => {
                        format!("ALTER TABLE {table} ADD COLUMN {column} TEXT NOT NULL DEFAULT ''")
                    }
                });
            }
        }
        statements
    }
}

fn placeholder(dialect: Dialect, n: usize) -> String {
    match dialect {
        Dialect::Postgres => format!("${n}"),
        Dialect::Sqlite => format!("?{n}"),
    }
}

fn table_name(schema: &str, dialect: Dialect, category: Category) -> String {
    let suffix = category.table_suffix();
    match dialect {
        Dialect::Postgres => format!("\"{schema}\".telegram_{suffix}"),
        Dialect::Sqlite => format!("\"{schema}__telegram_{suffix}\""),
    }
}

fn category_sql(schema: &str, dialect: Dialect, timestamps: bool, category: Category) -> CategorySql {
    let table = table_name(schema, dialect, category);
    let p = |n| placeholder(dialect, n);

    let (key_columns, key_filter, key_count): (&str, String, usize) =
        if category == Category::Conversation {
            (
                "conversation_name, participant_key",
                format!("conversation_name = {} AND participant_key = {}", p(1), p(2)),
                2,
            )
        } else {
            ("id", format!("id = {}", p(1)), 1)
        };

    let value_param = p(key_count + 1);
    let key_params = (1..=key_count).map(p).collect::<Vec<_>>().join(", ");

    // Postgres fills timestamps from column defaults and now(); SQLite gets
    // the instant as an extra bound parameter.
    let upsert = match (dialect, timestamps) {
        (Dialect::Postgres, true) => format!(
            "INSERT INTO {table} AS t ({key_columns}, value) VALUES ({key_params}, {value_param}) \
             ON CONFLICT ({key_columns}) DO UPDATE SET value = EXCLUDED.value, \
             updated_at = GREATEST(t.updated_at, now())"
        ),
        (Dialect::Sqlite, true) => {
            let ts = p(key_count + 2);
            format!(
                "INSERT INTO {table} ({key_columns}, value, created_at, updated_at) \
                 VALUES ({key_params}, {value_param}, {ts}, {ts}) \
                 ON CONFLICT ({key_columns}) DO UPDATE SET value = excluded.value, \
                 updated_at = MAX(updated_at, excluded.updated_at)"
            )
        }
        (_, false) => format!(
            "INSERT INTO {table} ({key_columns}, value) VALUES ({key_params}, {value_param}) \
             ON CONFLICT ({key_columns}) DO UPDATE SET value = excluded.value"
        ),
    };

    let select_by_name = (category == Category::Conversation).then(|| {
        format!(
            "SELECT participant_key, value FROM {table} WHERE conversation_name = {}",
            p(1)
        )
    });

    CategorySql {
        select: format!("SELECT value FROM {table} WHERE {key_filter}"),
        select_all: format!("SELECT {key_columns}, value FROM {table}"),
        select_by_name,
        upsert,
        delete: format!("DELETE FROM {table} WHERE {key_filter}"),
        table,
    }
}
