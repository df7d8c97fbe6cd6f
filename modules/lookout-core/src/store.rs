//! Persistent, single-writer record store backing feed de-duplication.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// Path value selecting the ephemeral in-process backing.
pub const MEMORY_PATH: &str = ":memory:";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    parsed_at  TIMESTAMP,
    feed_name  TEXT,
    uid        TEXT,
    hashsum    TEXT,
    class_name TEXT,
    as_json    TEXT,
    PRIMARY KEY (uid, hashsum)
)
"#;

/// A row of the `records` table. `uid` is
/// `"{entity_name}:{plugin-defined per-record id}"`; `hashsum` is the
/// record's content hash. Rows are append-only: an update of a logical
/// record adds a second row with the same `uid` and a new `hashsum`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PersistedRow {
    pub parsed_at: DateTime<Utc>,
    pub feed_name: String,
    pub uid: String,
    pub hashsum: String,
    pub class_name: String,
    pub as_json: String,
}

#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Open the store at `path`, creating the file and schema as needed.
    /// `:memory:` keeps everything in process. Concurrent callers serialize
    /// through the pool's single connection.
    pub async fn open(path: &str) -> Result<Self> {
        let options = if path == MEMORY_PATH {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Upsert on `(uid, hashsum)`; re-storing the same content is
    /// idempotent.
    pub async fn store(&self, row: &PersistedRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO records
                (parsed_at, feed_name, uid, hashsum, class_name, as_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(row.parsed_at)
        .bind(&row.feed_name)
        .bind(&row.uid)
        .bind(&row.hashsum)
        .bind(&row.class_name)
        .bind(&row.as_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest row for `uid`, optionally constrained to an exact hash.
    pub async fn fetch(&self, uid: &str, hashsum: Option<&str>) -> Result<Option<PersistedRow>> {
        let row = match hashsum {
            Some(hashsum) => {
                sqlx::query_as::<_, PersistedRow>(
                    r#"
                    SELECT * FROM records
                    WHERE uid = ?1 AND hashsum = ?2
                    ORDER BY parsed_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(uid)
                .bind(hashsum)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PersistedRow>(
                    r#"
                    SELECT * FROM records
                    WHERE uid = ?1
                    ORDER BY parsed_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(uid)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row)
    }

    /// Existence predicate behind the new/updated logic.
    pub async fn exists(&self, uid: &str, hashsum: Option<&str>) -> Result<bool> {
        Ok(self.fetch(uid, hashsum).await?.is_some())
    }

    /// Number of stored rows, total or for one feed partition.
    pub async fn size(&self, feed_name: Option<&str>) -> Result<i64> {
        let count = match feed_name {
            Some(feed_name) => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM records WHERE feed_name = ?1")
                    .bind(feed_name)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM records")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}
