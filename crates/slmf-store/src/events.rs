// SPDX-License-Identifier: MIT OR Apache-2.0
//! The append-only `events` table.

use crate::{StoreCipher, StoreConfig, StoreError};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use slmf_protocol::Envelope;

/// One persisted event, payload already decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Monotonic insert order, assigned by the store.
    pub id: i64,
    /// Envelope timestamp.
    pub timestamp_utc_ms: i64,
    /// Canonical topic.
    pub topic: String,
    /// Publishing component.
    pub source: String,
    /// Envelope message id, as a hyphenated UUID string.
    pub message_id: String,
    /// The payload schema identifier.
    pub message_type: String,
    /// Decrypted payload bytes.
    pub payload: Vec<u8>,
    /// Free-form metadata captured at append time.
    pub metadata: serde_json::Value,
}

/// Query bounds for [`EventStore::query`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Keep only topics starting with this prefix. Empty keeps all.
    pub topic_prefix: String,
    /// Inclusive lower timestamp bound.
    pub from_ms: Option<i64>,
    /// Exclusive upper timestamp bound.
    pub to_ms: Option<i64>,
    /// Maximum rows returned (default 1000).
    pub limit: Option<u32>,
}

/// Handle to the encrypted event database.
///
/// Opened once per process; the single-connection pool serializes writes,
/// which is the intended one-writer discipline.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
    cipher: StoreCipher,
}

impl EventStore {
    /// Open (and if necessary create) the store.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be opened or migrated.
    pub async fn open(config: &StoreConfig, cipher: StoreCipher) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&config.database_url)
            .await?;
        let store = Self { pool, cipher };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_utc_ms INTEGER NOT NULL,
                topic            TEXT NOT NULL,
                source           TEXT NOT NULL,
                message_id       TEXT NOT NULL,
                message_type     TEXT NOT NULL,
                payload          BLOB NOT NULL,
                metadata         TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_events_topic_ts
                ON events (topic, timestamp_utc_ms);

            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                task_id          TEXT PRIMARY KEY,
                task_class       TEXT NOT NULL,
                schedule         TEXT NOT NULL,
                config           TEXT NOT NULL DEFAULT '{}',
                enabled          INTEGER NOT NULL DEFAULT 1,
                created_at_utc_ms INTEGER NOT NULL,
                last_run_utc_ms  INTEGER,
                next_run_utc_ms  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_executions (
                execution_id     TEXT PRIMARY KEY,
                task_id          TEXT NOT NULL,
                started_at_utc_ms INTEGER NOT NULL,
                completed_at_utc_ms INTEGER,
                success          INTEGER,
                duration_ms      INTEGER,
                error            TEXT,
                retry_count      INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_executions_task
                ON task_executions (task_id, started_at_utc_ms);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append one envelope. Returns the assigned row id.
    ///
    /// # Errors
    ///
    /// Database and cipher failures. Callers on the routing path must
    /// treat this as loggable, not fatal.
    pub async fn append_envelope(&self, envelope: &Envelope) -> Result<i64, StoreError> {
        let metadata = serde_json::json!({
            "schema_version": envelope.schema_version,
            "correlation_id": envelope.correlation_id.map(|u| u.to_string()),
            "trace_id": envelope.trace_id.map(|u| u.to_string()),
        });
        let sealed = self.cipher.seal(&envelope.payload)?;
        let result = sqlx::query(
            "INSERT INTO events \
             (timestamp_utc_ms, topic, source, message_id, message_type, payload, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(envelope.timestamp_utc_ms as i64)
        .bind(envelope.topic.as_str())
        .bind(envelope.source.as_str())
        .bind(envelope.message_id.to_string())
        .bind(&envelope.payload_type_url)
        .bind(sealed)
        .bind(metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Query events by topic prefix and time window, oldest first.
    ///
    /// # Errors
    ///
    /// Database and decryption failures.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<EventRecord>, StoreError> {
        let prefix_like = format!("{}%", escape_like(&filter.topic_prefix));
        let rows = sqlx::query(
            "SELECT id, timestamp_utc_ms, topic, source, message_id, message_type, payload, metadata \
             FROM events \
             WHERE topic LIKE ? ESCAPE '\\' \
               AND timestamp_utc_ms >= ? \
               AND timestamp_utc_ms < ? \
             ORDER BY id ASC \
             LIMIT ?",
        )
        .bind(prefix_like)
        .bind(filter.from_ms.unwrap_or(0))
        .bind(filter.to_ms.unwrap_or(i64::MAX))
        .bind(i64::from(filter.limit.unwrap_or(1000)))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("payload");
            let metadata_text: String = row.get("metadata");
            records.push(EventRecord {
                id: row.get("id"),
                timestamp_utc_ms: row.get("timestamp_utc_ms"),
                topic: row.get("topic"),
                source: row.get("source"),
                message_id: row.get("message_id"),
                message_type: row.get("message_type"),
                payload: self.cipher.open(&blob)?,
                metadata: serde_json::from_str(&metadata_text)?,
            });
        }
        Ok(records)
    }

    /// Count events under a topic prefix.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn count(&self, topic_prefix: &str) -> Result<i64, StoreError> {
        let prefix_like = format!("{}%", escape_like(topic_prefix));
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events WHERE topic LIKE ? ESCAPE '\\'")
            .bind(prefix_like)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    /// Delete events under `topic_prefix` older than `cutoff_ms`.
    ///
    /// This is the retention job's primitive; records are otherwise never
    /// updated or deleted.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn prune_before(
        &self,
        topic_prefix: &str,
        cutoff_ms: i64,
    ) -> Result<u64, StoreError> {
        let prefix_like = format!("{}%", escape_like(topic_prefix));
        let result = sqlx::query(
            "DELETE FROM events WHERE topic LIKE ? ESCAPE '\\' AND timestamp_utc_ms < ?",
        )
        .bind(prefix_like)
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Reclaim free pages. Run from the weekly maintenance task.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn vacuum(&self) -> Result<(), StoreError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// A handle to the scheduler's table group in the same database.
    #[must_use]
    pub fn task_store(&self) -> crate::TaskStore {
        crate::TaskStore::new(self.pool.clone())
    }
}

fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use slmf_core::{ComponentId, Topic};
    use slmf_protocol::EnvelopeBuilder;

    async fn store() -> EventStore {
        EventStore::open(&StoreConfig::in_memory(), StoreCipher::derive(&[7u8; 32]))
            .await
            .unwrap()
    }

    fn envelope(topic: &str, payload: &[u8]) -> Envelope {
        EnvelopeBuilder::new(
            ComponentId::new("message_bus_client_scheduler"),
            Topic::parse(topic).unwrap(),
        )
        .payload("test.Payload", payload.to_vec())
        .build()
    }

    #[tokio::test]
    async fn append_and_query_roundtrip() {
        let store = store().await;
        let env = envelope("system/security/unauthorized", b"details");
        store.append_envelope(&env).await.unwrap();

        let records = store
            .query(&EventFilter {
                topic_prefix: "system/security/".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "system/security/unauthorized");
        assert_eq!(records[0].payload, b"details");
        assert_eq!(records[0].message_id, env.message_id.to_string());
    }

    #[tokio::test]
    async fn payload_is_encrypted_at_rest() {
        let store = store().await;
        let env = envelope("control/admin/action", b"sensitive-bytes");
        store.append_envelope(&env).await.unwrap();

        let row = sqlx::query("SELECT payload FROM events LIMIT 1")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let raw: Vec<u8> = row.get("payload");
        assert!(!raw.windows(b"sensitive-bytes".len()).any(|w| w == b"sensitive-bytes"));
    }

    #[tokio::test]
    async fn insert_order_is_monotonic() {
        let store = store().await;
        for i in 0..5u8 {
            store
                .append_envelope(&envelope("logs/test/mod", &[i]))
                .await
                .unwrap();
        }
        let records = store.query(&EventFilter::default()).await.unwrap();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(records.len(), 5);
    }

    #[tokio::test]
    async fn time_window_bounds_apply() {
        let store = store().await;
        let mut env = envelope("logs/a/b", b"old");
        env.timestamp_utc_ms = 1_000;
        store.append_envelope(&env).await.unwrap();
        let mut env = envelope("logs/a/b", b"new");
        env.timestamp_utc_ms = 2_000;
        store.append_envelope(&env).await.unwrap();

        let records = store
            .query(&EventFilter {
                from_ms: Some(1_500),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"new");
    }

    #[tokio::test]
    async fn prune_respects_prefix_and_cutoff() {
        let store = store().await;
        let mut old_log = envelope("logs/a/b", b"old");
        old_log.timestamp_utc_ms = 1_000;
        store.append_envelope(&old_log).await.unwrap();
        let mut old_audit = envelope("control/admin/x", b"audit");
        old_audit.timestamp_utc_ms = 1_000;
        store.append_envelope(&old_audit).await.unwrap();

        let removed = store.prune_before("logs/", 2_000).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count("").await.unwrap(), 1);
        assert_eq!(store.count("control/").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::at_path(&dir.path().join("events.db"));
        let cipher = StoreCipher::derive(&[8u8; 32]);

        {
            let store = EventStore::open(&config, cipher.clone()).await.unwrap();
            store
                .append_envelope(&envelope("control/admin/change", b"persisted"))
                .await
                .unwrap();
        }

        let reopened = EventStore::open(&config, cipher).await.unwrap();
        let records = reopened.query(&EventFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"persisted");
    }

    #[tokio::test]
    async fn like_escaping_is_literal() {
        let store = store().await;
        store
            .append_envelope(&envelope("logs/a_b/c", b"x"))
            .await
            .unwrap();
        // An underscore in the prefix must not act as a wildcard.
        assert_eq!(store.count("logs/axb").await.unwrap(), 0);
        assert_eq!(store.count("logs/a_b").await.unwrap(), 1);
    }
}
