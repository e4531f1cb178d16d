//! PostgreSQL implementation of StreamStore
//!
//! Streams shared between hosts, with:
//! - Id allocation under a row lock on the stream
//! - Cursor advance and pending-entry insert in one transaction
//! - Blocking group reads by polling with exponential backoff

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument, trace};

use super::store::*;
use crate::message::{Block, Cursor, Fields, MessageId, StreamEntry};

/// Polling behaviour for blocking group reads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// First wait after an empty read
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Longest wait between reads
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier applied after each empty read
    pub backoff_multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(20),
            max_interval: Duration::from_millis(500),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(current.as_secs_f64() * self.backoff_multiplier)
            .min(self.max_interval)
    }
}

/// PostgreSQL implementation of StreamStore
///
/// # Example
///
/// ```ignore
/// use cannon_ledger::PostgresStreamStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/cannon").await?;
/// let store = PostgresStreamStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStreamStore {
    pool: PgPool,
    poll: PollConfig,
}

impl PostgresStreamStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll: PollConfig::default(),
        }
    }

    /// Connect to `database_url` with a default pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to database: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(Self::new(pool))
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Override how blocking reads poll
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn require_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        sqlx::query("SELECT 1 FROM cannon_consumer_groups WHERE stream = $1 AND group_name = $2")
            .bind(stream)
            .bind(group)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .map(|_| ())
            .ok_or_else(|| no_group(stream, group))
    }

    async fn try_read(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        from: ReadFrom,
        count: Option<usize>,
    ) -> Result<Vec<StreamBatch>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;
        let limit = read_limit(count).map(to_db);
        let mut batches = Vec::new();

        for stream in streams {
            let cursor = sqlx::query(
                r#"
                SELECT last_ms, last_seq FROM cannon_consumer_groups
                WHERE stream = $1 AND group_name = $2
                FOR UPDATE
                "#,
            )
            .bind(*stream)
            .bind(group)
            .fetch_optional(&mut *tx)
            .await
            .map_err(database)?
            .ok_or_else(|| no_group(stream, group))?;

            touch_consumer(&mut tx, stream, group, consumer).await?;

            let entries = match from {
                ReadFrom::New => {
                    let rows = sqlx::query(
                        r#"
                        SELECT ms, seq, fields FROM cannon_stream_entries
                        WHERE stream = $1 AND (ms, seq) > ($2, $3)
                        ORDER BY ms, seq
                        LIMIT $4
                        "#,
                    )
                    .bind(*stream)
                    .bind(cursor.get::<i64, _>("last_ms"))
                    .bind(cursor.get::<i64, _>("last_seq"))
                    .bind(limit)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(database)?;
                    rows.iter().map(entry_from_row).collect::<Result<Vec<_>, _>>()?
                }
                ReadFrom::Backlog => {
                    let rows = sqlx::query(
                        r#"
                        SELECT e.ms, e.seq, e.fields
                        FROM cannon_pending_entries p
                        JOIN cannon_stream_entries e
                          ON e.stream = p.stream AND e.ms = p.ms AND e.seq = p.seq
                        WHERE p.stream = $1 AND p.group_name = $2 AND p.consumer = $3
                        ORDER BY p.ms, p.seq
                        LIMIT $4
                        "#,
                    )
                    .bind(*stream)
                    .bind(group)
                    .bind(consumer)
                    .bind(limit)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(database)?;
                    rows.iter().map(entry_from_row).collect::<Result<Vec<_>, _>>()?
                }
            };

            if entries.is_empty() {
                continue;
            }

            let (ms, seq) = id_arrays(entries.iter().map(|e| e.id));
            sqlx::query(
                r#"
                INSERT INTO cannon_pending_entries (stream, group_name, ms, seq, consumer)
                SELECT $1, $2, ids.ms, ids.seq, $3
                FROM UNNEST($4::BIGINT[], $5::BIGINT[]) AS ids (ms, seq)
                ON CONFLICT (stream, group_name, ms, seq) DO UPDATE
                SET consumer = EXCLUDED.consumer,
                    delivery_count = cannon_pending_entries.delivery_count + 1,
                    last_delivered_at = NOW()
                "#,
            )
            .bind(*stream)
            .bind(group)
            .bind(consumer)
            .bind(&ms)
            .bind(&seq)
            .execute(&mut *tx)
            .await
            .map_err(database)?;

            if from == ReadFrom::New {
                if let Some(last) = entries.last() {
                    sqlx::query(
                        r#"
                        UPDATE cannon_consumer_groups SET last_ms = $3, last_seq = $4
                        WHERE stream = $1 AND group_name = $2
                        "#,
                    )
                    .bind(*stream)
                    .bind(group)
                    .bind(to_db(last.id.ms))
                    .bind(to_db(last.id.seq))
                    .execute(&mut *tx)
                    .await
                    .map_err(database)?;
                }
            }

            trace!(stream = %stream, group, consumer, count = entries.len(), "delivered entries");
            batches.push(StreamBatch {
                stream: stream.to_string(),
                entries,
            });
        }

        tx.commit().await.map_err(database)?;
        Ok(batches)
    }
}

#[async_trait]
impl StreamStore for PostgresStreamStore {
    #[instrument(skip(self, fields))]
    async fn append(
        &self,
        stream: &str,
        fields: Fields,
        id: IdRequest,
    ) -> Result<MessageId, StoreError> {
        let json =
            serde_json::to_value(&fields).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut tx = self.pool.begin().await.map_err(database)?;

        let last = lock_stream(&mut tx, stream).await?;
        let new_id = next_id(last, id, now_millis())?;

        sqlx::query(
            "INSERT INTO cannon_stream_entries (stream, ms, seq, fields) VALUES ($1, $2, $3, $4)",
        )
        .bind(stream)
        .bind(to_db(new_id.ms))
        .bind(to_db(new_id.seq))
        .bind(&json)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to append entry: {}", e);
            StoreError::Database(e.to_string())
        })?;

        sqlx::query("UPDATE cannon_streams SET last_ms = $2, last_seq = $3 WHERE stream = $1")
            .bind(stream)
            .bind(to_db(new_id.ms))
            .bind(to_db(new_id.seq))
            .execute(&mut *tx)
            .await
            .map_err(database)?;

        tx.commit().await.map_err(database)?;

        trace!(stream, id = %new_id, "appended entry");
        Ok(new_id)
    }

    #[instrument(skip(self))]
    async fn range(
        &self,
        stream: &str,
        start: MessageId,
        end: MessageId,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        if start > end {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            SELECT ms, seq, fields FROM cannon_stream_entries
            WHERE stream = $1 AND (ms, seq) >= ($2, $3) AND (ms, seq) <= ($4, $5)
            ORDER BY ms, seq
            LIMIT $6
            "#,
        )
        .bind(stream)
        .bind(to_db(start.ms))
        .bind(to_db(start.seq))
        .bind(to_db(end.ms))
        .bind(to_db(end.seq))
        .bind(count.map(to_db))
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT s.last_ms, s.last_seq,
                   (SELECT COUNT(*) FROM cannon_stream_entries e WHERE e.stream = s.stream) AS length,
                   (SELECT COUNT(*) FROM cannon_consumer_groups g WHERE g.stream = s.stream) AS groups
            FROM cannon_streams s
            WHERE s.stream = $1
            "#,
        )
        .bind(stream)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?
        .ok_or_else(|| StoreError::NoSuchStream(stream.to_string()))?;

        let bounds = |order: &'static str| {
            format!(
                "SELECT ms, seq FROM cannon_stream_entries WHERE stream = $1 ORDER BY ms {order}, seq {order} LIMIT 1"
            )
        };
        let first = sqlx::query(&bounds("ASC"))
            .bind(stream)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;
        let last = sqlx::query(&bounds("DESC"))
            .bind(stream)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;

        Ok(StreamInfo {
            length: row.get::<i64, _>("length") as usize,
            first_id: first.as_ref().map(id_from_row),
            last_id: last.as_ref().map(id_from_row),
            last_generated_id: id_from_columns(&row, "last_ms", "last_seq"),
            groups: row.get::<i64, _>("groups") as usize,
        })
    }

    #[instrument(skip(self))]
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        cursor: Cursor,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(database)?;
        let last = lock_stream(&mut tx, stream).await?;
        let position = match cursor {
            Cursor::Latest => last,
            Cursor::After(id) => id,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO cannon_consumer_groups (stream, group_name, last_ms, last_seq)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stream, group_name) DO NOTHING
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(to_db(position.ms))
        .bind(to_db(position.seq))
        .execute(&mut *tx)
        .await
        .map_err(database)?;

        tx.commit().await.map_err(database)?;

        let created = result.rows_affected() == 1;
        if created {
            debug!(stream, group, %cursor, "created consumer group");
        }
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn set_group_cursor(
        &self,
        stream: &str,
        group: &str,
        cursor: Cursor,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cannon_consumer_groups g
            SET last_ms = CASE WHEN $3 THEN s.last_ms ELSE $4 END,
                last_seq = CASE WHEN $3 THEN s.last_seq ELSE $5 END
            FROM cannon_streams s
            WHERE g.stream = s.stream AND g.stream = $1 AND g.group_name = $2
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(cursor == Cursor::Latest)
        .bind(match cursor {
            Cursor::After(id) => to_db(id.ms),
            Cursor::Latest => 0,
        })
        .bind(match cursor {
            Cursor::After(id) => to_db(id.seq),
            Cursor::Latest => 0,
        })
        .execute(&self.pool)
        .await
        .map_err(database)?;

        if result.rows_affected() == 0 {
            return Err(no_group(stream, group));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>, StoreError> {
        let exists = sqlx::query("SELECT 1 FROM cannon_streams WHERE stream = $1")
            .bind(stream)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;
        if exists.is_none() {
            return Err(StoreError::NoSuchStream(stream.to_string()));
        }

        let rows = sqlx::query(
            r#"
            SELECT g.group_name, g.last_ms, g.last_seq,
                   (SELECT COUNT(*) FROM cannon_consumers c
                     WHERE c.stream = g.stream AND c.group_name = g.group_name) AS consumers,
                   (SELECT COUNT(*) FROM cannon_pending_entries p
                     WHERE p.stream = g.stream AND p.group_name = g.group_name) AS pending
            FROM cannon_consumer_groups g
            WHERE g.stream = $1
            ORDER BY g.group_name
            "#,
        )
        .bind(stream)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        Ok(rows
            .iter()
            .map(|row| GroupInfo {
                name: row.get("group_name"),
                consumers: row.get::<i64, _>("consumers") as usize,
                pending: row.get::<i64, _>("pending") as usize,
                last_delivered_id: id_from_columns(row, "last_ms", "last_seq"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn consumers(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<Vec<ConsumerInfo>, StoreError> {
        self.require_group(stream, group).await?;

        let rows = sqlx::query(
            r#"
            SELECT c.consumer, c.seen_at,
                   (SELECT COUNT(*) FROM cannon_pending_entries p
                     WHERE p.stream = c.stream AND p.group_name = c.group_name
                       AND p.consumer = c.consumer) AS pending
            FROM cannon_consumers c
            WHERE c.stream = $1 AND c.group_name = $2
            ORDER BY c.consumer
            "#,
        )
        .bind(stream)
        .bind(group)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        let now = Utc::now();
        Ok(rows
            .iter()
            .map(|row| ConsumerInfo {
                name: row.get("consumer"),
                pending: row.get::<i64, _>("pending") as usize,
                idle: idle_since(row.get("seen_at"), now),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        from: ReadFrom,
        count: Option<usize>,
        block: Block,
    ) -> Result<Vec<StreamBatch>, StoreError> {
        let deadline = match block {
            Block::For(timeout) => Some(tokio::time::Instant::now() + timeout),
            Block::Never | Block::Forever => None,
        };
        let mut interval = self.poll.min_interval;

        loop {
            let batches = self.try_read(group, consumer, streams, from, count).await?;
            if !batches.is_empty() || block == Block::Never || from == ReadFrom::Backlog {
                return Ok(batches);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return Ok(vec![]);
                    }
                    interval.min(remaining)
                }
                None => interval,
            };

            tokio::time::sleep(wait).await;
            interval = self.poll.next_interval(interval);
        }
    }

    #[instrument(skip(self, ids))]
    async fn ack(
        &self,
        stream: &str,
        group: &str,
        ids: &[MessageId],
    ) -> Result<usize, StoreError> {
        self.require_group(stream, group).await?;

        let (ms, seq) = id_arrays(ids.iter().copied());
        let result = sqlx::query(
            r#"
            DELETE FROM cannon_pending_entries
            WHERE stream = $1 AND group_name = $2
              AND (ms, seq) IN (SELECT * FROM UNNEST($3::BIGINT[], $4::BIGINT[]))
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(&ms)
        .bind(&seq)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self, ids))]
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.require_group(stream, group).await?;

        let mut tx = self.pool.begin().await.map_err(database)?;
        touch_consumer(&mut tx, stream, group, consumer).await?;

        let (ms, seq) = id_arrays(ids.iter().copied());
        let rows = sqlx::query(
            r#"
            WITH claimed AS (
                UPDATE cannon_pending_entries
                SET consumer = $3, last_delivered_at = NOW()
                WHERE stream = $1 AND group_name = $2
                  AND (ms, seq) IN (SELECT * FROM UNNEST($4::BIGINT[], $5::BIGINT[]))
                  AND last_delivered_at <= NOW() - ($6::BIGINT * INTERVAL '1 millisecond')
                RETURNING stream, ms, seq
            )
            SELECT e.ms, e.seq, e.fields
            FROM claimed c
            JOIN cannon_stream_entries e
              ON e.stream = c.stream AND e.ms = c.ms AND e.seq = c.seq
            ORDER BY e.ms, e.seq
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(consumer)
        .bind(&ms)
        .bind(&seq)
        .bind(to_db(min_idle.as_millis() as u64))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to claim entries: {}", e);
            StoreError::Database(e.to_string())
        })?;

        tx.commit().await.map_err(database)?;

        let claimed = rows.iter().map(entry_from_row).collect::<Result<Vec<_>, _>>()?;
        debug!(stream, group, consumer, count = claimed.len(), "claimed entries");
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        self.require_group(stream, group).await?;

        let rows = sqlx::query(
            r#"
            SELECT ms, seq, consumer, delivery_count, last_delivered_at
            FROM cannon_pending_entries
            WHERE stream = $1 AND group_name = $2
            ORDER BY ms, seq
            LIMIT $3
            "#,
        )
        .bind(stream)
        .bind(group)
        .bind(to_db(count as u64))
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        let now = Utc::now();
        Ok(rows
            .iter()
            .map(|row| PendingEntry {
                id: id_from_row(row),
                consumer: row.get("consumer"),
                idle: idle_since(row.get("last_delivered_at"), now),
                delivery_count: row.get::<i64, _>("delivery_count") as u64,
            })
            .collect())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Ensure the stream row exists and lock it, returning its last id
async fn lock_stream(
    tx: &mut Transaction<'_, Postgres>,
    stream: &str,
) -> Result<MessageId, StoreError> {
    sqlx::query("INSERT INTO cannon_streams (stream) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(stream)
        .execute(&mut **tx)
        .await
        .map_err(database)?;

    let row = sqlx::query("SELECT last_ms, last_seq FROM cannon_streams WHERE stream = $1 FOR UPDATE")
        .bind(stream)
        .fetch_one(&mut **tx)
        .await
        .map_err(database)?;

    Ok(id_from_columns(&row, "last_ms", "last_seq"))
}

async fn touch_consumer(
    tx: &mut Transaction<'_, Postgres>,
    stream: &str,
    group: &str,
    consumer: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO cannon_consumers (stream, group_name, consumer)
        VALUES ($1, $2, $3)
        ON CONFLICT (stream, group_name, consumer) DO UPDATE SET seen_at = NOW()
        "#,
    )
    .bind(stream)
    .bind(group)
    .bind(consumer)
    .execute(&mut **tx)
    .await
    .map_err(database)?;
    Ok(())
}

fn database(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn no_group(stream: &str, group: &str) -> StoreError {
    StoreError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

/// Postgres has no unsigned integers; values past i64::MAX saturate
fn to_db(value: impl TryInto<i64>) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn idle_since(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - at).to_std().unwrap_or_default()
}

fn id_arrays(ids: impl Iterator<Item = MessageId>) -> (Vec<i64>, Vec<i64>) {
    ids.map(|id| (to_db(id.ms), to_db(id.seq))).unzip()
}

fn id_from_columns(row: &PgRow, ms: &str, seq: &str) -> MessageId {
    MessageId::new(row.get::<i64, _>(ms) as u64, row.get::<i64, _>(seq) as u64)
}

fn id_from_row(row: &PgRow) -> MessageId {
    id_from_columns(row, "ms", "seq")
}

fn entry_from_row(row: &PgRow) -> Result<StreamEntry, StoreError> {
    let json: serde_json::Value = row.get("fields");
    let fields: Fields =
        serde_json::from_value(json).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(StreamEntry {
        id: id_from_row(row),
        fields,
    })
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_backoff_is_capped() {
        let config = PollConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(300))
            .with_backoff_multiplier(2.0);

        let second = config.next_interval(config.min_interval);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(config.next_interval(second), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_multiplier_floor() {
        let config = PollConfig::new().with_backoff_multiplier(0.5);
        assert_eq!(config.backoff_multiplier, 1.0);
    }

    #[test]
    fn test_poll_config_serde_millis() {
        let config = PollConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["min_interval"], 20);
        assert_eq!(json["max_interval"], 500);
    }

    #[test]
    fn test_to_db_saturates() {
        assert_eq!(to_db(u64::MAX), i64::MAX);
        assert_eq!(to_db(42u64), 42);
    }
}
