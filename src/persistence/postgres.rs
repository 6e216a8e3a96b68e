//! PostgreSQL implementation of the durable log and relation store.
//!
//! Topics share one `log_records` table keyed by `(topic, id)`; consumer
//! positions live in `consumer_offsets`. Friendships and blocks are read
//! from the relation service's `friendship` table, where `status = 1` marks
//! a block placed by `user_id` on `friend_id`.
//!
//! An insert trigger serializes writers per topic before drawing the id, so
//! ids on one topic become visible in id order and a consumer may advance
//! its cursor past the highest id it has read.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;

use super::{LogConsumer, LogProducer, LogRecord};
use crate::config::GatewayConfig;
use crate::domain::UserId;
use crate::error::GatewayError;
use crate::relation::{BlockStatus, RelationChecker};

/// `friendship.status` value marking a block.
const STATUS_BLOCKED: i16 = 1;

/// Opens a connection pool sized from configuration.
///
/// # Errors
///
/// Returns a [`GatewayError::PersistenceError`] if the database cannot be
/// reached within the connect timeout.
pub async fn connect(config: &GatewayConfig) -> Result<PgPool, GatewayError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}

/// Applies the bundled schema migrations.
///
/// # Errors
///
/// Returns a [`GatewayError::PersistenceError`] if a migration fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), GatewayError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| GatewayError::PersistenceError(e.to_string()))
}

/// One durable-log topic stored in PostgreSQL.
///
/// As a [`LogConsumer`] it follows the topic for `group`. With no committed
/// offset the group starts at the newest record, so a fresh gateway does not
/// replay history.
#[derive(Debug)]
pub struct PostgresLog {
    pool: PgPool,
    topic: String,
    group: String,
    cursor: Mutex<Option<i64>>,
}

impl PostgresLog {
    /// Creates a handle on `topic` for consumer group `group`.
    #[must_use]
    pub fn new(pool: PgPool, topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            pool,
            topic: topic.into(),
            group: group.into(),
            cursor: Mutex::new(None),
        }
    }

    async fn load_cursor(&self) -> Result<i64, GatewayError> {
        let committed = sqlx::query_scalar::<_, i64>(
            "SELECT last_id FROM consumer_offsets WHERE group_id = $1 AND topic = $2",
        )
        .bind(&self.group)
        .bind(&self.topic)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(last_id) = committed {
            return Ok(last_id);
        }

        let newest = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(id), 0) FROM log_records WHERE topic = $1",
        )
        .bind(&self.topic)
        .fetch_one(&self.pool)
        .await?;
        self.commit(newest).await?;
        tracing::info!(topic = %self.topic, group = %self.group, offset = newest, "consumer group initialized at newest record");
        Ok(newest)
    }
}

#[async_trait]
impl LogProducer for PostgresLog {
    async fn publish(&self, key: &str, value: &[u8]) -> Result<(), GatewayError> {
        sqlx::query("INSERT INTO log_records (topic, record_key, payload) VALUES ($1, $2, $3)")
            .bind(&self.topic)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for PostgresLog {
    async fn poll(&self, max: usize) -> Result<Vec<LogRecord>, GatewayError> {
        let mut cursor = self.cursor.lock().await;
        let from = match *cursor {
            Some(offset) => offset,
            None => self.load_cursor().await?,
        };

        let rows = sqlx::query_as::<_, (i64, String, String, Vec<u8>, DateTime<Utc>)>(
            "SELECT id, topic, record_key, payload, created_at FROM log_records \
             WHERE topic = $1 AND id > $2 ORDER BY id ASC LIMIT $3",
        )
        .bind(&self.topic)
        .bind(from)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let records: Vec<LogRecord> = rows
            .into_iter()
            .map(|(offset, topic, key, value, created_at)| LogRecord {
                offset,
                topic,
                key,
                value,
                created_at,
            })
            .collect();
        *cursor = Some(records.last().map_or(from, |r| r.offset));
        Ok(records)
    }

    async fn commit(&self, offset: i64) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO consumer_offsets (group_id, topic, last_id, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (group_id, topic) DO UPDATE \
             SET last_id = GREATEST(consumer_offsets.last_id, EXCLUDED.last_id), updated_at = now()",
        )
        .bind(&self.group)
        .bind(&self.topic)
        .bind(offset)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Relation checker backed by the relation service's `friendship` table.
#[derive(Debug, Clone)]
pub struct PostgresRelations {
    pool: PgPool,
}

impl PostgresRelations {
    /// Creates a checker over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelationChecker for PostgresRelations {
    async fn is_friend(&self, user: UserId, friend: UserId) -> Result<bool, GatewayError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM friendship WHERE user_id = $1 AND friend_id = $2)",
        )
        .bind(user.get())
        .bind(friend.get())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| GatewayError::RelationUnavailable(e.to_string()))
    }

    async fn block_status(
        &self,
        sender: UserId,
        receiver: UserId,
    ) -> Result<BlockStatus, GatewayError> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT user_id, friend_id FROM friendship \
             WHERE status = $3 AND ((user_id = $1 AND friend_id = $2) OR (user_id = $2 AND friend_id = $1))",
        )
        .bind(sender.get())
        .bind(receiver.get())
        .bind(STATUS_BLOCKED)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::RelationUnavailable(e.to_string()))?;

        let mut status = BlockStatus::default();
        for (blocker, _) in rows {
            if blocker == sender.get() {
                status.sender_blocked = true;
            } else {
                status.receiver_blocked = true;
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    const INSERT: &str =
        "INSERT INTO log_records (topic, record_key, payload) VALUES ($1, $2, ''::bytea)";

    async fn database() -> PgPool {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            panic!("DATABASE_URL must be set");
        };
        let Ok(pool) = PgPool::connect(&url).await else {
            panic!("database unreachable");
        };
        tokio_test::assert_ok!(run_migrations(&pool).await);
        pool
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL DATABASE_URL"]
    async fn record_committed_late_is_not_skipped() {
        let pool = database().await;
        let topic = format!("test.ordering.{}", uuid::Uuid::new_v4());
        let log = PostgresLog::new(pool.clone(), topic.as_str(), "test-group");
        assert!(log.poll(10).await.is_ok_and(|r| r.is_empty()));

        let Ok(mut first) = pool.begin().await else {
            panic!("begin failed");
        };
        tokio_test::assert_ok!(
            sqlx::query(INSERT)
                .bind(&topic)
                .bind("first")
                .execute(&mut *first)
                .await
        );

        let second = tokio::spawn({
            let pool = pool.clone();
            let topic = topic.clone();
            async move {
                sqlx::query(INSERT)
                    .bind(topic)
                    .bind("second")
                    .execute(&pool)
                    .await
                    .map(|_| ())
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            log.poll(10).await.is_ok_and(|r| r.is_empty()),
            "a later insert must not become visible ahead of an open one"
        );

        tokio_test::assert_ok!(first.commit().await);
        let Ok(Ok(())) = second.await else {
            panic!("second insert failed");
        };

        let Ok(records) = log.poll(10).await else {
            panic!("poll failed");
        };
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["first", "second"]);
        assert!(records.first().map(|r| r.offset) < records.last().map(|r| r.offset));
    }
}
