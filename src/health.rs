//! Read-only health checks and statistics over the outbox tables.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    config::Config,
    error::Error,
    message::{Message, MessageKind, MessageStatus, MESSAGE_COLUMNS},
};

/// Oldest pending message age above which the outbox is reported as lagging.
pub const PENDING_AGE_WARNING: TimeDelta = TimeDelta::hours(1);

/// Pending backlog above which the outbox is reported as lagging.
pub const PENDING_BACKLOG_WARNING: u64 = 1000;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Stuck messages are critical; an old or large pending backlog is a warning.
    pub fn evaluate(stuck: u64, pending: u64, oldest_pending_age: Option<TimeDelta>) -> Self {
        if stuck > 0 {
            Self::Critical
        } else if pending > PENDING_BACKLOG_WARNING
            || oldest_pending_age.is_some_and(|age| age > PENDING_AGE_WARNING)
        {
            Self::Warning
        } else {
            Self::Healthy
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub messages: BTreeMap<MessageStatus, u64>,
    pub oldest_pending: Option<DateTime<Utc>>,
    /// Messages in `processing` for longer than the configured threshold
    pub stuck_processing: u64,
    pub dead_letters: u64,
    pub oldest_dead_letter: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn count(&self, status: MessageStatus) -> u64 {
        self.messages.get(&status).copied().unwrap_or(0)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OutboxStats {
    pub total: u64,
    pub by_status: BTreeMap<MessageStatus, u64>,
    pub by_kind: BTreeMap<MessageKind, u64>,
    pub completed_last_hour: u64,
    pub completed_last_day: u64,
    pub failed: u64,
    pub dead_letters: u64,
    /// Mean time between claim and completion, over completed messages
    pub avg_processing_secs: Option<f64>,
}

#[derive(Clone)]
pub struct Health {
    db: SqlitePool,
    stuck_after: Duration,
}

impl Health {
    pub fn new(db: SqlitePool, config: &Config) -> Self {
        Self {
            db,
            stuck_after: config.stuck_after(),
        }
    }

    fn stuck_cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
        let stuck_after = TimeDelta::from_std(self.stuck_after).map_err(Error::internal)?;
        Ok(now - stuck_after)
    }

    /// Messages claimed before this instant and still `processing` count as stuck.
    /// Pass it to [`MessageStore::reset_stuck`](crate::store::MessageStore::reset_stuck)
    /// to recover them.
    pub fn stuck_since(&self) -> Result<DateTime<Utc>, Error> {
        self.stuck_cutoff(Utc::now())
    }

    pub async fn check(&self) -> Result<HealthReport, Error> {
        let now = Utc::now();
        let mut conn = self.db.acquire().await?;

        let messages: BTreeMap<MessageStatus, u64> = sqlx::query_as::<_, (MessageStatus, i64)>(
            "SELECT status, COUNT(*) FROM outbox_messages GROUP BY status",
        )
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|(status, count)| (status, count as u64))
        .collect();

        let oldest_pending: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(created_at) FROM outbox_messages WHERE status = 'pending'",
        )
        .fetch_one(&mut *conn)
        .await?;

        let stuck_processing: i64 = sqlx::query_scalar(
            "
            SELECT COUNT(*) FROM outbox_messages
            WHERE status = 'processing' AND processing_started_at < $1
            ",
        )
        .bind(self.stuck_cutoff(now)?)
        .fetch_one(&mut *conn)
        .await?;

        let (dead_letters, oldest_dead_letter): (i64, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT COUNT(*), MIN(failed_at) FROM outbox_dead_letter")
                .fetch_one(&mut *conn)
                .await?;

        let pending = messages
            .get(&MessageStatus::Pending)
            .copied()
            .unwrap_or(0);

        let status = HealthStatus::evaluate(
            stuck_processing as u64,
            pending,
            oldest_pending.map(|created_at| now - created_at),
        );

        if status != HealthStatus::Healthy {
            tracing::warn!(
                %status,
                pending,
                stuck = stuck_processing,
                "Outbox health degraded"
            );
        }

        Ok(HealthReport {
            status,
            messages,
            oldest_pending,
            stuck_processing: stuck_processing as u64,
            dead_letters: dead_letters as u64,
            oldest_dead_letter,
            checked_at: now,
        })
    }

    pub async fn stats(&self) -> Result<OutboxStats, Error> {
        let now = Utc::now();
        let mut conn = self.db.acquire().await?;

        let by_status: BTreeMap<MessageStatus, u64> = sqlx::query_as::<_, (MessageStatus, i64)>(
            "SELECT status, COUNT(*) FROM outbox_messages GROUP BY status",
        )
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|(status, count)| (status, count as u64))
        .collect();

        let by_kind: BTreeMap<MessageKind, u64> = sqlx::query_as::<_, (MessageKind, i64)>(
            "SELECT kind, COUNT(*) FROM outbox_messages GROUP BY kind",
        )
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|(kind, count)| (kind, count as u64))
        .collect();

        let (completed_last_hour, completed_last_day): (i64, i64) = sqlx::query_as(
            "
            SELECT
                COUNT(CASE WHEN processed_at >= $1 THEN 1 END),
                COUNT(CASE WHEN processed_at >= $2 THEN 1 END)
            FROM outbox_messages
            WHERE status = 'completed'
            ",
        )
        .bind(now - TimeDelta::hours(1))
        .bind(now - TimeDelta::days(1))
        .fetch_one(&mut *conn)
        .await?;

        let avg_processing_secs: Option<f64> = sqlx::query_scalar(
            "
            SELECT AVG((julianday(processed_at) - julianday(processing_started_at)) * 86400.0)
            FROM outbox_messages
            WHERE status = 'completed'
                AND processed_at IS NOT NULL
                AND processing_started_at IS NOT NULL
            ",
        )
        .fetch_one(&mut *conn)
        .await?;

        let dead_letters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_dead_letter")
            .fetch_one(&mut *conn)
            .await?;

        Ok(OutboxStats {
            total: by_status.values().sum(),
            failed: by_status.get(&MessageStatus::Failed).copied().unwrap_or(0),
            by_status,
            by_kind,
            completed_last_hour: completed_last_hour as u64,
            completed_last_day: completed_last_day as u64,
            dead_letters: dead_letters as u64,
            avg_processing_secs,
        })
    }

    /// Messages stuck in `processing` past the threshold, longest stuck first.
    pub async fn stuck_messages(&self) -> Result<Vec<Message>, Error> {
        let sql = format!(
            "
            SELECT {MESSAGE_COLUMNS} FROM outbox_messages
            WHERE status = 'processing' AND processing_started_at < $1
            ORDER BY processing_started_at
            "
        );

        Ok(sqlx::query_as(&sql)
            .bind(self.stuck_cutoff(Utc::now())?)
            .fetch_all(&self.db)
            .await?)
    }

    /// Failed messages with at least `min_attempts` attempts, most attempts first.
    pub async fn repeated_failures(&self, min_attempts: u32) -> Result<Vec<Message>, Error> {
        let sql = format!(
            "
            SELECT {MESSAGE_COLUMNS} FROM outbox_messages
            WHERE status = 'failed' AND attempts >= $1
            ORDER BY attempts DESC, updated_at DESC
            "
        );

        Ok(sqlx::query_as(&sql)
            .bind(min_attempts)
            .fetch_all(&self.db)
            .await?)
    }

    /// Messages whose recorded completion precedes their claim, a sign of clock
    /// skew between relays or of rows edited by hand.
    pub async fn out_of_order(&self) -> Result<Vec<Message>, Error> {
        let sql = format!(
            "
            SELECT {MESSAGE_COLUMNS} FROM outbox_messages
            WHERE processed_at IS NOT NULL AND processed_at < processing_started_at
            ORDER BY created_at, sequence_number
            "
        );

        Ok(sqlx::query_as(&sql).fetch_all(&self.db).await?)
    }

    /// The most frequent error texts among failed messages, most frequent first.
    pub async fn error_patterns(&self, limit: u32) -> Result<Vec<ErrorPattern>, Error> {
        let rows: Vec<(Option<String>, i64)> = sqlx::query_as(
            "
            SELECT error, COUNT(*) AS count
            FROM outbox_messages
            WHERE status = 'failed'
            GROUP BY error
            ORDER BY count DESC, error
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(error, count)| ErrorPattern {
                error,
                count: count as u64,
            })
            .collect())
    }

    /// Claim-to-completion durations over every message that has both timestamps.
    pub async fn processing_times(&self) -> Result<ProcessingTimes, Error> {
        let (samples, avg_secs, min_secs, max_secs): (i64, Option<f64>, Option<f64>, Option<f64>) =
            sqlx::query_as(
                "
                SELECT COUNT(*), AVG(secs), MIN(secs), MAX(secs)
                FROM (
                    SELECT (julianday(processed_at) - julianday(processing_started_at)) * 86400.0
                        AS secs
                    FROM outbox_messages
                    WHERE processed_at IS NOT NULL AND processing_started_at IS NOT NULL
                )
                ",
            )
            .fetch_one(&self.db)
            .await?;

        Ok(ProcessingTimes {
            samples: samples as u64,
            avg_secs,
            min_secs,
            max_secs,
        })
    }

    /// Messages created within the last `window`, oldest first, with their
    /// lifecycle timestamps.
    pub async fn timeline(&self, window: TimeDelta) -> Result<Vec<TimelineEntry>, Error> {
        let sql = format!(
            "
            SELECT {MESSAGE_COLUMNS} FROM outbox_messages
            WHERE created_at >= $1
            ORDER BY created_at, sequence_number
            "
        );

        let messages: Vec<Message> = sqlx::query_as(&sql)
            .bind(Utc::now() - window)
            .fetch_all(&self.db)
            .await?;

        Ok(messages.into_iter().map(TimelineEntry::from).collect())
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorPattern {
    pub error: Option<String>,
    pub count: u64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct ProcessingTimes {
    pub samples: u64,
    pub avg_secs: Option<f64>,
    pub min_secs: Option<f64>,
    pub max_secs: Option<f64>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub id: Uuid,
    pub message_type: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Seconds from claim to completion, once completed
    pub duration_secs: Option<f64>,
}

impl From<Message> for TimelineEntry {
    fn from(message: Message) -> Self {
        let duration_secs = message
            .processing_started_at
            .zip(message.processed_at)
            .and_then(|(started, processed)| (processed - started).num_microseconds())
            .map(|micros| micros as f64 / 1_000_000.0);

        Self {
            id: message.id,
            message_type: message.message_type,
            status: message.status,
            created_at: message.created_at,
            processing_started_at: message.processing_started_at,
            processed_at: message.processed_at,
            duration_secs,
        }
    }
}
