//! Outbox message types and status management.
//!
//! A message is the durable intent to publish an event or enqueue a job. Messages
//! are written in bulk by the [`Collector`](crate::collector::Collector) when a
//! business transaction commits, and afterwards only mutated by the
//! [`Relay`](crate::relay::Relay).
//!
//! # Message Lifecycle
//!
//! 1. Messages are created in `Pending` status with zero attempts
//! 2. A relay claims a message, moving it to `Processing` and counting an attempt
//! 3. When dispatch succeeds, it moves to `Completed`
//! 4. When dispatch fails it goes back to `Pending` until the attempt budget is
//!    spent, then it moves to `Failed` and a dead-letter entry is written
//!
//! Operators may reset `Failed` messages back to `Pending`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, QueryBuilder, Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::{error::Error, payload::Payload};

/// Rows per INSERT statement, keeping bound parameters well below SQLite's limit.
const INSERT_CHUNK_SIZE: usize = 500;

pub(crate) const MESSAGE_COLUMNS: &str = "id, transaction_id, correlation_id, sequence_number, \
     kind, aggregate_type, aggregate_id, message_type, payload, status, attempts, \
     processing_started_at, processed_at, error, created_at, updated_at";

/// Whether a message is published on the event bus or pushed onto the job queue.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
    Event,
    Job,
}

/// Represents the current status of a message in the outbox.
///
/// The status transitions follow:
/// `Pending` -> `Processing` (claimed by a relay)
/// `Processing` -> `Completed` (dispatch succeeded)
/// `Processing` -> `Pending` (dispatch failed, attempts remain)
/// `Processing` -> `Failed` (dispatch failed, attempts exhausted)
/// `Failed` -> `Pending` (operator reset)
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be claimed by a relay
    Pending,
    /// Claimed by a relay, dispatch in flight
    Processing,
    /// Dispatched successfully
    Completed,
    /// Dispatch failed permanently
    Failed,
}

/// A persisted outbox message.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    /// Groups the messages emitted by one business transaction
    pub transaction_id: Uuid,
    /// Links messages across the transactions of one logical flow
    pub correlation_id: Uuid,
    /// Zero-based position of the message within its transaction
    pub sequence_number: u32,

    pub kind: MessageKind,
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Schema tag of the payload
    pub message_type: String,
    #[sqlx(json)]
    pub payload: Payload,

    pub status: MessageStatus,
    /// Number of claims made so far
    pub attempts: u32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Text of the last dispatch failure
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Builds a fresh pending message, as written at commit time.
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        transaction_id: Uuid,
        correlation_id: Uuid,
        sequence_number: u32,
        kind: MessageKind,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: Payload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            correlation_id,
            sequence_number,
            kind,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            message_type: payload.schema.clone(),
            payload,
            status: MessageStatus::Pending,
            attempts: 0,
            processing_started_at: None,
            processed_at: None,
            error: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Inserts all messages on the given connection. Callers provide the
    /// transaction; a failure part-way leaves it to be rolled back.
    pub(crate) async fn insert_batch(
        db: &mut SqliteConnection,
        messages: &[Message],
    ) -> Result<(), Error> {
        for chunk in messages.chunks(INSERT_CHUNK_SIZE) {
            let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO outbox_messages ({MESSAGE_COLUMNS}) "
            ));

            query_builder.push_values(chunk, |mut b, message| {
                b.push_bind(message.id)
                    .push_bind(message.transaction_id)
                    .push_bind(message.correlation_id)
                    .push_bind(message.sequence_number)
                    .push_bind(message.kind)
                    .push_bind(&message.aggregate_type)
                    .push_bind(&message.aggregate_id)
                    .push_bind(&message.message_type)
                    .push_bind(sqlx::types::Json(&message.payload))
                    .push_bind(message.status)
                    .push_bind(message.attempts)
                    .push_bind(message.processing_started_at)
                    .push_bind(message.processed_at)
                    .push_bind(&message.error)
                    .push_bind(message.created_at)
                    .push_bind(message.updated_at);
            });

            query_builder.build().execute(&mut *db).await?;
        }

        Ok(())
    }

    pub(crate) async fn find(db: &mut SqliteConnection, id: Uuid) -> Result<Option<Self>, Error> {
        Ok(sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?)
    }

    /// Moves the message to `Failed` whatever its current status, recording the error.
    pub(crate) async fn mark_failed(
        db: &mut SqliteConnection,
        id: Uuid,
        error: &str,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            "
            UPDATE outbox_messages
            SET status = 'failed', error = $1, updated_at = $2
            WHERE id = $3
            ",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_status_text_form() {
        let test_cases = vec![
            ("pending", MessageStatus::Pending),
            ("processing", MessageStatus::Processing),
            ("completed", MessageStatus::Completed),
            ("failed", MessageStatus::Failed),
        ];

        for (text, status) in test_cases {
            assert_eq!(status.to_string(), text);
            assert_eq!(MessageStatus::from_str(text).unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(text)
            );
        }

        assert!(MessageStatus::from_str("delivered").is_err());
    }

    #[test]
    fn test_pending_message() {
        let payload = Payload::new("order.created", 1, serde_json::json!({ "id": 1 }));
        let now = Utc::now();
        let transaction_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();

        let message = Message::pending(
            transaction_id,
            correlation_id,
            4,
            MessageKind::Job,
            "Order",
            "123",
            payload,
            now,
        );

        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.attempts, 0);
        assert_eq!(message.sequence_number, 4);
        assert_eq!(message.message_type, "order.created");
        assert_eq!(message.kind.to_string(), "job");
        assert_eq!(message.created_at, message.updated_at);
        assert!(message.error.is_none());
    }
}
