//! Quarantine records for messages that exhausted their dispatch attempts.
//!
//! Entries copy every business-identifying field of the originating message, so
//! they remain inspectable after the message row itself has been pruned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, QueryBuilder, Sqlite, SqliteConnection};
use uuid::Uuid;

use crate::{
    error::Error,
    message::{Message, MessageKind},
    payload::Payload,
};

pub const DEFAULT_LIST_LIMIT: u32 = 50;

const DEAD_LETTER_COLUMNS: &str = "id, original_message_id, transaction_id, correlation_id, \
     aggregate_type, aggregate_id, message_type, payload, error, stack_trace, metadata, \
     failed_at, created_at";

/// State of the message at the moment it was dead-lettered.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterMetadata {
    pub attempts: u32,
    pub kind: MessageKind,
    pub sequence_number: u32,
}

#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    /// Id of the message this entry was made from. Not a foreign key.
    pub original_message_id: Uuid,
    pub transaction_id: Uuid,
    pub correlation_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    #[sqlx(json)]
    pub payload: Payload,
    pub error: String,
    pub stack_trace: Option<String>,
    #[sqlx(json)]
    pub metadata: DeadLetterMetadata,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_message(
        message: &Message,
        error: impl Into<String>,
        stack_trace: Option<String>,
        attempts: u32,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            original_message_id: message.id,
            transaction_id: message.transaction_id,
            correlation_id: message.correlation_id,
            aggregate_type: message.aggregate_type.clone(),
            aggregate_id: message.aggregate_id.clone(),
            message_type: message.message_type.clone(),
            payload: message.payload.clone(),
            error: error.into(),
            stack_trace,
            metadata: DeadLetterMetadata {
                attempts,
                kind: message.kind,
                sequence_number: message.sequence_number,
            },
            failed_at: now,
            created_at: now,
        }
    }

    pub(crate) async fn insert(db: &mut SqliteConnection, entry: &Self) -> Result<(), Error> {
        sqlx::query(&format!(
            "INSERT INTO outbox_dead_letter ({DEAD_LETTER_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(entry.id)
        .bind(entry.original_message_id)
        .bind(entry.transaction_id)
        .bind(entry.correlation_id)
        .bind(&entry.aggregate_type)
        .bind(&entry.aggregate_id)
        .bind(&entry.message_type)
        .bind(sqlx::types::Json(&entry.payload))
        .bind(&entry.error)
        .bind(&entry.stack_trace)
        .bind(sqlx::types::Json(&entry.metadata))
        .bind(entry.failed_at)
        .bind(entry.created_at)
        .execute(db)
        .await?;

        Ok(())
    }

    pub(crate) async fn list(
        db: &mut SqliteConnection,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<Self>, Error> {
        let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM outbox_dead_letter WHERE 1 = 1"
        ));

        if let Some(id) = filter.id {
            query_builder
                .push(" AND (id = ")
                .push_bind(id)
                .push(" OR original_message_id = ")
                .push_bind(id)
                .push(")");
        }
        if let Some(message_type) = &filter.message_type {
            query_builder
                .push(" AND message_type LIKE ")
                .push_bind(format!("%{message_type}%"));
        }
        if let Some(aggregate_type) = &filter.aggregate_type {
            query_builder
                .push(" AND aggregate_type LIKE ")
                .push_bind(format!("%{aggregate_type}%"));
        }
        if let Some(since) = filter.since {
            query_builder.push(" AND failed_at >= ").push_bind(since);
        }

        query_builder
            .push(" ORDER BY failed_at DESC, rowid DESC LIMIT ")
            .push_bind(filter.limit);

        Ok(query_builder.build_query_as().fetch_all(db).await?)
    }

    pub(crate) async fn count(db: &mut SqliteConnection) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_dead_letter")
            .fetch_one(db)
            .await?;

        Ok(count as u64)
    }

    /// Deletes up to `limit` entries created before `cutoff`, returning how many went.
    pub(crate) async fn delete_older_than(
        db: &mut SqliteConnection,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, Error> {
        let result = sqlx::query(
            "
            DELETE FROM outbox_dead_letter
            WHERE rowid IN (
                SELECT rowid FROM outbox_dead_letter
                WHERE created_at < $1
                LIMIT $2
            )
            ",
        )
        .bind(cutoff)
        .bind(limit)
        .execute(db)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Narrows a dead-letter listing. All criteria are optional and combined with AND.
#[derive(Debug, Clone, bon::Builder)]
pub struct DeadLetterFilter {
    /// Matches either the entry id or the original message id.
    pub id: Option<Uuid>,
    /// Substring of the message type.
    #[builder(into)]
    pub message_type: Option<String>,
    /// Substring of the aggregate type.
    #[builder(into)]
    pub aggregate_type: Option<String>,
    /// Only entries that failed at or after this instant.
    pub since: Option<DateTime<Utc>>,
    #[builder(default = DEFAULT_LIST_LIMIT)]
    pub limit: u32,
}

impl Default for DeadLetterFilter {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_copies_message_identity() {
        let message = Message::pending(
            Uuid::new_v4(),
            Uuid::new_v4(),
            2,
            MessageKind::Event,
            "Order",
            "123",
            Payload::new("order.shipped", 1, serde_json::json!({})),
            Utc::now(),
        );

        let entry = DeadLetterEntry::from_message(&message, "broker down", None, 3);

        assert_eq!(entry.original_message_id, message.id);
        assert_eq!(entry.transaction_id, message.transaction_id);
        assert_eq!(entry.correlation_id, message.correlation_id);
        assert_eq!(entry.aggregate_type, "Order");
        assert_eq!(entry.aggregate_id, "123");
        assert_eq!(entry.message_type, "order.shipped");
        assert_eq!(
            entry.metadata,
            DeadLetterMetadata {
                attempts: 3,
                kind: MessageKind::Event,
                sequence_number: 2,
            }
        );
        assert_ne!(entry.id, message.id);
    }

    #[test]
    fn test_filter_defaults() {
        let filter = DeadLetterFilter::default();
        assert_eq!(filter.limit, 50);
        assert!(filter.id.is_none());

        let filter = DeadLetterFilter::builder()
            .message_type("order")
            .limit(5)
            .build();
        assert_eq!(filter.message_type.as_deref(), Some("order"));
        assert_eq!(filter.limit, 5);
    }
}
