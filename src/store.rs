//! The message store: persistence contract shared by the collector, the relay and
//! operator tooling.
//!
//! Every state transition the relay performs is a single conditional `UPDATE`,
//! so concurrent relays coordinate through SQLite alone.

use chrono::{DateTime, Utc};
use sqlx::{Acquire, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::{
    config::Config,
    dead_letter::{DeadLetterEntry, DeadLetterFilter},
    error::Error,
    message::{Message, MessageStatus, MESSAGE_COLUMNS},
};

#[derive(Clone)]
pub struct MessageStore {
    db: SqlitePool,
    max_attempts: u32,
    dead_letter_enabled: bool,
}

impl MessageStore {
    pub fn new(db: SqlitePool, config: &Config) -> Self {
        Self {
            db,
            max_attempts: config.max_attempts(),
            dead_letter_enabled: config.dead_letter_enabled(),
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn dead_letter_enabled(&self) -> bool {
        self.dead_letter_enabled
    }

    /// Bulk inserts `messages` on `conn`, all or nothing under the caller's transaction.
    pub async fn store(&self, conn: &mut SqliteConnection, messages: &[Message]) -> Result<(), Error> {
        Message::insert_batch(conn, messages).await
    }

    /// Runs `work` inside a database transaction, committing when it returns `Ok`
    /// and rolling back otherwise. The error of `work` is returned unchanged.
    pub async fn run_atomic<F, R, E>(&self, work: F) -> Result<R, E>
    where
        F: AsyncFnOnce(&mut SqliteConnection) -> Result<R, E>,
        E: From<Error>,
    {
        let mut tx = self.db.begin().await.map_err(Error::from)?;

        let result = work(tx.acquire().await.map_err(Error::from)?).await;

        match result {
            Ok(value) => {
                tx.commit().await.map_err(Error::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!("Failed to roll back outbox transaction: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Pending messages that still have attempts left, oldest first.
    pub async fn fetch_pending(&self, limit: u32) -> Result<Vec<Message>, Error> {
        let mut conn = self.db.acquire().await?;

        let sql = format!(
            "
            SELECT {MESSAGE_COLUMNS} FROM outbox_messages
            WHERE status = 'pending' AND attempts < $1
            ORDER BY created_at, sequence_number, rowid
            LIMIT $2
            "
        );

        let mut stream = sqlx::query_as(&sql)
            .bind(self.max_attempts)
            .bind(limit)
            .fetch(&mut *conn);

        let mut messages = Vec::new();

        while let Some(message) = stream.next().await.transpose()? {
            messages.push(message);
        }

        Ok(messages)
    }

    /// Atomically moves a pending message to processing and counts the attempt.
    ///
    /// Returns `false` when the message is no longer pending, which means another
    /// relay got there first.
    pub async fn claim(&self, id: Uuid) -> Result<bool, Error> {
        let now = Utc::now();

        let result = sqlx::query(
            "
            UPDATE outbox_messages
            SET status = 'processing',
                attempts = attempts + 1,
                processing_started_at = $1,
                updated_at = $2
            WHERE id = $3 AND status = 'pending' AND attempts < $4
            ",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(self.max_attempts)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves a processing message to completed. Calling it for a message that is
    /// already completed changes nothing and returns `false`.
    pub async fn complete(&self, id: Uuid) -> Result<bool, Error> {
        let now = Utc::now();

        let result = sqlx::query(
            "
            UPDATE outbox_messages
            SET status = 'completed', processed_at = $1, updated_at = $2
            WHERE id = $3 AND status = 'processing'
            ",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn fail(&self, id: Uuid, error: &str) -> Result<bool, Error> {
        let mut conn = self.db.acquire().await?;
        Message::mark_failed(&mut conn, id, error).await
    }

    /// Hands a processing message back to the pending pool after a failed dispatch,
    /// keeping its attempt count.
    pub async fn release(&self, id: Uuid, error: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            "
            UPDATE outbox_messages
            SET status = 'pending', error = $1, updated_at = $2
            WHERE id = $3 AND status = 'processing'
            ",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Writes a dead-letter entry for `message`. Returns `None` without writing
    /// when dead-lettering is disabled.
    pub async fn dead_letter(
        &self,
        message: &Message,
        error: &str,
        stack_trace: Option<String>,
    ) -> Result<Option<DeadLetterEntry>, Error> {
        if !self.dead_letter_enabled {
            return Ok(None);
        }

        let entry = DeadLetterEntry::from_message(message, error, stack_trace, message.attempts);

        let mut conn = self.db.acquire().await?;
        DeadLetterEntry::insert(&mut conn, &entry).await?;

        Ok(Some(entry))
    }

    /// Marks `message` failed and writes its dead-letter entry in one transaction.
    pub async fn fail_and_dead_letter(
        &self,
        message: &Message,
        error: &str,
        stack_trace: Option<String>,
    ) -> Result<Option<DeadLetterEntry>, Error> {
        let mut tx = self.db.begin().await?;

        Message::mark_failed(tx.acquire().await?, message.id, error).await?;

        let entry = if self.dead_letter_enabled {
            let entry =
                DeadLetterEntry::from_message(message, error, stack_trace, message.attempts);
            DeadLetterEntry::insert(tx.acquire().await?, &entry).await?;
            Some(entry)
        } else {
            None
        };

        tx.commit().await?;

        Ok(entry)
    }

    pub async fn get(&self, id: Uuid) -> Result<Message, Error> {
        let mut conn = self.db.acquire().await?;

        Message::find(&mut conn, id)
            .await?
            .ok_or_else(|| Error::message_not_found(id))
    }

    /// All messages written by one outbox transaction, in sequence order.
    pub async fn transaction_messages(&self, transaction_id: Uuid) -> Result<Vec<Message>, Error> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM outbox_messages
            WHERE transaction_id = $1
            ORDER BY sequence_number"
        );

        Ok(sqlx::query_as(&sql)
            .bind(transaction_id)
            .fetch_all(&self.db)
            .await?)
    }

    /// Puts failed messages back in the pending pool with a fresh attempt budget.
    /// An empty `ids` resets every failed message.
    pub async fn reset_failed(&self, ids: &[Uuid]) -> Result<u64, Error> {
        let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "
            UPDATE outbox_messages
            SET status = 'pending',
                attempts = 0,
                error = NULL,
                processing_started_at = NULL,
                updated_at = ",
        );
        query_builder.push_bind(Utc::now());
        query_builder.push(" WHERE status = 'failed'");

        if !ids.is_empty() {
            query_builder.push(" AND id IN (");
            let mut separated = query_builder.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }

        let reset = query_builder
            .build()
            .execute(&self.db)
            .await?
            .rows_affected();

        tracing::info!(reset, "Reset failed outbox messages");

        Ok(reset)
    }

    /// Recovers messages left in `processing` since before `claimed_before`, e.g.
    /// by a relay that crashed or could not record the outcome of a dispatch.
    ///
    /// Messages with attempts left go back to `pending`; the others become
    /// `failed`, where [`MessageStore::reset_failed`] can pick them up. The last
    /// recorded error is kept.
    pub async fn reset_stuck(&self, claimed_before: DateTime<Utc>) -> Result<u64, Error> {
        let reset = sqlx::query(
            "
            UPDATE outbox_messages
            SET status = CASE WHEN attempts < $1 THEN 'pending' ELSE 'failed' END,
                error = COALESCE(error, $2),
                updated_at = $3
            WHERE status = 'processing' AND processing_started_at < $4
            ",
        )
        .bind(self.max_attempts)
        .bind("Processing interrupted before the outcome was recorded")
        .bind(Utc::now())
        .bind(claimed_before)
        .execute(&self.db)
        .await?
        .rows_affected();

        tracing::info!(reset, "Reset stuck outbox messages");

        Ok(reset)
    }

    /// Deletes completed or failed messages created before `older_than`, `batch`
    /// rows per statement.
    pub async fn prune(
        &self,
        status: MessageStatus,
        older_than: DateTime<Utc>,
        batch: u32,
    ) -> Result<u64, Error> {
        if !matches!(status, MessageStatus::Completed | MessageStatus::Failed) {
            return Err(Error::invalid_parameter(format!(
                "Refusing to prune {status} messages"
            )));
        }
        if batch == 0 {
            return Err(Error::invalid_parameter("Prune batch size must be at least 1"));
        }

        let mut total = 0;

        loop {
            let deleted = sqlx::query(
                "
                DELETE FROM outbox_messages
                WHERE rowid IN (
                    SELECT rowid FROM outbox_messages
                    WHERE status = $1 AND created_at < $2
                    LIMIT $3
                )
                ",
            )
            .bind(status)
            .bind(older_than)
            .bind(batch)
            .execute(&self.db)
            .await?
            .rows_affected();

            total += deleted;

            if deleted < u64::from(batch) {
                break;
            }
        }

        tracing::info!(%status, deleted = total, "Pruned outbox messages");

        Ok(total)
    }

    pub async fn prune_dead_letters(
        &self,
        older_than: DateTime<Utc>,
        batch: u32,
    ) -> Result<u64, Error> {
        if !self.dead_letter_enabled {
            return Ok(0);
        }
        if batch == 0 {
            return Err(Error::invalid_parameter("Prune batch size must be at least 1"));
        }

        let mut conn = self.db.acquire().await?;
        let mut total = 0;

        loop {
            let deleted = DeadLetterEntry::delete_older_than(&mut conn, older_than, batch).await?;
            total += deleted;

            if deleted < u64::from(batch) {
                break;
            }
        }

        tracing::info!(deleted = total, "Pruned dead-letter entries");

        Ok(total)
    }

    /// Dead-letter entries matching `filter`, most recent failure first.
    pub async fn dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, Error> {
        let mut conn = self.db.acquire().await?;
        DeadLetterEntry::list(&mut conn, filter).await
    }

    pub async fn dead_letter_count(&self) -> Result<u64, Error> {
        let mut conn = self.db.acquire().await?;
        DeadLetterEntry::count(&mut conn).await
    }
}
