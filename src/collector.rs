//! Transaction collector.
//!
//! Couples a business mutation with the messages it wants to emit. The unit of
//! work receives an [`OutboxTx`], which exposes the open database transaction
//! for the mutation and buffers every `publish`/`enqueue` call. When the work
//! succeeds, the buffer is written to the outbox on the same transaction before
//! it commits; when it fails, nothing is written and the transaction rolls back.
//!
//! ```no_run
//! # use stowaway::{collector::OutboxTx, error::Error, payload::OutboxPayload, service::Service};
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct OrderCreated { order_id: String }
//! # impl OutboxPayload for OrderCreated { const SCHEMA: &'static str = "order.created"; }
//! # async fn example(service: Service) -> Result<(), Error> {
//! let collector = service.collector();
//!
//! collector
//!     .run_transaction("Order", "123", async |tx: &mut OutboxTx<'_>| {
//!         sqlx::query("UPDATE orders SET state = 'placed' WHERE id = 123")
//!             .execute(tx.conn())
//!             .await?;
//!
//!         tx.publish(&OrderCreated { order_id: "123".to_owned() })?;
//!
//!         Ok::<_, Error>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::{
    error::Error,
    message::{Message, MessageKind},
    metrics::Metrics,
    payload::{OutboxPayload, Payload},
    store::MessageStore,
};

#[derive(Debug, Clone)]
struct Collected {
    payload: Payload,
    kind: MessageKind,
}

/// Buffers the messages of one outbox transaction at a time.
///
/// Use one collector per request or task. A collector refuses to start a
/// transaction while another one is active on it.
pub struct Collector {
    store: MessageStore,
    metrics: Arc<dyn Metrics>,
    correlation_id: Option<Uuid>,
    active: AtomicBool,
    buffer: Mutex<Vec<Collected>>,
}

/// Returns the collector to its idle state however the transaction ends.
struct ActiveGuard<'a> {
    collector: &'a Collector,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.collector.lock_buffer().clear();
        self.collector.active.store(false, Ordering::Release);
    }
}

impl Collector {
    pub fn new(store: MessageStore, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            store,
            metrics,
            correlation_id: None,
            active: AtomicBool::new(false),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Pins the correlation id shared by every transaction run on this collector.
    pub fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Appends a message to the buffer of the active transaction.
    pub fn collect(&self, payload: Payload, kind: MessageKind) -> Result<(), Error> {
        if !self.is_active() {
            return Err(Error::protocol(
                "Cannot collect outbox messages outside of an outbox transaction",
            ));
        }

        self.lock_buffer().push(Collected { payload, kind });

        Ok(())
    }

    /// Runs `work` in a database transaction and persists every message it
    /// collected on that same transaction.
    ///
    /// Returns the result of `work`. Errors from `work` are returned unchanged
    /// after the rollback; storage errors are converted with `From`.
    pub async fn run_transaction<F, R, E>(
        &self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        work: F,
    ) -> Result<R, E>
    where
        F: AsyncFnOnce(&mut OutboxTx<'_>) -> Result<R, E>,
        E: From<Error>,
    {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::protocol("Nested outbox transactions are not supported").into());
        }

        let _guard = ActiveGuard { collector: self };

        let aggregate_type = aggregate_type.into();
        let aggregate_id = aggregate_id.into();
        let transaction_id = Uuid::new_v4();
        let correlation_id = self.correlation_id.unwrap_or_else(Uuid::new_v4);

        let timer = self.metrics.start_timer();

        let (result, stored) = self
            .store
            .run_atomic(async move |conn: &mut SqliteConnection| -> Result<(R, u64), E> {
                let mut tx = OutboxTx {
                    conn,
                    collector: self,
                    transaction_id,
                    correlation_id,
                };

                let result = work(&mut tx).await?;

                let messages = self.flush(
                    transaction_id,
                    correlation_id,
                    &aggregate_type,
                    &aggregate_id,
                );

                if !messages.is_empty() {
                    self.store.store(tx.conn, &messages).await?;
                }

                Ok((result, messages.len() as u64))
            })
            .await?;

        self.metrics.record_transaction_duration(timer);

        if stored > 0 {
            self.metrics.increment_stored(stored);
            tracing::debug!(%transaction_id, %correlation_id, stored, "Stored outbox messages");
        }

        Ok(result)
    }

    /// Drains the buffer into pending messages, numbered in collection order.
    fn flush(
        &self,
        transaction_id: Uuid,
        correlation_id: Uuid,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Vec<Message> {
        let created_at = Utc::now();

        std::mem::take(&mut *self.lock_buffer())
            .into_iter()
            .enumerate()
            .map(|(sequence_number, collected)| {
                Message::pending(
                    transaction_id,
                    correlation_id,
                    sequence_number as u32,
                    collected.kind,
                    aggregate_type,
                    aggregate_id,
                    collected.payload,
                    created_at,
                )
            })
            .collect()
    }

    fn lock_buffer(&self) -> MutexGuard<'_, Vec<Collected>> {
        // The buffer holds plain data; a panic while it was locked leaves it usable.
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle given to the unit of work of an outbox transaction.
pub struct OutboxTx<'a> {
    conn: &'a mut SqliteConnection,
    collector: &'a Collector,
    transaction_id: Uuid,
    correlation_id: Uuid,
}

impl OutboxTx<'_> {
    /// The connection of the open transaction, for the business mutation.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        self.conn
    }

    pub fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Schedules `event` for publication once the transaction commits.
    pub fn publish<T: OutboxPayload>(&self, event: &T) -> Result<(), Error> {
        self.publish_payload(Payload::encode(event)?)
    }

    /// Schedules `job` for enqueueing once the transaction commits.
    pub fn enqueue<T: OutboxPayload>(&self, job: &T) -> Result<(), Error> {
        self.enqueue_payload(Payload::encode(job)?)
    }

    pub fn publish_payload(&self, payload: Payload) -> Result<(), Error> {
        self.collector.collect(payload, MessageKind::Event)
    }

    pub fn enqueue_payload(&self, payload: Payload) -> Result<(), Error> {
        self.collector.collect(payload, MessageKind::Job)
    }
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::{config::Config, metrics::CounterMetrics};

    async fn collector() -> (Collector, Arc<CounterMetrics>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let metrics = Arc::new(CounterMetrics::new());
        let store = MessageStore::new(pool, &Config::default());

        (Collector::new(store, metrics.clone()), metrics)
    }

    fn payload(n: u64) -> Payload {
        Payload::new("test.payload", 1, serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_collect_outside_transaction() {
        let (collector, _) = collector().await;

        let err = collector
            .collect(payload(1), MessageKind::Event)
            .unwrap_err();

        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_messages_numbered_in_collection_order() {
        let (collector, metrics) = collector().await;

        let transaction_id = collector
            .run_transaction("Order", "1", async |tx: &mut OutboxTx<'_>| {
                tx.publish_payload(payload(0))?;
                tx.enqueue_payload(payload(1))?;
                tx.publish_payload(payload(2))?;
                Ok::<_, Error>(tx.transaction_id())
            })
            .await
            .unwrap();

        let messages = collector
            .store
            .transaction_messages(transaction_id)
            .await
            .unwrap();

        let kinds: Vec<_> = messages.iter().map(|m| (m.sequence_number, m.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (0, MessageKind::Event),
                (1, MessageKind::Job),
                (2, MessageKind::Event),
            ]
        );
        assert!(!collector.is_active());
        assert_eq!(metrics.snapshot().stored, 3);
        assert_eq!(metrics.snapshot().transactions, 1);
    }

    #[tokio::test]
    async fn test_empty_transaction_stores_nothing() {
        let (collector, metrics) = collector().await;

        let value = collector
            .run_transaction("Order", "1", async |_tx: &mut OutboxTx<'_>| {
                Ok::<_, Error>(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(metrics.snapshot().stored, 0);
        assert_eq!(metrics.snapshot().transactions, 1);
    }

    #[tokio::test]
    async fn test_pinned_correlation_id() {
        let (collector, _) = collector().await;
        let correlation_id = Uuid::new_v4();
        let collector = collector.correlated(correlation_id);

        for _ in 0..2 {
            let seen = collector
                .run_transaction("Order", "1", async |tx: &mut OutboxTx<'_>| {
                    Ok::<_, Error>(tx.correlation_id())
                })
                .await
                .unwrap();

            assert_eq!(seen, correlation_id);
        }
    }
}
