//! Relay: claims pending outbox messages and hands them to the dispatcher.
//!
//! Each message goes through its own claim, dispatch and terminal update, so one
//! message failing never undoes the progress of another in the same batch. Any
//! number of relays may run against the same database; a message lost to another
//! relay's claim is skipped.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    dispatch::Dispatcher,
    error::Error,
    message::{Message, MessageStatus},
    metrics::Metrics,
    store::MessageStore,
};

pub struct Relay {
    store: MessageStore,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<dyn Metrics>,
    batch_size: u32,
    poll_interval: Duration,
    dispatch_timeout: Option<Duration>,
}

impl Relay {
    pub fn new(
        store: MessageStore,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<dyn Metrics>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
            batch_size: config.batch_size(),
            poll_interval: config.poll_interval(),
            dispatch_timeout: config.dispatch_timeout(),
        }
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Claims and dispatches up to `batch_size` pending messages, oldest first.
    ///
    /// Returns how many messages were dispatched successfully. Dispatch failures
    /// are recorded on the messages and do not fail the batch; storage errors do,
    /// leaving the messages handled so far in their new state.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn process_batch(&self, batch_size: u32) -> Result<u64, Error> {
        let mut processed = 0;
        self.run_batch(batch_size, &mut processed).await?;
        Ok(processed)
    }

    /// Like [`Relay::process_batch`], but counts into `processed` as it goes so
    /// the messages completed before a storage error are not lost to the caller.
    async fn run_batch(&self, batch_size: u32, processed: &mut u64) -> Result<(), Error> {
        let messages = self.store.fetch_pending(batch_size).await?;

        for message in messages {
            match self.process_message(message).await {
                Ok(true) => *processed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        processed = *processed,
                        "Outbox batch aborted after a storage error: {e}"
                    );
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn process_message(&self, mut message: Message) -> Result<bool, Error> {
        if !self.store.claim(message.id).await? {
            tracing::debug!(message_id = %message.id, "Message claimed by another relay");
            return Ok(false);
        }

        message.attempts += 1;
        message.status = MessageStatus::Processing;

        let report = match self.dispatch(&message).await {
            Ok(()) => {
                self.store.complete(message.id).await?;
                self.metrics.increment_processed(message.kind);

                tracing::debug!(
                    message_id = %message.id,
                    kind = %message.kind,
                    message_type = %message.message_type,
                    attempts = message.attempts,
                    "Dispatched outbox message"
                );

                return Ok(true);
            }
            Err(report) => report,
        };

        self.metrics.increment_failed(message.kind);

        let error = report.to_string();

        if message.attempts >= self.store.max_attempts() {
            let entry = self
                .store
                .fail_and_dead_letter(&message, &error, Some(format!("{report:?}")))
                .await?;

            if entry.is_some() {
                self.metrics.increment_dead_letter();
            }

            tracing::error!(
                message_id = %message.id,
                transaction_id = %message.transaction_id,
                kind = %message.kind,
                attempts = message.attempts,
                dead_lettered = entry.is_some(),
                "Outbox message failed permanently: {error}"
            );
        } else {
            self.store.release(message.id, &error).await?;

            tracing::warn!(
                message_id = %message.id,
                kind = %message.kind,
                attempts = message.attempts,
                "Outbox dispatch failed, will retry: {error}"
            );
        }

        Ok(false)
    }

    /// Dispatches `message`. A timeout or a panic in the dispatcher counts as a
    /// failed attempt.
    async fn dispatch(&self, message: &Message) -> eyre::Result<()> {
        let dispatch = AssertUnwindSafe(async {
            self.dispatcher
                .dispatch(message.kind, &message.payload)
                .await
        })
        .catch_unwind()
        .map(|res| res.unwrap_or_else(|panic| Err(panic_report(panic))));

        match self.dispatch_timeout {
            Some(timeout) => tokio::time::timeout(timeout, dispatch)
                .await
                .map_err(|_| eyre::eyre!("Dispatch timed out after {timeout:?}"))?,
            None => dispatch.await,
        }
    }

    /// Processes batches until `cancel` fires, returning the number of messages
    /// dispatched.
    ///
    /// Batches run back to back while every message of a full batch succeeds;
    /// otherwise the relay waits for the poll interval. A batch in progress is
    /// always finished before stopping.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        tracing::info!(
            batch_size = self.batch_size,
            poll_interval = ?self.poll_interval,
            "Outbox relay started"
        );

        let mut total = 0;

        while !cancel.is_cancelled() {
            let mut processed = 0;
            let result = self.run_batch(self.batch_size, &mut processed).await;
            total += processed;

            match result {
                Ok(()) if processed == u64::from(self.batch_size) => continue,
                Ok(()) => {}
                Err(e) => {
                    tracing::error!("Outbox relay batch failed: {e}");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!(processed = total, "Outbox relay stopped");

        total
    }
}

fn panic_report(panic: Box<dyn Any + Send>) -> eyre::Report {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned());

    eyre::eyre!("Dispatcher panicked: {message}")
}
