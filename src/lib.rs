//! Transactional outbox backed by SQLite.
//!
//! Business code runs its database mutation through a [`Collector`], which
//! persists the events and jobs it emits in the same transaction. A [`Relay`]
//! later claims those messages and hands them to a [`Dispatcher`], retrying
//! failures and moving messages that run out of attempts to the dead-letter
//! table. Delivery is at-least-once.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod collector;
pub mod config;
pub mod dead_letter;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod message;
pub mod metrics;
pub mod payload;
pub mod relay;
pub mod service;
pub mod store;

pub use collector::{Collector, OutboxTx};
pub use config::Config;
pub use dead_letter::{DeadLetterEntry, DeadLetterFilter};
pub use dispatch::Dispatcher;
pub use error::Error;
pub use message::{Message, MessageKind, MessageStatus};
pub use metrics::Metrics;
pub use payload::{OutboxPayload, Payload};
pub use relay::Relay;
pub use service::Service;
pub use store::MessageStore;

/// Returns a builder for a standalone relay process.
///
/// Logging is configured from `STOWAWAY_LOG`, settings from the `STOWAWAY_*`
/// environment. The relay runs until Ctrl-C or until `cancel` fires.
#[bon::builder(finish_fn = start)]
pub async fn run<D: Dispatcher>(
    dispatcher: D,
    metrics: Option<Arc<dyn Metrics>>,
    cancel: Option<CancellationToken>,
) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("STOWAWAY_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("STOWAWAY_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let mut service = Service::connect_with(config).await?;
    if let Some(metrics) = metrics {
        service = service.with_metrics(metrics);
    }

    let cancel = cancel.unwrap_or_default();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        tracing::error!("Failed to listen for Ctrl-C: {e}");
                        return;
                    }
                    tracing::info!("Received Ctrl-C, stopping relay");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        }
    });

    let relay = service.relay(dispatcher);
    relay.run(cancel).await;

    Ok(())
}
