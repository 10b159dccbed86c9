use std::sync::Arc;

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};

use crate::{
    collector::Collector,
    config::Config,
    dispatch::Dispatcher,
    error::Error,
    health::Health,
    metrics::{Metrics, NoopMetrics},
    relay::Relay,
    store::MessageStore,
};

/// Entry point tying the outbox components to one SQLite database.
pub struct Service {
    db: SqlitePool,
    config: Config,
    metrics: Arc<dyn Metrics>,
}

impl Service {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(Config::default()).await
    }

    /// Opens the database described by `config` and applies pending migrations.
    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let (opts, pool_opts) = if let Some(path) = config.db_path() {
            let opts = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);

            (opts, SqlitePoolOptions::new())
        } else {
            // The database lives as long as its only connection.
            let pool_opts = SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);

            (SqliteConnectOptions::new().in_memory(true), pool_opts)
        };

        let opts = opts
            .foreign_keys(true)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(db_path = config.db_path(), "Outbox database ready");

        Ok(Self {
            db: pool,
            config,
            metrics: Arc::new(NoopMetrics),
        })
    }

    /// Replaces the metrics sink used by collectors and relays created afterwards.
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }

    pub fn store(&self) -> MessageStore {
        MessageStore::new(self.db.clone(), &self.config)
    }

    /// A fresh collector, to be used by a single request or task.
    pub fn collector(&self) -> Collector {
        Collector::new(self.store(), self.metrics.clone())
    }

    pub fn relay(&self, dispatcher: impl Dispatcher) -> Relay {
        Relay::new(
            self.store(),
            Arc::new(dispatcher),
            self.metrics.clone(),
            &self.config,
        )
    }

    pub fn health(&self) -> Health {
        Health::new(self.db.clone(), &self.config)
    }
}
