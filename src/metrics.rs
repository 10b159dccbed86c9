//! Pluggable metrics sink.
//!
//! Every method of [`Metrics`] defaults to a no-op, so a sink implements only
//! what it records.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::message::MessageKind;

/// Token returned by [`Metrics::start_timer`].
#[derive(Debug, Clone, Copy)]
pub struct Timer(Instant);

impl Timer {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

pub trait Metrics: Send + Sync + 'static {
    fn start_timer(&self) -> Timer {
        Timer::start()
    }

    /// Called once per committed outbox transaction.
    fn record_transaction_duration(&self, _timer: Timer) {}

    fn increment_stored(&self, _count: u64) {}

    fn increment_processed(&self, _kind: MessageKind) {}

    fn increment_failed(&self, _kind: MessageKind) {}

    fn increment_dead_letter(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// In-process sink keeping plain atomic counters.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    transactions: AtomicU64,
    transaction_micros: AtomicU64,
    stored: AtomicU64,
    events_processed: AtomicU64,
    jobs_processed: AtomicU64,
    events_failed: AtomicU64,
    jobs_failed: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transactions: u64,
    pub transaction_micros: u64,
    pub stored: u64,
    pub events_processed: u64,
    pub jobs_processed: u64,
    pub events_failed: u64,
    pub jobs_failed: u64,
    pub dead_lettered: u64,
}

impl MetricsSnapshot {
    pub fn processed(&self) -> u64 {
        self.events_processed + self.jobs_processed
    }

    pub fn failed(&self) -> u64 {
        self.events_failed + self.jobs_failed
    }
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions: self.transactions.load(Ordering::Relaxed),
            transaction_micros: self.transaction_micros.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

impl Metrics for CounterMetrics {
    fn record_transaction_duration(&self, timer: Timer) {
        let micros = u64::try_from(timer.elapsed().as_micros()).unwrap_or(u64::MAX);

        self.transactions.fetch_add(1, Ordering::Relaxed);
        self.transaction_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn increment_stored(&self, count: u64) {
        self.stored.fetch_add(count, Ordering::Relaxed);
    }

    fn increment_processed(&self, kind: MessageKind) {
        match kind {
            MessageKind::Event => &self.events_processed,
            MessageKind::Job => &self.jobs_processed,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    fn increment_failed(&self, kind: MessageKind) {
        match kind {
            MessageKind::Event => &self.events_failed,
            MessageKind::Job => &self.jobs_failed,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    fn increment_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }
}
