#![allow(dead_code)]

use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use stowaway::{
    dispatch::{DispatchFuture, Dispatched, Dispatcher},
    Config, MessageKind, OutboxPayload, Payload, Service,
};
use tempfile::TempDir;

pub struct TmpService {
    svc: Service,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

pub async fn setup() -> TmpService {
    setup_with(Config::default()).await
}

pub async fn setup_with(config: Config) -> TmpService {
    let path = tempfile::tempdir().unwrap();

    TmpService {
        svc: Service::connect_with(Config {
            db_path: Some(path.path().join("stowaway.db").to_string_lossy().to_string()),
            ..config
        })
        .await
        .unwrap(),
        tmpdir: path,
    }
}

impl TmpService {
    pub fn with_metrics(self, metrics: std::sync::Arc<dyn stowaway::Metrics>) -> Self {
        Self {
            svc: self.svc.with_metrics(metrics),
            tmpdir: self.tmpdir,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OrderPlaced {
    pub order_id: String,
}

impl OutboxPayload for OrderPlaced {
    const SCHEMA: &'static str = "order.placed";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub order_id: String,
    pub email: String,
}

impl OutboxPayload for SendReceipt {
    const SCHEMA: &'static str = "email.send_receipt";
}

pub fn order_placed(order_id: &str) -> OrderPlaced {
    OrderPlaced {
        order_id: order_id.to_owned(),
    }
}

/// Emits one `order.placed` event per id, each in its own transaction.
pub async fn place_orders(service: &Service, ids: &[&str]) {
    for id in ids {
        service
            .collector()
            .run_transaction("Order", *id, async |tx: &mut stowaway::OutboxTx<'_>| {
                tx.publish(&order_placed(id))
            })
            .await
            .unwrap();
    }
}

/// Accepts everything and remembers what it was given.
#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<Dispatched>>,
}

impl RecordingDispatcher {
    pub fn dispatched(&self) -> Vec<Dispatched> {
        self.dispatched.lock().unwrap().clone()
    }

    fn record(&self, kind: MessageKind, payload: &Payload) -> DispatchFuture<'_> {
        self.dispatched.lock().unwrap().push(Dispatched {
            kind,
            payload: payload.clone(),
        });
        Box::pin(async { Ok(()) })
    }
}

impl Dispatcher for RecordingDispatcher {
    fn publish_event<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        self.record(MessageKind::Event, payload)
    }

    fn enqueue_job<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        self.record(MessageKind::Job, payload)
    }
}

/// Rejects every dispatch.
#[derive(Default)]
pub struct FailingDispatcher {
    calls: AtomicU64,
}

impl FailingDispatcher {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn reject(&self) -> DispatchFuture<'_> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { Err(eyre::eyre!("broker unavailable (call {call})")) })
    }
}

impl Dispatcher for FailingDispatcher {
    fn publish_event<'a>(&'a self, _payload: &'a Payload) -> DispatchFuture<'a> {
        self.reject()
    }

    fn enqueue_job<'a>(&'a self, _payload: &'a Payload) -> DispatchFuture<'a> {
        self.reject()
    }
}

/// Takes longer than any reasonable dispatch timeout.
pub struct SlowDispatcher(pub Duration);

impl Dispatcher for SlowDispatcher {
    fn publish_event<'a>(&'a self, _payload: &'a Payload) -> DispatchFuture<'a> {
        Box::pin(async move {
            tokio::time::sleep(self.0).await;
            Ok(())
        })
    }

    fn enqueue_job<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        self.publish_event(payload)
    }
}

/// Rejects orders whose id is listed and accepts everything else.
pub struct RejectingDispatcher {
    pub rejected: Vec<String>,
}

impl RejectingDispatcher {
    pub fn orders(ids: &[&str]) -> Self {
        Self {
            rejected: ids.iter().map(|id| id.to_string()).collect(),
        }
    }
}

impl Dispatcher for RejectingDispatcher {
    fn publish_event<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        Box::pin(async move {
            let order = payload.decode::<OrderPlaced>()?;
            if self.rejected.contains(&order.order_id) {
                eyre::bail!("order {} rejected by broker", order.order_id);
            }
            Ok(())
        })
    }

    fn enqueue_job<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        self.publish_event(payload)
    }
}

/// Panics inside every dispatch.
pub struct PanickingDispatcher;

async fn explode(schema: String) -> eyre::Result<()> {
    panic!("no handler registered for {schema}")
}

impl Dispatcher for PanickingDispatcher {
    fn publish_event<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        Box::pin(explode(payload.schema.clone()))
    }

    fn enqueue_job<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        self.publish_event(payload)
    }
}
