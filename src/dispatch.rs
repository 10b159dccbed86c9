//! The capability the relay hands claimed messages to.
//!
//! Host applications implement [`Dispatcher`] on top of their event bus and job
//! queue. [`ChannelDispatcher`] forwards messages into a tokio channel, for
//! in-process consumers and tests.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::sync::mpsc;

use crate::{message::MessageKind, payload::Payload};

pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'a>>;

/// Delivers outbox messages to the real event bus or job queue.
///
/// An `Err` counts as a failed attempt: the message is retried until it runs
/// out of attempts and is then dead-lettered. Delivery is at-least-once, so
/// implementations must tolerate seeing the same payload more than once.
pub trait Dispatcher: Send + Sync + 'static {
    /// Publishes an event payload.
    fn publish_event<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a>;

    /// Enqueues a job payload.
    fn enqueue_job<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a>;

    /// Routes the payload to the capability matching `kind`.
    fn dispatch<'a>(&'a self, kind: MessageKind, payload: &'a Payload) -> DispatchFuture<'a> {
        match kind {
            MessageKind::Event => self.publish_event(payload),
            MessageKind::Job => self.enqueue_job(payload),
        }
    }
}

impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    fn publish_event<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        (**self).publish_event(payload)
    }

    fn enqueue_job<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        (**self).enqueue_job(payload)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub kind: MessageKind,
    pub payload: Payload,
}

/// Sends every dispatched message into a bounded channel.
///
/// Dispatch waits for channel capacity and fails once the receiver is dropped.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<Dispatched>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Dispatched>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn send(&self, kind: MessageKind, payload: &Payload) -> DispatchFuture<'_> {
        let dispatched = Dispatched {
            kind,
            payload: payload.clone(),
        };
        Box::pin(async move {
            self.tx
                .send(dispatched)
                .await
                .map_err(|_| eyre::eyre!("Dispatch channel closed"))
        })
    }
}

impl Dispatcher for ChannelDispatcher {
    fn publish_event<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        self.send(MessageKind::Event, payload)
    }

    fn enqueue_job<'a>(&'a self, payload: &'a Payload) -> DispatchFuture<'a> {
        self.send(MessageKind::Job, payload)
    }
}
