//! Event bus contract consumed by the orchestrators (§6 "Event bus
//! contract (consumed)"): pull-based consumers, FIFO per consumer, no
//! drops.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus closed")]
    Closed,
}

/// A single consumer's pull handle. `receive` blocks until an event is
/// available or the consumer is closed.
#[async_trait]
pub trait Consumer<T>: Send + Sync {
    async fn receive(&mut self) -> Result<T, BusError>;
    fn close(&mut self);
}

/// Topic producers publish to after the Executor commits an append (§5
/// "producers publish after Executor commit").
#[async_trait]
pub trait EventHub<T>: Send + Sync + 'static
where
    T: Clone + Send + Sync + 'static,
{
    type Consumer: Consumer<T>;

    fn new_consumer(&self) -> Self::Consumer;

    async fn publish(&self, event: T);
}

/// Unbounded-channel broadcast: every live consumer receives every
/// published event, in publish order, with no drops. Slow consumers
/// apply their own backpressure by not calling `receive`.
pub struct InMemoryEventHub<T> {
    consumers: parking_lot::RwLock<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone + Send + Sync + 'static> InMemoryEventHub<T> {
    pub fn new() -> Self {
        Self {
            consumers: parking_lot::RwLock::new(Vec::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for InMemoryEventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InMemoryConsumer<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    closed: bool,
}

#[async_trait]
impl<T: Send + Sync + 'static> Consumer<T> for InMemoryConsumer<T> {
    async fn receive(&mut self) -> Result<T, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        self.receiver.recv().await.ok_or(BusError::Closed)
    }

    fn close(&mut self) {
        self.closed = true;
        self.receiver.close();
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> EventHub<T> for InMemoryEventHub<T> {
    type Consumer = InMemoryConsumer<T>;

    fn new_consumer(&self) -> Self::Consumer {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers.write().push(tx);
        InMemoryConsumer {
            receiver: rx,
            closed: false,
        }
    }

    async fn publish(&self, event: T) {
        let consumers = self.consumers.read();
        for tx in consumers.iter() {
            // A closed receiver simply stops getting future events; this
            // is not a publish-time error (§5 "no drops" binds live
            // consumers, not ones that already closed).
            let _ = tx.send(event.clone());
        }
    }
}

pub type SharedEventHub<T> = Arc<InMemoryEventHub<T>>;
