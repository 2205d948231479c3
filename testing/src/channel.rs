//! In-memory row-change channel.
//!
//! One tokio broadcast channel per table. Besides plain publish/subscribe it
//! lets tests reproduce the channel behaviours clients must survive: repeated
//! delivery ([`InMemoryEventChannel::redeliver`]), delivery of changes that were
//! never committed locally ([`InMemoryEventChannel::inject`]), transport
//! errors ([`InMemoryEventChannel::inject_error`]) and dropped connections
//! ([`InMemoryEventChannel::disconnect`]).

#![allow(clippy::missing_panics_doc)] // Mutex poisoning only happens after a test already panicked

use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use toolcrib_core::channel::{ChangeStream, ChannelError, EventChannel, RowChange};

const CAPACITY: usize = 256;

type Delivery = Result<RowChange, ChannelError>;

/// Broadcast-backed [`EventChannel`] for tests and single-process demos.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventChannel {
    senders: Arc<Mutex<HashMap<String, broadcast::Sender<Delivery>>>>,
    published: Arc<Mutex<Vec<RowChange>>>,
    fail_publishes: Arc<AtomicBool>,
}

impl InMemoryEventChannel {
    /// Create an empty channel
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, table: &str) -> broadcast::Sender<Delivery> {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(CAPACITY).0)
            .clone()
    }

    /// Every change accepted by [`EventChannel::publish`], in order
    #[must_use]
    pub fn published(&self) -> Vec<RowChange> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of live subscribers on `table`
    #[must_use]
    pub fn subscriber_count(&self, table: &str) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Deliver a change to subscribers without recording it as published
    pub fn inject(&self, change: RowChange) {
        let _ = self.sender(&change.table).send(Ok(change));
    }

    /// Make every current subscriber on `table` receive `error` as its next item
    pub fn inject_error(&self, table: &str, error: ChannelError) {
        let _ = self.sender(table).send(Err(error));
    }

    /// Deliver the `index`-th published change again (at-least-once delivery)
    pub fn redeliver(&self, index: usize) {
        let change = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned();
        if let Some(change) = change {
            self.inject(change);
        }
    }

    /// Drop every subscription on `table`; their streams end
    pub fn disconnect(&self, table: &str) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table);
    }

    /// Make subsequent publishes fail (simulates an unreachable backend)
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }
}

impl EventChannel for InMemoryEventChannel {
    fn publish(
        &self,
        change: RowChange,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>> {
        async move {
            if self.fail_publishes.load(Ordering::SeqCst) {
                return Err(ChannelError::PublishFailed {
                    table: change.table,
                    reason: "publishing disabled".to_string(),
                });
            }
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(change.clone());
            // No subscribers is not an error.
            let _ = self.sender(&change.table).send(Ok(change));
            Ok(())
        }
        .boxed()
    }

    fn subscribe(
        &self,
        table: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ChangeStream, ChannelError>> + Send + '_>> {
        let mut receiver = self.sender(table).subscribe();
        async move {
            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok(delivery) => yield delivery,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield Err(ChannelError::Lagged(skipped));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as ChangeStream)
        }
        .boxed()
    }
}
