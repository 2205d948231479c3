//! Live alert feed.
//!
//! [`AlertFeed::connect`] subscribes to alert row changes and runs a
//! [`FeedReducer`] on a runtime [`Store`]. A driver task pumps the channel into
//! the store; the reducer's effects load snapshots and fetch unknown rows.
//!
//! ```text
//! EventChannel ──▶ driver ──▶ Store<FeedReducer> ──▶ watch<AlertView>
//!                               │    ▲                broadcast<Alert> (urgent)
//!                               ▼    │
//!                            AlertStore (snapshot / single-row fetch)
//! ```
//!
//! When the subscription ends or yields an error the driver reports
//! `Disconnected`, backs off, resubscribes and reloads the snapshot. A lagged subscriber or an
//! undecodable change also triggers a reload.

pub mod reducer;

pub use reducer::{
    AlertEvent, AlertView, FeedAction, FeedEnvironment, FeedPhase, FeedReducer, FeedState,
};

use crate::channel::ALERTS_TABLE;
use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::persistence::AlertStore;
use crate::types::Alert;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use toolcrib_core::channel::{ChannelError, EventChannel};
use toolcrib_runtime::Store;
use toolcrib_runtime::retry::RetryPolicy;

/// The store running the feed reducer
pub type FeedStore = Store<FeedState, FeedAction, FeedEnvironment, FeedReducer>;

/// Handle to a running feed
pub struct AlertFeed {
    store: FeedStore,
    view: watch::Receiver<AlertView>,
    stop: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl AlertFeed {
    /// Start a feed over `alerts`, following changes on `channel`
    #[must_use]
    pub fn connect(
        alerts: Arc<dyn AlertStore>,
        channel: Arc<dyn EventChannel>,
        config: &FeedConfig,
    ) -> Self {
        let environment = FeedEnvironment::new(
            alerts,
            Duration::from_millis(config.reconnect_initial_ms),
            config.notification_capacity,
        );
        let view = environment.view.subscribe();
        let store = Store::new(FeedState::default(), FeedReducer, environment);
        let (stop, stopped) = watch::channel(false);

        let driver = tokio::spawn(drive(
            store.clone(),
            channel,
            config.reconnect_policy(),
            stopped,
        ));

        Self {
            store,
            view,
            stop,
            driver,
        }
    }

    /// Current view
    #[must_use]
    pub fn view(&self) -> AlertView {
        self.view.borrow().clone()
    }

    /// Receiver that wakes on every view change
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<AlertView> {
        self.view.clone()
    }

    /// Newly inserted unread high-priority alerts
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<Alert> {
        self.store.environment().notifier.subscribe()
    }

    /// Wait until the view satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// [`FeedError::Timeout`] if it does not within `timeout`;
    /// [`FeedError::Stopped`] if the feed shut down.
    pub async fn wait_until(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&AlertView) -> bool,
    ) -> Result<AlertView, FeedError> {
        let mut view = self.view.clone();
        match tokio::time::timeout(timeout, view.wait_for(predicate)).await {
            Ok(Ok(matched)) => Ok(matched.clone()),
            Ok(Err(_)) => Err(FeedError::Stopped),
            Err(_) => Err(FeedError::Timeout),
        }
    }

    /// Stop the driver and drain in-flight effects.
    ///
    /// # Errors
    ///
    /// [`FeedError::Store`] if effects are still running after `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), FeedError> {
        let _ = self.stop.send(true);
        if let Err(err) = self.driver.await {
            tracing::warn!(error = %err, "Feed driver ended abnormally");
        }
        self.store.shutdown(timeout).await?;
        Ok(())
    }
}

/// Pump channel changes into the store until told to stop
async fn drive(
    store: FeedStore,
    channel: Arc<dyn EventChannel>,
    policy: RetryPolicy,
    mut stop: watch::Receiver<bool>,
) {
    let mut attempt = 0;
    loop {
        let subscribed = tokio::select! {
            _ = stop.changed() => return,
            subscribed = channel.subscribe(ALERTS_TABLE) => subscribed,
        };

        match subscribed {
            Ok(mut stream) => {
                attempt = 0;
                if store.send(FeedAction::Connect).await.is_err() {
                    return;
                }
                loop {
                    let next = tokio::select! {
                        _ = stop.changed() => return,
                        next = stream.next() => next,
                    };
                    let action = match next {
                        Some(Ok(change)) => match AlertEvent::from_change(&change) {
                            Ok(event) => FeedAction::Changed(event),
                            Err(err) => {
                                tracing::warn!(error = %err, "Undecodable alert change; reloading");
                                FeedAction::Connect
                            }
                        },
                        Some(Err(ChannelError::Lagged(skipped))) => {
                            tracing::warn!(skipped, "Alert feed lagged; reloading");
                            FeedAction::Connect
                        }
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "Alert channel error; resubscribing");
                            break;
                        }
                        None => break,
                    };
                    if store.send(action).await.is_err() {
                        return;
                    }
                }
                if store.send(FeedAction::Disconnected).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, attempt, "Alert subscription failed");
            }
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = stop.changed() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}
