//! # Toolcrib Runtime
//!
//! The [`Store`](store::Store) runs a reducer: it owns the state, applies one
//! action at a time under a write lock, and executes the returned effects on
//! the tokio runtime, feeding any action they produce back into the reducer.
//!
//! ## Example
//!
//! ```ignore
//! use toolcrib_runtime::Store;
//!
//! let store = Store::new(FeedState::default(), FeedReducer, environment);
//!
//! store.send(FeedAction::Connect).await?;
//! store.shutdown(Duration::from_secs(5)).await?;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use toolcrib_core::{effect::Effect, reducer::Reducer};

/// Retry logic with exponential backoff
pub mod retry;

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for effects to complete
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// Timed out waiting for in-flight effects to settle
        #[error("Timed out with {0} effects still running")]
        Timeout(usize),
    }
}

pub use error::StoreError;
pub use store::Store;

/// Decrements the global in-flight effect counter when dropped, so a panicking
/// effect task still releases its slot.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Store module - the runtime coordinator for a reducer
pub mod store {
    use super::{
        Arc, AtomicBool, AtomicUsize, Duration, Effect, Ordering, PendingGuard, Reducer, RwLock,
        StoreError,
    };

    /// The Store - runtime coordinator for a reducer
    ///
    /// The Store manages:
    /// 1. State (behind `RwLock`; the reducer runs with the write lock held)
    /// 2. Reducer (business logic)
    /// 3. Environment (injected dependencies)
    /// 4. Effect execution (with feedback loop)
    ///
    /// Actions are applied strictly one at a time. Effects run concurrently in
    /// spawned tasks, so an effect that suspends on I/O never stalls actions
    /// that arrive while it is in flight.
    pub struct Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        state: Arc<RwLock<S>>,
        reducer: Arc<R>,
        environment: Arc<E>,
        shutdown: Arc<AtomicBool>,
        pending_effects: Arc<AtomicUsize>,
        _action: std::marker::PhantomData<fn(A)>,
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                reducer: Arc::clone(&self.reducer),
                environment: Arc::clone(&self.environment),
                shutdown: Arc::clone(&self.shutdown),
                pending_effects: Arc::clone(&self.pending_effects),
                _action: std::marker::PhantomData,
            }
        }
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
        A: Send + 'static,
        S: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        /// Create a new store with initial state, reducer, and environment
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer: Arc::new(reducer),
                environment: Arc::new(environment),
                shutdown: Arc::new(AtomicBool::new(false)),
                pending_effects: Arc::new(AtomicUsize::new(0)),
                _action: std::marker::PhantomData,
            }
        }

        /// Send an action to the store
        ///
        /// 1. Acquires the write lock on state
        /// 2. Calls the reducer with (state, action, environment)
        /// 3. Starts the returned effects in spawned tasks
        ///
        /// Returns once the effects are started, not once they complete.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        pub async fn send(&self, action: A) -> Result<(), StoreError> {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::warn!("Rejected action: store is shutting down");
                metrics::counter!("store.shutdown.rejected_actions").increment(1);
                return Err(StoreError::ShutdownInProgress);
            }

            metrics::counter!("store.actions.total").increment(1);

            let effects = {
                let mut state = self.state.write().await;
                let start = std::time::Instant::now();
                let effects = self.reducer.reduce(&mut *state, action, &self.environment);
                metrics::histogram!("store.reducer.duration_seconds")
                    .record(start.elapsed().as_secs_f64());
                effects
            };

            tracing::trace!("Reducer returned {} effects", effects.len());
            for effect in effects {
                self.execute_effect(effect);
            }

            Ok(())
        }

        pub(crate) fn pending_effects(&self) -> usize {
            self.pending_effects.load(Ordering::Acquire)
        }

        /// Access the injected environment
        #[must_use]
        pub fn environment(&self) -> &E {
            &self.environment
        }

        /// Wait until no effect is in flight
        ///
        /// Effects that feed actions back may start further effects; this waits
        /// for the whole cascade to drain.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::Timeout`] if effects are still running after `timeout`.
        pub async fn settle(&self, timeout: Duration) -> Result<(), StoreError> {
            let start = std::time::Instant::now();
            loop {
                let pending = self.pending_effects();
                if pending == 0 {
                    return Ok(());
                }
                if start.elapsed() >= timeout {
                    return Err(StoreError::Timeout(pending));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        /// Initiate graceful shutdown
        ///
        /// New actions are rejected immediately; in-flight effects get
        /// `timeout` to finish.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if effects are still running after `timeout`.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            tracing::info!("Initiating graceful shutdown");
            self.shutdown.store(true, Ordering::Release);

            match self.settle(timeout).await {
                Ok(()) => {
                    tracing::info!("All effects completed, shutdown successful");
                    Ok(())
                }
                Err(StoreError::Timeout(pending)) => {
                    tracing::error!(pending_effects = pending, "Shutdown timed out");
                    Err(StoreError::ShutdownTimeout(pending))
                }
                Err(other) => Err(other),
            }
        }

        /// Spawn an effect, tracking it in the in-flight counter
        fn execute_effect(&self, effect: Effect<A>) {
            if effect.is_none() {
                return;
            }

            self.pending_effects.fetch_add(1, Ordering::SeqCst);
            let guard = PendingGuard(Arc::clone(&self.pending_effects));
            let store = self.clone();

            tokio::spawn(async move {
                let _guard = guard;
                store.run_effect(effect).await;
            });
        }

        /// Run an effect to completion inside the current task
        async fn run_effect(&self, effect: Effect<A>) {
            match effect {
                Effect::None => {}
                Effect::Future(fut) => {
                    metrics::counter!("store.effects.executed", "type" => "future").increment(1);
                    if let Some(action) = fut.await {
                        self.feed_back(action).await;
                    }
                }
                Effect::Delay { duration, action } => {
                    metrics::counter!("store.effects.executed", "type" => "delay").increment(1);
                    tokio::time::sleep(duration).await;
                    self.feed_back(*action).await;
                }
            }
        }

        /// Send an effect-produced action back to the reducer
        async fn feed_back(&self, action: A) {
            if let Err(error) = self.send(action).await {
                tracing::debug!(error = %error, "Dropped effect feedback action");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use toolcrib_core::{SmallVec, smallvec};

    #[derive(Clone, Debug, PartialEq)]
    enum Action {
        Add(i64),
        AddLater(i64),
        AddAfter(Duration, i64),
    }

    #[derive(Default)]
    struct State {
        total: i64,
    }

    /// Mirrors the running total so tests can observe it from outside.
    type Observed = Arc<AtomicI64>;

    struct TestReducer;

    impl Reducer for TestReducer {
        type State = State;
        type Action = Action;
        type Environment = Observed;

        fn reduce(
            &self,
            state: &mut State,
            action: Action,
            env: &Observed,
        ) -> SmallVec<[Effect<Action>; 4]> {
            match action {
                Action::Add(n) => {
                    state.total += n;
                    env.store(state.total, Ordering::SeqCst);
                    SmallVec::new()
                }
                Action::AddLater(n) => {
                    smallvec![Effect::future(async move { Some(Action::Add(n)) })]
                }
                Action::AddAfter(duration, n) => smallvec![Effect::Delay {
                    duration,
                    action: Box::new(Action::Add(n)),
                }],
            }
        }
    }

    fn store() -> Store<State, Action, Observed, TestReducer> {
        Store::new(State::default(), TestReducer, Arc::new(AtomicI64::new(0)))
    }

    #[tokio::test]
    async fn future_effect_feeds_action_back() {
        let store = store();

        store.send(Action::AddLater(5)).await.unwrap();
        store.settle(Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.environment().load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn delay_effect_dispatches_after_wait() {
        let store = store();

        store
            .send(Action::AddAfter(Duration::from_millis(20), 2))
            .await
            .unwrap();
        assert_eq!(store.environment().load(Ordering::SeqCst), 0);
        store.settle(Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.environment().load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_drains_effects_then_rejects_actions() {
        let store = store();
        store
            .send(Action::AddAfter(Duration::from_millis(20), 3))
            .await
            .unwrap();

        store.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.pending_effects(), 0);
        let result = store.send(Action::Add(1)).await;
        assert!(matches!(result, Err(StoreError::ShutdownInProgress)));
    }
}
