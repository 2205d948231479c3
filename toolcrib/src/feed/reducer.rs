//! Alert feed reducer.
//!
//! Folds alert row changes into `{alerts, unread_count}`. Delivery is
//! at-least-once with per-row ordering only, so every event is applied
//! idempotently by id:
//!
//! - a duplicate `Inserted` is handled as `Updated`
//! - `Updated`/`Deleted` for an id the view has never seen starts a fetch of
//!   that row; later events for the same id wait in a queue until the fetch
//!   lands, events for other ids keep flowing
//! - a failed fetch falls back to a full snapshot
//! - ids deleted in the current generation stay deleted; late or repeated
//!   `Inserted`/`Updated` events for them are dropped
//!
//! Snapshot and fetch results carry the `generation` they were started in.
//! Every (re)connect bumps the generation, so results from before a
//! reconnect are dropped.

use crate::channel::ALERTS_TABLE;
use crate::persistence::{AlertFilter, AlertStore};
use crate::types::{Alert, AlertId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use toolcrib_core::channel::{ChangeKind, ChannelError, RowChange};
use toolcrib_core::effect::Effect;
use toolcrib_core::reducer::Reducer;
use toolcrib_core::SmallVec;

/// One alert row change
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlertEvent {
    /// Row inserted
    Inserted(Alert),
    /// Row updated; carries the new row
    Updated(Alert),
    /// Row deleted; carries the last row
    Deleted(Alert),
}

impl AlertEvent {
    /// Decode a channel change on the alerts table.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Codec`] if the change is for another table or the row
    /// does not decode as an [`Alert`].
    pub fn from_change(change: &RowChange) -> Result<Self, ChannelError> {
        if change.table != ALERTS_TABLE {
            return Err(ChannelError::Codec(format!(
                "expected a change on {ALERTS_TABLE}, got {}",
                change.table
            )));
        }
        let alert: Alert = change.decode()?;
        Ok(match change.kind {
            ChangeKind::Insert => Self::Inserted(alert),
            ChangeKind::Update => Self::Updated(alert),
            ChangeKind::Delete => Self::Deleted(alert),
        })
    }

    /// Id of the row
    #[must_use]
    pub const fn id(&self) -> AlertId {
        match self {
            Self::Inserted(alert) | Self::Updated(alert) | Self::Deleted(alert) => alert.id,
        }
    }
}

/// Connection phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedPhase {
    /// No subscription; the view may be stale
    #[default]
    Disconnected,
    /// Subscribed, waiting for the snapshot; events are buffered
    Loading,
    /// Snapshot applied; events apply as they arrive
    Live,
}

/// What presentation code sees
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertView {
    /// Alerts, newest first
    pub alerts: Vec<Alert>,
    /// Unread alerts in `alerts`
    pub unread_count: usize,
    /// Connection phase
    pub phase: FeedPhase,
    /// Bumped on every change to the fields above
    pub revision: u64,
}

/// Reducer state
#[derive(Clone, Debug, Default)]
pub struct FeedState {
    alerts: Vec<Alert>,
    unread: usize,
    phase: FeedPhase,
    generation: u64,
    revision: u64,
    backlog: Vec<AlertEvent>,
    reconciling: HashMap<AlertId, VecDeque<AlertEvent>>,
    deleted: HashSet<AlertId>,
}

impl FeedState {
    /// A live state over `alerts`, as if a snapshot had just loaded
    #[must_use]
    pub fn live(alerts: Vec<Alert>) -> Self {
        let mut state = Self::default();
        state.load_snapshot(alerts);
        state
    }

    /// Alerts, newest first
    #[must_use]
    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    /// Unread alerts
    #[must_use]
    pub const fn unread_count(&self) -> usize {
        self.unread
    }

    /// Connection phase
    #[must_use]
    pub const fn phase(&self) -> FeedPhase {
        self.phase
    }

    /// Change counter
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Connection generation
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a fetch for `id` is outstanding
    #[must_use]
    pub fn is_reconciling(&self, id: AlertId) -> bool {
        self.reconciling.contains_key(&id)
    }

    /// Whether `id` was deleted since the last snapshot
    #[must_use]
    pub fn is_deleted(&self, id: AlertId) -> bool {
        self.deleted.contains(&id)
    }

    /// Events buffered while the snapshot loads
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Copy of the visible part
    #[must_use]
    pub fn view(&self) -> AlertView {
        AlertView {
            alerts: self.alerts.clone(),
            unread_count: self.unread,
            phase: self.phase,
            revision: self.revision,
        }
    }

    const fn touch(&mut self) {
        self.revision += 1;
    }

    fn position(&self, id: AlertId) -> Option<usize> {
        self.alerts.iter().position(|a| a.id == id)
    }

    fn load_snapshot(&mut self, mut alerts: Vec<Alert>) {
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.unread = alerts.iter().filter(|a| !a.read).count();
        self.alerts = alerts;
        self.deleted.clear();
        self.phase = FeedPhase::Live;
        self.touch();
    }

    fn insert(&mut self, alert: Alert) {
        if !alert.read {
            self.unread += 1;
        }
        let at = self
            .alerts
            .partition_point(|a| a.created_at > alert.created_at);
        self.alerts.insert(at, alert);
        self.touch();
    }

    fn replace(&mut self, index: usize, alert: Alert) {
        let old = std::mem::replace(&mut self.alerts[index], alert);
        let new = &self.alerts[index];
        match (old.read, new.read) {
            (false, true) => self.unread = self.unread.saturating_sub(1),
            (true, false) => self.unread += 1,
            _ => {}
        }
        if old != *new {
            self.touch();
        }
    }

    fn remove(&mut self, index: usize) {
        let removed = self.alerts.remove(index);
        if !removed.read {
            self.unread = self.unread.saturating_sub(1);
        }
        self.touch();
    }

    fn upsert(&mut self, alert: Alert) {
        match self.position(alert.id) {
            Some(index) => self.replace(index, alert),
            None => self.insert(alert),
        }
    }

    /// Forget in-flight work and start a new generation
    fn reset(&mut self, phase: FeedPhase) {
        self.generation += 1;
        self.backlog.clear();
        self.reconciling.clear();
        self.deleted.clear();
        if self.phase != phase {
            self.phase = phase;
            self.touch();
        }
    }
}

/// Feed actions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedAction {
    /// (Re)load the full snapshot
    Connect,
    /// Snapshot fetched
    SnapshotLoaded {
        /// Generation the fetch was started in
        generation: u64,
        /// Every alert, newest first
        alerts: Vec<Alert>,
    },
    /// Snapshot fetch failed
    SnapshotFailed {
        /// Generation the fetch was started in
        generation: u64,
        /// Why
        error: String,
    },
    /// A row change arrived
    Changed(AlertEvent),
    /// A single-row fetch finished; `None` means the row no longer exists
    Reconciled {
        /// Generation the fetch was started in
        generation: u64,
        /// Row id
        id: AlertId,
        /// Current row
        row: Option<Alert>,
    },
    /// A single-row fetch failed
    ReconcileFailed {
        /// Generation the fetch was started in
        generation: u64,
        /// Row id
        id: AlertId,
        /// Why
        error: String,
    },
    /// The subscription ended
    Disconnected,
}

/// Injected dependencies
#[derive(Clone)]
pub struct FeedEnvironment {
    /// Where snapshots and single rows are read from
    pub source: Arc<dyn AlertStore>,
    /// Newly inserted urgent alerts
    pub notifier: broadcast::Sender<Alert>,
    /// Latest view
    pub view: Arc<watch::Sender<AlertView>>,
    /// Wait before retrying a failed snapshot
    pub retry_delay: Duration,
}

impl FeedEnvironment {
    /// Environment reading from `source`
    #[must_use]
    pub fn new(source: Arc<dyn AlertStore>, retry_delay: Duration, notification_capacity: usize) -> Self {
        let (notifier, _) = broadcast::channel(notification_capacity.max(1));
        let (view, _) = watch::channel(AlertView::default());
        Self {
            source,
            notifier,
            view: Arc::new(view),
            retry_delay,
        }
    }
}

/// Reducer for the alert feed
#[derive(Clone, Copy, Debug, Default)]
pub struct FeedReducer;

type Effects = SmallVec<[Effect<FeedAction>; 4]>;

impl Reducer for FeedReducer {
    type State = FeedState;
    type Action = FeedAction;
    type Environment = FeedEnvironment;

    fn reduce(&self, state: &mut FeedState, action: FeedAction, env: &FeedEnvironment) -> Effects {
        let revision = state.revision;
        let mut effects = Effects::new();

        match action {
            FeedAction::Connect => Self::resnapshot(state, env, &mut effects),

            FeedAction::SnapshotLoaded { generation, alerts } => {
                if generation == state.generation && state.phase == FeedPhase::Loading {
                    tracing::debug!(alerts = alerts.len(), backlog = state.backlog.len(), "Snapshot loaded");
                    state.load_snapshot(alerts);
                    for event in std::mem::take(&mut state.backlog) {
                        Self::apply(state, event, env, &mut effects);
                    }
                }
            }

            FeedAction::SnapshotFailed { generation, error } => {
                if generation == state.generation {
                    tracing::warn!(%error, "Alert snapshot failed; retrying");
                    state.reset(FeedPhase::Disconnected);
                    effects.push(Effect::Delay {
                        duration: env.retry_delay,
                        action: Box::new(FeedAction::Connect),
                    });
                }
            }

            FeedAction::Changed(event) => match state.phase {
                FeedPhase::Disconnected => {
                    tracing::debug!(alert_id = %event.id(), "Ignoring change while disconnected");
                }
                FeedPhase::Loading => state.backlog.push(event),
                FeedPhase::Live => Self::apply(state, event, env, &mut effects),
            },

            FeedAction::Reconciled { generation, id, row } => {
                if generation == state.generation {
                    if let Some(queued) = state.reconciling.remove(&id) {
                        match row {
                            Some(alert) if !state.deleted.contains(&id) => state.upsert(alert),
                            _ => {
                                if let Some(index) = state.position(id) {
                                    state.remove(index);
                                }
                            }
                        }
                        for event in queued {
                            Self::apply(state, event, env, &mut effects);
                        }
                    }
                }
            }

            FeedAction::ReconcileFailed { generation, id, error } => {
                if generation == state.generation {
                    tracing::warn!(alert_id = %id, %error, "Alert fetch failed; reloading snapshot");
                    Self::resnapshot(state, env, &mut effects);
                }
            }

            FeedAction::Disconnected => {
                tracing::info!("Alert feed disconnected");
                state.reset(FeedPhase::Disconnected);
            }
        }

        if state.revision != revision {
            effects.push(Self::publish(state, env));
        }
        effects
    }
}

impl FeedReducer {
    fn apply(state: &mut FeedState, event: AlertEvent, env: &FeedEnvironment, effects: &mut Effects) {
        let id = event.id();
        if state.deleted.contains(&id) {
            tracing::debug!(alert_id = %id, "Change for deleted alert; dropping");
            return;
        }
        if let Some(queue) = state.reconciling.get_mut(&id) {
            queue.push_back(event);
            return;
        }

        match event {
            AlertEvent::Inserted(alert) => match state.position(id) {
                Some(index) => state.replace(index, alert),
                None => {
                    if alert.is_urgent() {
                        effects.push(Self::notify(env, alert.clone()));
                    }
                    state.insert(alert);
                }
            },
            AlertEvent::Updated(alert) => match state.position(id) {
                Some(index) => state.replace(index, alert),
                None => Self::reconcile(state, id, env, effects),
            },
            AlertEvent::Deleted(_) => {
                state.deleted.insert(id);
                match state.position(id) {
                    Some(index) => state.remove(index),
                    None => Self::reconcile(state, id, env, effects),
                }
            }
        }
    }

    fn resnapshot(state: &mut FeedState, env: &FeedEnvironment, effects: &mut Effects) {
        state.reset(FeedPhase::Loading);
        let generation = state.generation;
        let source = Arc::clone(&env.source);
        effects.push(Effect::future(async move {
            Some(match source.list_alerts(AlertFilter::default()).await {
                Ok(alerts) => FeedAction::SnapshotLoaded { generation, alerts },
                Err(err) => FeedAction::SnapshotFailed {
                    generation,
                    error: err.to_string(),
                },
            })
        }));
    }

    fn reconcile(state: &mut FeedState, id: AlertId, env: &FeedEnvironment, effects: &mut Effects) {
        tracing::debug!(alert_id = %id, "Unknown alert; fetching row");
        state.reconciling.insert(id, VecDeque::new());
        let generation = state.generation;
        let source = Arc::clone(&env.source);
        effects.push(Effect::future(async move {
            metrics::counter!("toolcrib.feed.reconciliations").increment(1);
            Some(match source.get_alert(id).await {
                Ok(row) => FeedAction::Reconciled { generation, id, row },
                Err(err) => FeedAction::ReconcileFailed {
                    generation,
                    id,
                    error: err.to_string(),
                },
            })
        }));
    }

    fn notify(env: &FeedEnvironment, alert: Alert) -> Effect<FeedAction> {
        let notifier = env.notifier.clone();
        Effect::future(async move {
            // No listener is fine.
            let _ = notifier.send(alert);
            None
        })
    }

    /// Publish the view; a slower effect never overwrites a newer revision
    fn publish(state: &FeedState, env: &FeedEnvironment) -> Effect<FeedAction> {
        let view = state.view();
        let sender = Arc::clone(&env.view);
        Effect::future(async move {
            sender.send_if_modified(|current| {
                if view.revision > current.revision {
                    *current = view;
                    true
                } else {
                    false
                }
            });
            None
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryStore;
    use crate::types::{AlertPriority, ConditionClass, ToolId};
    use chrono::Duration as ChronoDuration;
    use toolcrib_testing::assertions::{assert_delays, assert_no_effects, future_count};
    use toolcrib_testing::{ReducerTest, epoch};

    fn env() -> FeedEnvironment {
        FeedEnvironment::new(Arc::new(InMemoryStore::new()), Duration::from_millis(10), 8)
    }

    fn alert(minutes: i64, priority: AlertPriority) -> Alert {
        Alert::new(
            ToolId::new(),
            ConditionClass::Overdue,
            "Overdue return",
            priority,
            epoch() + ChronoDuration::minutes(minutes),
        )
    }

    fn read(mut alert: Alert) -> Alert {
        alert.read = true;
        alert
    }

    #[test]
    fn insert_prepends_and_counts_unread() {
        let older = alert(0, AlertPriority::Medium);
        let newer = alert(5, AlertPriority::Medium);

        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::live(vec![older.clone()]))
            .when_action(FeedAction::Changed(AlertEvent::Inserted(newer.clone())))
            .then_state(move |state| {
                assert_eq!(state.alerts()[0].id, newer.id);
                assert_eq!(state.alerts()[1].id, older.id);
                assert_eq!(state.unread_count(), 2);
            })
            .run();
    }

    #[test]
    fn duplicate_insert_is_an_update() {
        let a = alert(0, AlertPriority::Medium);

        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::live(vec![]))
            .when_action(FeedAction::Changed(AlertEvent::Inserted(a.clone())))
            .when_action(FeedAction::Changed(AlertEvent::Inserted(a)))
            .then_state(|state| {
                assert_eq!(state.alerts().len(), 1);
                assert_eq!(state.unread_count(), 1);
            })
            .then_effects(assert_no_effects)
            .run();
    }

    #[test]
    fn repeated_insert_after_delete_stays_deleted() {
        let a = alert(0, AlertPriority::Medium);
        let id = a.id;

        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::live(vec![]))
            .when_action(FeedAction::Changed(AlertEvent::Inserted(a.clone())))
            .when_action(FeedAction::Changed(AlertEvent::Deleted(a.clone())))
            .when_action(FeedAction::Changed(AlertEvent::Updated(read(a.clone()))))
            .when_action(FeedAction::Changed(AlertEvent::Inserted(a)))
            .then_state(move |state| {
                assert!(state.alerts().is_empty());
                assert_eq!(state.unread_count(), 0);
                assert!(state.is_deleted(id));
            })
            .then_effects(assert_no_effects)
            .run();
    }

    #[test]
    fn reconnect_forgets_deleted_ids() {
        let a = alert(0, AlertPriority::Medium);
        let id = a.id;

        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::live(vec![a.clone()]))
            .when_action(FeedAction::Changed(AlertEvent::Deleted(a)))
            .when_action(FeedAction::Disconnected)
            .then_state(move |state| assert!(!state.is_deleted(id)))
            .run();
    }

    #[test]
    fn read_flag_changes_move_the_count_both_ways() {
        let a = alert(0, AlertPriority::Low);
        let b = alert(1, AlertPriority::Low);

        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::live(vec![a.clone(), b.clone()]))
            .when_action(FeedAction::Changed(AlertEvent::Updated(read(a.clone()))))
            .when_action(FeedAction::Changed(AlertEvent::Updated(read(b))))
            .when_action(FeedAction::Changed(AlertEvent::Updated(a)))
            .then_state(|state| assert_eq!(state.unread_count(), 1))
            .run();
    }

    #[test]
    fn deleting_unread_alert_decrements_and_read_one_does_not() {
        let unread = alert(0, AlertPriority::Low);
        let seen = read(alert(1, AlertPriority::Low));

        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::live(vec![unread.clone(), seen.clone()]))
            .when_action(FeedAction::Changed(AlertEvent::Deleted(seen)))
            .when_action(FeedAction::Changed(AlertEvent::Deleted(unread)))
            .then_state(|state| {
                assert!(state.alerts().is_empty());
                assert_eq!(state.unread_count(), 0);
            })
            .run();
    }

    #[test]
    fn urgent_insert_notifies() {
        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::live(vec![]))
            .when_action(FeedAction::Changed(AlertEvent::Inserted(alert(0, AlertPriority::High))))
            .then_effects(|effects| assert_eq!(future_count(effects), 2))
            .run();
    }

    #[test]
    fn unknown_update_is_fetched_and_later_events_wait() {
        let unknown = alert(0, AlertPriority::Medium);
        let other = alert(1, AlertPriority::Medium);
        let id = unknown.id;

        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::live(vec![]))
            .when_action(FeedAction::Changed(AlertEvent::Updated(unknown.clone())))
            .when_action(FeedAction::Changed(AlertEvent::Updated(read(unknown))))
            .when_action(FeedAction::Changed(AlertEvent::Inserted(other)))
            .then_state(move |state| {
                assert!(state.is_reconciling(id));
                assert_eq!(state.alerts().len(), 1);
                assert_eq!(state.unread_count(), 1);
            })
            .run();
    }

    #[test]
    fn fetched_row_is_applied_then_queue_replays() {
        let unknown = alert(0, AlertPriority::Medium);
        let id = unknown.id;
        let mut state = FeedState::live(vec![]);
        let env = env();
        FeedReducer.reduce(&mut state, FeedAction::Changed(AlertEvent::Updated(unknown.clone())), &env);
        FeedReducer.reduce(&mut state, FeedAction::Changed(AlertEvent::Updated(read(unknown.clone()))), &env);
        let generation = state.generation();

        ReducerTest::new(FeedReducer)
            .with_env(env)
            .given_state(state)
            .when_action(FeedAction::Reconciled {
                generation,
                id,
                row: Some(unknown),
            })
            .then_state(move |state| {
                assert!(!state.is_reconciling(id));
                assert_eq!(state.alerts().len(), 1);
                assert!(state.alerts()[0].read);
                assert_eq!(state.unread_count(), 0);
            })
            .run();
    }

    #[test]
    fn failed_fetch_falls_back_to_snapshot() {
        let unknown = alert(0, AlertPriority::Medium);
        let id = unknown.id;
        let mut state = FeedState::live(vec![]);
        let env = env();
        FeedReducer.reduce(&mut state, FeedAction::Changed(AlertEvent::Deleted(unknown)), &env);
        let generation = state.generation();

        ReducerTest::new(FeedReducer)
            .with_env(env)
            .given_state(state)
            .when_action(FeedAction::ReconcileFailed {
                generation,
                id,
                error: "store offline".into(),
            })
            .then_state(move |state| {
                assert_eq!(state.phase(), FeedPhase::Loading);
                assert_eq!(state.generation(), generation + 1);
                assert!(!state.is_reconciling(id));
            })
            .run();
    }

    #[test]
    fn events_during_load_are_replayed_after_snapshot() {
        let in_snapshot = alert(0, AlertPriority::Low);
        let late = alert(1, AlertPriority::Low);

        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::default())
            .when_action(FeedAction::Connect)
            .when_action(FeedAction::Changed(AlertEvent::Inserted(late.clone())))
            .when_action(FeedAction::Changed(AlertEvent::Updated(read(in_snapshot.clone()))))
            .when_action(FeedAction::SnapshotLoaded {
                generation: 1,
                alerts: vec![in_snapshot],
            })
            .then_state(move |state| {
                assert_eq!(state.phase(), FeedPhase::Live);
                assert_eq!(state.backlog_len(), 0);
                assert_eq!(state.alerts()[0].id, late.id);
                assert_eq!(state.unread_count(), 1);
            })
            .run();
    }

    #[test]
    fn stale_snapshot_is_ignored() {
        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::default())
            .when_action(FeedAction::Connect)
            .when_action(FeedAction::Connect)
            .when_action(FeedAction::SnapshotLoaded {
                generation: 1,
                alerts: vec![alert(0, AlertPriority::Low)],
            })
            .then_state(|state| {
                assert_eq!(state.phase(), FeedPhase::Loading);
                assert!(state.alerts().is_empty());
            })
            .then_effects(assert_no_effects)
            .run();
    }

    #[test]
    fn snapshot_recomputes_count_from_scratch() {
        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::live(vec![alert(0, AlertPriority::Low), alert(1, AlertPriority::Low)]))
            .when_action(FeedAction::Disconnected)
            .when_action(FeedAction::Connect)
            .when_action(FeedAction::SnapshotLoaded {
                generation: 2,
                alerts: vec![read(alert(2, AlertPriority::Low))],
            })
            .then_state(|state| {
                assert_eq!(state.alerts().len(), 1);
                assert_eq!(state.unread_count(), 0);
            })
            .run();
    }

    #[test]
    fn failed_snapshot_retries_after_delay() {
        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::default())
            .when_action(FeedAction::Connect)
            .when_action(FeedAction::SnapshotFailed {
                generation: 1,
                error: "store offline".into(),
            })
            .then_state(|state| assert_eq!(state.phase(), FeedPhase::Disconnected))
            .then_effects(|effects| assert_delays(effects, |a| *a == FeedAction::Connect))
            .run();
    }

    #[test]
    fn changes_while_disconnected_are_dropped() {
        ReducerTest::new(FeedReducer)
            .with_env(env())
            .given_state(FeedState::default())
            .when_action(FeedAction::Changed(AlertEvent::Inserted(alert(0, AlertPriority::High))))
            .then_state(|state| assert!(state.alerts().is_empty()))
            .then_effects(assert_no_effects)
            .run();
    }
}
