//! In-memory store.
//!
//! One mutex over all tables, so every single-row operation is atomic. Alert
//! writes are published to an optional [`EventChannel`] after they apply, the
//! way the Postgres trigger publishes committed rows. Failure injection lets
//! tests make the next N calls at a given [`FaultPoint`] fail as if the store
//! were unreachable.

use super::{
    AlertFilter, AlertInsert, AlertStore, ReservationFilter, Result, RowWrites, StoreFuture,
    ToolFilter, ViolationLog, ViolationRecord, WorkshopStore,
};
use crate::channel::ALERTS_TABLE;
use crate::error::PersistenceError;
use crate::types::{
    Alert, AlertId, Availability, Condition, Employee, EmployeeId, Reservation, ReservationId,
    ReservationStatus, Tool, ToolId,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use toolcrib_core::channel::{ChangeKind, EventChannel, RowChange};
use uuid::Uuid;

/// Where an injected failure fires
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Any read
    Read,
    /// [`RowWrites::update_tool_if`]
    ToolUpdate,
    /// [`RowWrites::insert_reservation`]
    ReservationInsert,
    /// [`RowWrites::replace_reservation_if`]
    ReservationReplace,
    /// [`RowWrites::delete_reservation_if`]
    ReservationDelete,
    /// Any alert write
    AlertWrite,
}

#[derive(Default)]
struct Tables {
    tools: HashMap<ToolId, Tool>,
    employees: HashMap<EmployeeId, Employee>,
    reservations: HashMap<ReservationId, Reservation>,
    alerts: HashMap<AlertId, (u64, Alert)>,
    alert_seq: u64,
}

impl Tables {
    // Mirrors the one-open-reservation-per-tool unique index.
    fn ensure_tool_free(&self, reservation: &Reservation) -> Result<()> {
        let held = self
            .reservations
            .values()
            .find(|r| r.tool_id == reservation.tool_id && r.id != reservation.id && r.is_open());
        match held {
            Some(open) => Err(PersistenceError::conflict(
                "reservation",
                reservation.id,
                format!("tool {} already held by reservation {}", open.tool_id, open.id),
            )),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct FaultPlan {
    skip: usize,
    fail: usize,
}

#[derive(Default)]
struct Faults {
    pending: HashMap<FaultPoint, FaultPlan>,
    unavailable: bool,
}

/// Mutex-backed implementation of every storage trait
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Mutex<Faults>>,
    channel: Option<Arc<dyn EventChannel>>,
    // Held across table write and publish so per-row change order matches write order.
    publish_order: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables();
        f.debug_struct("InMemoryStore")
            .field("tools", &tables.tools.len())
            .field("reservations", &tables.reservations.len())
            .field("alerts", &tables.alerts.len())
            .field("publishing", &self.channel.is_some())
            .finish()
    }
}

impl InMemoryStore {
    /// Empty store that publishes nothing
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store that publishes alert changes to `channel`
    #[must_use]
    pub fn with_channel(channel: Arc<dyn EventChannel>) -> Self {
        Self {
            channel: Some(channel),
            ..Self::default()
        }
    }

    /// Fail the next `times` calls at `point` with [`PersistenceError::Unavailable`]
    pub fn fail_next(&self, point: FaultPoint, times: usize) {
        self.fail_after(point, 0, times);
    }

    /// Let `skip` calls at `point` through, then fail the following `times`
    pub fn fail_after(&self, point: FaultPoint, skip: usize, times: usize) {
        let mut faults = self.faults();
        let plan = faults.pending.entry(point).or_default();
        plan.skip = skip;
        plan.fail += times;
    }

    /// Fail every call until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults().unavailable = unavailable;
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, point: FaultPoint) -> Result<()> {
        let mut faults = self.faults();
        if faults.unavailable {
            return Err(PersistenceError::Unavailable("store offline".to_string()));
        }
        let Some(plan) = faults.pending.get_mut(&point) else {
            return Ok(());
        };
        if plan.skip > 0 {
            plan.skip -= 1;
            return Ok(());
        }
        if plan.fail == 0 {
            return Ok(());
        }
        plan.fail -= 1;
        Err(PersistenceError::Unavailable(format!(
            "injected failure at {point:?}"
        )))
    }

    async fn publish(&self, kind: ChangeKind, alert: &Alert) {
        let Some(channel) = &self.channel else {
            return;
        };
        let change = match RowChange::encode(ALERTS_TABLE, kind, alert, Utc::now()) {
            Ok(change) => change,
            Err(err) => {
                tracing::error!(alert_id = %alert.id, error = %err, "Failed to encode alert change");
                return;
            }
        };
        // The write already applied; a lost change is repaired by the feed's
        // next reconciliation or resnapshot.
        if let Err(err) = channel.publish(change).await {
            tracing::warn!(alert_id = %alert.id, error = %err, "Failed to publish alert change");
            metrics::counter!("toolcrib.channel.publish_failures").increment(1);
        }
    }

    fn sorted_alerts(tables: &Tables, filter: &AlertFilter) -> Vec<Alert> {
        let mut rows: Vec<&(u64, Alert)> = tables
            .alerts
            .values()
            .filter(|(_, alert)| filter.matches(alert))
            .collect();
        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });
        rows.into_iter().map(|(_, alert)| alert.clone()).collect()
    }
}

impl WorkshopStore for InMemoryStore {
    fn get_tool(&self, id: ToolId) -> StoreFuture<'_, Result<Option<Tool>>> {
        async move {
            self.check(FaultPoint::Read)?;
            Ok(self.tables().tools.get(&id).cloned())
        }
        .boxed()
    }

    fn list_tools(&self, filter: ToolFilter) -> StoreFuture<'_, Result<Vec<Tool>>> {
        async move {
            self.check(FaultPoint::Read)?;
            let mut tools: Vec<Tool> = self
                .tables()
                .tools
                .values()
                .filter(|t| filter.matches(t))
                .cloned()
                .collect();
            tools.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.serial.cmp(&b.serial)));
            Ok(tools)
        }
        .boxed()
    }

    fn insert_tool(&self, tool: Tool) -> StoreFuture<'_, Result<()>> {
        async move {
            let mut tables = self.tables();
            if tables.tools.contains_key(&tool.id) {
                return Err(PersistenceError::conflict("tool", tool.id, "already exists"));
            }
            tables.tools.insert(tool.id, tool);
            Ok(())
        }
        .boxed()
    }

    fn get_employee(&self, id: EmployeeId) -> StoreFuture<'_, Result<Option<Employee>>> {
        async move {
            self.check(FaultPoint::Read)?;
            Ok(self.tables().employees.get(&id).cloned())
        }
        .boxed()
    }

    fn insert_employee(&self, employee: Employee) -> StoreFuture<'_, Result<()>> {
        async move {
            let mut tables = self.tables();
            if tables.employees.contains_key(&employee.id) {
                return Err(PersistenceError::conflict("employee", employee.id, "already exists"));
            }
            tables.employees.insert(employee.id, employee);
            Ok(())
        }
        .boxed()
    }

    fn get_reservation(&self, id: ReservationId) -> StoreFuture<'_, Result<Option<Reservation>>> {
        async move {
            self.check(FaultPoint::Read)?;
            Ok(self.tables().reservations.get(&id).cloned())
        }
        .boxed()
    }

    fn list_reservations(
        &self,
        filter: ReservationFilter,
    ) -> StoreFuture<'_, Result<Vec<Reservation>>> {
        async move {
            self.check(FaultPoint::Read)?;
            let mut rows: Vec<Reservation> = self
                .tables()
                .reservations
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect();
            rows.sort_by(|a, b| {
                a.due_at
                    .cmp(&b.due_at)
                    .then(a.reserved_at.cmp(&b.reserved_at))
                    .then(a.id.cmp(&b.id))
            });
            Ok(rows)
        }
        .boxed()
    }
}

impl RowWrites for InMemoryStore {
    fn update_tool_if(
        &self,
        id: ToolId,
        expected: Availability,
        availability: Availability,
        condition: Condition,
    ) -> StoreFuture<'_, Result<Tool>> {
        async move {
            self.check(FaultPoint::ToolUpdate)?;
            let mut tables = self.tables();
            let tool = tables
                .tools
                .get_mut(&id)
                .ok_or_else(|| PersistenceError::not_found("tool", id))?;
            if tool.availability != expected {
                return Err(PersistenceError::conflict(
                    "tool",
                    id,
                    format!("expected {expected}, found {}", tool.availability),
                ));
            }
            let previous = tool.clone();
            tool.availability = availability;
            tool.condition = condition;
            Ok(previous)
        }
        .boxed()
    }

    fn insert_reservation(&self, reservation: Reservation) -> StoreFuture<'_, Result<()>> {
        async move {
            self.check(FaultPoint::ReservationInsert)?;
            let mut tables = self.tables();
            if tables.reservations.contains_key(&reservation.id) {
                return Err(PersistenceError::conflict(
                    "reservation",
                    reservation.id,
                    "already exists",
                ));
            }
            if reservation.is_open() {
                tables.ensure_tool_free(&reservation)?;
            }
            tables.reservations.insert(reservation.id, reservation);
            Ok(())
        }
        .boxed()
    }

    fn replace_reservation_if(
        &self,
        reservation: Reservation,
        expected: Reservation,
    ) -> StoreFuture<'_, Result<Reservation>> {
        async move {
            self.check(FaultPoint::ReservationReplace)?;
            let mut tables = self.tables();
            if reservation.is_open() {
                tables.ensure_tool_free(&reservation)?;
            }
            let stored = tables
                .reservations
                .get_mut(&reservation.id)
                .ok_or_else(|| PersistenceError::not_found("reservation", reservation.id))?;
            if *stored != expected {
                return Err(PersistenceError::conflict(
                    "reservation",
                    reservation.id,
                    format!(
                        "changed since read: expected {} due {}, found {} due {}",
                        expected.status, expected.due_at, stored.status, stored.due_at
                    ),
                ));
            }
            Ok(std::mem::replace(stored, reservation))
        }
        .boxed()
    }

    fn delete_reservation_if(
        &self,
        id: ReservationId,
        expected: ReservationStatus,
    ) -> StoreFuture<'_, Result<Reservation>> {
        async move {
            self.check(FaultPoint::ReservationDelete)?;
            let mut tables = self.tables();
            let stored = tables
                .reservations
                .get(&id)
                .ok_or_else(|| PersistenceError::not_found("reservation", id))?;
            if stored.status != expected {
                return Err(PersistenceError::conflict(
                    "reservation",
                    id,
                    format!("expected {expected}, found {}", stored.status),
                ));
            }
            tables
                .reservations
                .remove(&id)
                .ok_or_else(|| PersistenceError::not_found("reservation", id))
        }
        .boxed()
    }
}

impl AlertStore for InMemoryStore {
    fn get_alert(&self, id: AlertId) -> StoreFuture<'_, Result<Option<Alert>>> {
        async move {
            self.check(FaultPoint::Read)?;
            Ok(self.tables().alerts.get(&id).map(|(_, alert)| alert.clone()))
        }
        .boxed()
    }

    fn list_alerts(&self, filter: AlertFilter) -> StoreFuture<'_, Result<Vec<Alert>>> {
        async move {
            self.check(FaultPoint::Read)?;
            Ok(Self::sorted_alerts(&self.tables(), &filter))
        }
        .boxed()
    }

    fn insert_if_absent(&self, alert: Alert) -> StoreFuture<'_, Result<AlertInsert>> {
        async move {
            let _order = self.publish_order.lock().await;
            self.check(FaultPoint::AlertWrite)?;
            let outcome = {
                let mut tables = self.tables();
                let existing = tables.alerts.values().find(|(_, a)| {
                    a.tool_id == alert.tool_id
                        && a.condition_class == alert.condition_class
                        && a.is_unresolved()
                });
                if let Some((_, existing)) = existing {
                    AlertInsert::Duplicate(existing.clone())
                } else {
                    tables.alert_seq += 1;
                    let seq = tables.alert_seq;
                    tables.alerts.insert(alert.id, (seq, alert.clone()));
                    AlertInsert::Inserted(alert)
                }
            };
            if let AlertInsert::Inserted(alert) = &outcome {
                self.publish(ChangeKind::Insert, alert).await;
            }
            Ok(outcome)
        }
        .boxed()
    }

    fn set_read(&self, id: AlertId, read: bool) -> StoreFuture<'_, Result<Option<Alert>>> {
        async move {
            let _order = self.publish_order.lock().await;
            self.check(FaultPoint::AlertWrite)?;
            let updated = self.tables().alerts.get_mut(&id).map(|(_, alert)| {
                alert.read = read;
                alert.clone()
            });
            if let Some(alert) = &updated {
                self.publish(ChangeKind::Update, alert).await;
            }
            Ok(updated)
        }
        .boxed()
    }

    fn mark_all_read(&self) -> StoreFuture<'_, Result<u64>> {
        async move {
            let _order = self.publish_order.lock().await;
            self.check(FaultPoint::AlertWrite)?;
            let changed: Vec<Alert> = self
                .tables()
                .alerts
                .values_mut()
                .filter(|(_, alert)| !alert.read)
                .map(|(_, alert)| {
                    alert.read = true;
                    alert.clone()
                })
                .collect();
            for alert in &changed {
                self.publish(ChangeKind::Update, alert).await;
            }
            Ok(changed.len() as u64)
        }
        .boxed()
    }

    fn resolve(&self, id: AlertId, at: DateTime<Utc>) -> StoreFuture<'_, Result<Option<Alert>>> {
        async move {
            let _order = self.publish_order.lock().await;
            self.check(FaultPoint::AlertWrite)?;
            let resolved = self
                .tables()
                .alerts
                .get_mut(&id)
                .filter(|(_, alert)| alert.is_unresolved())
                .map(|(_, alert)| {
                    alert.resolved_at = Some(at);
                    alert.clone()
                });
            if let Some(alert) = &resolved {
                self.publish(ChangeKind::Update, alert).await;
            }
            Ok(resolved)
        }
        .boxed()
    }

    fn delete_alert(&self, id: AlertId) -> StoreFuture<'_, Result<Option<Alert>>> {
        async move {
            let _order = self.publish_order.lock().await;
            self.check(FaultPoint::AlertWrite)?;
            let removed = self.tables().alerts.remove(&id).map(|(_, alert)| alert);
            if let Some(alert) = &removed {
                self.publish(ChangeKind::Delete, alert).await;
            }
            Ok(removed)
        }
        .boxed()
    }
}

/// In-memory [`ViolationLog`]
#[derive(Clone, Debug, Default)]
pub struct InMemoryViolationLog {
    records: Arc<Mutex<Vec<ViolationRecord>>>,
}

impl InMemoryViolationLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, resolved or not
    #[must_use]
    pub fn all(&self) -> Vec<ViolationRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ViolationLog for InMemoryViolationLog {
    fn record(&self, violation: ViolationRecord) -> StoreFuture<'_, Result<()>> {
        async move {
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(violation);
            Ok(())
        }
        .boxed()
    }

    fn list_unresolved(&self) -> StoreFuture<'_, Result<Vec<ViolationRecord>>> {
        async move {
            Ok(self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|r| r.resolved_at.is_none())
                .cloned()
                .collect())
        }
        .boxed()
    }

    fn resolve(
        &self,
        id: Uuid,
        resolved_by: String,
        notes: Option<String>,
    ) -> StoreFuture<'_, Result<()>> {
        async move {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| PersistenceError::not_found("consistency violation", id))?;
            record.resolved_at = Some(Utc::now());
            record.resolved_by = Some(resolved_by);
            record.resolution_notes = notes;
            Ok(())
        }
        .boxed()
    }
}
