//! Alert generation and the alert mutators.
//!
//! [`AlertGenerator`] turns detected conditions into alert rows. Deduplication
//! is keyed on `(tool, condition class)` and enforced by the store's
//! [`AlertStore::insert_if_absent`], so two generators racing on the same tool
//! still produce one unresolved alert. The reason text is for people only and
//! is never inspected.
//!
//! Failures are returned to the caller and not retried here; the periodic
//! sweep ([`crate::sweep`]) re-evaluates everything on its next run.

use crate::error::AlertError;
use crate::overdue::{OverdueReservation, detect_overdue};
use crate::persistence::{
    AlertFilter, AlertInsert, AlertStore, ReservationFilter, ToolFilter, WorkshopStore,
};
use crate::types::{Alert, AlertId, AlertPriority, Condition, ConditionClass, Tool, ToolId};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use toolcrib_core::environment::Clock;

/// Priority rules
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlertPolicy {
    /// Overdue alerts at or beyond this many days are [`AlertPriority::High`]
    pub high_priority_after_days: i64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            high_priority_after_days: 3,
        }
    }
}

impl AlertPolicy {
    /// Priority of an overdue alert
    #[must_use]
    pub const fn overdue_priority(&self, days_overdue: i64) -> AlertPriority {
        if days_overdue >= self.high_priority_after_days {
            AlertPriority::High
        } else {
            AlertPriority::Medium
        }
    }

    /// Priority of a condition alert; `None` when the condition needs no alert
    #[must_use]
    pub const fn condition_priority(condition: Condition) -> Option<AlertPriority> {
        match condition {
            Condition::Good => None,
            Condition::Deteriorating => Some(AlertPriority::Medium),
            Condition::Damaged => Some(AlertPriority::High),
        }
    }
}

/// Reason text for an overdue alert
#[must_use]
pub fn overdue_reason(employee_name: &str, tool: &Tool, days_overdue: i64) -> String {
    let unit = if days_overdue == 1 { "day" } else { "days" };
    format!(
        "Overdue return: {employee_name} has not returned {}, {days_overdue} {unit} past due",
        tool.label()
    )
}

/// Reason text for a condition alert
#[must_use]
pub fn condition_reason(tool: &Tool, condition: Condition) -> String {
    format!(
        "Condition alert: {} reported {condition}; inspect before the next checkout",
        tool.label()
    )
}

/// Result of one generation attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerateOutcome {
    /// A new alert was stored
    Created(Alert),
    /// An unresolved alert already covered the condition; nothing was stored
    AlreadyOpen(Alert),
}

impl GenerateOutcome {
    /// The stored alert, new or existing
    #[must_use]
    pub const fn alert(&self) -> &Alert {
        match self {
            Self::Created(alert) | Self::AlreadyOpen(alert) => alert,
        }
    }

    /// Whether a new row was written
    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Result of a batch run; one failing item does not stop the others
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Alerts written by this run
    pub created: Vec<Alert>,
    /// Conditions already covered by an unresolved alert
    pub deduplicated: usize,
    /// Items that could not be processed
    pub failed: Vec<(ToolId, AlertError)>,
}

impl BatchOutcome {
    fn record(&mut self, tool_id: ToolId, result: Result<GenerateOutcome, AlertError>) {
        match result {
            Ok(GenerateOutcome::Created(alert)) => self.created.push(alert),
            Ok(GenerateOutcome::AlreadyOpen(_)) => self.deduplicated += 1,
            Err(err) => {
                tracing::warn!(%tool_id, error = %err, "Alert generation failed");
                self.failed.push((tool_id, err));
            }
        }
    }

    /// Whether any item failed on a transient error
    #[must_use]
    pub fn has_retryable_failures(&self) -> bool {
        self.failed.iter().any(|(_, err)| err.is_retryable())
    }
}

/// Writes overdue and condition alerts without duplicates
#[derive(Clone)]
pub struct AlertGenerator {
    store: Arc<dyn WorkshopStore>,
    alerts: Arc<dyn AlertStore>,
    clock: Arc<dyn Clock>,
    policy: AlertPolicy,
}

impl AlertGenerator {
    /// Generator reading tools and employees from `store` and writing to `alerts`
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkshopStore>,
        alerts: Arc<dyn AlertStore>,
        clock: Arc<dyn Clock>,
        policy: AlertPolicy,
    ) -> Self {
        Self {
            store,
            alerts,
            clock,
            policy,
        }
    }

    /// Raise an overdue alert for `overdue` unless one is already open for its tool.
    ///
    /// # Errors
    ///
    /// [`AlertError::NotFound`] if the tool or employee is gone;
    /// [`AlertError::Store`] on store failure.
    #[tracing::instrument(skip(self, overdue), fields(reservation_id = %overdue.reservation.id))]
    pub async fn generate_overdue_alert(
        &self,
        overdue: &OverdueReservation,
    ) -> Result<GenerateOutcome, AlertError> {
        let reservation = &overdue.reservation;
        let tool = self.tool(reservation.tool_id).await?;
        let employee = self
            .store
            .get_employee(reservation.employee_id)
            .await?
            .ok_or_else(|| AlertError::NotFound {
                entity: "employee",
                id: reservation.employee_id.to_string(),
            })?;

        let alert = Alert::new(
            tool.id,
            ConditionClass::Overdue,
            overdue_reason(&employee.full_name, &tool, overdue.days_overdue),
            self.policy.overdue_priority(overdue.days_overdue),
            self.clock.now(),
        );
        self.insert(alert).await
    }

    /// Raise overdue alerts for a batch, at most one per tool.
    ///
    /// Idempotent: running it again with the same set creates nothing new
    /// while the earlier alerts stay unresolved.
    pub async fn generate_all_overdue_alerts(
        &self,
        overdue: &[OverdueReservation],
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut seen = HashSet::new();
        for item in overdue {
            let tool_id = item.reservation.tool_id;
            if !seen.insert(tool_id) {
                continue;
            }
            outcome.record(tool_id, self.generate_overdue_alert(item).await);
        }
        tracing::info!(
            candidates = overdue.len(),
            created = outcome.created.len(),
            deduplicated = outcome.deduplicated,
            failed = outcome.failed.len(),
            "Overdue alert batch finished"
        );
        outcome
    }

    /// React to a tool's condition changing.
    ///
    /// Deteriorating or worse raises a [`ConditionClass::Deteriorated`] alert
    /// (deduplicated independently of overdue alerts). Going back to good
    /// resolves the open condition alert.
    ///
    /// # Errors
    ///
    /// [`AlertError::NotFound`] if the tool is gone; [`AlertError::Store`] on
    /// store failure.
    #[tracing::instrument(skip(self))]
    pub async fn on_condition_changed(
        &self,
        tool_id: ToolId,
        old: Condition,
        new: Condition,
    ) -> Result<Option<GenerateOutcome>, AlertError> {
        let Some(priority) = AlertPolicy::condition_priority(new) else {
            if old.is_deteriorated() {
                let resolved = self
                    .resolve_matching(AlertFilter::unresolved(ConditionClass::Deteriorated).for_tool(tool_id))
                    .await?;
                tracing::info!(%tool_id, resolved = resolved.len(), "Tool back in good condition");
            }
            return Ok(None);
        };

        let tool = self.tool(tool_id).await?;
        let alert = Alert::new(
            tool_id,
            ConditionClass::Deteriorated,
            condition_reason(&tool, new),
            priority,
            self.clock.now(),
        );
        self.insert(alert).await.map(Some)
    }

    /// Raise condition alerts for every tool currently deteriorating or worse.
    ///
    /// # Errors
    ///
    /// [`AlertError::Store`] if the tools cannot be listed.
    pub async fn generate_condition_alerts(&self) -> Result<BatchOutcome, AlertError> {
        let tools = self.store.list_tools(ToolFilter::deteriorated()).await?;
        let mut outcome = BatchOutcome::default();
        for tool in tools {
            let Some(priority) = AlertPolicy::condition_priority(tool.condition) else {
                continue;
            };
            let alert = Alert::new(
                tool.id,
                ConditionClass::Deteriorated,
                condition_reason(&tool, tool.condition),
                priority,
                self.clock.now(),
            );
            outcome.record(tool.id, self.insert(alert).await);
        }
        Ok(outcome)
    }

    /// Resolve alerts whose condition no longer holds at `now`.
    ///
    /// Overdue alerts clear once their tool has no overdue open reservation
    /// (for example, returned while the sweep was raising the alert).
    /// Condition alerts clear once the tool is back in good condition.
    ///
    /// # Errors
    ///
    /// [`AlertError::Store`] on store failure.
    pub async fn resolve_stale_alerts(&self, now: DateTime<Utc>) -> Result<Vec<Alert>, AlertError> {
        let open = self.store.list_reservations(ReservationFilter::open()).await?;
        let still_overdue: HashSet<ToolId> = detect_overdue(now, &open)
            .into_iter()
            .map(|o| o.reservation.tool_id)
            .collect();

        let mut stale: Vec<AlertId> = self
            .alerts
            .list_alerts(AlertFilter::unresolved(ConditionClass::Overdue))
            .await?
            .into_iter()
            .filter(|alert| !still_overdue.contains(&alert.tool_id))
            .map(|alert| alert.id)
            .collect();

        for alert in self
            .alerts
            .list_alerts(AlertFilter::unresolved(ConditionClass::Deteriorated))
            .await?
        {
            let tool = self.store.get_tool(alert.tool_id).await?;
            if tool.is_none_or(|t| !t.condition.is_deteriorated()) {
                stale.push(alert.id);
            }
        }

        let mut resolved = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(alert) = self.alerts.resolve(id, now).await? {
                resolved.push(alert);
            }
        }
        if !resolved.is_empty() {
            tracing::info!(count = resolved.len(), "Resolved stale alerts");
            metrics::counter!("toolcrib.alerts.resolved").increment(resolved.len() as u64);
        }
        Ok(resolved)
    }

    async fn tool(&self, id: ToolId) -> Result<Tool, AlertError> {
        self.store
            .get_tool(id)
            .await?
            .ok_or_else(|| AlertError::NotFound {
                entity: "tool",
                id: id.to_string(),
            })
    }

    async fn resolve_matching(&self, filter: AlertFilter) -> Result<Vec<Alert>, AlertError> {
        let now = self.clock.now();
        let mut resolved = Vec::new();
        for alert in self.alerts.list_alerts(filter).await? {
            if let Some(alert) = self.alerts.resolve(alert.id, now).await? {
                resolved.push(alert);
            }
        }
        Ok(resolved)
    }

    async fn insert(&self, alert: Alert) -> Result<GenerateOutcome, AlertError> {
        let class = alert.condition_class.as_str();
        match self.alerts.insert_if_absent(alert).await? {
            AlertInsert::Inserted(alert) => {
                tracing::info!(
                    alert_id = %alert.id,
                    tool_id = %alert.tool_id,
                    class,
                    priority = ?alert.priority,
                    "Alert raised"
                );
                metrics::counter!("toolcrib.alerts.generated", "class" => class).increment(1);
                Ok(GenerateOutcome::Created(alert))
            }
            AlertInsert::Duplicate(existing) => {
                tracing::debug!(alert_id = %existing.id, class, "Condition already alerted");
                metrics::counter!("toolcrib.alerts.deduplicated", "class" => class).increment(1);
                Ok(GenerateOutcome::AlreadyOpen(existing))
            }
        }
    }
}

/// Operator actions on alerts
#[derive(Clone)]
pub struct AlertService {
    alerts: Arc<dyn AlertStore>,
}

impl AlertService {
    /// Service over `alerts`
    #[must_use]
    pub fn new(alerts: Arc<dyn AlertStore>) -> Self {
        Self { alerts }
    }

    /// Mark one alert read
    ///
    /// # Errors
    ///
    /// [`AlertError::NotFound`] if the alert does not exist.
    pub async fn mark_alert_read(&self, id: AlertId) -> Result<Alert, AlertError> {
        self.alerts
            .set_read(id, true)
            .await?
            .ok_or_else(|| Self::missing(id))
    }

    /// Mark every alert read; returns how many changed
    ///
    /// # Errors
    ///
    /// [`AlertError::Store`] on store failure.
    pub async fn mark_all_read(&self) -> Result<u64, AlertError> {
        let changed = self.alerts.mark_all_read().await?;
        tracing::info!(changed, "Marked all alerts read");
        Ok(changed)
    }

    /// Delete one alert
    ///
    /// # Errors
    ///
    /// [`AlertError::NotFound`] if the alert does not exist.
    pub async fn delete_alert(&self, id: AlertId) -> Result<Alert, AlertError> {
        self.alerts
            .delete_alert(id)
            .await?
            .ok_or_else(|| Self::missing(id))
    }

    /// Alerts matching `filter`, newest first
    ///
    /// # Errors
    ///
    /// [`AlertError::Store`] on store failure.
    pub async fn list_alerts(&self, filter: AlertFilter) -> Result<Vec<Alert>, AlertError> {
        Ok(self.alerts.list_alerts(filter).await?)
    }

    /// Number of unread alerts
    ///
    /// # Errors
    ///
    /// [`AlertError::Store`] on store failure.
    pub async fn unread_count(&self) -> Result<usize, AlertError> {
        let filter = AlertFilter {
            unread_only: true,
            ..AlertFilter::default()
        };
        Ok(self.alerts.list_alerts(filter).await?.len())
    }

    fn missing(id: AlertId) -> AlertError {
        AlertError::NotFound {
            entity: "alert",
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::persistence::memory::{FaultPoint, InMemoryStore};
    use crate::types::{Employee, EmployeeId, Reservation, ReservationId, ReservationStatus};
    use chrono::Duration;
    use toolcrib_testing::{FixedClock, epoch};

    struct Fixture {
        store: Arc<InMemoryStore>,
        generator: AlertGenerator,
        tool: Tool,
        employee: Employee,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let tool = Tool::new("Torque wrench", "TW-12", "hand");
        let employee = Employee::new("Ana Ruiz", "E-001");
        store.insert_tool(tool.clone()).await.unwrap();
        store.insert_employee(employee.clone()).await.unwrap();
        let generator = AlertGenerator::new(
            store.clone(),
            store.clone(),
            Arc::new(FixedClock::new(epoch())),
            AlertPolicy::default(),
        );
        Fixture {
            store,
            generator,
            tool,
            employee,
        }
    }

    fn overdue(tool: &Tool, employee_id: EmployeeId, days: i64) -> OverdueReservation {
        OverdueReservation {
            reservation: Reservation {
                id: ReservationId::new(),
                tool_id: tool.id,
                employee_id,
                reserved_at: epoch() - Duration::days(days + 1),
                due_at: epoch() - Duration::days(days),
                returned_at: None,
                status: ReservationStatus::Open,
                condition_at_return: None,
            },
            days_overdue: days,
        }
    }

    #[test]
    fn reason_names_employee_tool_and_days() {
        let tool = Tool::new("Torque wrench", "TW-12", "hand");
        assert_eq!(
            overdue_reason("Ana Ruiz", &tool, 1),
            "Overdue return: Ana Ruiz has not returned Torque wrench (TW-12), 1 day past due"
        );
        assert!(overdue_reason("Ana Ruiz", &tool, 4).ends_with("4 days past due"));
    }

    #[test]
    fn priority_escalates_with_days_and_severity() {
        let policy = AlertPolicy::default();
        assert_eq!(policy.overdue_priority(1), AlertPriority::Medium);
        assert_eq!(policy.overdue_priority(3), AlertPriority::High);
        assert_eq!(AlertPolicy::condition_priority(Condition::Good), None);
        assert_eq!(
            AlertPolicy::condition_priority(Condition::Damaged),
            Some(AlertPriority::High)
        );
    }

    #[tokio::test]
    async fn second_overdue_alert_for_same_tool_is_deduplicated() {
        let f = fixture().await;
        let item = overdue(&f.tool, f.employee.id, 2);

        let first = f.generator.generate_overdue_alert(&item).await.unwrap();
        let second = f.generator.generate_overdue_alert(&item).await.unwrap();

        assert!(first.is_created());
        assert_eq!(second, GenerateOutcome::AlreadyOpen(first.alert().clone()));
        assert_eq!(f.store.list_alerts(AlertFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_raises_one_alert_per_tool() {
        let f = fixture().await;
        let items = vec![
            overdue(&f.tool, f.employee.id, 5),
            overdue(&f.tool, f.employee.id, 1),
        ];

        let outcome = f.generator.generate_all_overdue_alerts(&items).await;

        assert_eq!(outcome.created.len(), 1);
        assert_eq!(outcome.created[0].priority, Some(AlertPriority::High));
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_reported_not_retried() {
        let f = fixture().await;
        f.store.fail_next(FaultPoint::AlertWrite, 1);

        let result = f
            .generator
            .generate_overdue_alert(&overdue(&f.tool, f.employee.id, 1))
            .await;

        assert!(result.unwrap_err().is_retryable());
        assert!(f.store.list_alerts(AlertFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn condition_alerts_are_independent_of_overdue_alerts() {
        let f = fixture().await;
        f.generator
            .generate_overdue_alert(&overdue(&f.tool, f.employee.id, 1))
            .await
            .unwrap();

        let outcome = f
            .generator
            .on_condition_changed(f.tool.id, Condition::Good, Condition::Damaged)
            .await
            .unwrap()
            .unwrap();

        assert!(outcome.is_created());
        assert_eq!(outcome.alert().condition_class, ConditionClass::Deteriorated);
        assert_eq!(outcome.alert().priority, Some(AlertPriority::High));
    }

    #[tokio::test]
    async fn recovering_to_good_resolves_condition_alert() {
        let f = fixture().await;
        f.generator
            .on_condition_changed(f.tool.id, Condition::Good, Condition::Deteriorating)
            .await
            .unwrap();

        let outcome = f
            .generator
            .on_condition_changed(f.tool.id, Condition::Deteriorating, Condition::Good)
            .await
            .unwrap();

        assert_eq!(outcome, None);
        let open = f
            .store
            .list_alerts(AlertFilter::unresolved(ConditionClass::Deteriorated))
            .await
            .unwrap();
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn alert_service_reports_missing_alerts() {
        let f = fixture().await;
        let service = AlertService::new(f.store.clone());

        let result = service.mark_alert_read(AlertId::new()).await;
        assert!(matches!(result, Err(AlertError::NotFound { entity: "alert", .. })));
        assert_eq!(service.mark_all_read().await.unwrap(), 0);
    }
}
