//! Reservation state machine.
//!
//! Per tool: `Available -> checkout -> Reserved -> return -> Available`, plus
//! `Reserved -> Available` by cancel.
//!
//! Every operation is split in two. A pure `plan_*` function validates the
//! request against rows read beforehand and produces a [`PairWrite`] carrying
//! the expected prior states. [`ReservationService`] then commits that plan
//! through a [`ReservationLedger`], whose conditional writes decide races: if
//! the rows changed since they were read, the commit fails with
//! [`ReservationError::Conflict`] and nothing is written.

use crate::alerts::AlertGenerator;
use crate::error::ReservationError;
use crate::overdue::{OverdueReservation, detect_overdue};
use crate::persistence::{
    PairWrite, ReservationFilter, ReservationLedger, ViolationLog, ViolationRecord, WorkshopStore,
};
use crate::types::{
    Availability, Condition, Employee, EmployeeId, Reservation, ReservationId, ReservationStatus,
    Tool, ToolId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use toolcrib_core::environment::Clock;

// ============================================================================
// Planners
// ============================================================================

/// Plan a checkout of `tool` by `employee` at `now`.
///
/// # Errors
///
/// [`ReservationError::Validation`] if `due_at` is not after `now`;
/// [`ReservationError::Conflict`] if the tool is already reserved.
pub fn plan_checkout(
    tool: &Tool,
    employee: &Employee,
    due_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<PairWrite, ReservationError> {
    if due_at <= now {
        return Err(ReservationError::validation(
            "due_at",
            format!("must be after {}", now.to_rfc3339()),
        ));
    }
    if tool.availability != Availability::Available {
        return Err(ReservationError::Conflict(format!(
            "tool {} is already reserved",
            tool.id
        )));
    }
    Ok(PairWrite::Checkout {
        reservation: Reservation {
            id: ReservationId::new(),
            tool_id: tool.id,
            employee_id: employee.id,
            reserved_at: now,
            due_at,
            returned_at: None,
            status: ReservationStatus::Open,
            condition_at_return: None,
        },
        condition: tool.condition,
    })
}

/// Plan the return of an open reservation.
///
/// The tool's condition becomes `condition`.
///
/// # Errors
///
/// [`ReservationError::Conflict`] if the reservation is already returned;
/// [`ReservationError::Validation`] if `returned_at` is before the checkout or
/// after `now`.
pub fn plan_return(
    reservation: &Reservation,
    condition: Condition,
    returned_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<PairWrite, ReservationError> {
    if !reservation.is_open() {
        return Err(ReservationError::Conflict(format!(
            "reservation {} is already returned",
            reservation.id
        )));
    }
    if returned_at < reservation.reserved_at {
        return Err(ReservationError::validation(
            "returned_at",
            "must not be before the tool was checked out",
        ));
    }
    if returned_at > now {
        return Err(ReservationError::validation(
            "returned_at",
            "must not be in the future",
        ));
    }
    Ok(PairWrite::Release {
        previous: reservation.clone(),
        reservation: Reservation {
            returned_at: Some(returned_at),
            status: ReservationStatus::Returned,
            condition_at_return: Some(condition),
            ..reservation.clone()
        },
        condition,
    })
}

/// Plan a due date correction.
///
/// # Errors
///
/// [`ReservationError::Validation`] if `due_at` is not after the checkout.
pub fn plan_due_date_edit(
    reservation: &Reservation,
    due_at: DateTime<Utc>,
) -> Result<PairWrite, ReservationError> {
    if due_at <= reservation.reserved_at {
        return Err(ReservationError::validation(
            "due_at",
            "must be after the tool was checked out",
        ));
    }
    Ok(PairWrite::Amend {
        previous: reservation.clone(),
        reservation: Reservation {
            due_at,
            ..reservation.clone()
        },
    })
}

/// Plan a forced status change.
///
/// Returns `Ok(None)` when nothing would change.
///
/// - `Open -> Returned` releases the tool like [`plan_return`]; the condition
///   defaults to the tool's current one.
/// - `Returned -> Returned` with a condition corrects `condition_at_return`.
/// - `Returned -> Open` re-reserves the tool.
///
/// # Errors
///
/// [`ReservationError::Conflict`] when reopening while the tool is reserved
/// by another reservation; [`ReservationError::Validation`] when a condition
/// is given for an open reservation.
pub fn plan_status_edit(
    reservation: &Reservation,
    tool: &Tool,
    status: ReservationStatus,
    condition_at_return: Option<Condition>,
    now: DateTime<Utc>,
) -> Result<Option<PairWrite>, ReservationError> {
    use ReservationStatus::{Open, Returned};

    match (reservation.status, status) {
        (Open, Returned) => plan_return(
            reservation,
            condition_at_return.unwrap_or(tool.condition),
            now,
            now,
        )
        .map(Some),
        (Returned, Returned) => Ok(condition_at_return
            .filter(|c| reservation.condition_at_return != Some(*c))
            .map(|c| PairWrite::Amend {
                previous: reservation.clone(),
                reservation: Reservation {
                    condition_at_return: Some(c),
                    ..reservation.clone()
                },
            })),
        (_, Open) if condition_at_return.is_some() => Err(ReservationError::validation(
            "condition_at_return",
            "only applies to returned reservations",
        )),
        (Returned, Open) => {
            if tool.availability == Availability::Reserved {
                return Err(ReservationError::Conflict(format!(
                    "tool {} is reserved by another reservation",
                    tool.id
                )));
            }
            Ok(Some(PairWrite::Reopen {
                previous: reservation.clone(),
                reservation: Reservation {
                    returned_at: None,
                    status: Open,
                    condition_at_return: None,
                    ..reservation.clone()
                },
                condition: tool.condition,
            }))
        }
        (Open, Open) => Ok(None),
    }
}

/// Plan the deletion of a reservation; an open one releases `tool`
#[must_use]
pub fn plan_cancel(reservation: &Reservation, tool: &Tool) -> PairWrite {
    PairWrite::Cancel {
        reservation: reservation.clone(),
        condition: tool.condition,
    }
}

// ============================================================================
// Service
// ============================================================================

/// Reservation operations exposed to the presentation layer
#[derive(Clone)]
pub struct ReservationService {
    store: Arc<dyn WorkshopStore>,
    ledger: Arc<dyn ReservationLedger>,
    violations: Arc<dyn ViolationLog>,
    clock: Arc<dyn Clock>,
    alerts: Option<AlertGenerator>,
}

impl ReservationService {
    /// Service without condition alerts
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkshopStore>,
        ledger: Arc<dyn ReservationLedger>,
        violations: Arc<dyn ViolationLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            violations,
            clock,
            alerts: None,
        }
    }

    /// Forward condition changes on return to `generator`
    #[must_use]
    pub fn with_alerts(mut self, generator: AlertGenerator) -> Self {
        self.alerts = Some(generator);
        self
    }

    /// Check `tool_id` out to `employee_id` until `due_at`.
    ///
    /// # Errors
    ///
    /// [`ReservationError::NotFound`] for an unknown tool or employee,
    /// [`ReservationError::Validation`] for a past due date,
    /// [`ReservationError::Conflict`] if the tool is (or just became) reserved.
    #[tracing::instrument(skip(self))]
    pub async fn checkout(
        &self,
        tool_id: ToolId,
        employee_id: EmployeeId,
        due_at: DateTime<Utc>,
    ) -> Result<Reservation, ReservationError> {
        let now = self.clock.now();
        let tool = self.load_tool(tool_id).await?;
        let employee = self
            .store
            .get_employee(employee_id)
            .await?
            .ok_or_else(|| ReservationError::NotFound {
                entity: "employee",
                id: employee_id.to_string(),
            })?;

        let result = match plan_checkout(&tool, &employee, due_at, now) {
            Ok(write) => {
                let reservation = write.reservation().clone();
                self.commit(write).await.map(|()| reservation)
            }
            Err(err) => Err(err),
        };

        match &result {
            Ok(reservation) => {
                metrics::counter!("toolcrib.checkout.total").increment(1);
                tracing::info!(
                    reservation_id = %reservation.id,
                    due_at = %reservation.due_at,
                    "Tool checked out"
                );
            }
            Err(ReservationError::Conflict(_)) => {
                metrics::counter!("toolcrib.checkout.conflicts").increment(1);
            }
            Err(_) => {}
        }
        result
    }

    /// Return an open reservation.
    ///
    /// `returned_at` defaults to now. The tool becomes available in
    /// `condition`; a change of condition is passed on to the alert generator.
    ///
    /// # Errors
    ///
    /// [`ReservationError::Conflict`] if the reservation is already returned.
    #[tracing::instrument(skip(self))]
    pub async fn return_tool(
        &self,
        reservation_id: ReservationId,
        condition: Condition,
        returned_at: Option<DateTime<Utc>>,
    ) -> Result<Reservation, ReservationError> {
        let now = self.clock.now();
        let reservation = self.load_reservation(reservation_id).await?;
        let tool = self.load_tool(reservation.tool_id).await?;

        let write = plan_return(&reservation, condition, returned_at.unwrap_or(now), now)?;
        let returned = write.reservation().clone();
        self.commit(write).await?;

        tracing::info!(tool_id = %tool.id, %condition, "Tool returned");
        self.condition_changed(&tool, condition).await;
        Ok(returned)
    }

    /// Correct the due date.
    ///
    /// # Errors
    ///
    /// [`ReservationError::Validation`] if the date is not after the checkout;
    /// [`ReservationError::Conflict`] if the reservation changed status meanwhile.
    #[tracing::instrument(skip(self))]
    pub async fn edit_due_date(
        &self,
        reservation_id: ReservationId,
        due_at: DateTime<Utc>,
    ) -> Result<Reservation, ReservationError> {
        let reservation = self.load_reservation(reservation_id).await?;
        let write = plan_due_date_edit(&reservation, due_at)?;
        let edited = write.reservation().clone();
        self.commit(write).await?;
        tracing::info!("Due date corrected");
        Ok(edited)
    }

    /// Force a reservation's status.
    ///
    /// Forcing `Returned` releases the tool as [`Self::return_tool`] does.
    /// Forcing `Open` re-reserves the tool.
    ///
    /// # Errors
    ///
    /// [`ReservationError::Conflict`] if reopening while another reservation
    /// holds the tool.
    #[tracing::instrument(skip(self))]
    pub async fn edit_status(
        &self,
        reservation_id: ReservationId,
        status: ReservationStatus,
        condition_at_return: Option<Condition>,
    ) -> Result<Reservation, ReservationError> {
        let now = self.clock.now();
        let reservation = self.load_reservation(reservation_id).await?;
        let tool = self.load_tool(reservation.tool_id).await?;

        let Some(write) =
            plan_status_edit(&reservation, &tool, status, condition_at_return, now)?
        else {
            return Ok(reservation);
        };
        let released = matches!(write, PairWrite::Release { .. });
        let edited = write.reservation().clone();
        self.commit(write).await?;

        tracing::info!(from = %reservation.status, to = %status, "Reservation status edited");
        if released {
            if let Some(condition) = edited.condition_at_return {
                self.condition_changed(&tool, condition).await;
            }
        }
        Ok(edited)
    }

    /// Delete a reservation, releasing its tool if it was open.
    ///
    /// # Errors
    ///
    /// [`ReservationError::NotFound`] for an unknown reservation;
    /// [`ReservationError::Conflict`] if it changed status meanwhile.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, reservation_id: ReservationId) -> Result<(), ReservationError> {
        let reservation = self.load_reservation(reservation_id).await?;
        let tool = self.load_tool(reservation.tool_id).await?;
        self.commit(plan_cancel(&reservation, &tool)).await?;
        tracing::info!(was_open = reservation.is_open(), "Reservation cancelled");
        Ok(())
    }

    /// Open reservations, oldest due date first
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn list_open_reservations(&self) -> Result<Vec<Reservation>, ReservationError> {
        Ok(self.store.list_reservations(ReservationFilter::open()).await?)
    }

    /// Open reservations overdue at `now`, most overdue first
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn list_overdue(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<OverdueReservation>, ReservationError> {
        let open = self.list_open_reservations().await?;
        Ok(detect_overdue(now, &open))
    }

    async fn load_tool(&self, id: ToolId) -> Result<Tool, ReservationError> {
        self.store
            .get_tool(id)
            .await?
            .ok_or_else(|| ReservationError::NotFound {
                entity: "tool",
                id: id.to_string(),
            })
    }

    async fn load_reservation(&self, id: ReservationId) -> Result<Reservation, ReservationError> {
        self.store
            .get_reservation(id)
            .await?
            .ok_or_else(|| ReservationError::NotFound {
                entity: "reservation",
                id: id.to_string(),
            })
    }

    async fn commit(&self, write: PairWrite) -> Result<(), ReservationError> {
        let operation = write.operation();
        let reservation = write.reservation().clone();

        let err = match self.ledger.commit(write).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if err.needs_review() {
            metrics::counter!("toolcrib.ledger.consistency_violations", "operation" => operation)
                .increment(1);
            let record =
                ViolationRecord::new(operation, &reservation, err.to_string(), self.clock.now());
            if let Err(log_err) = self.violations.record(record).await {
                tracing::error!(
                    operation,
                    error = %log_err,
                    "Could not record consistency violation"
                );
            }
        } else if matches!(err, ReservationError::Conflict(_)) {
            tracing::warn!(operation, reservation_id = %reservation.id, error = %err, "Write lost a race");
        }
        Err(err)
    }

    async fn condition_changed(&self, tool: &Tool, new: Condition) {
        let Some(alerts) = &self.alerts else {
            return;
        };
        if tool.condition == new {
            return;
        }
        if let Err(err) = alerts.on_condition_changed(tool.id, tool.condition, new).await {
            tracing::warn!(tool_id = %tool.id, error = %err, "Condition alert not raised");
        }
    }
}
