//! Storage contracts and adapters.
//!
//! Reads go through [`WorkshopStore`] and [`AlertStore`]. Every write that
//! must change a tool and its reservation together goes through a
//! [`ReservationLedger`] as one [`PairWrite`]; the ledger either commits both
//! rows or neither.
//!
//! Adapters:
//!
//! - [`memory::InMemoryStore`]: mutex-guarded maps, with failure injection
//! - [`ledger::CompensatingLedger`]: a ledger over any [`RowWrites`] store
//!   that has no transactions, using ordered conditional writes plus
//!   compensation
//! - [`postgres::PgStore`]: sqlx over `PgPool`, one transaction per pair write
//!
//! Traits return boxed futures so they stay dyn-compatible.

pub mod ledger;
pub mod memory;
pub mod postgres;

use crate::error::{PersistenceError, ReservationError};
use crate::types::{
    Alert, AlertId, Availability, Condition, ConditionClass, Employee, EmployeeId, Reservation,
    ReservationId, ReservationStatus, Tool, ToolId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Boxed future returned by every storage trait
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result alias for storage operations
pub type Result<T> = std::result::Result<T, PersistenceError>;

// ============================================================================
// Filters
// ============================================================================

/// Reservation query
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    /// Only this status
    pub status: Option<ReservationStatus>,
    /// Only this tool
    pub tool_id: Option<ToolId>,
}

impl ReservationFilter {
    /// Open reservations
    #[must_use]
    pub fn open() -> Self {
        Self {
            status: Some(ReservationStatus::Open),
            ..Self::default()
        }
    }

    /// Narrow to one tool
    #[must_use]
    pub const fn for_tool(mut self, tool_id: ToolId) -> Self {
        self.tool_id = Some(tool_id);
        self
    }

    /// Whether `reservation` passes the filter
    #[must_use]
    pub fn matches(&self, reservation: &Reservation) -> bool {
        self.status.is_none_or(|s| s == reservation.status)
            && self.tool_id.is_none_or(|t| t == reservation.tool_id)
    }
}

/// Tool query
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolFilter {
    /// Only this availability
    pub availability: Option<Availability>,
    /// Only tools at least this bad
    pub min_condition: Option<Condition>,
}

impl ToolFilter {
    /// Tools in a condition worse than good
    #[must_use]
    pub fn deteriorated() -> Self {
        Self {
            min_condition: Some(Condition::Deteriorating),
            ..Self::default()
        }
    }

    /// Whether `tool` passes the filter
    #[must_use]
    pub fn matches(&self, tool: &Tool) -> bool {
        self.availability.is_none_or(|a| a == tool.availability)
            && self.min_condition.is_none_or(|c| tool.condition >= c)
    }
}

/// Alert query. Results are newest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertFilter {
    /// Only this tool
    pub tool_id: Option<ToolId>,
    /// Only this class
    pub condition_class: Option<ConditionClass>,
    /// Skip resolved alerts
    pub unresolved_only: bool,
    /// Skip read alerts
    pub unread_only: bool,
}

impl AlertFilter {
    /// Unresolved alerts of one class
    #[must_use]
    pub fn unresolved(condition_class: ConditionClass) -> Self {
        Self {
            condition_class: Some(condition_class),
            unresolved_only: true,
            ..Self::default()
        }
    }

    /// Narrow to one tool
    #[must_use]
    pub const fn for_tool(mut self, tool_id: ToolId) -> Self {
        self.tool_id = Some(tool_id);
        self
    }

    /// Whether `alert` passes the filter
    #[must_use]
    pub fn matches(&self, alert: &Alert) -> bool {
        self.tool_id.is_none_or(|t| t == alert.tool_id)
            && self.condition_class.is_none_or(|c| c == alert.condition_class)
            && (!self.unresolved_only || alert.is_unresolved())
            && (!self.unread_only || !alert.read)
    }
}

// ============================================================================
// Read side and single-row writes
// ============================================================================

/// Tools, employees and reservations
pub trait WorkshopStore: Send + Sync {
    /// Fetch one tool
    fn get_tool(&self, id: ToolId) -> StoreFuture<'_, Result<Option<Tool>>>;

    /// List tools matching `filter`
    fn list_tools(&self, filter: ToolFilter) -> StoreFuture<'_, Result<Vec<Tool>>>;

    /// Register a tool
    fn insert_tool(&self, tool: Tool) -> StoreFuture<'_, Result<()>>;

    /// Fetch one employee
    fn get_employee(&self, id: EmployeeId) -> StoreFuture<'_, Result<Option<Employee>>>;

    /// Register an employee
    fn insert_employee(&self, employee: Employee) -> StoreFuture<'_, Result<()>>;

    /// Fetch one reservation
    fn get_reservation(&self, id: ReservationId) -> StoreFuture<'_, Result<Option<Reservation>>>;

    /// List reservations matching `filter`, oldest due date first
    fn list_reservations(
        &self,
        filter: ReservationFilter,
    ) -> StoreFuture<'_, Result<Vec<Reservation>>>;
}

/// Conditional single-row writes.
///
/// Each call is atomic on its own row and checks the row's current state
/// before writing; a mismatch is reported as [`PersistenceError::Conflict`]
/// and nothing changes. [`ledger::CompensatingLedger`] builds pair writes out
/// of these.
pub trait RowWrites: Send + Sync {
    /// Set availability and condition if availability is `expected`.
    ///
    /// Returns the tool as it was before the write.
    fn update_tool_if(
        &self,
        id: ToolId,
        expected: Availability,
        availability: Availability,
        condition: Condition,
    ) -> StoreFuture<'_, Result<Tool>>;

    /// Insert a reservation; conflicts if the tool already has an open one
    fn insert_reservation(&self, reservation: Reservation) -> StoreFuture<'_, Result<()>>;

    /// Overwrite a reservation if the stored row still equals `expected`,
    /// the row the change was planned from.
    ///
    /// Returns the row as it was before the write.
    fn replace_reservation_if(
        &self,
        reservation: Reservation,
        expected: Reservation,
    ) -> StoreFuture<'_, Result<Reservation>>;

    /// Delete a reservation if its stored status is `expected`
    fn delete_reservation_if(
        &self,
        id: ReservationId,
        expected: ReservationStatus,
    ) -> StoreFuture<'_, Result<Reservation>>;
}

// ============================================================================
// Pair writes
// ============================================================================

/// A planned change to a tool and its reservation that must land as a unit.
///
/// Produced by the pure planners in [`crate::reservation`]; committed by a
/// [`ReservationLedger`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairWrite {
    /// Tool `Available -> Reserved`, insert the open reservation
    Checkout {
        /// New open reservation
        reservation: Reservation,
        /// Tool condition, unchanged
        condition: Condition,
    },

    /// Reservation `Open -> Returned`, tool `Reserved -> Available`
    Release {
        /// Row before the write
        previous: Reservation,
        /// Row after the write
        reservation: Reservation,
        /// Tool condition after the write
        condition: Condition,
    },

    /// Reservation `Returned -> Open`, tool `Available -> Reserved`
    Reopen {
        /// Row before the write
        previous: Reservation,
        /// Row after the write
        reservation: Reservation,
        /// Tool condition, unchanged
        condition: Condition,
    },

    /// Delete the reservation; if it was open, tool `Reserved -> Available`
    Cancel {
        /// Row being deleted
        reservation: Reservation,
        /// Tool condition, unchanged
        condition: Condition,
    },

    /// Rewrite reservation fields without touching the tool
    Amend {
        /// Row before the write
        previous: Reservation,
        /// Row after the write
        reservation: Reservation,
    },
}

impl PairWrite {
    /// Operation name for logs and violation records
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::Checkout { .. } => "checkout",
            Self::Release { .. } => "return",
            Self::Reopen { .. } => "reopen",
            Self::Cancel { .. } => "cancel",
            Self::Amend { .. } => "amend",
        }
    }

    /// The reservation row this write produces or removes
    #[must_use]
    pub const fn reservation(&self) -> &Reservation {
        match self {
            Self::Checkout { reservation, .. }
            | Self::Release { reservation, .. }
            | Self::Reopen { reservation, .. }
            | Self::Cancel { reservation, .. }
            | Self::Amend { reservation, .. } => reservation,
        }
    }
}

/// Build the error for a tool/reservation disagreement found while committing.
pub(crate) fn disagreement(
    operation: &'static str,
    reservation: &Reservation,
    detail: impl std::fmt::Display,
) -> ReservationError {
    tracing::error!(
        operation,
        tool_id = %reservation.tool_id,
        reservation_id = %reservation.id,
        %detail,
        "Tool and reservation disagree"
    );
    ReservationError::ConsistencyViolation {
        operation,
        detail: format!(
            "tool {} / reservation {}: {detail}",
            reservation.tool_id, reservation.id
        ),
    }
}

/// Commits a [`PairWrite`] all-or-nothing.
///
/// On [`ReservationError::Conflict`] and [`ReservationError::Unavailable`]
/// nothing was written. [`ReservationError::ConsistencyViolation`] means the
/// ledger found or left the pair in disagreement.
pub trait ReservationLedger: Send + Sync {
    /// Commit `write`
    fn commit(&self, write: PairWrite) -> StoreFuture<'_, std::result::Result<(), ReservationError>>;
}

// ============================================================================
// Alerts
// ============================================================================

/// Result of a deduplicating alert insert
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlertInsert {
    /// No unresolved alert existed for `(tool, class)`; this one was stored
    Inserted(Alert),
    /// An unresolved alert already covers `(tool, class)`
    Duplicate(Alert),
}

/// Alert rows
pub trait AlertStore: Send + Sync {
    /// Fetch one alert
    fn get_alert(&self, id: AlertId) -> StoreFuture<'_, Result<Option<Alert>>>;

    /// List alerts matching `filter`, newest first
    fn list_alerts(&self, filter: AlertFilter) -> StoreFuture<'_, Result<Vec<Alert>>>;

    /// Insert `alert` unless an unresolved alert shares its tool and class.
    ///
    /// The check and the insert are one atomic step at the store.
    fn insert_if_absent(&self, alert: Alert) -> StoreFuture<'_, Result<AlertInsert>>;

    /// Set the read flag; `None` if the alert does not exist
    fn set_read(&self, id: AlertId, read: bool) -> StoreFuture<'_, Result<Option<Alert>>>;

    /// Mark every unread alert read; returns how many changed
    fn mark_all_read(&self) -> StoreFuture<'_, Result<u64>>;

    /// Stamp `resolved_at` on an unresolved alert; `None` if missing or
    /// already resolved
    fn resolve(&self, id: AlertId, at: DateTime<Utc>) -> StoreFuture<'_, Result<Option<Alert>>>;

    /// Delete an alert; `None` if it did not exist
    fn delete_alert(&self, id: AlertId) -> StoreFuture<'_, Result<Option<Alert>>>;
}

// ============================================================================
// Consistency violations
// ============================================================================

/// A tool/reservation disagreement awaiting manual reconciliation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Identifier
    pub id: Uuid,
    /// Operation that detected it
    pub operation: String,
    /// Tool involved
    pub tool_id: ToolId,
    /// Reservation involved
    pub reservation_id: ReservationId,
    /// What was left in which state
    pub detail: String,
    /// When it was detected
    pub detected_at: DateTime<Utc>,
    /// When someone reconciled it
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who reconciled it
    pub resolved_by: Option<String>,
    /// What they did
    pub resolution_notes: Option<String>,
}

impl ViolationRecord {
    /// A new unresolved record
    #[must_use]
    pub fn new(
        operation: impl Into<String>,
        reservation: &Reservation,
        detail: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            tool_id: reservation.tool_id,
            reservation_id: reservation.id,
            detail: detail.into(),
            detected_at,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        }
    }
}

/// Durable list of consistency violations
pub trait ViolationLog: Send + Sync {
    /// Append a record
    fn record(&self, violation: ViolationRecord) -> StoreFuture<'_, Result<()>>;

    /// Records nobody has resolved yet, oldest first
    fn list_unresolved(&self) -> StoreFuture<'_, Result<Vec<ViolationRecord>>>;

    /// Mark a record reconciled
    fn resolve(
        &self,
        id: Uuid,
        resolved_by: String,
        notes: Option<String>,
    ) -> StoreFuture<'_, Result<()>>;
}
