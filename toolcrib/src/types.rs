//! Domain types for the tool crib.
//!
//! Tools, employees, reservations and alerts as they are stored. Enums that
//! are persisted as text carry `as_str`/`parse` pairs so the SQL adapters and
//! the change channel agree on one spelling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a tool
    ToolId
);
uuid_id!(
    /// Unique identifier for an employee
    EmployeeId
);
uuid_id!(
    /// Unique identifier for a reservation
    ReservationId
);
uuid_id!(
    /// Unique identifier for an alert
    AlertId
);

/// Error returned when a stored enum spelling is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    /// Which enum was being parsed
    pub kind: &'static str,
    /// The offending text
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stored spelling
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            /// Parse the stored spelling
            ///
            /// # Errors
            ///
            /// Returns [`UnknownVariant`] for any other text.
            pub fn parse(value: &str) -> Result<Self, UnknownVariant> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ============================================================================
// Tools
// ============================================================================

/// Whether a tool can be checked out
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// On the shelf
    Available,
    /// Held by exactly one open reservation
    Reserved,
}

text_enum!(Availability, "availability", {
    Available => "available",
    Reserved => "reserved",
});

/// Physical condition of a tool.
///
/// Variants are declared in severity order, so `Good < Deteriorating < Damaged`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Fit for use
    Good,
    /// Usable, but wearing out
    Deteriorating,
    /// Must not be issued until repaired
    Damaged,
}

text_enum!(Condition, "condition", {
    Good => "good",
    Deteriorating => "deteriorating",
    Damaged => "damaged",
});

impl Condition {
    /// True for any condition worse than [`Condition::Good`]
    #[must_use]
    pub fn is_deteriorated(self) -> bool {
        self > Self::Good
    }
}

/// A tool in the crib
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    /// Identifier
    pub id: ToolId,
    /// Display name, e.g. "Cordless drill"
    pub name: String,
    /// Serial number stamped on the tool
    pub serial: String,
    /// Free-form category
    pub category: String,
    /// Availability
    pub availability: Availability,
    /// Last known physical condition
    pub condition: Condition,
}

impl Tool {
    /// A new, available tool in good condition
    #[must_use]
    pub fn new(name: impl Into<String>, serial: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: ToolId::new(),
            name: name.into(),
            serial: serial.into(),
            category: category.into(),
            availability: Availability::Available,
            condition: Condition::Good,
        }
    }

    /// "name (serial)" as used in alert text
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.serial)
    }
}

// ============================================================================
// Employees
// ============================================================================

/// Someone allowed to check tools out
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    /// Identifier
    pub id: EmployeeId,
    /// Full name
    pub full_name: String,
    /// Badge or national identification number
    pub identification: String,
    /// Payload printed on the employee's QR badge
    pub qr_payload: String,
}

impl Employee {
    /// A new employee; the QR payload defaults to the identification number
    #[must_use]
    pub fn new(full_name: impl Into<String>, identification: impl Into<String>) -> Self {
        let identification = identification.into();
        Self {
            id: EmployeeId::new(),
            full_name: full_name.into(),
            qr_payload: identification.clone(),
            identification,
        }
    }
}

// ============================================================================
// Reservations
// ============================================================================

/// Reservation lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Tool is out with the employee
    Open,
    /// Tool came back
    Returned,
}

text_enum!(ReservationStatus, "reservation status", {
    Open => "open",
    Returned => "returned",
});

/// A checkout of one tool by one employee
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Identifier
    pub id: ReservationId,
    /// Tool held
    pub tool_id: ToolId,
    /// Holder
    pub employee_id: EmployeeId,
    /// When the tool left the crib
    pub reserved_at: DateTime<Utc>,
    /// When it is due back
    pub due_at: DateTime<Utc>,
    /// When it came back; set iff status is `Returned`
    pub returned_at: Option<DateTime<Utc>>,
    /// Lifecycle status
    pub status: ReservationStatus,
    /// Condition recorded at return; set iff status is `Returned`
    pub condition_at_return: Option<Condition>,
}

impl Reservation {
    /// True while the tool is out
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == ReservationStatus::Open
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// What an alert is about; deduplication is keyed on `(tool, class)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionClass {
    /// Tool not returned by its due date
    Overdue,
    /// Tool reported in a condition worse than good
    Deteriorated,
    /// Category running short
    LowStock,
}

text_enum!(ConditionClass, "condition class", {
    Overdue => "overdue",
    Deteriorated => "deteriorated",
    LowStock => "low_stock",
});

/// Alert urgency
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    /// Informational
    Low,
    /// Needs attention
    Medium,
    /// Surfaced as a notification immediately
    High,
}

text_enum!(AlertPriority, "alert priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// A dashboard alert about one tool
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Identifier
    pub id: AlertId,
    /// Tool the alert is about
    pub tool_id: ToolId,
    /// Dedup class
    pub condition_class: ConditionClass,
    /// Human-readable text
    pub reason: String,
    /// When the alert was raised
    pub created_at: DateTime<Utc>,
    /// Seen by an operator
    pub read: bool,
    /// Urgency, if classified
    pub priority: Option<AlertPriority>,
    /// When the underlying condition cleared; `None` while it still holds
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// A fresh unread, unresolved alert
    #[must_use]
    pub fn new(
        tool_id: ToolId,
        condition_class: ConditionClass,
        reason: impl Into<String>,
        priority: AlertPriority,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::new(),
            tool_id,
            condition_class,
            reason: reason.into(),
            created_at,
            read: false,
            priority: Some(priority),
            resolved_at: None,
        }
    }

    /// Condition still holds
    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Unread and high priority
    #[must_use]
    pub fn is_urgent(&self) -> bool {
        !self.read && self.priority == Some(AlertPriority::High)
    }
}
