//! Row-change channel abstraction for real-time client updates.
//!
//! The persistence layer announces every committed insert, update and delete of
//! a watched table as a [`RowChange`]. Connected clients subscribe to the table
//! through an [`EventChannel`] and fold the changes into their local view.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   commit   ┌──────────────┐  notify  ┌──────────────┐
//! │   Service    │──────────▶│  Persistence  │────────▶│ EventChannel │
//! └──────────────┘            └──────────────┘          └──────┬───────┘
//!                                                               │ at-least-once
//!                                                  ┌────────────┼────────────┐
//!                                                  ▼            ▼            ▼
//!                                              client A     client B     client C
//! ```
//!
//! # Delivery guarantees
//!
//! - **Per-row ordering**: changes to a single row arrive in commit order
//! - **No cross-row ordering**: changes to different rows may interleave freely
//! - **At-least-once**: a change may be delivered more than once
//!
//! Subscribers must therefore be idempotent and must never assume a global order.
//!
//! # Implementations
//!
//! - `InMemoryEventChannel` (in `toolcrib-testing`): broadcast-backed, for tests
//! - `PgAlertChannel` (in `toolcrib`): `PostgreSQL` `LISTEN/NOTIFY`

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during channel operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Failed to connect to the channel backend
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a change
    #[error("Publish failed for table '{table}': {reason}")]
    PublishFailed {
        /// The table the change belongs to
        table: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a table
    #[error("Subscription failed for table '{table}': {reason}")]
    SubscriptionFailed {
        /// The table that failed to subscribe
        table: String,
        /// The reason for failure
        reason: String,
    },

    /// A change payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// The subscriber fell behind and `skipped` changes were dropped
    ///
    /// Subscribers must treat this as an uncertain period and resynchronise
    /// from a full snapshot.
    #[error("Subscriber lagged, {0} changes dropped")]
    Lagged(u64),

    /// The channel was closed by the backend
    #[error("Channel closed")]
    Closed,
}

/// Kind of row-level change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A row was inserted
    Insert,
    /// A row was updated
    Update,
    /// A row was deleted; the payload holds the last known row
    Delete,
}

impl ChangeKind {
    /// Parse the operation name used by database triggers (`INSERT`, `UPDATE`, `DELETE`).
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Codec`] for any other operation name.
    pub fn from_operation(op: &str) -> Result<Self, ChannelError> {
        match op.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(ChannelError::Codec(format!("unknown operation: {other}"))),
        }
    }
}

/// A single committed row change.
///
/// The row itself travels as JSON so the channel stays table-agnostic; typed
/// consumers call [`RowChange::decode`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Table the row belongs to (e.g. `"alerts"`)
    pub table: String,
    /// What happened to the row
    pub kind: ChangeKind,
    /// The row after the change (or before, for deletes)
    pub row: serde_json::Value,
    /// When the change was committed at the store
    pub committed_at: DateTime<Utc>,
}

impl RowChange {
    /// Build a change from a typed row.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Codec`] if the row cannot be serialized.
    pub fn encode<T: Serialize>(
        table: impl Into<String>,
        kind: ChangeKind,
        row: &T,
        committed_at: DateTime<Utc>,
    ) -> Result<Self, ChannelError> {
        let row = serde_json::to_value(row).map_err(|e| ChannelError::Codec(e.to_string()))?;
        Ok(Self {
            table: table.into(),
            kind,
            row,
            committed_at,
        })
    }

    /// Decode the row payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Codec`] if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        serde_json::from_value(self.row.clone()).map_err(|e| ChannelError::Codec(e.to_string()))
    }
}

/// Stream of changes from a subscription.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<RowChange, ChannelError>> + Send>>;

/// Trait for row-change channel implementations.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
/// channel can be shared as `Arc<dyn EventChannel>` between services and
/// effect closures.
pub trait EventChannel: Send + Sync {
    /// Publish a committed change to every subscriber of `change.table`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PublishFailed`] if the backend rejects the change.
    fn publish(
        &self,
        change: RowChange,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>>;

    /// Subscribe to all changes of `table`.
    ///
    /// Only changes committed after the subscription is established are
    /// delivered; callers load a snapshot afterwards to cover earlier state.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SubscriptionFailed`] if the subscription cannot be set up.
    fn subscribe(
        &self,
        table: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ChangeStream, ChannelError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u32,
        read: bool,
    }

    #[test]
    fn change_round_trips_typed_row() {
        let row = Row { id: 7, read: false };
        let change = RowChange::encode("alerts", ChangeKind::Insert, &row, Utc::now()).unwrap();
        assert_eq!(change.table, "alerts");
        assert_eq!(change.decode::<Row>().unwrap(), row);
    }

    #[test]
    fn decode_rejects_foreign_payload() {
        let change = RowChange {
            table: "alerts".to_string(),
            kind: ChangeKind::Update,
            row: serde_json::json!({ "unexpected": true }),
            committed_at: Utc::now(),
        };
        assert!(matches!(change.decode::<Row>(), Err(ChannelError::Codec(_))));
    }

    #[test]
    fn trigger_operation_names_parse() {
        assert_eq!(ChangeKind::from_operation("INSERT").unwrap(), ChangeKind::Insert);
        assert_eq!(ChangeKind::from_operation("update").unwrap(), ChangeKind::Update);
        assert_eq!(ChangeKind::from_operation("DELETE").unwrap(), ChangeKind::Delete);
        assert!(ChangeKind::from_operation("TRUNCATE").is_err());
    }
}
