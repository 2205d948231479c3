//! Alert change channel over `PostgreSQL` `LISTEN/NOTIFY`.
//!
//! The `alerts_notify` trigger sends one notification per committed alert
//! row change on the `alerts_changes` channel:
//!
//! ```json
//! {"table": "alerts", "op": "UPDATE", "row": {...}, "committed_at": "..."}
//! ```
//!
//! `NOTIFY` is delivered after commit, in commit order per session, and is
//! lost while a listener is disconnected. A reconnect is reported to the
//! subscriber as [`ChannelError::Lagged`] so it can resnapshot.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::future::Future;
use std::pin::Pin;
use toolcrib_core::channel::{ChangeKind, ChangeStream, ChannelError, EventChannel, RowChange};

/// Table whose changes drive the alert feed
pub const ALERTS_TABLE: &str = "alerts";

fn notify_channel(table: &str) -> String {
    format!("{table}_changes")
}

/// Wire format of a notification payload
#[derive(Debug, Serialize, Deserialize)]
struct NotifyPayload {
    table: String,
    op: String,
    row: serde_json::Value,
    committed_at: DateTime<Utc>,
}

impl NotifyPayload {
    fn into_change(self) -> Result<RowChange, ChannelError> {
        Ok(RowChange {
            kind: ChangeKind::from_operation(&self.op)?,
            table: self.table,
            row: self.row,
            committed_at: self.committed_at,
        })
    }
}

/// [`EventChannel`] backed by `LISTEN/NOTIFY`
#[derive(Clone, Debug)]
pub struct PgAlertChannel {
    pool: PgPool,
}

impl PgAlertChannel {
    /// Channel over an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl EventChannel for PgAlertChannel {
    fn publish(
        &self,
        change: RowChange,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>> {
        async move {
            let op = match change.kind {
                ChangeKind::Insert => "INSERT",
                ChangeKind::Update => "UPDATE",
                ChangeKind::Delete => "DELETE",
            };
            let payload = serde_json::to_string(&NotifyPayload {
                table: change.table.clone(),
                op: op.to_string(),
                row: change.row,
                committed_at: change.committed_at,
            })
            .map_err(|e| ChannelError::Codec(e.to_string()))?;

            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(notify_channel(&change.table))
                .bind(payload)
                .execute(&self.pool)
                .await
                .map_err(|e| ChannelError::PublishFailed {
                    table: change.table,
                    reason: e.to_string(),
                })?;
            Ok(())
        }
        .boxed()
    }

    fn subscribe(
        &self,
        table: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ChangeStream, ChannelError>> + Send + '_>> {
        let table = table.to_string();
        async move {
            let subscription_failed = |e: sqlx::Error| ChannelError::SubscriptionFailed {
                table: table.clone(),
                reason: e.to_string(),
            };
            let mut listener = PgListener::connect_with(&self.pool)
                .await
                .map_err(subscription_failed)?;
            listener
                .listen(&notify_channel(&table))
                .await
                .map_err(subscription_failed)?;
            tracing::info!(table = %table, "Listening for row changes");

            let stream = async_stream::stream! {
                loop {
                    match listener.try_recv().await {
                        Ok(Some(notification)) => {
                            yield serde_json::from_str::<NotifyPayload>(notification.payload())
                                .map_err(|e| ChannelError::Codec(e.to_string()))
                                .and_then(NotifyPayload::into_change);
                        }
                        // Connection dropped and was re-established; anything
                        // sent in between is gone.
                        Ok(None) => yield Err(ChannelError::Lagged(0)),
                        Err(err) => {
                            yield Err(ChannelError::ConnectionFailed(err.to_string()));
                            break;
                        }
                    }
                }
            };
            Ok(Box::pin(stream) as ChangeStream)
        }
        .boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn trigger_payload_decodes_into_row_change() {
        let payload = r#"{
            "table": "alerts",
            "op": "DELETE",
            "row": {"id": "7f1f0e5e-2d5b-4a53-9a0e-0c8a4bb0b6a1"},
            "committed_at": "2025-01-01T08:30:00.123456+00:00"
        }"#;

        let change = serde_json::from_str::<NotifyPayload>(payload)
            .unwrap()
            .into_change()
            .unwrap();

        assert_eq!(change.kind, ChangeKind::Delete);
        assert_eq!(change.table, ALERTS_TABLE);
        assert_eq!(change.committed_at.to_rfc3339(), "2025-01-01T08:30:00.123456+00:00");
    }

    #[test]
    fn channel_name_is_derived_from_table() {
        assert_eq!(notify_channel(ALERTS_TABLE), "alerts_changes");
    }
}
