//! `PostgreSQL` store.
//!
//! Pair writes run in one transaction of conditional `UPDATE`s; a statement
//! that matches no row means the tool or reservation was not in the state the
//! plan expected, and the transaction is rolled back. Alert deduplication
//! rides on the partial unique index `alerts_one_unresolved_per_class`, and
//! the `alerts_notify` trigger publishes every committed alert change (see
//! [`crate::channel::PgAlertChannel`]).

use super::{
    AlertFilter, AlertInsert, AlertStore, PairWrite, ReservationFilter, ReservationLedger, Result,
    StoreFuture, ToolFilter, ViolationLog, ViolationRecord, WorkshopStore, disagreement,
};
use crate::config::PostgresConfig;
use crate::error::{PersistenceError, ReservationError};
use crate::types::{
    Alert, AlertId, AlertPriority, Availability, Condition, ConditionClass, Employee, EmployeeId,
    Reservation, ReservationId, ReservationStatus, Tool, ToolId,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

const TOOL_COLUMNS: &str = "id, name, serial, category, availability, condition";
const RESERVATION_COLUMNS: &str =
    "id, tool_id, employee_id, reserved_at, due_at, returned_at, status, condition_at_return";
const ALERT_COLUMNS: &str =
    "id, tool_id, condition_class, reason, created_at, read, priority, resolved_at";

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict {
                entity: "row",
                id: db.constraint().unwrap_or("unique").to_string(),
                reason: db.message().to_string(),
            },
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => Self::Corrupt(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Connect a pool using `config`
///
/// # Errors
///
/// Returns [`PersistenceError::Unavailable`] if no connection can be made.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(config.idle_timeout())
        .connect(&config.url)
        .await?;
    tracing::info!(
        max_connections = config.max_connections,
        "Connected to PostgreSQL"
    );
    Ok(pool)
}

/// Apply the bundled migrations
///
/// # Errors
///
/// Returns [`PersistenceError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| PersistenceError::Database(format!("migration failed: {e}")))
}

/// Store backed by a `PgPool`
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Store over an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn tool_from_row(row: &PgRow) -> Result<Tool> {
        Ok(Tool {
            id: ToolId::from_uuid(row.try_get("id")?),
            name: row.try_get("name")?,
            serial: row.try_get("serial")?,
            category: row.try_get("category")?,
            availability: Availability::parse(row.try_get("availability")?)?,
            condition: Condition::parse(row.try_get("condition")?)?,
        })
    }

    fn employee_from_row(row: &PgRow) -> Result<Employee> {
        Ok(Employee {
            id: EmployeeId::from_uuid(row.try_get("id")?),
            full_name: row.try_get("full_name")?,
            identification: row.try_get("identification")?,
            qr_payload: row.try_get("qr_payload")?,
        })
    }

    fn reservation_from_row(row: &PgRow) -> Result<Reservation> {
        let condition_at_return: Option<&str> = row.try_get("condition_at_return")?;
        Ok(Reservation {
            id: ReservationId::from_uuid(row.try_get("id")?),
            tool_id: ToolId::from_uuid(row.try_get("tool_id")?),
            employee_id: EmployeeId::from_uuid(row.try_get("employee_id")?),
            reserved_at: row.try_get("reserved_at")?,
            due_at: row.try_get("due_at")?,
            returned_at: row.try_get("returned_at")?,
            status: ReservationStatus::parse(row.try_get("status")?)?,
            condition_at_return: condition_at_return.map(Condition::parse).transpose()?,
        })
    }

    fn alert_from_row(row: &PgRow) -> Result<Alert> {
        let priority: Option<&str> = row.try_get("priority")?;
        Ok(Alert {
            id: AlertId::from_uuid(row.try_get("id")?),
            tool_id: ToolId::from_uuid(row.try_get("tool_id")?),
            condition_class: ConditionClass::parse(row.try_get("condition_class")?)?,
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
            read: row.try_get("read")?,
            priority: priority.map(AlertPriority::parse).transpose()?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }

    async fn commit_pair(&self, write: PairWrite) -> std::result::Result<(), ReservationError> {
        let operation = write.operation();
        let mut tx = self.pool.begin().await.map_err(PersistenceError::from)?;

        match &write {
            PairWrite::Checkout {
                reservation,
                condition,
            } => {
                claim_tool(&mut tx, reservation.tool_id, *condition).await?;
                match insert_reservation(&mut tx, reservation).await {
                    Err(PersistenceError::Conflict { reason, .. }) => {
                        return Err(disagreement(operation, reservation, reason));
                    }
                    other => other?,
                }
            }

            PairWrite::Release {
                previous,
                reservation,
                condition,
            } => {
                update_reservation(&mut tx, reservation, previous).await?;
                if !set_tool(
                    &mut tx,
                    reservation.tool_id,
                    Availability::Reserved,
                    Availability::Available,
                    *condition,
                )
                .await?
                {
                    return Err(disagreement(
                        operation,
                        reservation,
                        "reservation was open but the tool was not reserved",
                    ));
                }
            }

            PairWrite::Reopen {
                previous,
                reservation,
                condition,
            } => {
                claim_tool(&mut tx, reservation.tool_id, *condition).await?;
                update_reservation(&mut tx, reservation, previous).await?;
            }

            PairWrite::Cancel {
                reservation,
                condition,
            } => {
                let deleted = sqlx::query("DELETE FROM reservations WHERE id = $1 AND status = $2")
                    .bind(reservation.id.as_uuid())
                    .bind(reservation.status.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(PersistenceError::from)?;
                if deleted.rows_affected() == 0 {
                    return Err(reservation_mismatch(&mut tx, reservation.id, reservation.status)
                        .await
                        .into());
                }
                if reservation.is_open()
                    && !set_tool(
                        &mut tx,
                        reservation.tool_id,
                        Availability::Reserved,
                        Availability::Available,
                        *condition,
                    )
                    .await?
                {
                    return Err(disagreement(
                        operation,
                        reservation,
                        "open reservation deleted but the tool was not reserved",
                    ));
                }
            }

            PairWrite::Amend {
                previous,
                reservation,
            } => {
                update_reservation(&mut tx, reservation, previous).await?;
            }
        }

        tx.commit().await.map_err(PersistenceError::from)?;
        tracing::debug!(operation, reservation_id = %write.reservation().id, "Pair write committed");
        Ok(())
    }

    async fn insert_alert_once(&self, alert: &Alert) -> Result<Option<Alert>> {
        let sql = format!(
            "INSERT INTO alerts ({ALERT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (tool_id, condition_class) WHERE resolved_at IS NULL DO NOTHING
             RETURNING {ALERT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(alert.id.as_uuid())
            .bind(alert.tool_id.as_uuid())
            .bind(alert.condition_class.as_str())
            .bind(&alert.reason)
            .bind(alert.created_at)
            .bind(alert.read)
            .bind(alert.priority.map(|p| p.as_str()))
            .bind(alert.resolved_at)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::alert_from_row).transpose()
    }

    async fn open_alert_for(&self, tool_id: ToolId, class: ConditionClass) -> Result<Option<Alert>> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts
             WHERE tool_id = $1 AND condition_class = $2 AND resolved_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(tool_id.as_uuid())
            .bind(class.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::alert_from_row).transpose()
    }
}

/// Conditional availability/condition update; `false` if no row matched
async fn set_tool(
    conn: &mut PgConnection,
    id: ToolId,
    expected: Availability,
    availability: Availability,
    condition: Condition,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tools SET availability = $3, condition = $4
         WHERE id = $1 AND availability = $2",
    )
    .bind(id.as_uuid())
    .bind(expected.as_str())
    .bind(availability.as_str())
    .bind(condition.as_str())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// `Available -> Reserved`, reporting why if the tool was not available
async fn claim_tool(conn: &mut PgConnection, id: ToolId, condition: Condition) -> Result<()> {
    if set_tool(conn, id, Availability::Available, Availability::Reserved, condition).await? {
        return Ok(());
    }
    let current: Option<String> = sqlx::query_scalar("SELECT availability FROM tools WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?;
    Err(match current {
        None => PersistenceError::not_found("tool", id),
        Some(found) => {
            PersistenceError::conflict("tool", id, format!("expected available, found {found}"))
        }
    })
}

async fn insert_reservation(conn: &mut PgConnection, reservation: &Reservation) -> Result<()> {
    let sql = format!(
        "INSERT INTO reservations ({RESERVATION_COLUMNS})
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
    );
    sqlx::query(&sql)
        .bind(reservation.id.as_uuid())
        .bind(reservation.tool_id.as_uuid())
        .bind(reservation.employee_id.as_uuid())
        .bind(reservation.reserved_at)
        .bind(reservation.due_at)
        .bind(reservation.returned_at)
        .bind(reservation.status.as_str())
        .bind(reservation.condition_at_return.map(|c| c.as_str()))
        .execute(conn)
        .await?;
    Ok(())
}

/// Overwrite a reservation if its mutable columns still match `expected`
async fn update_reservation(
    conn: &mut PgConnection,
    reservation: &Reservation,
    expected: &Reservation,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE reservations
         SET status = $2, due_at = $3, returned_at = $4, condition_at_return = $5
         WHERE id = $1
           AND status = $6
           AND due_at = $7
           AND returned_at IS NOT DISTINCT FROM $8
           AND condition_at_return IS NOT DISTINCT FROM $9",
    )
    .bind(reservation.id.as_uuid())
    .bind(reservation.status.as_str())
    .bind(reservation.due_at)
    .bind(reservation.returned_at)
    .bind(reservation.condition_at_return.map(|c| c.as_str()))
    .bind(expected.status.as_str())
    .bind(expected.due_at)
    .bind(expected.returned_at)
    .bind(expected.condition_at_return.map(|c| c.as_str()))
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 1 {
        return Ok(());
    }
    Err(reservation_mismatch(
        conn,
        reservation.id,
        format!("{} due {}", expected.status, expected.due_at),
    )
    .await)
}

/// Explain why a conditional reservation statement matched nothing
async fn reservation_mismatch(
    conn: &mut PgConnection,
    id: ReservationId,
    expected: impl std::fmt::Display,
) -> PersistenceError {
    let current: std::result::Result<Option<String>, sqlx::Error> =
        sqlx::query_scalar("SELECT status FROM reservations WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(conn)
            .await;
    match current {
        Ok(None) => PersistenceError::not_found("reservation", id),
        Ok(Some(found)) => PersistenceError::conflict(
            "reservation",
            id,
            format!("expected {expected}, found {found}"),
        ),
        Err(err) => err.into(),
    }
}

impl WorkshopStore for PgStore {
    fn get_tool(&self, id: ToolId) -> StoreFuture<'_, Result<Option<Tool>>> {
        async move {
            let sql = format!("SELECT {TOOL_COLUMNS} FROM tools WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::tool_from_row).transpose()
        }
        .boxed()
    }

    fn list_tools(&self, filter: ToolFilter) -> StoreFuture<'_, Result<Vec<Tool>>> {
        async move {
            let conditions: Option<Vec<&str>> = filter.min_condition.map(|min| {
                [Condition::Good, Condition::Deteriorating, Condition::Damaged]
                    .into_iter()
                    .filter(|c| *c >= min)
                    .map(|c| c.as_str())
                    .collect()
            });
            let sql = format!(
                "SELECT {TOOL_COLUMNS} FROM tools
                 WHERE ($1::text IS NULL OR availability = $1)
                   AND ($2::text[] IS NULL OR condition = ANY($2))
                 ORDER BY name, serial"
            );
            let rows = sqlx::query(&sql)
                .bind(filter.availability.map(|a| a.as_str()))
                .bind(conditions)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(Self::tool_from_row).collect()
        }
        .boxed()
    }

    fn insert_tool(&self, tool: Tool) -> StoreFuture<'_, Result<()>> {
        async move {
            let sql = format!("INSERT INTO tools ({TOOL_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)");
            sqlx::query(&sql)
                .bind(tool.id.as_uuid())
                .bind(&tool.name)
                .bind(&tool.serial)
                .bind(&tool.category)
                .bind(tool.availability.as_str())
                .bind(tool.condition.as_str())
                .execute(&self.pool)
                .await?;
            Ok(())
        }
        .boxed()
    }

    fn get_employee(&self, id: EmployeeId) -> StoreFuture<'_, Result<Option<Employee>>> {
        async move {
            let row = sqlx::query(
                "SELECT id, full_name, identification, qr_payload FROM employees WHERE id = $1",
            )
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(Self::employee_from_row).transpose()
        }
        .boxed()
    }

    fn insert_employee(&self, employee: Employee) -> StoreFuture<'_, Result<()>> {
        async move {
            sqlx::query(
                "INSERT INTO employees (id, full_name, identification, qr_payload)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(employee.id.as_uuid())
            .bind(&employee.full_name)
            .bind(&employee.identification)
            .bind(&employee.qr_payload)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
        .boxed()
    }

    fn get_reservation(&self, id: ReservationId) -> StoreFuture<'_, Result<Option<Reservation>>> {
        async move {
            let sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::reservation_from_row).transpose()
        }
        .boxed()
    }

    fn list_reservations(
        &self,
        filter: ReservationFilter,
    ) -> StoreFuture<'_, Result<Vec<Reservation>>> {
        async move {
            let sql = format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations
                 WHERE ($1::text IS NULL OR status = $1)
                   AND ($2::uuid IS NULL OR tool_id = $2)
                 ORDER BY due_at, reserved_at, id"
            );
            let rows = sqlx::query(&sql)
                .bind(filter.status.map(|s| s.as_str()))
                .bind(filter.tool_id.map(|t| *t.as_uuid()))
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(Self::reservation_from_row).collect()
        }
        .boxed()
    }
}

impl ReservationLedger for PgStore {
    fn commit(&self, write: PairWrite) -> StoreFuture<'_, std::result::Result<(), ReservationError>> {
        self.commit_pair(write).boxed()
    }
}

impl AlertStore for PgStore {
    fn get_alert(&self, id: AlertId) -> StoreFuture<'_, Result<Option<Alert>>> {
        async move {
            let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::alert_from_row).transpose()
        }
        .boxed()
    }

    fn list_alerts(&self, filter: AlertFilter) -> StoreFuture<'_, Result<Vec<Alert>>> {
        async move {
            let sql = format!(
                "SELECT {ALERT_COLUMNS} FROM alerts
                 WHERE ($1::uuid IS NULL OR tool_id = $1)
                   AND ($2::text IS NULL OR condition_class = $2)
                   AND (NOT $3 OR resolved_at IS NULL)
                   AND (NOT $4 OR NOT read)
                 ORDER BY created_at DESC, id DESC"
            );
            let rows = sqlx::query(&sql)
                .bind(filter.tool_id.map(|t| *t.as_uuid()))
                .bind(filter.condition_class.map(|c| c.as_str()))
                .bind(filter.unresolved_only)
                .bind(filter.unread_only)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(Self::alert_from_row).collect()
        }
        .boxed()
    }

    fn insert_if_absent(&self, alert: Alert) -> StoreFuture<'_, Result<AlertInsert>> {
        async move {
            // The blocking alert can be resolved between the insert and the
            // lookup; one retry covers that window.
            for _ in 0..2 {
                if let Some(inserted) = self.insert_alert_once(&alert).await? {
                    return Ok(AlertInsert::Inserted(inserted));
                }
                if let Some(existing) =
                    self.open_alert_for(alert.tool_id, alert.condition_class).await?
                {
                    return Ok(AlertInsert::Duplicate(existing));
                }
            }
            Err(PersistenceError::conflict(
                "alert",
                alert.id,
                "unresolved alert for this tool and class kept changing",
            ))
        }
        .boxed()
    }

    fn set_read(&self, id: AlertId, read: bool) -> StoreFuture<'_, Result<Option<Alert>>> {
        async move {
            let sql = format!("UPDATE alerts SET read = $2 WHERE id = $1 RETURNING {ALERT_COLUMNS}");
            let row = sqlx::query(&sql)
                .bind(id.as_uuid())
                .bind(read)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::alert_from_row).transpose()
        }
        .boxed()
    }

    fn mark_all_read(&self) -> StoreFuture<'_, Result<u64>> {
        async move {
            let result = sqlx::query("UPDATE alerts SET read = true WHERE NOT read")
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
        .boxed()
    }

    fn resolve(&self, id: AlertId, at: DateTime<Utc>) -> StoreFuture<'_, Result<Option<Alert>>> {
        async move {
            let sql = format!(
                "UPDATE alerts SET resolved_at = $2
                 WHERE id = $1 AND resolved_at IS NULL
                 RETURNING {ALERT_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(id.as_uuid())
                .bind(at)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::alert_from_row).transpose()
        }
        .boxed()
    }

    fn delete_alert(&self, id: AlertId) -> StoreFuture<'_, Result<Option<Alert>>> {
        async move {
            let sql = format!("DELETE FROM alerts WHERE id = $1 RETURNING {ALERT_COLUMNS}");
            let row = sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::alert_from_row).transpose()
        }
        .boxed()
    }
}

/// [`ViolationLog`] in the `consistency_violations` table
#[derive(Clone, Debug)]
pub struct PgViolationLog {
    pool: PgPool,
}

impl PgViolationLog {
    /// Log over an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &PgRow) -> Result<ViolationRecord> {
        Ok(ViolationRecord {
            id: row.try_get("id")?,
            operation: row.try_get("operation")?,
            tool_id: ToolId::from_uuid(row.try_get("tool_id")?),
            reservation_id: ReservationId::from_uuid(row.try_get("reservation_id")?),
            detail: row.try_get("detail")?,
            detected_at: row.try_get("detected_at")?,
            resolved_at: row.try_get("resolved_at")?,
            resolved_by: row.try_get("resolved_by")?,
            resolution_notes: row.try_get("resolution_notes")?,
        })
    }
}

impl ViolationLog for PgViolationLog {
    fn record(&self, violation: ViolationRecord) -> StoreFuture<'_, Result<()>> {
        async move {
            sqlx::query(
                r"
                INSERT INTO consistency_violations (
                    id, operation, tool_id, reservation_id, detail, detected_at
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(violation.id)
            .bind(&violation.operation)
            .bind(violation.tool_id.as_uuid())
            .bind(violation.reservation_id.as_uuid())
            .bind(&violation.detail)
            .bind(violation.detected_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
        .boxed()
    }

    fn list_unresolved(&self) -> StoreFuture<'_, Result<Vec<ViolationRecord>>> {
        async move {
            let rows = sqlx::query(
                r"
                SELECT id, operation, tool_id, reservation_id, detail, detected_at,
                       resolved_at, resolved_by, resolution_notes
                FROM consistency_violations
                WHERE resolved_at IS NULL
                ORDER BY detected_at ASC
                ",
            )
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(Self::record_from_row).collect()
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
            let result = sqlx::query(
                r"
                UPDATE consistency_violations
                SET resolved_at = NOW(), resolved_by = $2, resolution_notes = $3
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(&resolved_by)
            .bind(notes)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(PersistenceError::not_found("consistency violation", id));
            }
            tracing::info!(violation_id = %id, resolved_by = %resolved_by, "Consistency violation resolved");
            Ok(())
        }
        .boxed()
    }
}
