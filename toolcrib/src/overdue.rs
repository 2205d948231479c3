//! Overdue detection.
//!
//! Pure functions of `now` and the open reservations; no I/O. A reservation is
//! overdue once its due instant is strictly in the past, and the day count
//! rounds *up* on the millisecond difference: one minute late is one day late.

use crate::types::Reservation;
use chrono::{DateTime, Utc};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// An open reservation past its due date
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverdueReservation {
    /// The reservation
    pub reservation: Reservation,
    /// Whole days late, rounded up; always at least 1
    pub days_overdue: i64,
}

/// Days between `due_at` and `now`, rounded up; 0 if not yet due.
#[must_use]
pub fn days_overdue(due_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let late_ms = (now - due_at).num_milliseconds();
    if late_ms <= 0 {
        return 0;
    }
    late_ms / DAY_MS + i64::from(late_ms % DAY_MS != 0)
}

/// Open reservations in `reservations` that are overdue at `now`.
///
/// Most overdue first; ties broken by earliest due date.
#[must_use]
pub fn detect_overdue<'a>(
    now: DateTime<Utc>,
    reservations: impl IntoIterator<Item = &'a Reservation>,
) -> Vec<OverdueReservation> {
    let mut overdue: Vec<OverdueReservation> = reservations
        .into_iter()
        .filter(|r| r.is_open() && r.due_at < now)
        .map(|r| OverdueReservation {
            reservation: r.clone(),
            days_overdue: days_overdue(r.due_at, now),
        })
        .collect();
    overdue.sort_by(|a, b| {
        b.days_overdue
            .cmp(&a.days_overdue)
            .then(a.reservation.due_at.cmp(&b.reservation.due_at))
    });
    overdue
}
