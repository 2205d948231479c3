//! End-to-end scenarios over the in-memory crib.
//!
//! Run with: `cargo test --test scenarios_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

mod common;

use chrono::Duration;
use common::Crib;
use toolcrib::persistence::AlertFilter;
use toolcrib::{Availability, Condition, ConditionClass, ReservationStatus};

/// A checkout due in one hour is one day overdue two hours later.
#[tokio::test]
async fn checkout_becomes_overdue_after_due_date() {
    let crib = Crib::new();
    let tool = crib.tool("Torque wrench", "TW-100").await;
    let employee = crib.employee("Ines Alvarez").await;
    let start = crib.clock_now();

    let reservation = crib.checkout(&tool, &employee, 1).await;

    let overdue = crib
        .reservations
        .list_overdue(start + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].reservation.id, reservation.id);
    assert_eq!(overdue[0].reservation.tool_id, tool.id);
    assert_eq!(overdue[0].days_overdue, 1);
    assert_eq!(crib.availability(tool.id).await, Availability::Reserved);
}

/// Returning the tool frees it and takes it off the overdue list.
#[tokio::test]
async fn return_releases_tool_and_clears_overdue() {
    let crib = Crib::new();
    let tool = crib.tool("Torque wrench", "TW-100").await;
    let employee = crib.employee("Ines Alvarez").await;
    let reservation = crib.checkout(&tool, &employee, 1).await;
    crib.clock.advance(Duration::hours(2));

    let returned = crib
        .reservations
        .return_tool(reservation.id, Condition::Good, None)
        .await
        .unwrap();

    assert_eq!(returned.status, ReservationStatus::Returned);
    assert_eq!(returned.condition_at_return, Some(Condition::Good));
    assert_eq!(returned.returned_at, Some(crib.clock_now()));
    assert_eq!(crib.availability(tool.id).await, Availability::Available);
    let overdue = crib
        .reservations
        .list_overdue(crib.clock_now())
        .await
        .unwrap();
    assert!(overdue.is_empty());
}

/// Generating the same overdue alert twice leaves one alert; marking all read
/// clears the unread count.
#[tokio::test]
async fn overdue_alert_is_raised_once_and_marked_read() {
    let crib = Crib::new();
    let tool = crib.tool("Torque wrench", "TW-100").await;
    let employee = crib.employee("Ines Alvarez").await;
    crib.checkout(&tool, &employee, 1).await;
    crib.clock.advance(Duration::hours(2));

    let overdue = crib
        .reservations
        .list_overdue(crib.clock_now())
        .await
        .unwrap();
    let first = crib.generator.generate_overdue_alert(&overdue[0]).await.unwrap();
    let second = crib.generator.generate_overdue_alert(&overdue[0]).await.unwrap();

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(second.alert().id, first.alert().id);

    let alerts = crib.alerts.list_alerts(AlertFilter::default()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].condition_class, ConditionClass::Overdue);
    assert!(alerts[0].reason.contains("Ines Alvarez"));
    assert!(alerts[0].reason.contains("1 day past due"));
    assert_eq!(crib.alerts.unread_count().await.unwrap(), 1);

    assert_eq!(crib.alerts.mark_all_read().await.unwrap(), 1);

    assert_eq!(crib.alerts.unread_count().await.unwrap(), 0);
    let alerts = crib.alerts.list_alerts(AlertFilter::default()).await.unwrap();
    assert!(alerts.iter().all(|a| a.read));
}
