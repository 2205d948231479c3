//! Alert generation: deduplication under repetition and concurrency,
//! condition alerts, and resolution of stale alerts.
//!
//! Run with: `cargo test --test alert_generation_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

mod common;

use chrono::Duration;
use common::Crib;
use std::sync::Arc;
use toolcrib::config::SweepConfig;
use toolcrib::persistence::memory::FaultPoint;
use toolcrib::persistence::{AlertFilter, WorkshopStore};
use toolcrib::sweep::Sweeper;
use toolcrib::{AlertError, AlertPriority, Condition, ConditionClass, Tool};

/// Running the overdue batch repeatedly creates each alert once.
#[tokio::test]
async fn repeated_batches_create_each_alert_once() {
    let crib = Crib::new();
    let employee = crib.employee("Ana Ruiz").await;
    for i in 0..3 {
        let tool = crib.tool("Multimeter", &format!("MM-{i}")).await;
        crib.checkout(&tool, &employee, 1).await;
    }
    crib.clock.advance(Duration::hours(5));
    let overdue = crib.reservations.list_overdue(crib.clock_now()).await.unwrap();

    let first = crib.generator.generate_all_overdue_alerts(&overdue).await;
    let second = crib.generator.generate_all_overdue_alerts(&overdue).await;

    assert_eq!(first.created.len(), 3);
    assert_eq!(second.created.len(), 0);
    assert_eq!(second.deduplicated, 3);
    assert_eq!(
        crib.alerts.list_alerts(AlertFilter::default()).await.unwrap().len(),
        3
    );
}

/// Generators racing on the same overdue set still store one alert per tool.
#[tokio::test]
async fn concurrent_generators_do_not_duplicate() {
    let crib = Crib::new();
    let employee = crib.employee("Ana Ruiz").await;
    let tool = crib.tool("Oscilloscope", "OS-1").await;
    crib.checkout(&tool, &employee, 1).await;
    crib.clock.advance(Duration::days(1));
    let overdue = Arc::new(crib.reservations.list_overdue(crib.clock_now()).await.unwrap());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let generator = crib.generator.clone();
        let overdue = Arc::clone(&overdue);
        handles.push(tokio::spawn(async move {
            generator.generate_all_overdue_alerts(&overdue).await
        }));
    }
    let mut created = 0;
    for handle in handles {
        created += handle.await.unwrap().created.len();
    }

    assert_eq!(created, 1);
    let alerts = crib
        .alerts
        .list_alerts(AlertFilter::default().for_tool(tool.id))
        .await
        .unwrap();
    assert_eq!(alerts.len(), 1);
}

/// Priority escalates with lateness: medium below the threshold, high at it.
#[tokio::test]
async fn overdue_priority_follows_policy() {
    let crib = Crib::new();
    let employee = crib.employee("Ana Ruiz").await;
    let slightly = crib.tool("Sander", "SD-1").await;
    let badly = crib.tool("Planer", "PL-1").await;
    crib.checkout(&badly, &employee, 1).await;
    crib.clock.advance(Duration::days(2));
    crib.checkout(&slightly, &employee, 1).await;
    crib.clock.advance(Duration::hours(2));

    let overdue = crib.reservations.list_overdue(crib.clock_now()).await.unwrap();
    assert_eq!(overdue[0].reservation.tool_id, badly.id);
    assert_eq!(overdue[0].days_overdue, 3);
    assert_eq!(overdue[1].days_overdue, 1);

    let batch = crib.generator.generate_all_overdue_alerts(&overdue).await;
    let priority_of = |tool: &Tool| {
        batch
            .created
            .iter()
            .find(|a| a.tool_id == tool.id)
            .and_then(|a| a.priority)
    };
    assert_eq!(priority_of(&badly), Some(AlertPriority::High));
    assert_eq!(priority_of(&slightly), Some(AlertPriority::Medium));
}

/// Overdue and condition alerts for the same tool are deduplicated separately.
#[tokio::test]
async fn condition_and_overdue_alerts_coexist() {
    let crib = Crib::new();
    let employee = crib.employee("Ana Ruiz").await;
    let mut tool = Tool::new("Welder", "WD-2", "power");
    tool.condition = Condition::Deteriorating;
    crib.store.insert_tool(tool.clone()).await.unwrap();
    crib.checkout(&tool, &employee, 1).await;
    crib.clock.advance(Duration::hours(3));

    let overdue = crib.reservations.list_overdue(crib.clock_now()).await.unwrap();
    crib.generator.generate_all_overdue_alerts(&overdue).await;
    let first = crib.generator.generate_condition_alerts().await.unwrap();
    let second = crib.generator.generate_condition_alerts().await.unwrap();

    assert_eq!(first.created.len(), 1);
    assert_eq!(first.created[0].priority, Some(AlertPriority::Medium));
    assert_eq!(second.deduplicated, 1);
    let classes: Vec<ConditionClass> = crib
        .alerts
        .list_alerts(AlertFilter::default().for_tool(tool.id))
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.condition_class)
        .collect();
    assert_eq!(classes.len(), 2);
    assert!(classes.contains(&ConditionClass::Overdue));
    assert!(classes.contains(&ConditionClass::Deteriorated));
}

/// Once the tool is back, its overdue alert is resolved and a later overdue
/// checkout raises a fresh alert.
#[tokio::test]
async fn returned_tool_alert_is_resolved_and_can_recur() {
    let crib = Crib::new();
    let employee = crib.employee("Ana Ruiz").await;
    let tool = crib.tool("Pipe bender", "PB-6").await;
    let reservation = crib.checkout(&tool, &employee, 1).await;
    crib.clock.advance(Duration::hours(2));
    let overdue = crib.reservations.list_overdue(crib.clock_now()).await.unwrap();
    let first = crib.generator.generate_overdue_alert(&overdue[0]).await.unwrap();

    crib.reservations
        .return_tool(reservation.id, Condition::Good, None)
        .await
        .unwrap();
    let resolved = crib
        .generator
        .resolve_stale_alerts(crib.clock_now())
        .await
        .unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, first.alert().id);
    assert_eq!(resolved[0].resolved_at, Some(crib.clock_now()));

    crib.checkout(&tool, &employee, 1).await;
    crib.clock.advance(Duration::hours(2));
    let overdue = crib.reservations.list_overdue(crib.clock_now()).await.unwrap();
    let again = crib.generator.generate_overdue_alert(&overdue[0]).await.unwrap();

    assert!(again.is_created());
    assert_ne!(again.alert().id, first.alert().id);
}

/// Alerts for tools still overdue stay unresolved.
#[tokio::test]
async fn resolve_stale_keeps_live_alerts() {
    let crib = Crib::new();
    let employee = crib.employee("Ana Ruiz").await;
    let tool = crib.tool("Pipe bender", "PB-6").await;
    crib.checkout(&tool, &employee, 1).await;
    crib.clock.advance(Duration::hours(2));
    let overdue = crib.reservations.list_overdue(crib.clock_now()).await.unwrap();
    crib.generator.generate_all_overdue_alerts(&overdue).await;

    let resolved = crib
        .generator
        .resolve_stale_alerts(crib.clock_now())
        .await
        .unwrap();

    assert!(resolved.is_empty());
}

/// One failing item does not stop the rest of the batch.
#[tokio::test]
async fn batch_reports_failures_and_continues() {
    let crib = Crib::new();
    let employee = crib.employee("Ana Ruiz").await;
    for i in 0..2 {
        let tool = crib.tool("Clamp", &format!("CL-{i}")).await;
        crib.checkout(&tool, &employee, 1).await;
    }
    crib.clock.advance(Duration::hours(2));
    let overdue = crib.reservations.list_overdue(crib.clock_now()).await.unwrap();
    crib.store.fail_next(FaultPoint::AlertWrite, 1);

    let batch = crib.generator.generate_all_overdue_alerts(&overdue).await;

    assert_eq!(batch.created.len(), 1);
    assert_eq!(batch.failed.len(), 1);
    assert!(batch.has_retryable_failures());
}

/// Operator actions on a single alert.
#[tokio::test]
async fn mark_read_and_delete_single_alert() {
    let crib = Crib::new();
    let employee = crib.employee("Ana Ruiz").await;
    let tool = crib.tool("Grease gun", "GG-1").await;
    crib.checkout(&tool, &employee, 1).await;
    crib.clock.advance(Duration::hours(2));
    let overdue = crib.reservations.list_overdue(crib.clock_now()).await.unwrap();
    let alert = crib
        .generator
        .generate_overdue_alert(&overdue[0])
        .await
        .unwrap()
        .alert()
        .clone();

    let read = crib.alerts.mark_alert_read(alert.id).await.unwrap();
    assert!(read.read);
    assert_eq!(crib.alerts.unread_count().await.unwrap(), 0);

    crib.alerts.delete_alert(alert.id).await.unwrap();
    assert!(matches!(
        crib.alerts.delete_alert(alert.id).await,
        Err(AlertError::NotFound { entity: "alert", .. })
    ));
    assert!(matches!(
        crib.alerts.mark_alert_read(alert.id).await,
        Err(AlertError::NotFound { entity: "alert", .. })
    ));
}

/// A sweep over the crib raises the overdue alert and later resolves it.
#[tokio::test]
async fn sweep_raises_then_resolves() {
    let crib = Crib::new();
    let employee = crib.employee("Ana Ruiz").await;
    let tool = crib.tool("Band saw", "BS-1").await;
    let reservation = crib.checkout(&tool, &employee, 1).await;
    let sweeper = Sweeper::new(
        crib.store.clone(),
        crib.generator.clone(),
        crib.clock.clone(),
        &SweepConfig {
            interval_secs: 60,
            high_priority_after_days: 3,
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        },
    );

    crib.clock.advance(Duration::hours(2));
    let report = sweeper.run_once().await.unwrap();
    assert_eq!(report.overdue, 1);
    assert_eq!(report.created, 1);

    crib.reservations
        .return_tool(reservation.id, Condition::Good, None)
        .await
        .unwrap();
    let report = sweeper.run_once().await.unwrap();
    assert_eq!(report.overdue, 0);
    assert_eq!(report.resolved, 1);
    assert_eq!(
        crib.alerts
            .list_alerts(AlertFilter::unresolved(ConditionClass::Overdue))
            .await
            .unwrap()
            .len(),
        0
    );
}
