//! Shared fixture for the integration tests: an in-memory crib wired the way
//! the sweeper wires the Postgres one.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use chrono::Duration;
use std::sync::Arc;
use toolcrib::alerts::{AlertGenerator, AlertPolicy, AlertService};
use toolcrib::persistence::ledger::CompensatingLedger;
use toolcrib::persistence::memory::{InMemoryStore, InMemoryViolationLog};
use toolcrib::persistence::WorkshopStore;
use toolcrib::reservation::ReservationService;
use toolcrib::{Availability, Employee, Reservation, Tool, ToolId};
use toolcrib_core::channel::EventChannel;
use toolcrib_testing::{ManualClock, epoch};

pub struct Crib {
    pub store: Arc<InMemoryStore>,
    pub violations: Arc<InMemoryViolationLog>,
    pub clock: Arc<ManualClock>,
    pub generator: AlertGenerator,
    pub reservations: ReservationService,
    pub alerts: AlertService,
}

impl Crib {
    pub fn new() -> Self {
        Self::over(InMemoryStore::new())
    }

    /// Crib whose alert writes are published to `channel`
    pub fn publishing_to(channel: Arc<dyn EventChannel>) -> Self {
        Self::over(InMemoryStore::with_channel(channel))
    }

    fn over(store: InMemoryStore) -> Self {
        toolcrib_testing::init_test_tracing();
        let store = Arc::new(store);
        let violations = Arc::new(InMemoryViolationLog::new());
        let clock = Arc::new(ManualClock::new(epoch()));
        let generator = AlertGenerator::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            AlertPolicy::default(),
        );
        let reservations = ReservationService::new(
            store.clone(),
            Arc::new(CompensatingLedger::new(store.clone())),
            violations.clone(),
            clock.clone(),
        )
        .with_alerts(generator.clone());
        let alerts = AlertService::new(store.clone());

        Self {
            store,
            violations,
            clock,
            generator,
            reservations,
            alerts,
        }
    }

    pub async fn tool(&self, name: &str, serial: &str) -> Tool {
        let tool = Tool::new(name, serial, "hand tools");
        self.store.insert_tool(tool.clone()).await.unwrap();
        tool
    }

    pub async fn employee(&self, name: &str) -> Employee {
        let employee = Employee::new(name, format!("ID-{name}"));
        self.store.insert_employee(employee.clone()).await.unwrap();
        employee
    }

    /// Check `tool` out to `employee`, due `hours` after the current clock
    pub async fn checkout(&self, tool: &Tool, employee: &Employee, hours: i64) -> Reservation {
        let due_at = self.clock_now() + Duration::hours(hours);
        self.reservations
            .checkout(tool.id, employee.id, due_at)
            .await
            .unwrap()
    }

    pub async fn availability(&self, tool_id: ToolId) -> Availability {
        self.store
            .get_tool(tool_id)
            .await
            .unwrap()
            .unwrap()
            .availability
    }

    pub fn clock_now(&self) -> chrono::DateTime<chrono::Utc> {
        toolcrib_core::environment::Clock::now(self.clock.as_ref())
    }
}
