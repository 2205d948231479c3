//! Toolcrib - reservation lifecycle and alert engine for a workshop tool crib
//!
//! Employees check tools out of the crib and bring them back. This crate keeps
//! each tool's availability consistent with its reservation across concurrent
//! administrators, finds overdue returns, raises deduplicated alerts, and
//! keeps every client's alert list and unread counter live.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐   PairWrite   ┌────────────────────┐
//! │ ReservationService │─────────────▶│ ReservationLedger  │──┐
//! └────────────────────┘               └────────────────────┘  │
//!           │ condition changes                                 ▼
//!           ▼                                          ┌─────────────────┐
//! ┌────────────────────┐  insert_if_absent             │   Persistence   │
//! │   AlertGenerator   │─────────────────────────────▶│ (memory / pg)   │
//! └────────────────────┘                               └─────────────────┘
//!           ▲                                                   │ row changes
//! ┌────────────────────┐                                        ▼
//! │  Sweeper (timer)   │                              ┌─────────────────┐
//! └────────────────────┘                              │  EventChannel   │
//!                                                     └─────────────────┘
//!                                                               │
//!                                                               ▼
//!                                                 AlertFeed (FeedReducer on Store)
//! ```
//!
//! # Key pieces
//!
//! - [`reservation`]: pure planners plus [`ReservationService`]; the store's
//!   conditional writes decide checkout races
//! - [`overdue`]: pure overdue detection, days rounded up
//! - [`alerts`]: [`AlertGenerator`] (dedup on tool and condition class) and
//!   [`AlertService`]
//! - [`feed`]: [`AlertFeed`], a live `{alerts, unread_count}` view tolerant of
//!   duplicate and out-of-order delivery
//! - [`sweep`]: the periodic sweep with retry and backoff
//! - [`persistence`]: storage contracts, in-memory and `PostgreSQL` adapters

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alerts;
pub mod channel;
pub mod config;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod overdue;
pub mod persistence;
pub mod reservation;
pub mod sweep;
pub mod types;

pub use alerts::{AlertGenerator, AlertPolicy, AlertService, BatchOutcome, GenerateOutcome};
pub use config::Config;
pub use error::{AlertError, FeedError, PersistenceError, ReservationError};
pub use feed::{AlertFeed, AlertView, FeedPhase};
pub use overdue::{OverdueReservation, detect_overdue};
pub use reservation::ReservationService;
pub use sweep::{SweepReport, Sweeper};
pub use types::*;
