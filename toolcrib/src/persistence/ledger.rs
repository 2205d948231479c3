//! Pair writes without transactions.
//!
//! [`CompensatingLedger`] commits a [`PairWrite`] as two ordered conditional
//! single-row writes. The first write is the one that can lose a race; if it
//! is rejected nothing has changed. If the second write fails the first is
//! undone. If the undo fails too, the pair is left disagreeing and the commit
//! reports [`ReservationError::ConsistencyViolation`].

use super::{PairWrite, ReservationLedger, Result, RowWrites, StoreFuture, disagreement};
use crate::error::{PersistenceError, ReservationError};
use crate::types::{Availability, Reservation};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// What a rejected second write means
#[derive(Clone, Copy, Debug)]
enum SecondWrite {
    /// The partner row raced with another writer
    MayRace,
    /// The partner row should have been in the expected state; a mismatch is
    /// a disagreement between tool and reservation
    MustAgree,
}

/// [`ReservationLedger`] over a store that only offers [`RowWrites`]
#[derive(Debug)]
pub struct CompensatingLedger<S> {
    store: Arc<S>,
}

impl<S> Clone for CompensatingLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: RowWrites> CompensatingLedger<S> {
    /// Ledger writing through `store`
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn apply(&self, write: PairWrite) -> std::result::Result<(), ReservationError> {
        let operation = write.operation();
        let store = &self.store;
        match write {
            PairWrite::Checkout {
                reservation,
                condition,
            } => {
                let tool_id = reservation.tool_id;
                store
                    .update_tool_if(tool_id, Availability::Available, Availability::Reserved, condition)
                    .await?;
                let second = store.insert_reservation(reservation.clone()).await;
                finish(operation, &reservation, SecondWrite::MustAgree, second, || {
                    store.update_tool_if(
                        tool_id,
                        Availability::Reserved,
                        Availability::Available,
                        condition,
                    )
                })
                .await
            }

            PairWrite::Release {
                previous,
                reservation,
                condition,
            } => {
                store
                    .replace_reservation_if(reservation.clone(), previous.clone())
                    .await?;
                let second = store
                    .update_tool_if(
                        reservation.tool_id,
                        Availability::Reserved,
                        Availability::Available,
                        condition,
                    )
                    .await;
                finish(operation, &reservation, SecondWrite::MustAgree, second, || {
                    store.replace_reservation_if(previous.clone(), reservation.clone())
                })
                .await
            }

            PairWrite::Reopen {
                previous,
                reservation,
                condition,
            } => {
                let tool_id = reservation.tool_id;
                store
                    .update_tool_if(tool_id, Availability::Available, Availability::Reserved, condition)
                    .await?;
                let second = store
                    .replace_reservation_if(reservation.clone(), previous)
                    .await;
                finish(operation, &reservation, SecondWrite::MayRace, second, || {
                    store.update_tool_if(
                        tool_id,
                        Availability::Reserved,
                        Availability::Available,
                        condition,
                    )
                })
                .await
            }

            PairWrite::Cancel {
                reservation,
                condition,
            } => {
                store
                    .delete_reservation_if(reservation.id, reservation.status)
                    .await?;
                if !reservation.is_open() {
                    return Ok(());
                }
                let second = store
                    .update_tool_if(
                        reservation.tool_id,
                        Availability::Reserved,
                        Availability::Available,
                        condition,
                    )
                    .await;
                finish(operation, &reservation, SecondWrite::MustAgree, second, || {
                    store.insert_reservation(reservation.clone())
                })
                .await
            }

            PairWrite::Amend {
                previous,
                reservation,
            } => {
                store.replace_reservation_if(reservation, previous).await?;
                Ok(())
            }
        }
    }
}

impl<S: RowWrites + 'static> ReservationLedger for CompensatingLedger<S> {
    fn commit(&self, write: PairWrite) -> StoreFuture<'_, std::result::Result<(), ReservationError>> {
        self.apply(write).boxed()
    }
}

/// Settle the outcome of the second write, undoing the first if it failed.
async fn finish<T, U, F, Fut>(
    operation: &'static str,
    reservation: &Reservation,
    kind: SecondWrite,
    second: Result<T>,
    undo: F,
) -> std::result::Result<(), ReservationError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<U>>,
{
    let Err(err) = second else {
        return Ok(());
    };

    metrics::counter!("toolcrib.ledger.compensations", "operation" => operation).increment(1);

    if let Err(undo_err) = undo().await {
        return Err(disagreement(
            operation,
            reservation,
            format_args!("write failed ({err}) and could not be undone ({undo_err})"),
        ));
    }

    match (kind, err) {
        (
            SecondWrite::MustAgree,
            err @ (PersistenceError::Conflict { .. } | PersistenceError::NotFound { .. }),
        ) => Err(disagreement(
            operation,
            reservation,
            format_args!("{err}; first write rolled back"),
        )),
        (_, err) => {
            tracing::warn!(
                operation,
                reservation_id = %reservation.id,
                error = %err,
                "Second write failed; first write rolled back"
            );
            Err(err.into())
        }
    }
}
