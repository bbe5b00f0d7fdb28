//! Startup orphan-hold reconciliation.
//!
//! `create_session` holds funds before persisting the session. A crash in
//! that window leaves a ledger hold with a gateway-style reference and no
//! session row. This pass runs once at startup and releases every such hold.

use crate::ledger::{Ledger, LedgerError};
use crate::model::is_session_reference;
use crate::store::{GatewayStore, StoreError};
use std::sync::Arc;

/// Releases ledger holds whose gateway reference has no session row.
///
/// Only holds the ledger reports as neither settled nor released are
/// considered. A store read failure skips that hold: a hold we cannot verify
/// is left for the next startup rather than released blind.
///
/// Returns how many holds were released.
pub async fn reconcile_orphan_holds(
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn GatewayStore>,
) -> Result<usize, LedgerError> {
    let holds = ledger.open_holds().await?;
    let mut released = 0usize;

    for hold in holds {
        if !is_session_reference(&hold.reference) {
            continue;
        }

        match store.get_session(&hold.reference).await {
            Ok(_) => continue,
            Err(StoreError::NotFound) => {
                match ledger
                    .release_hold(&hold.buyer, hold.amount, &hold.reference)
                    .await
                {
                    Ok(()) => {
                        released += 1;
                        tracing::info!(
                            reference = %hold.reference,
                            buyer = %hold.buyer,
                            amount = %hold.amount,
                            "orphan hold released"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            reference = %hold.reference,
                            error = %err,
                            "orphan hold release failed"
                        );
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    reference = %hold.reference,
                    error = %err,
                    "could not verify hold against the store; leaving it"
                );
            }
        }
    }

    if released > 0 {
        tracing::info!(released, "orphan-hold reconciliation complete");
    }
    Ok(released)
}
