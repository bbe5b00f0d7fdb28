//! Ledger interface.
//!
//! The ledger owns monetary correctness: holds, settlements, and releases are
//! atomic on its side. The gateway only sequences the calls and records what
//! happened. Settlement is one-phase: `settle_hold` (optionally with a
//! platform fee split) moves funds from the buyer's pending balance to the
//! seller in a single operation.

use async_trait::async_trait;
use paygate_core::Amount;
use thiserror::Error;

/// Opaque ledger failure. The gateway maps these into [`crate::MoneyError`]
/// with the appropriate fund-state.
#[derive(Debug, Error, Clone)]
#[error("ledger: {0}")]
pub struct LedgerError(pub String);

/// A hold that has neither been settled nor released.
#[derive(Debug, Clone)]
pub struct OpenHold {
    pub buyer: String,
    pub amount: Amount,
    /// The reference the hold was created under; gateway holds use the
    /// session id.
    pub reference: String,
}

/// External ledger consumed by the gateway.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Reserves `amount` from the buyer's available balance under `reference`.
    async fn hold(&self, buyer: &str, amount: Amount, reference: &str)
        -> Result<(), LedgerError>;

    /// Moves `amount` from the buyer's hold to the seller.
    ///
    /// `reference` is the request reference and embeds the session id, which
    /// identifies the hold.
    async fn settle_hold(
        &self,
        buyer: &str,
        seller: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    /// Like [`settle_hold`](Ledger::settle_hold) but routes `fee` of the
    /// amount to the platform address; the seller receives the remainder.
    async fn settle_hold_with_fee(
        &self,
        buyer: &str,
        seller: &str,
        amount: Amount,
        fee: Amount,
        platform: &str,
        reference: &str,
    ) -> Result<(), LedgerError>;

    /// Returns `amount` from the buyer's hold back to their available balance.
    async fn release_hold(
        &self,
        buyer: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), LedgerError>;

    /// Lists holds with no matching settle or release entry. Used once at
    /// startup by the orphan-hold reconciler.
    async fn open_holds(&self) -> Result<Vec<OpenHold>, LedgerError>;
}
