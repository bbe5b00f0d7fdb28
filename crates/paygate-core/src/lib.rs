//! Core infrastructure shared by the paygate crates.
//!
//! Provides the observer-hook fan-out gateway components report their
//! lifecycle events through, and the fixed-decimal [`Amount`] type all
//! monetary values flow through.

pub mod events;
pub mod money;

pub use events::Hooks;
pub use money::{Amount, AmountError};
