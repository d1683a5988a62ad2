//! Crate-wide error type
//!
//! Boundary errors (`LedgerError`, `ApiError`) live next to the code that
//! produces them; `MarketError` is what pipeline mutators and the binary see.

use thiserror::Error;

use crate::api::ApiError;
use crate::ledger::LedgerError;
use crate::model::AddressError;

#[derive(Debug, Error)]
pub enum MarketError {
    /// Ledger contract call failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// REST backend call failed
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Malformed address at an input boundary
    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    /// Operation needs a connected wallet
    #[error("No wallet connected")]
    NotConnected,

    /// No ledger provider is available (neither wallet nor read-only)
    #[error("No ledger provider available")]
    NoProvider,

    /// Unknown dispute id in the current snapshot
    #[error("Dispute not found: {0}")]
    DisputeNotFound(u64),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MarketError>;
