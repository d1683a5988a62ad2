//! jobmarket-sync - client-side state aggregation for a decentralized job marketplace
//!
//! Reconciles ledger state (job contracts, the dispute DAO, the reputation
//! registry) with the off-chain message store and publishes one consistent,
//! denormalised [`MarketSnapshot`](pipeline::MarketSnapshot).
//!
//! ## Layers
//!
//! - [`transport`]: bearer-token HTTP with single-flight session refresh
//! - [`api`]: typed REST client for users, dispute threads and chat
//! - [`cache`]: coalescing profile cache
//! - [`ledger`]: contract-call traits, sentinel scanner, in-memory ledger
//! - [`aggregate`]: job, dispute and conversation aggregators
//! - [`pipeline`]: staged recomputation on identity change, with generations

pub mod aggregate;
pub mod api;
pub mod batch;
pub mod cache;
pub mod config;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod transport;
pub mod types;

pub use api::{ApiError, MarketApi};
pub use batch::{BatchOutcome, ItemFailure};
pub use cache::{ProfileCache, ProfileSource};
pub use ledger::{LedgerError, LedgerProvider, MemoryLedger};
pub use model::{Address, Identity};
pub use pipeline::{IdentityInput, MarketSnapshot, Pipeline, PipelineConfig};
pub use transport::{AuthTransport, SessionEvent, TransportConfig};
pub use types::{MarketError, Result};
