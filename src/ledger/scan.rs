//! Sentinel-indexed collection scanner.
//!
//! Some ledger collections expose `item(i)` but no length. They are
//! enumerated by probing 0, 1, 2, … until the first failing call.
//!
//! The first failure always ends the scan. A transient transport failure
//! looks the same to the caller as running off the end, so a scan can be
//! truncated; the stop reason is reported so callers can log it, but the
//! read is never retried here.

use std::future::Future;
use tracing::{debug, warn};

use super::LedgerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    /// Probe ran past the end of the collection
    Exhausted,
    /// Probe failed for another reason; items may be missing
    Interrupted(LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome<T> {
    pub items: Vec<T>,
    pub stop: ScanStop,
}

impl<T> ScanOutcome<T> {
    pub fn is_truncated(&self) -> bool {
        matches!(self.stop, ScanStop::Interrupted(_))
    }
}

/// Probe `read(0)`, `read(1)`, … and collect results until the first error.
pub async fn scan_all<T, F, Fut>(mut read: F) -> ScanOutcome<T>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut items = Vec::new();
    let mut index = 0u64;

    loop {
        match read(index).await {
            Ok(item) => {
                items.push(item);
                index += 1;
            }
            Err(e) if e.is_end_of_collection() => {
                debug!(count = items.len(), "Sentinel scan exhausted");
                return ScanOutcome {
                    items,
                    stop: ScanStop::Exhausted,
                };
            }
            Err(e) => {
                warn!(
                    index = index,
                    count = items.len(),
                    error = %e,
                    "Sentinel scan interrupted, result may be truncated"
                );
                return ScanOutcome {
                    items,
                    stop: ScanStop::Interrupted(e),
                };
            }
        }
    }
}
