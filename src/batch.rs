//! Best-effort fan-out results.
//!
//! A stage that reads N items concurrently keeps going when some of them
//! fail: the successful items form the published value and the failures are
//! kept alongside for diagnostics instead of aborting the batch.

use serde::Serialize;
use std::fmt::Display;
use tracing::warn;

/// One dropped item of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub stage: String,
    pub item: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome<T> {
    pub items: Vec<T>,
    pub failures: Vec<ItemFailure>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    /// Collect per-item results, keeping input order for the successes.
    pub fn collect<K, E>(stage: &str, results: impl IntoIterator<Item = (K, Result<T, E>)>) -> Self
    where
        K: Display,
        E: Display,
    {
        Self::collect_filtered(
            stage,
            results
                .into_iter()
                .map(|(key, result)| (key, result.map(Some))),
        )
    }

    /// Like [`collect`](Self::collect), but `Ok(None)` items are skipped
    /// without being counted as failures.
    pub fn collect_filtered<K, E>(
        stage: &str,
        results: impl IntoIterator<Item = (K, Result<Option<T>, E>)>,
    ) -> Self
    where
        K: Display,
        E: Display,
    {
        let mut outcome = Self::default();
        for (key, result) in results {
            match result {
                Ok(Some(item)) => outcome.items.push(item),
                Ok(None) => {}
                Err(e) => {
                    warn!(stage = stage, item = %key, error = %e, "Dropping item from batch");
                    outcome.failures.push(ItemFailure {
                        stage: stage.to_string(),
                        item: key.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        outcome
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}
