//! Coalescing read-through cache for user profiles.
//!
//! Dispute threads and conversation lists reference the same handful of
//! addresses many times over, usually all at once. The cache guarantees one
//! directory lookup per address for the lifetime of the cache:
//!
//! 1. A resolved entry is returned without touching the network.
//! 2. While a lookup for an address is in flight, every other caller for
//!    that address subscribes to the same result (single-flight).
//! 3. A resolved lookup is cached permanently; an address with no profile
//!    is a resolved value too.
//! 4. A failed lookup resolves to `None` for everyone waiting on it and is
//!    not cached, so a later call retries.
//!
//! The in-flight marker is removed on every exit path, including the leading
//! caller being dropped mid-lookup.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::model::{Address, ProfileInfo};

/// Where profiles come from.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Cheap existence probe.
    async fn exists(&self, address: &Address) -> Result<bool, ApiError>;

    async fn fetch(&self, address: &Address) -> Result<ProfileInfo, ApiError>;
}

enum Slot {
    Ready(Option<ProfileInfo>),
    Pending(broadcast::Sender<Option<ProfileInfo>>),
}

enum Claim {
    Leader(broadcast::Sender<Option<ProfileInfo>>),
    Follower(broadcast::Receiver<Option<ProfileInfo>>),
}

/// Removes a still-pending slot when the leading lookup ends without
/// caching a value.
struct InFlightGuard<'a> {
    slots: &'a DashMap<Address, Slot>,
    address: Address,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slots
                .remove_if(&self.address, |_, slot| matches!(slot, Slot::Pending(_)));
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileCacheStats {
    pub cached: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub coalesced: u64,
    pub lookups: u64,
}

/// Process-lifetime profile cache keyed by (lower-cased) address.
pub struct ProfileCache {
    source: Arc<dyn ProfileSource>,
    slots: DashMap<Address, Slot>,
    hits: AtomicU64,
    coalesced: AtomicU64,
    lookups: AtomicU64,
}

impl ProfileCache {
    pub fn new(source: Arc<dyn ProfileSource>) -> Self {
        Self {
            source,
            slots: DashMap::new(),
            hits: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
        }
    }

    /// Profile for `address`, or `None` if it has none or the lookup failed.
    pub async fn get(&self, address: &Address) -> Option<ProfileInfo> {
        // Check and claim under the shard lock so two callers can never both
        // become leader for the same address.
        let claim = match self.slots.entry(*address) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(profile) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return profile.clone();
                }
                Slot::Pending(sender) => Claim::Follower(sender.subscribe()),
            },
            Entry::Vacant(entry) => {
                let (sender, _) = broadcast::channel(1);
                entry.insert(Slot::Pending(sender.clone()));
                Claim::Leader(sender)
            }
        };

        match claim {
            Claim::Follower(mut receiver) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(address = %address, "Joining in-flight profile lookup");
                // A closed channel means the leader went away; treat as failed.
                receiver.recv().await.unwrap_or(None)
            }
            Claim::Leader(sender) => self.lead(*address, sender).await,
        }
    }

    /// Display name, or `fallback` when there is no usable profile.
    pub async fn display_name_or(&self, address: &Address, fallback: &str) -> String {
        match self.get(address).await {
            Some(profile) if !profile.display_name.trim().is_empty() => profile.display_name,
            _ => fallback.to_string(),
        }
    }

    /// Display name, or the truncated address label.
    pub async fn display_name(&self, address: &Address) -> String {
        self.display_name_or(address, &address.short_label()).await
    }

    pub fn stats(&self) -> ProfileCacheStats {
        let in_flight = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Pending(_)))
            .count();
        ProfileCacheStats {
            cached: self.slots.len() - in_flight,
            in_flight,
            hits: self.hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
        }
    }

    async fn lead(
        &self,
        address: Address,
        sender: broadcast::Sender<Option<ProfileInfo>>,
    ) -> Option<ProfileInfo> {
        let mut guard = InFlightGuard {
            slots: &self.slots,
            address,
            armed: true,
        };
        self.lookups.fetch_add(1, Ordering::Relaxed);

        let resolved = match self.lookup(&address).await {
            Ok(profile) => {
                // Publish before waking followers so late callers hit the cache.
                self.slots.insert(address, Slot::Ready(profile.clone()));
                guard.armed = false;
                profile
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Profile lookup failed");
                None
            }
        };
        drop(guard);

        // No receivers is fine: nobody else asked.
        let _ = sender.send(resolved.clone());
        resolved
    }

    async fn lookup(&self, address: &Address) -> Result<Option<ProfileInfo>, ApiError> {
        if !self.source.exists(address).await? {
            debug!(address = %address, "No profile registered");
            return Ok(None);
        }
        self.source.fetch(address).await.map(Some)
    }
}
