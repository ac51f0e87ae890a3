//! Reference-counted cache of peer connections.
//!
//! Every peer authority gets its own HTTP client, and with it its own
//! connection pool. Callers hold a [`PeerLease`] while they talk to a peer;
//! when the last lease of a peer is released its client is dropped, which
//! tears its connections down instead of keeping them idle.

use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Client;

use super::ReqwestConfig;
use crate::error::Result;

/// Tracing target for peer connection management.
pub const TRACING_TARGET: &str = "conduit_reqwest::peers";

struct PeerEntry {
    client: Client,
    leases: usize,
}

type Stripe = Mutex<HashMap<String, PeerEntry>>;

struct PeerCacheInner {
    stripes: Vec<Stripe>,
    hasher: RandomState,
    config: ReqwestConfig,
}

/// Peer connections keyed by `host:port`, guarded by striped locks.
#[derive(Clone)]
pub struct PeerCache {
    inner: Arc<PeerCacheInner>,
}

/// A use of one peer connection. Dropping the lease releases it.
pub struct PeerLease {
    cache: Arc<PeerCacheInner>,
    authority: String,
    client: Client,
}

impl PeerCache {
    /// Creates an empty cache.
    pub fn new(config: ReqwestConfig) -> Self {
        let stripes = (0..config.stripes.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();

        Self {
            inner: Arc::new(PeerCacheInner {
                stripes,
                hasher: RandomState::new(),
                config,
            }),
        }
    }

    /// Acquires the connection to `authority`, connecting lazily.
    pub fn acquire(&self, authority: &str) -> Result<PeerLease> {
        let mut stripe = self.inner.stripe(authority);
        let client = match stripe.get_mut(authority) {
            Some(entry) => {
                entry.leases += 1;
                entry.client.clone()
            }
            None => {
                let client = Client::builder()
                    .connect_timeout(self.inner.config.connect_timeout())
                    .user_agent(self.inner.config.user_agent())
                    .build()?;
                stripe.insert(
                    authority.to_string(),
                    PeerEntry {
                        client: client.clone(),
                        leases: 1,
                    },
                );
                tracing::debug!(
                    target: TRACING_TARGET,
                    peer = %authority,
                    "Peer connection opened"
                );
                client
            }
        };

        Ok(PeerLease {
            cache: Arc::clone(&self.inner),
            authority: authority.to_string(),
            client,
        })
    }

    /// Returns the number of peers with at least one lease.
    pub fn len(&self) -> usize {
        self.inner.stripes.iter().map(|s| lock(s).len()).sum()
    }

    /// Returns `true` if no peer is leased.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of leases held on `authority`.
    pub fn leases(&self, authority: &str) -> usize {
        self.inner
            .stripe(authority)
            .get(authority)
            .map_or(0, |entry| entry.leases)
    }
}

impl PeerCacheInner {
    fn stripe(&self, authority: &str) -> MutexGuard<'_, HashMap<String, PeerEntry>> {
        let index = self.hasher.hash_one(authority) as usize % self.stripes.len();
        lock(&self.stripes[index])
    }

    fn release(&self, authority: &str) {
        let mut stripe = self.stripe(authority);
        let Some(entry) = stripe.get_mut(authority) else {
            tracing::error!(target: TRACING_TARGET, peer = %authority, "Released an unknown peer");
            return;
        };

        entry.leases -= 1;
        if entry.leases == 0 {
            stripe.remove(authority);
            tracing::debug!(target: TRACING_TARGET, peer = %authority, "Peer connection closed");
        }
    }
}

impl PeerLease {
    /// Returns the HTTP client bound to this peer.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Returns the peer authority.
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

impl Drop for PeerLease {
    fn drop(&mut self) {
        self.cache.release(&self.authority);
    }
}

impl std::fmt::Debug for PeerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCache")
            .field("stripes", &self.inner.stripes.len())
            .field("peers", &self.len())
            .finish()
    }
}

impl std::fmt::Debug for PeerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLease")
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
