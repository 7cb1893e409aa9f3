//! Certificate Cache
//!
//! Concurrent per-hostname cache of forged certificates. Lookups take only a
//! read lock; concurrent forging for the same hostname is tolerated and the
//! last insert wins (the certificates are interchangeable). Entries live as
//! long as the cache.

use super::certificate_authority::ForgedCertificate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Certificate cache keyed by lowercase hostname
#[derive(Default)]
pub struct CertCache {
    entries: RwLock<HashMap<String, Arc<ForgedCertificate>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CertCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a certificate from the cache
    pub async fn get(&self, hostname: &str) -> Option<Arc<ForgedCertificate>> {
        let entries = self.entries.read().await;
        match entries.get(&cache_key(hostname)) {
            Some(cert) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(cert))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a certificate, replacing any concurrent winner
    pub async fn insert(&self, hostname: &str, cert: Arc<ForgedCertificate>) {
        self.entries.write().await.insert(cache_key(hostname), cert);
    }

    /// Get the number of certificates in the cache
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Check if the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Get the cache hit rate (hits / total requests)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Get the number of cache hits
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get the number of cache misses
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Clear the cache
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

fn cache_key(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}
