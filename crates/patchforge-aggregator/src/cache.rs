//! In-process enrichment cache.
//!
//! Keyed by CVE id with a TTL (24h default, matching the daily EPSS
//! publication cadence). Concurrent-read, exclusive-write.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::enrich::Enrichment;

struct CacheEntry {
    enrichment: Enrichment,
    inserted_at: Instant,
}

/// TTL cache of enrichment data per CVE id.
pub struct EnrichmentCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl EnrichmentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up unexpired enrichment data for a CVE.
    pub fn get(&self, cve_id: &str) -> Option<Enrichment> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let entry = entries.get(cve_id)?;
        if entry.inserted_at.elapsed() < self.ttl {
            debug!("enrichment cache hit for {}", cve_id);
            Some(entry.enrichment.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, cve_id: &str, enrichment: Enrichment) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(
            cve_id.to_string(),
            CacheEntry {
                enrichment,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_hit() {
        let cache = EnrichmentCache::new(Duration::from_secs(60));
        cache.insert("CVE-2024-0001", Enrichment::default());
        assert!(cache.get("CVE-2024-0001").is_some());
        assert!(cache.get("CVE-2024-0002").is_none());
    }

    #[test]
    fn test_expired_entries_miss() {
        let cache = EnrichmentCache::new(Duration::from_millis(0));
        cache.insert("CVE-2024-0001", Enrichment::default());
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("CVE-2024-0001").is_none());
    }

    #[test]
    fn test_evict_expired() {
        let cache = EnrichmentCache::new(Duration::from_millis(0));
        cache.insert("CVE-2024-0001", Enrichment::default());
        cache.insert("CVE-2024-0002", Enrichment::default());
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.evict_expired(), 2);
        assert!(cache.is_empty());
    }
}
