//! DNS hint cache
//!
//! TTL-bounded map from an observed address (or digest of one) to the
//! last DNS name seen resolving to it. Capture workers consult it when a
//! new flow is created so events can carry a hostname even when the DNS
//! exchange happened long before the flow.
//!
//! Persisted as CSV, one `key,expiry_epoch_seconds,hostname` entry per
//! line; ordering not significant.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::IpAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::debug;

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// TTL-bounded hostname hint cache
pub struct DnsHintCache {
    ttl: u64,
    entries: Mutex<HashMap<String, (u64, String)>>,
}

impl DnsHintCache {
    pub fn new(ttl: u64) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a hint with expiry = now + TTL
    pub fn insert(&self, key: &str, hostname: &str) {
        self.insert_at(key, hostname, epoch_now());
    }

    /// Insert keyed by address text
    pub fn insert_addr(&self, addr: &IpAddr, hostname: &str) {
        self.insert(&addr.to_string(), hostname);
    }

    pub fn insert_at(&self, key: &str, hostname: &str, now: u64) {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), (now + self.ttl, hostname.to_string()));
    }

    /// Return the hostname if present and not expired. Does not refresh
    /// the expiry.
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.lookup_at(key, epoch_now())
    }

    pub fn lookup_addr(&self, addr: &IpAddr) -> Option<String> {
        self.lookup(&addr.to_string())
    }

    pub fn lookup_at(&self, key: &str, now: u64) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|(expiry, _)| *expiry >= now)
            .map(|(_, hostname)| hostname.clone())
    }

    /// Remove all expired entries; returns how many were dropped.
    pub fn purge(&self) -> usize {
        self.purge_at(epoch_now())
    }

    pub fn purge_at(&self, now: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (expiry, _)| *expiry >= now);
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {} expired DNS hint cache entries", purged);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load entries saved by `save`; malformed lines are skipped.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let file = File::open(&path)
            .with_context(|| format!("Failed to open DNS hint cache: {}", path.as_ref().display()))?;
        let reader = BufReader::new(file);

        let mut entries = self.entries.lock();
        let mut loaded = 0;
        for line in reader.lines() {
            let line = line?;
            let mut fields = line.splitn(3, ',');
            let (Some(key), Some(expiry), Some(hostname)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(expiry) = expiry.parse::<u64>() else {
                continue;
            };
            entries.insert(key.to_string(), (expiry, hostname.to_string()));
            loaded += 1;
        }

        debug!("Loaded {} DNS hint cache entries", loaded);
        Ok(loaded)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let file = File::create(&path)
            .with_context(|| format!("Failed to save DNS hint cache: {}", path.as_ref().display()))?;
        let mut writer = BufWriter::new(file);

        let entries = self.entries.lock();
        for (key, (expiry, hostname)) in entries.iter() {
            writeln!(writer, "{},{},{}", key, expiry, hostname)?;
        }
        writer.flush()?;

        debug!("Saved {} DNS hint cache entries", entries.len());
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup() {
        let cache = DnsHintCache::new(1800);
        cache.insert_at("203.0.113.9", "example.test", 1000);

        assert_eq!(
            cache.lookup_at("203.0.113.9", 1500),
            Some("example.test".to_string())
        );
        assert_eq!(cache.lookup_at("203.0.113.10", 1500), None);
    }

    #[test]
    fn test_expiry() {
        let ttl = 1800;
        let cache = DnsHintCache::new(ttl);
        cache.insert_at("10.0.0.1", "internal.test", 1000);

        // Valid through t + TTL, gone after.
        assert!(cache.lookup_at("10.0.0.1", 1000 + ttl).is_some());
        assert!(cache.lookup_at("10.0.0.1", 1000 + ttl + 1).is_none());

        assert_eq!(cache.purge_at(1000 + ttl + 1), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_keeps_live_entries() {
        let cache = DnsHintCache::new(100);
        cache.insert_at("a", "old.test", 0);
        cache.insert_at("b", "new.test", 1000);

        assert_eq!(cache.purge_at(500), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup_at("b", 1000), Some("new.test".to_string()));
    }

    #[test]
    fn test_csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns-cache.csv");

        let cache = DnsHintCache::new(1800);
        cache.insert_at("192.0.2.1", "one.test", 1000);
        cache.insert_at("192.0.2.2", "two.test", 2000);
        assert_eq!(cache.save(&path).unwrap(), 2);

        let restored = DnsHintCache::new(1800);
        assert_eq!(restored.load(&path).unwrap(), 2);
        assert_eq!(restored.lookup_at("192.0.2.1", 2000), Some("one.test".to_string()));
        assert_eq!(restored.lookup_at("192.0.2.2", 3000), Some("two.test".to_string()));
    }
}
