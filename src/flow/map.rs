//! Sharded flow map
//!
//! A fixed array of buckets created at startup, each an associative map
//! from primary digest to shared flow record, each guarded by its own
//! lock. Lookups on different buckets never contend; iterating a bucket
//! blocks mutation of that bucket only.
//!
//! `bucket_of(digest) = digest[0] % buckets` - no rebalancing, no resize.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::core::flow::FlowRecord;
use crate::FlowDigest;

/// One bucket's associative container
pub type FlowBucket = HashMap<FlowDigest, Arc<FlowRecord>>;

/// Sharded flow map with per-bucket locking
pub struct FlowMap {
    buckets: Vec<Mutex<FlowBucket>>,
}

impl FlowMap {
    /// Create the bucket array; the count never changes afterwards.
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1);
        let map = Self {
            buckets: (0..buckets).map(|_| Mutex::new(FlowBucket::new())).collect(),
        };

        debug!("Created {} flow map buckets", buckets);
        map
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn bucket_index(&self, digest: &FlowDigest) -> usize {
        digest[0] as usize % self.buckets.len()
    }

    /// Lock and return the bucket a digest maps to. The guard gives the
    /// caller an atomic lookup-or-insert window; dropping it releases the
    /// bucket.
    pub fn bucket_for(&self, digest: &FlowDigest) -> MutexGuard<'_, FlowBucket> {
        self.buckets[self.bucket_index(digest)].lock()
    }

    /// Lock and return a bucket by index, for whole-bucket sweeps.
    pub fn bucket(&self, index: usize) -> MutexGuard<'_, FlowBucket> {
        self.buckets[index].lock()
    }

    /// Look up a flow, locking its bucket only for the read.
    pub fn lookup(&self, digest: &FlowDigest) -> Option<Arc<FlowRecord>> {
        self.bucket_for(digest).get(digest).cloned()
    }

    /// Insert a flow; returns true iff this was a new entry.
    pub fn insert(&self, digest: FlowDigest, flow: Arc<FlowRecord>) -> bool {
        let mut bucket = self.bucket_for(&digest);
        match bucket.entry(digest) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(flow);
                true
            }
        }
    }

    pub fn delete(&self, digest: &FlowDigest) -> bool {
        self.bucket_for(digest).remove(digest).is_some()
    }

    /// Any one flow, scanning buckets in order. Test and debug helper.
    pub fn lookup_any(&self) -> Option<Arc<FlowRecord>> {
        self.buckets
            .iter()
            .find_map(|b| b.lock().values().next().cloned())
    }

    /// Total flows across all buckets. Locks each bucket briefly in turn.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.lock().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::InterfaceInfo;
    use crate::config::InterfaceRole;
    use crate::core::flow::primary_digest;
    use crate::core::packet::PacketMeta;
    use crate::testing::frames;

    fn flow_for(sport: u16) -> (FlowDigest, Arc<FlowRecord>) {
        let frame = frames::tcp(
            frames::MAC_A,
            frames::MAC_B,
            "192.168.1.100",
            sport,
            "10.0.0.1",
            80,
            frames::TcpKind::Syn,
            1,
            &[],
        );
        let pkt = PacketMeta::parse(&frame, 1).unwrap();
        let digest = primary_digest("test0", &pkt);
        let iface = Arc::new(InterfaceInfo::new("test0", InterfaceRole::Lan));
        (digest, Arc::new(FlowRecord::new(iface, &pkt, digest, 15)))
    }

    #[test]
    fn test_insert_lookup_delete() {
        let map = FlowMap::new(128);
        let (digest, flow) = flow_for(54321);

        assert!(map.insert(digest, flow.clone()));
        assert!(!map.insert(digest, flow)); // duplicate
        assert_eq!(map.len(), 1);

        let found = map.lookup(&digest).unwrap();
        assert_eq!(found.digest, digest);

        assert!(map.delete(&digest));
        assert!(!map.delete(&digest));
        assert!(map.lookup(&digest).is_none());
    }

    #[test]
    fn test_bucket_assignment_stable() {
        let map = FlowMap::new(128);
        let (digest, _) = flow_for(1000);
        assert_eq!(map.bucket_index(&digest), digest[0] as usize % 128);
        assert_eq!(map.bucket_index(&digest), map.bucket_index(&digest));
    }

    #[test]
    fn test_distinct_buckets_do_not_contend() {
        let map = FlowMap::new(128);

        // Find two flows hashing to different buckets.
        let (d1, f1) = flow_for(2000);
        let mut other = None;
        for port in 2001..3000 {
            let (d2, f2) = flow_for(port);
            if map.bucket_index(&d2) != map.bucket_index(&d1) {
                other = Some((d2, f2));
                break;
            }
        }
        let (d2, f2) = other.expect("found digest in another bucket");
        map.insert(d1, f1);
        map.insert(d2, f2);

        // Holding one bucket must not block access to the other.
        let guard = map.bucket_for(&d1);
        assert!(map.lookup(&d2).is_some());
        drop(guard);
    }

    #[test]
    fn test_bucket_sweep_sees_all() {
        let map = FlowMap::new(8);
        for port in 4000..4032 {
            let (d, f) = flow_for(port);
            map.insert(d, f);
        }

        let mut total = 0;
        for b in 0..map.num_buckets() {
            total += map.bucket(b).len();
        }
        assert_eq!(total, 32);
    }
}
