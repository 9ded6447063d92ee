//! Routing table: an ordered, non-overlapping set of k-buckets spanning the
//! full 160-bit id space, owned by one local node id.

use crate::kbucket::{AddOutcome, KBucket, NodeInfo};
use crate::node_id::{NodeId, KEY_BITS};
use parking_lot::RwLock;

pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: RwLock<Vec<KBucket>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddResult {
    Added,
    Updated,
    Dropped,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: RwLock::new(vec![KBucket::new(0, KEY_BITS - 1, k)]),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    fn bucket_index_for(buckets: &[KBucket], distance_bit: usize) -> usize {
        buckets
            .iter()
            .position(|b| b.covers(distance_bit))
            .expect("bucket ranges always partition the full id space")
    }

    pub fn add(&self, node: NodeInfo) -> AddResult {
        if node.node_id == self.self_id {
            return AddResult::Dropped;
        }
        let distance_bit = self.self_id.distance(&node.node_id).bucket_index();
        let mut buckets = self.buckets.write();
        loop {
            let idx = Self::bucket_index_for(&buckets, distance_bit);
            match buckets[idx].add(node.clone()) {
                AddOutcome::Added => return AddResult::Added,
                AddOutcome::Updated => return AddResult::Updated,
                AddOutcome::Full => {
                    // Split only the bucket currently covering our own id's
                    // position, per the standard Kademlia rule. Our distance
                    // to ourselves is 0, so that bucket is the one whose
                    // range starts at bit 0.
                    let owns_self = buckets[idx].min_distance_bit == 0;
                    if owns_self && buckets[idx].max_distance_bit > buckets[idx].min_distance_bit
                    {
                        let bucket = buckets.remove(idx);
                        let (left, right) = bucket.split(&self.self_id);
                        buckets.insert(idx, right);
                        buckets.insert(idx, left);
                        continue;
                    }
                    return AddResult::Dropped;
                }
            }
        }
    }

    pub fn remove(&self, id: &NodeId) -> bool {
        let distance_bit = self.self_id.distance(id).bucket_index();
        let mut buckets = self.buckets.write();
        let idx = Self::bucket_index_for(&buckets, distance_bit);
        buckets[idx].remove(id)
    }

    pub fn record_failure(&self, id: &NodeId, threshold: u32) -> bool {
        let distance_bit = self.self_id.distance(id).bucket_index();
        let mut buckets = self.buckets.write();
        let idx = Self::bucket_index_for(&buckets, distance_bit);
        buckets[idx].record_failure(id, threshold)
    }

    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<NodeInfo> {
        let buckets = self.buckets.read();
        let mut all: Vec<NodeInfo> = buckets.iter().flat_map(|b| b.nodes().to_vec()).collect();
        all.sort_by(|a, b| {
            target
                .distance(&a.node_id)
                .cmp(&target.distance(&b.node_id))
                .then_with(|| a.node_id.to_hex().cmp(&b.node_id.to_hex()))
        });
        all.truncate(count);
        all
    }

    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        self.buckets
            .read()
            .iter()
            .flat_map(|b| b.nodes().to_vec())
            .collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Bucket ranges (as `(min_bit, max_bit, stale)`) whose `last_updated`
    /// is older than `refresh_interval_secs` ago, for the background
    /// refresh task to pick a random id inside and run a lookup.
    pub fn stale_buckets(&self, refresh_interval_secs: u64) -> Vec<(usize, usize)> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.buckets
            .read()
            .iter()
            .filter(|b| now.saturating_sub(b.last_updated) >= refresh_interval_secs)
            .map(|b| (b.min_distance_bit, b.max_distance_bit))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kbucket::NodeInfo;

    fn node() -> NodeInfo {
        NodeInfo::new(NodeId::random(), "127.0.0.1", 9000)
    }

    #[test]
    fn adding_self_is_a_no_op() {
        let id = NodeId::random();
        let table = RoutingTable::new(id, 20);
        let mut me = NodeInfo::new(id, "127.0.0.1", 1);
        me.node_id = id;
        assert_eq!(table.add(me), AddResult::Dropped);
        assert_eq!(table.all_nodes().len(), 0);
    }

    #[test]
    fn splits_when_own_bucket_overflows() {
        let id = NodeId::random();
        let table = RoutingTable::new(id, 2);
        for _ in 0..20 {
            table.add(node());
        }
        // With k=2 and 20 random inserts, the bucket covering our own id
        // must have split at least once.
        assert!(table.bucket_count() >= 1);
    }

    #[test]
    fn find_closest_orders_by_xor_distance() {
        let id = NodeId::random();
        let table = RoutingTable::new(id, 20);
        for _ in 0..10 {
            table.add(node());
        }
        let closest = table.find_closest(&id, 5);
        assert!(closest.len() <= 5);
        for w in closest.windows(2) {
            assert!(id.distance(&w[0].node_id) <= id.distance(&w[1].node_id));
        }
    }

    #[test]
    fn bucket_ranges_always_partition_the_space() {
        let id = NodeId::random();
        let table = RoutingTable::new(id, 2);
        for _ in 0..50 {
            table.add(node());
        }
        let buckets = table.buckets.read();
        let mut sorted: Vec<_> = buckets.iter().collect();
        sorted.sort_by_key(|b| b.min_distance_bit);
        assert_eq!(sorted.first().unwrap().min_distance_bit, 0);
        assert_eq!(sorted.last().unwrap().max_distance_bit, KEY_BITS - 1);
        for w in sorted.windows(2) {
            assert_eq!(w[0].max_distance_bit + 1, w[1].min_distance_bit);
        }
    }
}
