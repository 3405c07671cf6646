use std::{collections::VecDeque, time::Duration};

use ethereum_types::H256;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

use crate::{
    types::{Node, NodeRecord},
    utils::{NUMBER_OF_BUCKETS, bucket_number, log_distance},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Inserted from a record, never contacted.
    Unknown,
    /// A request to the node is in flight.
    Pending,
    Live,
    Dead,
}

#[derive(Debug, Clone)]
pub struct NodeTableEntry {
    node_id: H256,
    pub record: NodeRecord,
    pub status: NodeStatus,
    /// Consecutive failures, reset when the node is seen alive.
    pub failure_counter: u32,
    /// Set once the node answered one of our requests.
    pub has_responded_ever: bool,
    pub last_seen: Instant,
}

impl NodeTableEntry {
    pub fn new(record: NodeRecord) -> Self {
        Self {
            node_id: record.node_id(),
            record,
            status: NodeStatus::Unknown,
            failure_counter: 0,
            has_responded_ever: false,
            last_seen: Instant::now(),
        }
    }

    pub fn node_id(&self) -> H256 {
        self.node_id
    }

    pub fn node(&self) -> Option<Node> {
        Node::from_enr(&self.record).ok()
    }
}

/// Live list ordered from least to most recently seen, plus a bounded replacement cache.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    entries: Vec<NodeTableEntry>,
    replacements: VecDeque<NodeTableEntry>,
}

impl KBucket {
    pub fn entries(&self) -> &[NodeTableEntry] {
        &self.entries
    }

    pub fn replacements(&self) -> impl Iterator<Item = &NodeTableEntry> {
        self.replacements.iter()
    }

    fn position(&self, node_id: &H256) -> Option<usize> {
        self.entries.iter().position(|e| e.node_id == *node_id)
    }

    fn replacement_position(&self, node_id: &H256) -> Option<usize> {
        self.replacements.iter().position(|e| e.node_id == *node_id)
    }

    fn get_mut(&mut self, node_id: &H256) -> Option<&mut NodeTableEntry> {
        if let Some(idx) = self.position(node_id) {
            return self.entries.get_mut(idx);
        }
        let idx = self.replacement_position(node_id)?;
        self.replacements.get_mut(idx)
    }

    fn get(&self, node_id: &H256) -> Option<&NodeTableEntry> {
        self.entries
            .iter()
            .chain(self.replacements.iter())
            .find(|e| e.node_id == *node_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Inserted,
    /// Already known, the record was replaced by a newer one.
    Updated,
    /// Already known with the same or a newer record.
    Unchanged,
    AddedAsReplacement,
    /// The least recently seen entry wasn't live and was evicted for the new node.
    Evicted(H256),
    /// Bucket and replacement cache full.
    Dropped,
    /// Our own record, or a record we can't reach.
    Ignored,
}

/// Kademlia table with one lock per bucket.
#[derive(Debug)]
pub struct RoutingTable {
    local_node_id: H256,
    buckets: Vec<RwLock<KBucket>>,
    bucket_size: usize,
    replacement_size: usize,
    max_allowed_failures: u32,
}

impl RoutingTable {
    pub fn new(
        local_node_id: H256,
        bucket_size: usize,
        replacement_size: usize,
        max_allowed_failures: u32,
    ) -> Self {
        Self {
            local_node_id,
            buckets: (0..NUMBER_OF_BUCKETS)
                .map(|_| RwLock::new(KBucket::default()))
                .collect(),
            bucket_size,
            replacement_size,
            max_allowed_failures,
        }
    }

    pub fn local_node_id(&self) -> H256 {
        self.local_node_id
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    fn bucket(&self, node_id: &H256) -> &RwLock<KBucket> {
        &self.buckets[bucket_number(&self.local_node_id, node_id)]
    }

    /// Snapshot of a single bucket.
    pub fn bucket_at(&self, index: usize) -> Option<KBucket> {
        self.buckets.get(index).map(|bucket| bucket.read().clone())
    }

    pub fn update_from_record(&self, record: NodeRecord) -> UpdateOutcome {
        let node_id = record.node_id();
        if node_id == self.local_node_id || record.udp_addr().is_none() {
            return UpdateOutcome::Ignored;
        }

        let mut bucket = self.bucket(&node_id).write();

        // the node id is derived from the first accepted record and never changes
        if let Some(entry) = bucket.get_mut(&node_id) {
            if record.seq > entry.record.seq {
                entry.record = record;
                return UpdateOutcome::Updated;
            }
            return UpdateOutcome::Unchanged;
        }

        if bucket.entries.len() < self.bucket_size {
            bucket.entries.push(NodeTableEntry::new(record));
            return UpdateOutcome::Inserted;
        }

        let least_recently_seen = &bucket.entries[0];
        if least_recently_seen.status == NodeStatus::Live {
            if bucket.replacements.len() >= self.replacement_size {
                trace!(node = %node_id, "Replacement cache full, dropping node");
                return UpdateOutcome::Dropped;
            }
            bucket.replacements.push_back(NodeTableEntry::new(record));
            return UpdateOutcome::AddedAsReplacement;
        }

        let evicted = bucket.entries.remove(0);
        trace!(evicted = %evicted.node_id, inserted = %node_id, status = ?evicted.status, "Evicting least recently seen node");
        bucket.entries.push(NodeTableEntry::new(record));
        UpdateOutcome::Evicted(evicted.node_id)
    }

    fn with_entry<T>(&self, node_id: &H256, f: impl FnOnce(&mut NodeTableEntry) -> T) -> Option<T> {
        let mut bucket = self.bucket(node_id).write();
        bucket.get_mut(node_id).map(f)
    }

    /// Marks the node as live and moves it to the tail of its bucket.
    pub fn mark_live(&self, node_id: &H256) -> bool {
        let mut bucket = self.bucket(node_id).write();
        if let Some(idx) = bucket.position(node_id) {
            let mut entry = bucket.entries.remove(idx);
            entry.status = NodeStatus::Live;
            entry.failure_counter = 0;
            entry.last_seen = Instant::now();
            bucket.entries.push(entry);
            return true;
        }
        match bucket.get_mut(node_id) {
            Some(entry) => {
                entry.status = NodeStatus::Live;
                entry.failure_counter = 0;
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// The node answered one of our requests.
    pub fn mark_responded(&self, node_id: &H256) -> bool {
        self.with_entry(node_id, |entry| entry.has_responded_ever = true)
            .is_some()
            && self.mark_live(node_id)
    }

    pub fn mark_pending(&self, node_id: &H256) -> bool {
        self.with_entry(node_id, |entry| entry.status = NodeStatus::Pending)
            .is_some()
    }

    pub fn mark_dead(&self, node_id: &H256) -> bool {
        self.with_entry(node_id, |entry| entry.status = NodeStatus::Dead)
            .is_some()
    }

    /// Returns the resulting status. Past `max_allowed_failures` the node is dead.
    pub fn increase_failure_counter(&self, node_id: &H256) -> Option<NodeStatus> {
        let max_allowed_failures = self.max_allowed_failures;
        self.with_entry(node_id, |entry| {
            entry.failure_counter += 1;
            if entry.failure_counter > max_allowed_failures {
                entry.status = NodeStatus::Dead;
            }
            entry.status
        })
    }

    pub fn get_entry(&self, node_id: &H256) -> Option<NodeTableEntry> {
        self.bucket(node_id).read().get(node_id).cloned()
    }

    pub fn get_record(&self, node_id: &H256) -> Option<NodeRecord> {
        self.bucket(node_id)
            .read()
            .get(node_id)
            .map(|entry| entry.record.clone())
    }

    pub fn get_node(&self, node_id: &H256) -> Option<Node> {
        self.bucket(node_id).read().get(node_id).and_then(|e| e.node())
    }

    fn collect_sorted(
        &self,
        target: &H256,
        filter: impl Fn(&NodeTableEntry) -> bool,
    ) -> Vec<NodeRecord> {
        let mut nodes: Vec<(H256, NodeRecord)> = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read();
            nodes.extend(
                bucket
                    .entries
                    .iter()
                    .filter(|entry| filter(entry))
                    .map(|entry| (entry.node_id ^ *target, entry.record.clone())),
            );
        }
        nodes.sort_by(|(a, _), (b, _)| a.cmp(b));
        nodes.into_iter().map(|(_, record)| record).collect()
    }

    /// Every node that ever answered us, closest to `target` first. All buckets are scanned.
    pub fn closest_nodes(&self, target: &H256) -> Vec<NodeRecord> {
        self.collect_sorted(target, |entry| entry.has_responded_ever)
    }

    /// Up to `limit` nodes that aren't dead, closest to `target` first.
    pub fn closest_known_nodes(&self, target: &H256, limit: usize) -> Vec<NodeRecord> {
        let mut nodes = self.collect_sorted(target, |entry| entry.status != NodeStatus::Dead);
        nodes.truncate(limit);
        nodes
    }

    /// Records to answer a FINDNODE with. Distance 0 is our own record.
    pub fn records_at_distances(
        &self,
        distances: &[u64],
        local_record: &NodeRecord,
        limit: usize,
    ) -> Vec<NodeRecord> {
        let mut records = Vec::new();
        let mut seen = Vec::with_capacity(distances.len());
        for &distance in distances {
            if records.len() >= limit {
                break;
            }
            if distance > NUMBER_OF_BUCKETS as u64 || seen.contains(&distance) {
                continue;
            }
            seen.push(distance);

            if distance == 0 {
                records.push(local_record.clone());
                continue;
            }
            // bucket i holds exactly the nodes at log distance i + 1
            let bucket = self.buckets[distance as usize - 1].read();
            records.extend(
                bucket
                    .entries
                    .iter()
                    .filter(|entry| {
                        entry.status == NodeStatus::Live
                            && log_distance(&self.local_node_id, &entry.node_id) as u64 == distance
                    })
                    .map(|entry| entry.record.clone())
                    .take(limit - records.len()),
            );
        }
        records
    }

    /// Entries not seen for `interval` that are still worth pinging.
    pub fn entries_to_revalidate(&self, interval: Duration) -> Vec<NodeTableEntry> {
        let now = Instant::now();
        let mut entries = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read();
            entries.extend(
                bucket
                    .entries
                    .iter()
                    .filter(|entry| {
                        !matches!(entry.status, NodeStatus::Dead | NodeStatus::Pending)
                            && now.duration_since(entry.last_seen) >= interval
                    })
                    .cloned(),
            );
        }
        entries
    }

    /// Drops dead entries, promoting the newest replacement of their bucket in their place.
    /// Returns the removed ids.
    pub fn replace_dead_entries(&self) -> Vec<H256> {
        let mut removed = Vec::new();
        for bucket in &self.buckets {
            let mut bucket = bucket.write();
            while let Some(idx) = bucket
                .entries
                .iter()
                .position(|e| e.status == NodeStatus::Dead)
            {
                let dead = bucket.entries.remove(idx);
                removed.push(dead.node_id);
                if let Some(replacement) = bucket.replacements.pop_back() {
                    trace!(removed = %dead.node_id, promoted = %replacement.node_id, "Replacing dead node");
                    bucket.entries.push(replacement);
                }
            }
        }
        removed
    }

    /// Number of entries in the live lists.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::NodeRecordPairs,
        utils::{node_id, public_key_from_signing_key},
    };
    use secp256k1::SecretKey;
    use std::{collections::HashSet, net::Ipv4Addr};

    fn random_record(seq: u64) -> (NodeRecord, SecretKey) {
        let signer = SecretKey::new(&mut rand::thread_rng());
        let record = NodeRecord::new(
            seq,
            NodeRecordPairs {
                ip: Some(Ipv4Addr::LOCALHOST),
                udp_port: Some(30303),
                ..Default::default()
            },
            &signer,
        )
        .unwrap();
        (record, signer)
    }

    fn get_test_table(bucket_size: usize, replacement_size: usize) -> RoutingTable {
        let signer = SecretKey::new(&mut rand::thread_rng());
        RoutingTable::new(
            node_id(&public_key_from_signing_key(&signer)),
            bucket_size,
            replacement_size,
            3,
        )
    }

    /// Generates records until `count` of them land in the same bucket.
    fn records_in_same_bucket(table: &RoutingTable, count: usize) -> Vec<NodeRecord> {
        // half of all ids fall into bucket 255
        let mut records = Vec::new();
        while records.len() < count {
            let (record, _) = random_record(1);
            if bucket_number(&table.local_node_id, &record.node_id()) == 255 {
                records.push(record);
            }
        }
        records
    }

    #[test]
    fn inserts_until_bucket_is_full_then_uses_replacements() {
        let table = get_test_table(2, 1);
        let records = records_in_same_bucket(&table, 5);

        assert_eq!(table.update_from_record(records[0].clone()), UpdateOutcome::Inserted);
        assert_eq!(table.update_from_record(records[1].clone()), UpdateOutcome::Inserted);
        table.mark_live(&records[0].node_id());
        table.mark_live(&records[1].node_id());

        // the least recently seen node is live, so newcomers wait in the replacement cache
        assert_eq!(
            table.update_from_record(records[2].clone()),
            UpdateOutcome::AddedAsReplacement
        );
        assert_eq!(table.update_from_record(records[3].clone()), UpdateOutcome::Dropped);

        let bucket = table.bucket_at(255).unwrap();
        assert_eq!(bucket.entries().len(), 2);
        assert_eq!(bucket.replacements().count(), 1);
    }

    #[test]
    fn non_live_least_recently_seen_is_evicted() {
        let table = get_test_table(2, 2);
        let records = records_in_same_bucket(&table, 3);
        table.update_from_record(records[0].clone());
        table.update_from_record(records[1].clone());
        table.mark_live(&records[1].node_id());

        // records[0] was never seen alive
        assert_eq!(
            table.update_from_record(records[2].clone()),
            UpdateOutcome::Evicted(records[0].node_id())
        );
        assert!(table.get_entry(&records[0].node_id()).is_none());
        assert!(table.get_entry(&records[2].node_id()).is_some());
    }

    #[test]
    fn bucket_invariants_hold_after_many_updates() {
        let table = get_test_table(4, 3);
        let records = records_in_same_bucket(&table, 20);
        for (i, record) in records.iter().enumerate() {
            table.update_from_record(record.clone());
            if i % 2 == 0 {
                table.mark_live(&record.node_id());
            }
            // updates of known nodes must not duplicate them
            table.update_from_record(record.clone());
        }

        let bucket = table.bucket_at(255).unwrap();
        assert!(bucket.entries().len() <= 4);
        assert!(bucket.replacements().count() <= 3);
        let live: HashSet<H256> = bucket.entries().iter().map(|e| e.node_id()).collect();
        assert_eq!(live.len(), bucket.entries().len());
        assert!(bucket.replacements().all(|r| !live.contains(&r.node_id())));
    }

    #[test]
    fn newer_record_replaces_content_but_not_id() {
        let table = get_test_table(16, 16);
        let (record, signer) = random_record(1);
        table.update_from_record(record.clone());

        let newer = record
            .update(
                NodeRecordPairs {
                    ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
                    udp_port: Some(9000),
                    ..Default::default()
                },
                &signer,
            )
            .unwrap();
        assert_eq!(table.update_from_record(newer.clone()), UpdateOutcome::Updated);
        assert_eq!(table.update_from_record(record.clone()), UpdateOutcome::Unchanged);

        let entry = table.get_entry(&record.node_id()).unwrap();
        assert_eq!(entry.node_id(), record.node_id());
        assert_eq!(entry.record.seq, 2);
        assert_eq!(entry.node().unwrap().udp_port, 9000);
    }

    #[test]
    fn own_record_is_never_stored() {
        let signer = SecretKey::new(&mut rand::thread_rng());
        let local_id = node_id(&public_key_from_signing_key(&signer));
        let table = RoutingTable::new(local_id, 16, 16, 3);
        let own = NodeRecord::new(
            1,
            NodeRecordPairs {
                ip: Some(Ipv4Addr::LOCALHOST),
                udp_port: Some(1),
                ..Default::default()
            },
            &signer,
        )
        .unwrap();
        assert_eq!(table.update_from_record(own), UpdateOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn failures_escalate_to_dead() {
        let table = get_test_table(16, 16);
        let (record, _) = random_record(1);
        let id = record.node_id();
        table.update_from_record(record);
        table.mark_live(&id);

        assert_eq!(table.increase_failure_counter(&id), Some(NodeStatus::Live));
        assert_eq!(table.increase_failure_counter(&id), Some(NodeStatus::Live));
        assert_eq!(table.increase_failure_counter(&id), Some(NodeStatus::Live));
        assert_eq!(table.increase_failure_counter(&id), Some(NodeStatus::Dead));
        assert_eq!(table.get_entry(&id).unwrap().failure_counter, 4);

        // coming back resets the counter
        table.mark_live(&id);
        assert_eq!(table.get_entry(&id).unwrap().failure_counter, 0);
        assert_eq!(table.increase_failure_counter(&H256::zero()), None);
    }

    #[test]
    fn closest_nodes_only_returns_responders_sorted_by_distance() {
        let table = get_test_table(16, 16);
        let mut ids = Vec::new();
        for _ in 0..30 {
            let (record, _) = random_record(1);
            ids.push(record.node_id());
            table.update_from_record(record);
        }
        for id in ids.iter().step_by(2) {
            table.mark_responded(id);
        }

        let target = H256(rand::random());
        let closest = table.closest_nodes(&target);
        assert!(closest.iter().all(|r| table.get_entry(&r.node_id()).unwrap().has_responded_ever));
        assert!(
            closest
                .windows(2)
                .all(|w| (w[0].node_id() ^ target) <= (w[1].node_id() ^ target))
        );
        assert_eq!(closest, table.closest_nodes(&target));
    }

    #[test]
    fn records_at_distances_returns_live_nodes_and_self() {
        let signer = SecretKey::new(&mut rand::thread_rng());
        let local_id = node_id(&public_key_from_signing_key(&signer));
        let table = RoutingTable::new(local_id, 16, 16, 3);
        let local_record = NodeRecord::new(
            1,
            NodeRecordPairs {
                ip: Some(Ipv4Addr::LOCALHOST),
                udp_port: Some(1),
                ..Default::default()
            },
            &signer,
        )
        .unwrap();

        let mut live_at_256 = 0;
        for i in 0..10 {
            let (record, _) = random_record(1);
            let id = record.node_id();
            table.update_from_record(record);
            if i % 2 == 0 {
                table.mark_live(&id);
                if log_distance(&local_id, &id) == 256 {
                    live_at_256 += 1;
                }
            }
        }

        let own = table.records_at_distances(&[0], &local_record, 16);
        assert_eq!(own, vec![local_record.clone()]);

        let at_256 = table.records_at_distances(&[256, 256], &local_record, 16);
        assert_eq!(at_256.len(), live_at_256);
        assert!(
            at_256
                .iter()
                .all(|r| log_distance(&local_id, &r.node_id()) == 256)
        );

        let capped = table.records_at_distances(&[0, 256, 255], &local_record, 1);
        assert_eq!(capped.len(), 1);
        assert!(table.records_at_distances(&[300], &local_record, 16).is_empty());
    }

    #[test]
    fn dead_entries_are_swapped_for_replacements() {
        let table = get_test_table(1, 2);
        let records = records_in_same_bucket(&table, 2);
        table.update_from_record(records[0].clone());
        table.mark_live(&records[0].node_id());
        assert_eq!(
            table.update_from_record(records[1].clone()),
            UpdateOutcome::AddedAsReplacement
        );

        table.mark_dead(&records[0].node_id());
        assert_eq!(table.replace_dead_entries(), vec![records[0].node_id()]);

        let bucket = table.bucket_at(255).unwrap();
        assert_eq!(bucket.entries().len(), 1);
        assert_eq!(bucket.entries()[0].node_id(), records[1].node_id());
        assert_eq!(bucket.replacements().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn revalidation_picks_stale_entries() {
        let table = get_test_table(16, 16);
        let (stale, _) = random_record(1);
        let (dead, _) = random_record(1);
        table.update_from_record(stale.clone());
        table.update_from_record(dead.clone());
        table.mark_dead(&dead.node_id());

        tokio::time::advance(Duration::from_secs(31)).await;
        let (fresh, _) = random_record(1);
        table.update_from_record(fresh.clone());
        table.mark_live(&fresh.node_id());

        let to_ping: Vec<H256> = table
            .entries_to_revalidate(Duration::from_secs(30))
            .iter()
            .map(|e| e.node_id())
            .collect();
        assert_eq!(to_ping, vec![stale.node_id()]);
    }
}
