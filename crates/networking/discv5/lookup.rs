use std::collections::HashSet;

use ethereum_types::H256;
use futures::future::join_all;
use rand::rngs::OsRng;
use tracing::{debug, trace};

use crate::{
    server::Discv5Server,
    types::{Node, NodeRecord},
    utils::{NUMBER_OF_BUCKETS, log_distance, random_node_id_at_distance},
};

/// Distances sent in a single lookup FINDNODE.
const LOOKUP_REQUEST_DISTANCES: usize = 3;

/// The distance of `target` as seen from `node_id`, followed by its neighbours
/// alternating above and below, so that nodes close to the target get returned even
/// when the exact bucket is sparse.
pub fn lookup_distances(target: &H256, node_id: &H256) -> Vec<u64> {
    let target_distance = log_distance(target, node_id) as u64;
    let mut distances = vec![target_distance];
    let mut i = 1;
    while distances.len() < LOOKUP_REQUEST_DISTANCES && i < NUMBER_OF_BUCKETS as u64 {
        if target_distance + i <= NUMBER_OF_BUCKETS as u64 {
            distances.push(target_distance + i);
        }
        if distances.len() < LOOKUP_REQUEST_DISTANCES && target_distance > i {
            distances.push(target_distance - i);
        }
        i += 1;
    }
    distances
}

/// Inserts `record` keeping `closest` ordered by xor distance to `target` and capped at `limit`.
fn insert_closest(closest: &mut Vec<NodeRecord>, record: NodeRecord, target: &H256, limit: usize) {
    let distance = record.node_id() ^ *target;
    let idx = closest.partition_point(|other| (other.node_id() ^ *target) <= distance);
    if idx < limit {
        closest.insert(idx, record);
        closest.truncate(limit);
    }
}

impl Discv5Server {
    /// Iteratively asks the closest known nodes for nodes closer to `target` until a
    /// round of queries gets no closer. Returns up to a bucket's worth of records, closest first.
    pub(crate) async fn lookup(&self, target: H256) -> Vec<NodeRecord> {
        let limit = self.routing_table.bucket_size();
        let local_id = self.local_node.node_id();

        let mut initial = self.routing_table.closest_nodes(&target);
        if initial.is_empty() {
            initial = self.routing_table.closest_known_nodes(&target, limit);
        }

        let mut seen: HashSet<H256> = HashSet::from([local_id]);
        let mut asked: HashSet<H256> = HashSet::new();
        let mut closest = Vec::with_capacity(limit);
        for record in initial {
            if seen.insert(record.node_id()) {
                insert_closest(&mut closest, record, &target, limit);
            }
        }

        loop {
            if self.cancel_token.is_cancelled() {
                debug!(target = %target, "Lookup cancelled");
                break;
            }
            let to_ask: Vec<Node> = closest
                .iter()
                .filter(|record| !asked.contains(&record.node_id()))
                .filter_map(|record| Node::from_enr(record).ok())
                .take(self.config.lookup_concurrency)
                .collect();
            if to_ask.is_empty() {
                break;
            }
            for node in &to_ask {
                asked.insert(node.node_id());
            }

            let best_before = closest.first().map(|record| record.node_id() ^ target);
            let queries = to_ask.iter().map(|node| async move {
                let distances = lookup_distances(&target, &node.node_id());
                (node, self.find_node(node, distances).await)
            });
            for (node, result) in join_all(queries).await {
                match result {
                    Ok(records) => {
                        trace!(from = %node, found = records.len(), "Lookup query answered");
                        for record in records {
                            if seen.insert(record.node_id()) {
                                insert_closest(&mut closest, record, &target, limit);
                            }
                        }
                    }
                    Err(err) => trace!(to = %node, err = %err, "Lookup query failed"),
                }
            }

            let best_after = closest.first().map(|record| record.node_id() ^ target);
            // a round that brings nothing closer ends the lookup
            if best_after == best_before {
                break;
            }
        }
        debug!(target = %target, found = closest.len(), queried = asked.len(), "Lookup finished");
        closest
    }

    /// Pings every entry that hasn't been heard from for a ping interval. Failures are
    /// accounted by the request sweeper.
    pub(crate) async fn revalidate(&self) {
        let entries = self
            .routing_table
            .entries_to_revalidate(self.config.ping_interval);
        if entries.is_empty() {
            return;
        }
        trace!(count = entries.len(), "Revalidating nodes");
        let pings = entries
            .iter()
            .filter_map(|entry| entry.node())
            .map(|node| async move {
                if let Err(err) = self.ping(&node).await {
                    trace!(to = %node, err = %err, "Revalidation ping failed");
                }
            });
        join_all(pings).await;
    }

    /// Replaces dead entries from the replacement caches, then looks up a random
    /// target to discover fresh nodes.
    pub(crate) async fn refresh(&self) {
        let removed = self.routing_table.replace_dead_entries();
        if !removed.is_empty() {
            debug!(removed = removed.len(), "Replaced dead nodes");
        }
        let distance = rand::random::<usize>() % NUMBER_OF_BUCKETS + 1;
        let target = random_node_id_at_distance(&self.local_node.node_id(), distance, &mut OsRng);
        let found = self.lookup(target).await;
        debug!(found = found.len(), table = self.routing_table.len(), "Refresh finished");
    }
}
