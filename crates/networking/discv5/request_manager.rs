use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use ethereum_types::H256;
use rustc_hash::FxBuildHasher;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, trace};

use crate::{
    messages::{Message, RequestId},
    routing_table::RoutingTable,
    types::Node,
};

/// Receives every reply packet of a request once it completes.
pub type ResponseSender = oneshot::Sender<Vec<Message>>;

/// An outbound request. The same shape is used while it waits for a handshake (cached)
/// and once it has been sent (pending).
#[derive(Debug)]
pub struct PendingRequest {
    pub node: Node,
    pub message: Message,
    started_at: Instant,
    pub is_fulfilled: bool,
    pub responses_count: u64,
    /// Learned from the `total` of the first NODES reply, 1 for everything else.
    pub max_responses: u64,
    responses: Vec<Message>,
    responder: Option<ResponseSender>,
}

pub type CachedRequest = PendingRequest;

impl PendingRequest {
    pub fn new(node: Node, message: Message, responder: Option<ResponseSender>) -> Self {
        Self {
            node,
            message,
            started_at: Instant::now(),
            is_fulfilled: false,
            responses_count: 0,
            max_responses: 1,
            responses: Vec::new(),
            responder,
        }
    }

    pub fn req_id(&self) -> &RequestId {
        self.message.req_id()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_complete(&self) -> bool {
        self.is_fulfilled && self.responses_count >= self.max_responses
    }

    fn accepts(&self, response: &Message) -> bool {
        matches!(
            (&self.message, response),
            (Message::Ping(_), Message::Pong(_))
                | (Message::FindNode(_), Message::Nodes(_))
                | (Message::TalkReq(_), Message::TalkRes(_))
        )
    }

    /// Hands whatever was collected to the waiting caller, if any.
    fn respond(&mut self) {
        if let Some(responder) = self.responder.take() {
            // the caller may have given up already
            let _ = responder.send(std::mem::take(&mut self.responses));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillOutcome {
    /// No request with that id.
    Unknown,
    /// The reply didn't come from the node the request was sent to.
    UnexpectedSender,
    /// The reply type doesn't answer the request.
    UnexpectedResponse,
    /// More NODES packets are expected.
    Partial,
    Complete,
    /// More replies than announced.
    Exceeded,
}

/// Tracks in-flight and pre-handshake requests and feeds timeouts back to the routing table.
#[derive(Debug)]
pub struct RequestManager {
    routing_table: Arc<RoutingTable>,
    pending: DashMap<RequestId, PendingRequest, FxBuildHasher>,
    cached: DashMap<RequestId, CachedRequest, FxBuildHasher>,
    request_timeout: Duration,
}

impl RequestManager {
    pub fn new(routing_table: Arc<RoutingTable>, request_timeout: Duration) -> Self {
        Self {
            routing_table,
            pending: DashMap::with_hasher(FxBuildHasher),
            cached: DashMap::with_hasher(FxBuildHasher),
            request_timeout,
        }
    }

    /// Returns false, leaving the tracked request untouched, if the id is already pending.
    pub fn add_pending_request(&self, request: PendingRequest) -> bool {
        let node_id = request.node.node_id();
        match self.pending.entry(request.req_id().clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(entry) => {
                entry.insert(request);
            }
        }
        self.routing_table.mark_pending(&node_id);
        true
    }

    /// Keeps a request until a handshake with its node completes.
    pub fn add_cached_request(&self, request: CachedRequest) -> bool {
        match self.cached.entry(request.req_id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(request);
                true
            }
        }
    }

    pub fn has_pending_request(&self, req_id: &RequestId) -> bool {
        self.pending.contains_key(req_id)
    }

    /// Distances asked for by the pending FINDNODE with this id.
    pub fn requested_distances(&self, req_id: &RequestId) -> Option<Vec<u64>> {
        match &self.pending.get(req_id)?.message {
            Message::FindNode(find_node) => Some(find_node.distances.clone()),
            _ => None,
        }
    }

    pub fn has_pending_requests_for(&self, node_id: &H256) -> bool {
        self.pending
            .iter()
            .any(|request| request.node.node_id() == *node_id)
    }

    pub fn has_cached_requests_for(&self, node_id: &H256) -> bool {
        self.cached
            .iter()
            .any(|request| request.node.node_id() == *node_id)
    }

    /// Removes every cached request for `node_id`, oldest first.
    pub fn take_cached_requests_for(&self, node_id: &H256) -> Vec<CachedRequest> {
        let req_ids: Vec<RequestId> = self
            .cached
            .iter()
            .filter(|request| request.node.node_id() == *node_id)
            .map(|request| request.key().clone())
            .collect();
        let mut requests: Vec<CachedRequest> = req_ids
            .iter()
            .filter_map(|req_id| self.cached.remove(req_id).map(|(_, request)| request))
            .collect();
        requests.sort_by_key(|request| request.started_at);
        requests
    }

    /// Removes the oldest cached request for `node_id`, leaving the others cached.
    pub fn take_oldest_cached_request_for(&self, node_id: &H256) -> Option<CachedRequest> {
        let req_id = self
            .cached
            .iter()
            .filter(|request| request.node.node_id() == *node_id)
            .min_by_key(|request| request.started_at)
            .map(|request| request.key().clone())?;
        self.cached.remove(&req_id).map(|(_, request)| request)
    }

    /// Moves a cached request into the pending set, restarting its timer.
    pub fn promote(&self, mut request: CachedRequest) -> bool {
        request.started_at = Instant::now();
        self.add_pending_request(request)
    }

    /// Accounts a reply from `from`. Replies are kept until the request is complete and
    /// are then handed to the caller waiting on it.
    pub fn mark_request_as_fulfilled(
        &self,
        req_id: &RequestId,
        from: &H256,
        response: Message,
    ) -> FulfillOutcome {
        let Some(mut request) = self.pending.get_mut(req_id) else {
            return FulfillOutcome::Unknown;
        };
        if request.node.node_id() != *from {
            return FulfillOutcome::UnexpectedSender;
        }
        if !request.accepts(&response) {
            return FulfillOutcome::UnexpectedResponse;
        }
        if request.is_complete() {
            return FulfillOutcome::Exceeded;
        }

        if let Message::Nodes(nodes) = &response {
            if request.responses_count == 0 {
                request.max_responses = nodes.total.max(1);
            }
        }
        request.is_fulfilled = true;
        request.responses_count += 1;
        request.responses.push(response);

        if request.is_complete() {
            request.respond();
            FulfillOutcome::Complete
        } else {
            FulfillOutcome::Partial
        }
    }

    /// Drops requests older than the request timeout. Unanswered pending requests count
    /// as a failure for their node. Cached ones mean the handshake never completed, so a
    /// node that never responded is declared dead.
    pub fn sweep_expired_requests(&self) -> usize {
        let timeout = self.request_timeout;
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|request| !request.is_complete() && request.elapsed() >= timeout)
            .map(|request| request.key().clone())
            .collect();
        let mut removed = 0;
        for req_id in expired {
            let Some((_, mut request)) = self.pending.remove(&req_id) else {
                continue;
            };
            removed += 1;
            let node_id = request.node.node_id();
            if request.is_fulfilled {
                // got part of a multi packet reply, give the caller what arrived
                trace!(node = %node_id, received = request.responses_count, expected = request.max_responses, "Partial response timed out");
                request.respond();
                continue;
            }
            let status = self.routing_table.increase_failure_counter(&node_id);
            debug!(node = %node_id, ?status, "Request timed out");
        }

        let expired: Vec<RequestId> = self
            .cached
            .iter()
            .filter(|request| request.elapsed() >= timeout)
            .map(|request| request.key().clone())
            .collect();
        for req_id in expired {
            let Some((_, request)) = self.cached.remove(&req_id) else {
                continue;
            };
            removed += 1;
            let node_id = request.node.node_id();
            match self.routing_table.get_entry(&node_id) {
                Some(entry) if !entry.has_responded_ever => {
                    debug!(node = %node_id, "Handshake never completed, marking node as dead");
                    self.routing_table.mark_dead(&node_id);
                }
                Some(_) => {
                    self.routing_table.increase_failure_counter(&node_id);
                }
                None => {}
            }
        }
        removed
    }

    /// Removes requests whose replies have all been accounted for.
    pub fn sweep_fulfilled_requests(&self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, request| !request.is_complete());
        before - self.pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn cached_len(&self) -> usize {
        self.cached.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{FindNodeMessage, NodesMessage, PingMessage, PongMessage},
        routing_table::NodeStatus,
        types::{NodeRecord, NodeRecordPairs},
        utils::{node_id, public_key_from_signing_key},
    };
    use bytes::Bytes;
    use secp256k1::SecretKey;
    use std::net::{IpAddr, Ipv4Addr};

    const TIMEOUT: Duration = Duration::from_millis(1000);

    fn setup() -> (RequestManager, Arc<RoutingTable>) {
        let local = SecretKey::new(&mut rand::thread_rng());
        let table = Arc::new(RoutingTable::new(
            node_id(&public_key_from_signing_key(&local)),
            16,
            16,
            1,
        ));
        (RequestManager::new(table.clone(), TIMEOUT), table)
    }

    /// A node already present in the routing table.
    fn known_node(table: &RoutingTable) -> Node {
        let signer = SecretKey::new(&mut rand::thread_rng());
        let record = NodeRecord::new(
            1,
            NodeRecordPairs {
                ip: Some(Ipv4Addr::LOCALHOST),
                udp_port: Some(30303),
                ..Default::default()
            },
            &signer,
        )
        .unwrap();
        table.update_from_record(record.clone());
        Node::from_enr(&record).unwrap()
    }

    fn ping(req_id: u8) -> Message {
        Message::Ping(PingMessage {
            req_id: Bytes::copy_from_slice(&[req_id]),
            enr_seq: 1,
        })
    }

    fn pong(req_id: u8) -> Message {
        Message::Pong(PongMessage {
            req_id: Bytes::copy_from_slice(&[req_id]),
            enr_seq: 1,
            recipient_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            recipient_port: 30303,
        })
    }

    fn nodes(req_id: u8, total: u64) -> Message {
        Message::Nodes(NodesMessage {
            req_id: Bytes::copy_from_slice(&[req_id]),
            total,
            nodes: vec![],
        })
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_once() {
        let (manager, table) = setup();
        let node = known_node(&table);
        let node_id = node.node_id();

        assert!(manager.add_pending_request(PendingRequest::new(node.clone(), ping(1), None)));
        assert_eq!(table.get_entry(&node_id).unwrap().status, NodeStatus::Pending);

        tokio::time::advance(Duration::from_millis(600)).await;
        // same id again: rejected and the original timer keeps running
        assert!(!manager.add_pending_request(PendingRequest::new(node, ping(1), None)));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(manager.sweep_expired_requests(), 1);
        assert!(!manager.has_pending_request(&Bytes::from_static(&[1])));
        assert_eq!(table.get_entry(&node_id).unwrap().failure_counter, 1);

        assert_eq!(manager.sweep_expired_requests(), 0);
        assert_eq!(table.get_entry(&node_id).unwrap().failure_counter, 1);
    }

    #[tokio::test]
    async fn reply_completes_request_and_notifies_caller() {
        let (manager, table) = setup();
        let node = known_node(&table);
        let (tx, rx) = oneshot::channel();
        manager.add_pending_request(PendingRequest::new(node.clone(), ping(2), Some(tx)));

        assert_eq!(
            manager.mark_request_as_fulfilled(&Bytes::from_static(&[3]), &node.node_id(), pong(3)),
            FulfillOutcome::Unknown
        );
        assert_eq!(
            manager.mark_request_as_fulfilled(&Bytes::from_static(&[2]), &H256::zero(), pong(2)),
            FulfillOutcome::UnexpectedSender
        );
        assert_eq!(
            manager.mark_request_as_fulfilled(&Bytes::from_static(&[2]), &node.node_id(), nodes(2, 1)),
            FulfillOutcome::UnexpectedResponse
        );
        assert_eq!(
            manager.mark_request_as_fulfilled(&Bytes::from_static(&[2]), &node.node_id(), pong(2)),
            FulfillOutcome::Complete
        );
        assert_eq!(rx.await.unwrap(), vec![pong(2)]);

        assert_eq!(
            manager.mark_request_as_fulfilled(&Bytes::from_static(&[2]), &node.node_id(), pong(2)),
            FulfillOutcome::Exceeded
        );
        assert_eq!(manager.sweep_fulfilled_requests(), 1);
        assert_eq!(manager.pending_len(), 0);
    }

    #[tokio::test]
    async fn nodes_reply_is_complete_after_announced_total() {
        let (manager, table) = setup();
        let node = known_node(&table);
        let find_node = Message::FindNode(FindNodeMessage {
            req_id: Bytes::from_static(&[4]),
            distances: vec![256],
        });
        let (tx, rx) = oneshot::channel();
        manager.add_pending_request(PendingRequest::new(node.clone(), find_node, Some(tx)));
        let req_id = Bytes::from_static(&[4]);

        assert_eq!(
            manager.mark_request_as_fulfilled(&req_id, &node.node_id(), nodes(4, 3)),
            FulfillOutcome::Partial
        );
        assert_eq!(
            manager.mark_request_as_fulfilled(&req_id, &node.node_id(), nodes(4, 3)),
            FulfillOutcome::Partial
        );
        // fulfilled but not complete, the sweeper keeps it
        assert_eq!(manager.sweep_fulfilled_requests(), 0);
        assert_eq!(
            manager.mark_request_as_fulfilled(&req_id, &node.node_id(), nodes(4, 3)),
            FulfillOutcome::Complete
        );
        assert_eq!(rx.await.unwrap().len(), 3);
        assert_eq!(
            manager.mark_request_as_fulfilled(&req_id, &node.node_id(), nodes(4, 3)),
            FulfillOutcome::Exceeded
        );
        assert_eq!(manager.sweep_fulfilled_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_reply_timeout_is_not_a_failure() {
        let (manager, table) = setup();
        let node = known_node(&table);
        let find_node = Message::FindNode(FindNodeMessage {
            req_id: Bytes::from_static(&[5]),
            distances: vec![256],
        });
        let (tx, rx) = oneshot::channel();
        manager.add_pending_request(PendingRequest::new(node.clone(), find_node, Some(tx)));
        manager.mark_request_as_fulfilled(&Bytes::from_static(&[5]), &node.node_id(), nodes(5, 2));

        tokio::time::advance(TIMEOUT).await;
        assert_eq!(manager.sweep_expired_requests(), 1);
        assert_eq!(rx.await.unwrap().len(), 1);
        assert_eq!(table.get_entry(&node.node_id()).unwrap().failure_counter, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_cached_request_kills_silent_node() {
        let (manager, table) = setup();
        let silent = known_node(&table);
        let responsive = known_node(&table);
        table.mark_responded(&responsive.node_id());

        manager.add_cached_request(PendingRequest::new(silent.clone(), ping(6), None));
        manager.add_cached_request(PendingRequest::new(responsive.clone(), ping(7), None));
        assert!(manager.has_cached_requests_for(&silent.node_id()));

        tokio::time::advance(TIMEOUT).await;
        assert_eq!(manager.sweep_expired_requests(), 2);
        assert_eq!(manager.cached_len(), 0);
        assert_eq!(table.get_entry(&silent.node_id()).unwrap().status, NodeStatus::Dead);
        let entry = table.get_entry(&responsive.node_id()).unwrap();
        assert_eq!(entry.status, NodeStatus::Live);
        assert_eq!(entry.failure_counter, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_requests_are_promoted_in_order() {
        let (manager, table) = setup();
        let node = known_node(&table);
        manager.add_cached_request(PendingRequest::new(node.clone(), ping(8), None));
        tokio::time::advance(Duration::from_millis(10)).await;
        manager.add_cached_request(PendingRequest::new(node.clone(), ping(9), None));

        let cached = manager.take_cached_requests_for(&node.node_id());
        assert_eq!(
            cached.iter().map(|r| r.req_id().clone()).collect::<Vec<_>>(),
            vec![Bytes::from_static(&[8]), Bytes::from_static(&[9])]
        );
        assert!(!manager.has_cached_requests_for(&node.node_id()));

        for request in cached {
            assert!(manager.promote(request));
        }
        assert_eq!(manager.pending_len(), 2);
        assert_eq!(table.get_entry(&node.node_id()).unwrap().status, NodeStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_cached_request_goes_first_and_the_rest_wait() {
        let (manager, table) = setup();
        let node = known_node(&table);
        let other = known_node(&table);
        manager.add_cached_request(PendingRequest::new(node.clone(), ping(10), None));
        tokio::time::advance(Duration::from_millis(10)).await;
        manager.add_cached_request(PendingRequest::new(node.clone(), ping(11), None));
        manager.add_cached_request(PendingRequest::new(other.clone(), ping(12), None));

        let oldest = manager
            .take_oldest_cached_request_for(&node.node_id())
            .unwrap();
        assert_eq!(oldest.req_id(), &Bytes::from_static(&[10]));
        assert_eq!(manager.cached_len(), 2);
        assert!(manager.has_cached_requests_for(&node.node_id()));

        assert!(!manager.has_pending_requests_for(&node.node_id()));
        assert!(manager.promote(oldest));
        assert!(manager.has_pending_requests_for(&node.node_id()));
        assert!(!manager.has_pending_requests_for(&other.node_id()));

        let rest = manager.take_oldest_cached_request_for(&node.node_id()).unwrap();
        assert_eq!(rest.req_id(), &Bytes::from_static(&[11]));
        assert!(manager.take_oldest_cached_request_for(&node.node_id()).is_none());
    }
}
