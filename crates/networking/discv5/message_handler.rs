use std::{net::SocketAddr, sync::Arc};

use ethereum_types::H256;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    messages::{
        FindNodeMessage, Message, NodesMessage, PongMessage, RequestId, TalkResMessage,
        random_request_id,
    },
    request_manager::{FulfillOutcome, RequestManager},
    routing_table::RoutingTable,
    types::{Node, NodeRecord},
    utils::log_distance,
};

/// Max ENRs per NODES packet, keeps every reply well under the packet size limit.
pub const MAX_ENRS_PER_MESSAGE: usize = 3;

/// Requests the message layer wants sent, drained by the server.
pub type FollowUpSender = mpsc::UnboundedSender<(Node, Message)>;
pub type FollowUpReceiver = mpsc::UnboundedReceiver<(Node, Message)>;

/// Consumer of decrypted message plaintexts.
pub trait PayloadHandler: Send + Sync {
    /// Returns the encoded replies, each sent back in its own packet, or `None` when
    /// nothing should be sent.
    fn handle_decrypted_payload(
        &self,
        src_id: H256,
        payload: &[u8],
        from: SocketAddr,
    ) -> Option<Vec<Vec<u8>>>;
}

/// The discv5 messages: answers PING, FINDNODE and TALKREQ and routes the replies to
/// our own requests into the request manager.
#[derive(Debug)]
pub struct DiscoveryProtocol {
    local_record: NodeRecord,
    routing_table: Arc<RoutingTable>,
    requests: Arc<RequestManager>,
    max_nodes_per_response: usize,
    follow_ups: FollowUpSender,
}

impl DiscoveryProtocol {
    pub fn new(
        local_record: NodeRecord,
        routing_table: Arc<RoutingTable>,
        requests: Arc<RequestManager>,
        max_nodes_per_response: usize,
    ) -> (Self, FollowUpReceiver) {
        let (follow_ups, receiver) = mpsc::unbounded_channel();
        (
            Self {
                local_record,
                routing_table,
                requests,
                max_nodes_per_response,
                follow_ups,
            },
            receiver,
        )
    }

    fn handle_ping(&self, src_id: H256, req_id: RequestId, enr_seq: u64, from: SocketAddr) -> Vec<u8> {
        trace!(from = %src_id, enr_seq, "Received PING");

        // the sender advertises a newer record than ours, fetch it
        if let Some(record) = self.routing_table.get_record(&src_id)
            && enr_seq > record.seq
            && let Ok(node) = Node::from_enr(&record)
        {
            let find_node = Message::FindNode(FindNodeMessage {
                req_id: random_request_id(&mut OsRng),
                distances: vec![0],
            });
            let _ = self.follow_ups.send((node, find_node));
        }

        Message::Pong(PongMessage {
            req_id,
            enr_seq: self.local_record.seq,
            recipient_ip: from.ip(),
            recipient_port: from.port(),
        })
        .encode()
    }

    fn handle_find_node(&self, src_id: H256, find_node: FindNodeMessage) -> Vec<Vec<u8>> {
        trace!(from = %src_id, distances = ?find_node.distances, "Received FINDNODE");
        let records = self.routing_table.records_at_distances(
            &find_node.distances,
            &self.local_record,
            self.max_nodes_per_response,
        );

        // an empty reply is still one NODES packet
        let chunks: Vec<&[NodeRecord]> = if records.is_empty() {
            vec![records.as_slice()]
        } else {
            records.chunks(MAX_ENRS_PER_MESSAGE).collect()
        };
        let total = chunks.len() as u64;
        chunks
            .into_iter()
            .map(|chunk| {
                Message::Nodes(NodesMessage {
                    req_id: find_node.req_id.clone(),
                    total,
                    nodes: chunk.to_vec(),
                })
                .encode()
            })
            .collect()
    }

    /// Keeps the records that are correctly signed and lie at one of the distances we asked `src_id` for.
    fn filter_nodes(&self, src_id: H256, distances: &[u64], nodes: Vec<NodeRecord>) -> Vec<NodeRecord> {
        nodes
            .into_iter()
            .filter(|record| {
                let distance = log_distance(&src_id, &record.node_id()) as u64;
                let valid = record.verify_signature() && distances.contains(&distance);
                if !valid {
                    trace!(from = %src_id, node = %record.node_id(), distance, "Dropping NODES record");
                }
                valid
            })
            .collect()
    }

    fn handle_response(&self, src_id: H256, response: Message) {
        let req_id = response.req_id().clone();
        let mut records = Vec::new();
        let response = match response {
            Message::Nodes(nodes) => {
                if nodes.nodes.len() > self.max_nodes_per_response {
                    trace!(from = %src_id, count = nodes.nodes.len(), "Too many records in NODES");
                    return;
                }
                let Some(distances) = self.requests.requested_distances(&req_id) else {
                    trace!(from = %src_id, "NODES for an unknown request");
                    return;
                };
                records = self.filter_nodes(src_id, &distances, nodes.nodes);
                Message::Nodes(NodesMessage {
                    nodes: records.clone(),
                    ..nodes
                })
            }
            other => other,
        };

        match self
            .requests
            .mark_request_as_fulfilled(&req_id, &src_id, response)
        {
            FulfillOutcome::Partial | FulfillOutcome::Complete => {
                self.routing_table.mark_responded(&src_id);
                for record in records {
                    if record.node_id() != self.local_record.node_id() {
                        self.routing_table.update_from_record(record);
                    }
                }
            }
            outcome => {
                trace!(from = %src_id, req_id = %hex::encode(&req_id), ?outcome, "Dropping response");
            }
        }
    }
}

impl PayloadHandler for DiscoveryProtocol {
    fn handle_decrypted_payload(
        &self,
        src_id: H256,
        payload: &[u8],
        from: SocketAddr,
    ) -> Option<Vec<Vec<u8>>> {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                trace!(from = %src_id, %from, err = %err, "Undecodable message");
                return None;
            }
        };
        match message {
            Message::Ping(ping) => Some(vec![self.handle_ping(
                src_id,
                ping.req_id,
                ping.enr_seq,
                from,
            )]),
            Message::FindNode(find_node) => Some(self.handle_find_node(src_id, find_node)),
            Message::TalkReq(talk_req) => {
                // no sub-protocols are registered
                trace!(from = %src_id, protocol = %hex::encode(&talk_req.protocol), "Received TALKREQ");
                Some(vec![
                    Message::TalkRes(TalkResMessage {
                        req_id: talk_req.req_id,
                        response: Default::default(),
                    })
                    .encode(),
                ])
            }
            response @ (Message::Pong(_) | Message::Nodes(_) | Message::TalkRes(_)) => {
                self.handle_response(src_id, response);
                None
            }
        }
    }
}
