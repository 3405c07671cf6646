use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use ethereum_types::H256;
use futures::StreamExt;
use rand::rngs::OsRng;
use rustc_hash::FxBuildHasher;
use secp256k1::SecretKey;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker, udp::UdpFramed};
use tracing::{debug, error, info, trace};

use crate::{
    codec::Discv5Codec,
    config::Discv5Config,
    error::DiscoveryError,
    message_handler::{DiscoveryProtocol, FollowUpReceiver, PayloadHandler},
    messages::{
        FindNodeMessage, Message, PingMessage, PongMessage, TalkReqMessage, random_request_id,
    },
    packet::{Nonce, Packet},
    request_manager::{PendingRequest, RequestManager},
    routing_table::RoutingTable,
    session::SessionManager,
    types::{Node, NodeRecord},
    utils::{node_id, public_key_from_signing_key},
};

/// A packet we sent, kept until the request timeout so that a WHOAREYOU answering it
/// can be matched to its destination and the message re-sent inside the handshake.
#[derive(Debug, Clone)]
pub(crate) struct OutboundPacket {
    pub node: Node,
    /// Message plaintext, `None` for the random packets that start a handshake.
    pub payload: Option<Vec<u8>>,
    pub sent_at: Instant,
}

/// Shared state of a running discovery node. Every received packet is handled in its
/// own task, so everything in here is safe to use concurrently.
pub struct Discv5Server {
    pub(crate) local_node: Node,
    pub(crate) local_record: NodeRecord,
    pub(crate) config: Discv5Config,
    pub(crate) udp_socket: Arc<UdpSocket>,
    pub(crate) sessions: SessionManager,
    pub(crate) routing_table: Arc<RoutingTable>,
    pub(crate) requests: Arc<RequestManager>,
    pub(crate) payload_handler: Arc<dyn PayloadHandler>,
    pub(crate) outbound: DashMap<Nonce, OutboundPacket, FxBuildHasher>,
    pub(crate) whoareyou_rate_limit: DashMap<SocketAddr, Instant, FxBuildHasher>,
    /// Cancelled on shutdown, long running work checks it between steps.
    pub(crate) cancel_token: CancellationToken,
}

impl std::fmt::Debug for Discv5Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discv5Server")
            .field("local_node", &self.local_node)
            .field("routing_table_len", &self.routing_table.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl Discv5Server {
    /// Binds the socket and builds the node state without starting any task.
    pub async fn new(
        config: Discv5Config,
        signer: SecretKey,
    ) -> Result<(Self, FollowUpReceiver), DiscoveryError> {
        config.validate()?;

        let udp_socket = UdpSocket::bind(SocketAddr::new(config.listen_ip, config.udp_port))
            .await
            .map_err(DiscoveryError::Bind)?;
        let bound_port = udp_socket.local_addr()?.port();

        let public_key = public_key_from_signing_key(&signer);
        let local_node = Node::new(config.advertised_ip(), bound_port, bound_port, public_key);
        let local_record = NodeRecord::from_node(&local_node, 1, &signer)?;
        let local_node_id = node_id(&public_key);

        let routing_table = Arc::new(RoutingTable::new(
            local_node_id,
            config.bucket_size,
            config.replacement_cache_size,
            config.max_allowed_failures,
        ));
        let requests = Arc::new(RequestManager::new(
            routing_table.clone(),
            config.request_timeout,
        ));
        let (payload_handler, follow_ups) = DiscoveryProtocol::new(
            local_record.clone(),
            routing_table.clone(),
            requests.clone(),
            config.max_nodes_per_response,
        );
        let session_capacity = NonZeroUsize::new(config.session_cache_capacity)
            .ok_or(crate::config::ConfigError::Zero("session_cache_capacity"))?;

        let server = Self {
            sessions: SessionManager::new(local_node_id, signer, session_capacity),
            local_node,
            local_record,
            config,
            udp_socket: Arc::new(udp_socket),
            routing_table,
            requests,
            payload_handler: Arc::new(payload_handler),
            outbound: DashMap::with_hasher(FxBuildHasher),
            whoareyou_rate_limit: DashMap::with_hasher(FxBuildHasher),
            cancel_token: CancellationToken::new(),
        };
        Ok((server, follow_ups))
    }

    /// Starts the node: receive loop, request sweepers, liveness pings, bucket refresh
    /// and lookups. Bootnodes from the config are inserted and looked up first.
    pub async fn spawn(
        config: Discv5Config,
        signer: SecretKey,
    ) -> Result<Discv5Handle, DiscoveryError> {
        let (server, follow_ups) = Self::new(config, signer).await?;
        let server = Arc::new(server);
        info!(
            node = %server.local_node,
            enr = %server.local_record.enr_url(),
            "Starting discv5 server"
        );

        let bootnodes = server.config.bootnodes.clone();
        info!(count = bootnodes.len(), "Adding bootnodes");
        for record in bootnodes {
            if !record.verify_signature() {
                debug!(node = %record.node_id(), "Skipping bootnode with invalid signature");
                continue;
            }
            server.routing_table.update_from_record(record);
        }

        let cancel_token = server.cancel_token.clone();
        let tracker = TaskTracker::new();

        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        tracker.spawn(receive_loop(server.clone(), packet_tx, cancel_token.clone()));
        tracker.spawn(dispatch_loop(
            server.clone(),
            packet_rx,
            tracker.clone(),
            cancel_token.clone(),
        ));
        tracker.spawn(follow_up_loop(
            server.clone(),
            follow_ups,
            cancel_token.clone(),
        ));

        let config = &server.config;
        spawn_periodic(
            &tracker,
            &cancel_token,
            config.pending_sweep_interval,
            server.clone(),
            |server| async move {
                let removed = server.requests.sweep_expired_requests();
                if removed > 0 {
                    trace!(removed, "Swept expired requests");
                }
            },
        );
        spawn_periodic(
            &tracker,
            &cancel_token,
            config.fulfilled_sweep_interval,
            server.clone(),
            |server| async move {
                server.requests.sweep_fulfilled_requests();
            },
        );
        spawn_periodic(
            &tracker,
            &cancel_token,
            config.cleanup_interval,
            server.clone(),
            |server| async move { server.cleanup_stale_entries() },
        );
        spawn_periodic(
            &tracker,
            &cancel_token,
            config.ping_interval,
            server.clone(),
            |server| async move { server.revalidate().await },
        );
        spawn_periodic(
            &tracker,
            &cancel_token,
            config.refresh_interval,
            server.clone(),
            |server| async move { server.refresh().await },
        );
        // the first tick fires right away, which doubles as the bootstrap self lookup
        spawn_periodic(
            &tracker,
            &cancel_token,
            config.lookup_interval,
            server.clone(),
            |server| async move {
                let found = server.lookup(server.local_node.node_id()).await;
                debug!(found = found.len(), table = server.routing_table.len(), "Self lookup finished");
            },
        );

        Ok(Discv5Handle {
            server,
            cancel_token,
            tracker,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.udp_socket.local_addr()?)
    }

    /// Sends `message` to `node` and waits for every reply packet, up to the receive timeout.
    pub(crate) async fn request(
        &self,
        node: &Node,
        message: Message,
    ) -> Result<Vec<Message>, DiscoveryError> {
        let (tx, rx) = oneshot::channel();
        self.send_request(node, message, Some(tx)).await?;
        match tokio::time::timeout(self.config.receive_timeout, rx).await {
            Ok(Ok(responses)) if !responses.is_empty() => Ok(responses),
            // the sweeper dropped the request
            _ => Err(DiscoveryError::Timeout(node.to_string())),
        }
    }

    pub(crate) async fn ping(&self, node: &Node) -> Result<PongMessage, DiscoveryError> {
        let ping = Message::Ping(PingMessage {
            req_id: random_request_id(&mut OsRng),
            enr_seq: self.local_record.seq,
        });
        self.request(node, ping)
            .await?
            .into_iter()
            .find_map(|response| match response {
                Message::Pong(pong) => Some(pong),
                _ => None,
            })
            .ok_or_else(|| DiscoveryError::Timeout(node.to_string()))
    }

    pub(crate) async fn find_node(
        &self,
        node: &Node,
        distances: Vec<u64>,
    ) -> Result<Vec<NodeRecord>, DiscoveryError> {
        let find_node = Message::FindNode(FindNodeMessage {
            req_id: random_request_id(&mut OsRng),
            distances,
        });
        let records = self
            .request(node, find_node)
            .await?
            .into_iter()
            .flat_map(|response| match response {
                Message::Nodes(nodes) => nodes.nodes,
                _ => Vec::new(),
            })
            .collect();
        Ok(records)
    }

    pub(crate) async fn talk_req(
        &self,
        node: &Node,
        protocol: Bytes,
        request: Bytes,
    ) -> Result<Bytes, DiscoveryError> {
        let talk_req = Message::TalkReq(TalkReqMessage {
            req_id: random_request_id(&mut OsRng),
            protocol,
            request,
        });
        self.request(node, talk_req)
            .await?
            .into_iter()
            .find_map(|response| match response {
                Message::TalkRes(talk_res) => Some(talk_res.response),
                _ => None,
            })
            .ok_or_else(|| DiscoveryError::Timeout(node.to_string()))
    }

    /// Builds a request for `node` and sends it without waiting for the reply.
    pub(crate) async fn send_request(
        &self,
        node: &Node,
        message: Message,
        responder: Option<oneshot::Sender<Vec<Message>>>,
    ) -> Result<(), DiscoveryError> {
        let request = PendingRequest::new(node.clone(), message, responder);
        self.dispatch_request(request).await
    }

    /// Remove stale entries from the nonce and rate limit maps.
    pub(crate) fn cleanup_stale_entries(&self) {
        let now = Instant::now();
        let request_timeout = self.config.request_timeout;
        let rate_limit = self.config.whoareyou_rate_limit;

        let before_outbound = self.outbound.len();
        self.outbound
            .retain(|_, packet| now.duration_since(packet.sent_at) < request_timeout);
        let removed_outbound = before_outbound - self.outbound.len();

        let before_rate_limits = self.whoareyou_rate_limit.len();
        self.whoareyou_rate_limit
            .retain(|_, last_sent| now.duration_since(*last_sent) < rate_limit);
        let removed_rate_limits = before_rate_limits - self.whoareyou_rate_limit.len();

        if removed_outbound + removed_rate_limits > 0 {
            trace!(
                removed_outbound,
                removed_rate_limits, "Cleaned up stale entries"
            );
        }
    }
}

fn spawn_periodic<F, Fut>(
    tracker: &TaskTracker,
    cancel_token: &CancellationToken,
    period: Duration,
    server: Arc<Discv5Server>,
    task: F,
) where
    F: Fn(Arc<Discv5Server>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancel_token = cancel_token.clone();
    tracker.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = task(server.clone()) => {}
            }
        }
    });
}

/// Reads datagrams off the socket into the handler queue.
async fn receive_loop(
    server: Arc<Discv5Server>,
    packet_tx: mpsc::UnboundedSender<(Packet, SocketAddr)>,
    cancel_token: CancellationToken,
) {
    let mut stream = UdpFramed::new(
        server.udp_socket.clone(),
        Discv5Codec::new(server.local_node.node_id()),
    );
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok((packet, from))) => {
                    if packet_tx.send((packet, from)).is_err() {
                        break;
                    }
                }
                // malformed datagrams never reach the handlers
                Some(Err(err)) => trace!(err = %err, "Dropping undecodable datagram"),
                None => break,
            }
        }
    }
    debug!("Discv5 receive loop stopped");
}

/// Handles every queued packet in its own task.
async fn dispatch_loop(
    server: Arc<Discv5Server>,
    mut packet_rx: mpsc::UnboundedReceiver<(Packet, SocketAddr)>,
    tracker: TaskTracker,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = packet_rx.recv() => {
                let Some((packet, from)) = next else { break };
                let server = server.clone();
                tracker.spawn(async move {
                    if let Err(err) = server.handle_packet(packet, from).await {
                        trace!(%from, err = %err, "Error handling packet");
                    }
                });
            }
        }
    }
}

/// Sends the requests the message layer asks for, e.g. fetching a newer record.
async fn follow_up_loop(
    server: Arc<Discv5Server>,
    mut follow_ups: FollowUpReceiver,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = follow_ups.recv() => {
                let Some((node, message)) = next else { break };
                if let Err(err) = server.send_request(&node, message, None).await {
                    error!(to = %node, err = %err, "Error sending follow up request");
                }
            }
        }
    }
}

/// Cheap to clone handle to a running discovery node.
#[derive(Debug, Clone)]
pub struct Discv5Handle {
    server: Arc<Discv5Server>,
    cancel_token: CancellationToken,
    tracker: TaskTracker,
}

impl Discv5Handle {
    pub fn local_record(&self) -> NodeRecord {
        self.server.local_record.clone()
    }

    pub fn local_node(&self) -> Node {
        self.server.local_node.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        self.server.local_addr()
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.server.routing_table.clone()
    }

    pub async fn ping(&self, node: &Node) -> Result<PongMessage, DiscoveryError> {
        self.ensure_running()?;
        self.server.ping(node).await
    }

    pub async fn find_node(
        &self,
        node: &Node,
        distances: Vec<u64>,
    ) -> Result<Vec<NodeRecord>, DiscoveryError> {
        self.ensure_running()?;
        self.server.find_node(node, distances).await
    }

    pub async fn talk_req(
        &self,
        node: &Node,
        protocol: Bytes,
        request: Bytes,
    ) -> Result<Bytes, DiscoveryError> {
        self.ensure_running()?;
        self.server.talk_req(node, protocol, request).await
    }

    /// Iterative lookup for the nodes closest to `target`.
    pub async fn lookup(&self, target: H256) -> Result<Vec<NodeRecord>, DiscoveryError> {
        self.ensure_running()?;
        Ok(self.server.lookup(target).await)
    }

    fn ensure_running(&self) -> Result<(), DiscoveryError> {
        if self.cancel_token.is_cancelled() {
            return Err(DiscoveryError::ShuttingDown);
        }
        Ok(())
    }

    /// Stops every loop and waits for in-flight handlers to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down discv5 server");
        self.cancel_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
