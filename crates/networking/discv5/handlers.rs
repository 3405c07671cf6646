//! Packet handling: the Ordinary / WHOAREYOU / Handshake exchange and the encrypted
//! message flow on top of established sessions.
//!
//! See https://github.com/ethereum/devp2p/blob/master/discv5/discv5-theory.md#sessions

use std::net::SocketAddr;

use ethereum_types::H256;
use rand::{RngCore, rngs::OsRng};
use secp256k1::PublicKey;
use tokio::time::Instant;
use tracing::trace;

use crate::{
    crypto::verify_id_signature,
    error::DiscoveryError,
    packet::{
        AuthData, HandshakeAuthData, Nonce, Packet, PacketHeader, WhoAreYouAuthData,
        message_ad, random_masking_iv,
    },
    request_manager::PendingRequest,
    server::{Discv5Server, OutboundPacket},
    session::{SessionError, SessionRole},
    types::Node,
    utils::public_key_from_h512,
};

impl Discv5Server {
    pub(crate) async fn handle_packet(
        &self,
        packet: Packet,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        // ignore packets sent by ourselves
        if packet.src_id() == Some(self.local_node.node_id()) {
            return Ok(());
        }
        match packet.header.authdata.clone() {
            AuthData::Ordinary { src_id } => self.handle_ordinary(packet, src_id, from).await,
            AuthData::WhoAreYou(who_are_you) => {
                self.handle_who_are_you(packet, who_are_you, from).await
            }
            AuthData::Handshake(handshake) => self.handle_handshake(packet, handshake, from).await,
        }
    }

    async fn handle_ordinary(
        &self,
        packet: Packet,
        src_id: H256,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        // decrypt with the existing session, or challenge the sender if there's none or it's stale
        let decrypted = self.sessions.get_session(&src_id, &from).and_then(|session| {
            let mut session = session.lock();
            if !session.is_established() {
                return None;
            }
            let plaintext = session
                .decrypt_message(&packet.header.nonce, &packet.message, &packet.message_ad())
                .inspect_err(|err| trace!(from = %src_id, %from, err = %err, "Decryption failed"))
                .ok()?;
            Some((plaintext, session.confirm()))
        });
        let Some((plaintext, first_message)) = decrypted else {
            trace!(from = %src_id, %from, "No usable session, sending WhoAreYou");
            return self
                .send_who_are_you(packet.header.nonce, src_id, from)
                .await;
        };

        self.routing_table.mark_live(&src_id);
        let result = self.handle_payload(src_id, &plaintext, from).await;

        // the peer answered over the keys we derived, requests held back for it can go now
        if first_message {
            let cached = self.requests.take_cached_requests_for(&src_id);
            self.flush_requests(cached).await;
        }
        result
    }

    async fn handle_who_are_you(
        &self,
        packet: Packet,
        who_are_you: WhoAreYouAuthData,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        // WHOAREYOU carries no node id, the nonce tells us which packet it answers
        let Some((_, outbound)) = self.outbound.remove(&packet.header.nonce) else {
            trace!(%from, "Received unexpected WhoAreYou packet. Ignoring it");
            return Ok(());
        };
        let node = outbound.node;
        let dest_id = node.node_id();
        trace!(received = "WhoAreYou", from = %dest_id, %from);

        // the message that triggered the challenge, or the oldest one waiting for this
        // handshake. Other cached requests stay cached until the peer answers.
        let payload = match outbound.payload {
            Some(payload) => payload,
            None => {
                let Some(first) = self.requests.take_oldest_cached_request_for(&dest_id) else {
                    trace!(to = %dest_id, "Nothing left to send, dropping handshake");
                    return Ok(());
                };
                let payload = first.message.encode();
                self.requests.promote(first);
                payload
            }
        };

        let remote_pubkey = public_key_from_h512(&node.public_key)
            .ok_or_else(|| DiscoveryError::UnknownNode(node.to_string()))?;
        let record = (who_are_you.enr_seq < self.local_record.seq)
            .then(|| self.local_record.clone());

        let (handshake, nonce) = {
            let session = self
                .sessions
                .create_session(SessionRole::Initiator, dest_id, from);
            let mut session = session.lock();
            // challenge-data = masking-iv || static-header || authdata
            session.set_challenge_data(packet.message_ad());
            let id_signature = session
                .generate_id_signature(&dest_id)
                .ok_or(SessionError::NoChallengeData)?;

            let nonce = session.next_nonce(&mut OsRng);
            let header = PacketHeader::new(
                nonce,
                AuthData::Handshake(HandshakeAuthData {
                    src_id: self.local_node.node_id(),
                    id_signature: id_signature.to_vec(),
                    eph_pubkey: session.ephemeral_pubkey().to_vec(),
                    record,
                }),
            )?;
            let masking_iv = random_masking_iv(&mut OsRng);
            let ciphertext = session.encrypt_message_with_new_keys(
                &remote_pubkey,
                &dest_id,
                &nonce,
                &payload,
                &message_ad(&masking_iv, &header),
            )?;
            (Packet::new(masking_iv, header, ciphertext), nonce)
        };

        self.remember_outbound(nonce, node, Some(payload));
        self.send_packet(&handshake, &dest_id, from).await
    }

    async fn handle_handshake(
        &self,
        packet: Packet,
        handshake: HandshakeAuthData,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let src_id = handshake.src_id;
        let Some(session) = self.sessions.get_session(&src_id, &from) else {
            trace!(from = %src_id, %from, "Received unexpected Handshake packet");
            return Ok(());
        };

        // the sender's static key comes from the attached record or from the one we know
        let record = match &handshake.record {
            Some(record) => {
                if !record.verify_signature() {
                    trace!(from = %src_id, "Handshake ENR signature verification failed");
                    return Ok(());
                }
                if record.node_id() != src_id {
                    trace!(from = %src_id, "Handshake ENR node_id mismatch");
                    return Ok(());
                }
                record.clone()
            }
            None => match self.routing_table.get_record(&src_id) {
                Some(record) => record,
                None => {
                    trace!(from = %src_id, "Cannot verify handshake: unknown sender public key");
                    return Ok(());
                }
            },
        };
        let Some(src_pubkey) = public_key_from_h512(&record.public_key()) else {
            return Ok(());
        };
        let Ok(eph_pubkey) = PublicKey::from_slice(&handshake.eph_pubkey) else {
            trace!(from = %src_id, "Invalid ephemeral public key");
            return Ok(());
        };

        let plaintext = {
            let mut session = session.lock();
            if session.role() != SessionRole::Recipient || session.is_established() {
                trace!(from = %src_id, "No handshake in progress with sender");
                return Ok(());
            }
            let Some(challenge_data) = session.challenge_data() else {
                return Ok(());
            };
            if !verify_id_signature(
                &handshake.id_signature,
                &src_pubkey,
                challenge_data,
                &handshake.eph_pubkey,
                &self.local_node.node_id(),
            ) {
                trace!(from = %src_id, "Handshake signature verification failed");
                return Ok(());
            }
            match session.decrypt_message_with_new_keys(
                &eph_pubkey,
                &src_id,
                &packet.header.nonce,
                &packet.message,
                &packet.message_ad(),
            ) {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    trace!(from = %src_id, err = %err, "Handshake decryption failed");
                    return Ok(());
                }
            }
        };
        trace!(from = %src_id, %from, "Handshake completed");

        if handshake.record.is_some() {
            self.routing_table.update_from_record(record);
        }
        self.routing_table.mark_live(&src_id);

        self.handle_payload(src_id, &plaintext, from).await?;

        let cached = self.requests.take_cached_requests_for(&src_id);
        self.flush_requests(cached).await;
        Ok(())
    }

    /// Hands a decrypted message to the message layer and sends back whatever it returns,
    /// one packet per reply.
    async fn handle_payload(
        &self,
        src_id: H256,
        plaintext: &[u8],
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let Some(responses) = self
            .payload_handler
            .handle_decrypted_payload(src_id, plaintext, from)
        else {
            return Ok(());
        };
        let node = self.routing_table.get_node(&src_id);
        for response in responses {
            self.send_ordinary(src_id, from, node.clone(), response)
                .await?;
        }
        Ok(())
    }

    /// Sends a request over a confirmed session, or queues it until the handshake with
    /// the node completes. Only the first queued request starts a handshake.
    pub(crate) async fn dispatch_request(
        &self,
        request: PendingRequest,
    ) -> Result<(), DiscoveryError> {
        let node = request.node.clone();
        let node_id = node.node_id();
        let addr = node.udp_addr();

        let session = self.sessions.get_session(&node_id, &addr).map(|session| {
            let session = session.lock();
            (session.is_confirmed(), session.role())
        });

        let start_handshake = match session {
            Some((true, _)) => {
                let payload = request.message.encode();
                if !self.requests.add_pending_request(request) {
                    trace!(to = %node, "Request id already in flight");
                    return Ok(());
                }
                return self.send_ordinary(node_id, addr, Some(node), payload).await;
            }
            // we challenged the node, its handshake flushes the queue
            Some((false, SessionRole::Recipient)) => false,
            // our handshake is out and waits for the first reply, unless whatever it
            // carried is already gone
            Some((false, SessionRole::Initiator)) => {
                !self.requests.has_cached_requests_for(&node_id)
                    && !self.requests.has_pending_requests_for(&node_id)
            }
            None => !self.requests.has_cached_requests_for(&node_id),
        };
        self.requests.add_cached_request(request);
        if start_handshake {
            return self.send_random(node).await;
        }

        // the session may have been confirmed while we queued, after its flush ran
        let confirmed = self
            .sessions
            .get_session(&node_id, &addr)
            .is_some_and(|session| session.lock().is_confirmed());
        if confirmed {
            for request in self.requests.take_cached_requests_for(&node_id) {
                let (node, payload) = (request.node.clone(), request.message.encode());
                if self.requests.promote(request) {
                    self.send_ordinary(node_id, node.udp_addr(), Some(node), payload)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Promotes requests queued behind a handshake and sends them over the new session.
    async fn flush_requests(&self, requests: Vec<PendingRequest>) {
        for request in requests {
            let node = request.node.clone();
            if let Err(err) = self.dispatch_request(request).await {
                trace!(to = %node, err = %err, "Failed to send queued request");
            }
        }
    }

    /// Sends `payload` encrypted with the established session for (`dest_id`, `addr`).
    pub(crate) async fn send_ordinary(
        &self,
        dest_id: H256,
        addr: SocketAddr,
        node: Option<Node>,
        payload: Vec<u8>,
    ) -> Result<(), DiscoveryError> {
        let session = self
            .sessions
            .get_session(&dest_id, &addr)
            .ok_or(SessionError::NotEstablished)?;
        let (packet, nonce) = {
            let mut session = session.lock();
            let nonce = session.next_nonce(&mut OsRng);
            let header = PacketHeader::new(
                nonce,
                AuthData::Ordinary {
                    src_id: self.local_node.node_id(),
                },
            )?;
            let masking_iv = random_masking_iv(&mut OsRng);
            let ciphertext =
                session.encrypt_message(&nonce, &payload, &message_ad(&masking_iv, &header))?;
            (Packet::new(masking_iv, header, ciphertext), nonce)
        };

        // a WHOAREYOU for it can be handled before the send returns
        if let Some(node) = node {
            self.remember_outbound(nonce, node, Some(payload));
        }
        self.send_packet(&packet, &dest_id, addr).await
    }

    /// Ordinary packet with random content, answered with a WHOAREYOU by the receiver.
    async fn send_random(&self, node: Node) -> Result<(), DiscoveryError> {
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let packet = Packet::random(self.local_node.node_id(), nonce, &mut OsRng)?;
        let (dest_id, addr) = (node.node_id(), node.udp_addr());
        self.remember_outbound(nonce, node, None);
        self.send_packet(&packet, &dest_id, addr).await
    }

    /// Sends a WhoAreYou challenge packet in response to an undecryptable message.
    /// See: https://github.com/ethereum/devp2p/blob/master/discv5/discv5-wire.md#whoareyou-packet-flag--1
    pub(crate) async fn send_who_are_you(
        &self,
        nonce: Nonce,
        src_id: H256,
        addr: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        // rate limit per endpoint, WHOAREYOU can be abused for amplification
        let now = Instant::now();
        if let Some(last_sent) = self.whoareyou_rate_limit.get(&addr)
            && now.duration_since(*last_sent) < self.config.whoareyou_rate_limit
        {
            trace!(to = %addr, "Rate limiting WHOAREYOU packet");
            return Ok(());
        }
        self.whoareyou_rate_limit.insert(addr, now);

        // the record seq we know for the sender, 0 if unknown
        let enr_seq = self
            .routing_table
            .get_record(&src_id)
            .map_or(0, |record| record.seq);
        let mut id_nonce = [0u8; 16];
        OsRng.fill_bytes(&mut id_nonce);

        let header = PacketHeader::new(
            nonce,
            AuthData::WhoAreYou(WhoAreYouAuthData { id_nonce, enr_seq }),
        )?;
        let packet = Packet::new(random_masking_iv(&mut OsRng), header, Vec::new());

        // store the challenge before sending so a fast handshake finds it
        let session = self
            .sessions
            .create_session(SessionRole::Recipient, src_id, addr);
        session.lock().set_challenge_data(packet.message_ad());

        self.send_packet(&packet, &src_id, addr).await
    }

    /// Encodes and sends a packet over UDP.
    async fn send_packet(
        &self,
        packet: &Packet,
        dest_id: &H256,
        addr: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let encoded = packet.encode(dest_id)?;
        self.udp_socket.send_to(&encoded, addr).await?;
        trace!(to = %dest_id, %addr, flag = ?packet.header.flag, "Sent packet");
        Ok(())
    }

    fn remember_outbound(&self, nonce: Nonce, node: Node, payload: Option<Vec<u8>>) {
        self.outbound.insert(
            nonce,
            OutboundPacket {
                node,
                payload,
                sent_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Discv5Config,
        messages::{Message, PingMessage},
        messages::PongMessage,
        packet::PacketFlag,
        session::{Session, SessionState},
        types::NodeRecord,
    };
    use bytes::Bytes;
    use secp256k1::SecretKey;
    use std::{
        net::{IpAddr, Ipv4Addr},
        time::Duration,
    };
    use tokio::net::UdpSocket;

    async fn test_server() -> Discv5Server {
        let config = Discv5Config {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: 0,
            ..Default::default()
        };
        let (server, _follow_ups) = Discv5Server::new(config, SecretKey::new(&mut OsRng))
            .await
            .unwrap();
        server
    }

    /// A peer we can point packets at, backed by a plain socket.
    async fn peer() -> (UdpSocket, Node, SecretKey) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let signer = SecretKey::new(&mut OsRng);
        let node = Node::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            socket.local_addr().unwrap().port(),
            0,
            crate::utils::public_key_from_signing_key(&signer),
        );
        (socket, node, signer)
    }

    #[tokio::test]
    async fn test_whoareyou_rate_limiting() {
        let server = test_server().await;
        let (socket, node, _) = peer().await;
        let addr = node.udp_addr();

        server
            .send_who_are_you([1; 12], node.node_id(), addr)
            .await
            .unwrap();
        assert!(server.whoareyou_rate_limit.contains_key(&addr));
        let first_challenge = server
            .sessions
            .get_session(&node.node_id(), &addr)
            .unwrap()
            .lock()
            .challenge_data()
            .map(<[u8]>::to_vec);

        // second one within the window is dropped and keeps the first challenge
        server
            .send_who_are_you([2; 12], node.node_id(), addr)
            .await
            .unwrap();
        let second_challenge = server
            .sessions
            .get_session(&node.node_id(), &addr)
            .unwrap()
            .lock()
            .challenge_data()
            .map(<[u8]>::to_vec);
        assert_eq!(first_challenge, second_challenge);

        // only one datagram reached the peer and it decodes as a WHOAREYOU for our nonce
        let mut buf = [0u8; 1280];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        let packet = Packet::decode(&node.node_id(), &buf[..len]).unwrap();
        assert_eq!(packet.header.flag, PacketFlag::WhoAreYou);
        assert_eq!(packet.header.nonce, [1; 12]);
        assert_eq!(Some(packet.message_ad()), first_challenge);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), socket.recv_from(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn request_without_session_is_cached_and_starts_one_handshake() {
        let server = test_server().await;
        let (socket, node, _) = peer().await;

        for id in 1..=2u8 {
            let ping = Message::Ping(PingMessage {
                req_id: Bytes::copy_from_slice(&[id]),
                enr_seq: 1,
            });
            server.send_request(&node, ping, None).await.unwrap();
        }
        assert_eq!(server.requests.cached_len(), 2);
        assert_eq!(server.requests.pending_len(), 0);
        assert_eq!(server.outbound.len(), 1);

        let mut buf = [0u8; 1280];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        let packet = Packet::decode(&node.node_id(), &buf[..len]).unwrap();
        assert_eq!(
            packet.header.authdata,
            AuthData::Ordinary {
                src_id: server.local_node.node_id()
            }
        );
        assert!(server.outbound.contains_key(&packet.header.nonce));
    }

    #[tokio::test]
    async fn ordinary_without_session_gets_challenged() {
        let server = test_server().await;
        let (socket, node, _) = peer().await;

        let random = Packet::random(node.node_id(), [7; 12], &mut OsRng).unwrap();
        server
            .handle_packet(random, node.udp_addr())
            .await
            .unwrap();

        let session = server
            .sessions
            .get_session(&node.node_id(), &node.udp_addr())
            .unwrap();
        assert_eq!(session.lock().role(), SessionRole::Recipient);
        assert!(matches!(
            session.lock().state(),
            SessionState::ChallengePending { .. }
        ));

        let mut buf = [0u8; 1280];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        let packet = Packet::decode(&node.node_id(), &buf[..len]).unwrap();
        let AuthData::WhoAreYou(who_are_you) = &packet.header.authdata else {
            panic!("expected WHOAREYOU");
        };
        // we don't know the sender's record yet
        assert_eq!(who_are_you.enr_seq, 0);
        assert_eq!(packet.header.nonce, [7; 12]);
    }

    #[tokio::test]
    async fn unexpected_whoareyou_and_handshake_are_ignored() {
        let server = test_server().await;
        let (_socket, node, signer) = peer().await;

        let header = PacketHeader::new(
            [9; 12],
            AuthData::WhoAreYou(WhoAreYouAuthData {
                id_nonce: [0; 16],
                enr_seq: 0,
            }),
        )
        .unwrap();
        let who_are_you = Packet::new([0; 16], header, Vec::new());
        server
            .handle_packet(who_are_you, node.udp_addr())
            .await
            .unwrap();
        assert!(server.sessions.is_empty());

        let record = NodeRecord::from_node(&node, 1, &signer).unwrap();
        let header = PacketHeader::new(
            [3; 12],
            AuthData::Handshake(HandshakeAuthData {
                src_id: node.node_id(),
                id_signature: vec![0; 64],
                eph_pubkey: vec![2; 33],
                record: Some(record),
            }),
        )
        .unwrap();
        let handshake = Packet::new([0; 16], header, vec![0; 32]);
        server
            .handle_packet(handshake, node.udp_addr())
            .await
            .unwrap();
        assert!(server.routing_table.is_empty());
    }

    fn ping(req_id: u8) -> Message {
        Message::Ping(PingMessage {
            req_id: Bytes::copy_from_slice(&[req_id]),
            enr_seq: 1,
        })
    }

    async fn recv_packet(socket: &UdpSocket, local_id: &H256) -> Packet {
        let mut buf = [0u8; 1280];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        Packet::decode(local_id, &buf[..len]).unwrap()
    }

    async fn assert_silent(socket: &UdpSocket) {
        let mut buf = [0u8; 1280];
        assert!(
            tokio::time::timeout(Duration::from_millis(100), socket.recv_from(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cached_requests_wait_for_the_first_reply_after_handshake() {
        let server = test_server().await;
        let server_id = server.local_node.node_id();
        let (socket, node, signer) = peer().await;
        let peer_id = node.node_id();
        let from = node.udp_addr();

        server.send_request(&node, ping(1), None).await.unwrap();
        server.send_request(&node, ping(2), None).await.unwrap();
        let random = recv_packet(&socket, &peer_id).await;

        // answer the random packet with a challenge
        let header = PacketHeader::new(
            random.header.nonce,
            AuthData::WhoAreYou(WhoAreYouAuthData {
                id_nonce: [5; 16],
                enr_seq: 0,
            }),
        )
        .unwrap();
        let who_are_you = Packet::new(random_masking_iv(&mut OsRng), header, Vec::new());
        let mut peer_session = Session::new(
            SessionRole::Recipient,
            peer_id,
            signer,
            SecretKey::new(&mut OsRng),
        );
        peer_session.set_challenge_data(who_are_you.message_ad());
        server.handle_packet(who_are_you, from).await.unwrap();

        // only the oldest request rides in the handshake
        assert_eq!(server.requests.pending_len(), 1);
        assert_eq!(server.requests.cached_len(), 1);
        let handshake = recv_packet(&socket, &peer_id).await;
        assert_silent(&socket).await;
        let AuthData::Handshake(authdata) = &handshake.header.authdata else {
            panic!("expected handshake");
        };
        let eph_pubkey = PublicKey::from_slice(&authdata.eph_pubkey).unwrap();
        let plaintext = peer_session
            .decrypt_message_with_new_keys(
                &eph_pubkey,
                &server_id,
                &handshake.header.nonce,
                &handshake.message,
                &handshake.message_ad(),
            )
            .unwrap();
        assert_eq!(Message::decode(&plaintext).unwrap(), ping(1));
        let session = server.sessions.get_session(&peer_id, &from).unwrap();
        assert!(!session.lock().is_confirmed());

        // a new request keeps waiting too, no second handshake is started
        server.send_request(&node, ping(3), None).await.unwrap();
        assert_eq!(server.requests.cached_len(), 2);
        assert_silent(&socket).await;

        // the pong proves the peer holds the keys, the rest goes out as ordinary packets
        let nonce = peer_session.next_nonce(&mut OsRng);
        let header = PacketHeader::new(nonce, AuthData::Ordinary { src_id: peer_id }).unwrap();
        let masking_iv = random_masking_iv(&mut OsRng);
        let pong = Message::Pong(PongMessage {
            req_id: Bytes::from_static(&[1]),
            enr_seq: 1,
            recipient_ip: from.ip(),
            recipient_port: server.local_addr().unwrap().port(),
        });
        let ciphertext = peer_session
            .encrypt_message(&nonce, &pong.encode(), &message_ad(&masking_iv, &header))
            .unwrap();
        server
            .handle_packet(Packet::new(masking_iv, header, ciphertext), from)
            .await
            .unwrap();
        assert!(session.lock().is_confirmed());
        assert_eq!(server.requests.cached_len(), 0);

        let mut flushed = Vec::new();
        for _ in 0..2 {
            let packet = recv_packet(&socket, &peer_id).await;
            assert_eq!(packet.header.flag, PacketFlag::Ordinary);
            let plaintext = peer_session
                .decrypt_message(&packet.header.nonce, &packet.message, &packet.message_ad())
                .unwrap();
            flushed.push(Message::decode(&plaintext).unwrap());
        }
        flushed.sort_by_key(|message| message.req_id().clone());
        assert_eq!(flushed, vec![ping(2), ping(3)]);
    }

    #[tokio::test]
    async fn random_packet_is_tracked_when_the_challenge_arrives() {
        let server = test_server().await;
        let (socket, node, _) = peer().await;

        server.send_request(&node, ping(1), None).await.unwrap();
        let random = recv_packet(&socket, &node.node_id()).await;
        let outbound = server.outbound.get(&random.header.nonce).unwrap();
        assert_eq!(outbound.node, node);
        assert!(outbound.payload.is_none());
    }

    #[tokio::test]
    async fn lookup_stops_once_cancelled() {
        let server = test_server().await;
        let (socket, node, signer) = peer().await;
        let record = NodeRecord::from_node(&node, 1, &signer).unwrap();
        server.routing_table.update_from_record(record.clone());

        server.cancel_token.cancel();
        let found = tokio::time::timeout(
            Duration::from_millis(100),
            server.lookup(node.node_id()),
        )
        .await
        .unwrap();
        assert_eq!(found, vec![record]);
        assert_silent(&socket).await;
    }

    #[tokio::test]
    async fn cleanup_drops_stale_entries() {
        let mut server = test_server().await;
        server.config.request_timeout = Duration::from_millis(10);
        server.config.whoareyou_rate_limit = Duration::from_millis(10);
        let (_socket, node, _) = peer().await;

        server.remember_outbound([1; 12], node.clone(), None);
        server.whoareyou_rate_limit.insert(node.udp_addr(), Instant::now());
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.remember_outbound([2; 12], node, None);

        server.cleanup_stale_entries();
        assert_eq!(server.outbound.len(), 1);
        assert!(server.outbound.contains_key(&[2; 12]));
        assert!(server.whoareyou_rate_limit.is_empty());
    }
}
