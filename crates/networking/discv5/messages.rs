use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use alloy_rlp::{
    Decodable, Encodable, Error as RLPError, Header, RlpDecodable, RlpEncodable,
};
use bytes::{BufMut, Bytes};
use rand::RngCore;

use crate::{rlp, types::NodeRecord};

/// Request ids are opaque byte strings of at most 8 bytes.
pub type RequestId = Bytes;
pub const MAX_REQUEST_ID_SIZE: usize = 8;

pub fn random_request_id<R: RngCore + ?Sized>(rng: &mut R) -> RequestId {
    let mut req_id = [0u8; MAX_REQUEST_ID_SIZE];
    rng.fill_bytes(&mut req_id);
    Bytes::copy_from_slice(&req_id)
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    Ping(PingMessage),
    Pong(PongMessage),
    FindNode(FindNodeMessage),
    Nodes(NodesMessage),
    TalkReq(TalkReqMessage),
    TalkRes(TalkResMessage),
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Ping(_) => 0x01,
            Message::Pong(_) => 0x02,
            Message::FindNode(_) => 0x03,
            Message::Nodes(_) => 0x04,
            Message::TalkReq(_) => 0x05,
            Message::TalkRes(_) => 0x06,
        }
    }

    pub fn req_id(&self) -> &RequestId {
        match self {
            Message::Ping(msg) => &msg.req_id,
            Message::Pong(msg) => &msg.req_id,
            Message::FindNode(msg) => &msg.req_id,
            Message::Nodes(msg) => &msg.req_id,
            Message::TalkReq(msg) => &msg.req_id,
            Message::TalkRes(msg) => &msg.req_id,
        }
    }

    /// Requests expect an answer, the rest are responses.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::Ping(_) | Message::FindNode(_) | Message::TalkReq(_)
        )
    }

    /// message-pt = message-type || rlp(message-data)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.msg_type()];
        match self {
            Message::Ping(ping) => ping.encode(&mut buf),
            Message::Pong(pong) => pong.encode(&mut buf),
            Message::FindNode(find_node) => find_node.encode(&mut buf),
            Message::Nodes(nodes) => nodes.encode(&mut buf),
            Message::TalkReq(talk_req) => talk_req.encode(&mut buf),
            Message::TalkRes(talk_res) => talk_res.encode(&mut buf),
        }
        buf
    }

    pub fn decode(plaintext: &[u8]) -> Result<Message, RLPError> {
        let Some((message_type, mut data)) = plaintext.split_first() else {
            return Err(RLPError::InputTooShort);
        };
        let message = match message_type {
            0x01 => Message::Ping(PingMessage::decode(&mut data)?),
            0x02 => Message::Pong(PongMessage::decode(&mut data)?),
            0x03 => Message::FindNode(FindNodeMessage::decode(&mut data)?),
            0x04 => Message::Nodes(NodesMessage::decode(&mut data)?),
            0x05 => Message::TalkReq(TalkReqMessage::decode(&mut data)?),
            0x06 => Message::TalkRes(TalkResMessage::decode(&mut data)?),
            _ => return Err(RLPError::Custom("unknown message type")),
        };
        if message.req_id().len() > MAX_REQUEST_ID_SIZE {
            return Err(RLPError::Custom("request id longer than 8 bytes"));
        }
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct PingMessage {
    /// The request id of the sender.
    pub req_id: RequestId,
    /// The ENR sequence number of the sender.
    pub enr_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongMessage {
    pub req_id: RequestId,
    pub enr_seq: u64,
    /// Endpoint the PING was observed from.
    pub recipient_ip: IpAddr,
    pub recipient_port: u16,
}

impl PongMessage {
    fn ip_octets(&self) -> Vec<u8> {
        match self.recipient_ip {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        }
    }

    fn payload_length(&self) -> usize {
        self.req_id.length()
            + self.enr_seq.length()
            + self.ip_octets().as_slice().length()
            + self.recipient_port.length()
    }
}

impl Encodable for PongMessage {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.req_id.encode(out);
        self.enr_seq.encode(out);
        self.ip_octets().as_slice().encode(out);
        self.recipient_port.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        alloy_rlp::length_of_length(payload_length) + payload_length
    }
}

impl Decodable for PongMessage {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut payload = rlp::list_payload(buf)?;
        let req_id = Bytes::decode(&mut payload)?;
        let enr_seq = u64::decode(&mut payload)?;
        let ip = Bytes::decode(&mut payload)?;
        let recipient_ip = match ip.len() {
            4 => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(ip.as_ref()).map_err(
                |_| RLPError::Custom("invalid ipv4"),
            )?)),
            16 => IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(ip.as_ref()).map_err(
                |_| RLPError::Custom("invalid ipv6"),
            )?)),
            _ => return Err(RLPError::Custom("invalid recipient ip length")),
        };
        let recipient_port = u16::decode(&mut payload)?;
        if !payload.is_empty() {
            return Err(RLPError::ListLengthMismatch {
                expected: 0,
                got: payload.len(),
            });
        }
        Ok(Self {
            req_id,
            enr_seq,
            recipient_ip,
            recipient_port,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct FindNodeMessage {
    pub req_id: RequestId,
    /// Log distances, 0 asks for the responder's own record.
    pub distances: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct NodesMessage {
    pub req_id: RequestId,
    /// Number of NODES packets that make up the full response.
    pub total: u64,
    pub nodes: Vec<NodeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TalkReqMessage {
    pub req_id: RequestId,
    pub protocol: Bytes,
    pub request: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TalkResMessage {
    pub req_id: RequestId,
    pub response: Bytes,
}
