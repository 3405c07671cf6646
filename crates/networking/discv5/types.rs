use alloy_rlp::{Decodable, Encodable, Error as RLPError, Header};
use bytes::{BufMut, Bytes};
use ethereum_types::{H256, H512};
use secp256k1::{Message as SecpMessage, PublicKey, SECP256K1, SecretKey, ecdsa::Signature};
use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
    sync::OnceLock,
};
use thiserror::Error;

use crate::{
    base64, rlp,
    utils::{keccak, node_id},
};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("RLP decode error: {0}")]
    RLPDecodeError(#[from] RLPError),
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Signature error: {0}")]
    SignatureError(String),
}

/// Records bigger than this are rejected, see https://github.com/ethereum/devp2p/blob/master/enr.md#rlp-encoding
pub const MAX_NODE_RECORD_ENCODED_SIZE: usize = 300;
const IDENTITY_SCHEME: &str = "v4";

#[derive(Debug, Clone)]
pub struct Node {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub public_key: H512,
    node_id: OnceLock<H256>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
            && self.udp_port == other.udp_port
            && self.tcp_port == other.tcp_port
            && self.public_key == other.public_key
    }
}

impl Eq for Node {}

impl FromStr for Node {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let record = NodeRecord::from_str(s)?;
        Node::from_enr(&record)
    }
}

impl Node {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16, public_key: H512) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
            public_key,
            node_id: OnceLock::new(),
        }
    }

    pub fn from_enr(record: &NodeRecord) -> Result<Self, NodeError> {
        let pairs = record.decode_pairs();

        let ip: IpAddr = match (pairs.ip, pairs.ip6) {
            (None, None) => {
                return Err(NodeError::MissingField(
                    "Ip not found in record, can't construct node".into(),
                ));
            }
            (None, Some(ipv6)) => IpAddr::from(ipv6),
            (Some(ipv4), _) => IpAddr::from(ipv4),
        };

        // both udp and tcp can be defined in the pairs or only one
        // in the latter case, we have to default both ports to the one provided
        let udp_port = pairs
            .udp_port
            .or(pairs.tcp_port)
            .ok_or(NodeError::MissingField("No port found in record".into()))?;
        let tcp_port = pairs.tcp_port.unwrap_or(udp_port);

        let node = Self::new(ip, udp_port, tcp_port, record.public_key);
        // the record already derived it
        let _ = node.node_id.set(record.node_id);
        Ok(node)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.udp_port)
    }

    pub fn node_id(&self) -> H256 {
        *self.node_id.get_or_init(|| node_id(&self.public_key))
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:#x}({})", self.node_id(), self.udp_addr())
    }
}

/// Typed view over the well known ENR keys.
/// Reference: [ENR records](https://github.com/ethereum/devp2p/blob/master/enr.md)
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct NodeRecordPairs {
    /// The ID of the identity scheme: https://github.com/ethereum/devp2p/blob/master/enr.md#v4-identity-scheme
    /// This is always "v4".
    pub id: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub ip6: Option<Ipv6Addr>,
    // ports are encoded as 2 byte big-endian integers, see geth:
    // https://github.com/ethereum/go-ethereum/blob/f544fc3b4659aeca24a6de83f820dd61ea9b39db/p2p/enr/entries.go#L60-L78
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    /// Compressed secp256k1 public key.
    pub secp256k1: Option<[u8; 33]>,
}

impl NodeRecordPairs {
    /// Decodes the known keys, ignoring unknown ones and malformed values.
    pub fn from_raw_pairs(pairs: &[(Bytes, Bytes)]) -> NodeRecordPairs {
        let mut decoded_pairs = NodeRecordPairs::default();
        for (key, value) in pairs {
            let mut value = value.as_ref();
            match key.as_ref() {
                b"id" => decoded_pairs.id = String::decode(&mut value).ok(),
                b"ip" => decoded_pairs.ip = decode_ip::<4>(value).map(Ipv4Addr::from),
                b"ip6" => decoded_pairs.ip6 = decode_ip::<16>(value).map(Ipv6Addr::from),
                b"tcp" => decoded_pairs.tcp_port = u16::decode(&mut value).ok(),
                b"udp" => decoded_pairs.udp_port = u16::decode(&mut value).ok(),
                b"secp256k1" => decoded_pairs.secp256k1 = <[u8; 33]>::decode(&mut value).ok(),
                // Key is some random bytes sequence which we don't care
                _ => {}
            }
        }
        decoded_pairs
    }

    /// Encodes to a list of (key, value) sorted by key, where values are rlp encoded bytes.
    pub fn into_raw_pairs(self) -> Vec<(Bytes, Bytes)> {
        let mut pairs = Vec::new();
        if let Some(id) = &self.id {
            pairs.push(raw_pair("id", alloy_rlp::encode(id)));
        }
        if let Some(ip) = self.ip {
            pairs.push(raw_pair("ip", rlp::encode_item(&ip.octets())));
        }
        if let Some(ip6) = self.ip6 {
            pairs.push(raw_pair("ip6", rlp::encode_item(&ip6.octets())));
        }
        if let Some(secp256k1) = &self.secp256k1 {
            pairs.push(raw_pair("secp256k1", rlp::encode_item(secp256k1)));
        }
        if let Some(tcp) = self.tcp_port {
            pairs.push(raw_pair("tcp", alloy_rlp::encode(tcp)));
        }
        if let Some(udp) = self.udp_port {
            pairs.push(raw_pair("udp", alloy_rlp::encode(udp)));
        }
        pairs
    }
}

fn raw_pair(key: &'static str, value: Vec<u8>) -> (Bytes, Bytes) {
    (Bytes::from_static(key.as_bytes()), Bytes::from(value))
}

fn decode_ip<const N: usize>(mut value: &[u8]) -> Option<[u8; N]> {
    let octets = Bytes::decode(&mut value).ok()?;
    octets.as_ref().try_into().ok()
}

/// Reference: [ENR records](https://github.com/ethereum/devp2p/blob/master/enr.md#record-structure)
///
/// The key/value pairs are kept exactly as received so that records relayed in NODES
/// responses keep a valid signature even when they carry keys we don't understand.
#[derive(Debug, PartialEq, Clone, Eq)]
pub struct NodeRecord {
    pub signature: H512,
    pub seq: u64,
    /// Sorted (key, rlp-encoded value) pairs.
    pairs: Vec<(Bytes, Bytes)>,
    node_id: H256,
    public_key: H512,
}

impl NodeRecord {
    /// Builds and signs a record out of the given pairs. The identity scheme and
    /// public key are always taken from `signer`.
    pub fn new(seq: u64, pairs: NodeRecordPairs, signer: &SecretKey) -> Result<Self, NodeError> {
        let pairs = NodeRecordPairs {
            id: Some(IDENTITY_SCHEME.to_string()),
            secp256k1: Some(PublicKey::from_secret_key(SECP256K1, signer).serialize()),
            ..pairs
        };
        let mut record = Self::from_parts(H512::zero(), seq, pairs.into_raw_pairs())?;
        record.signature = record.sign_record(signer)?;
        Ok(record)
    }

    pub fn from_node(node: &Node, seq: u64, signer: &SecretKey) -> Result<Self, NodeError> {
        let mut pairs = NodeRecordPairs {
            tcp_port: Some(node.tcp_port),
            udp_port: Some(node.udp_port),
            ..Default::default()
        };
        match node.ip.to_canonical() {
            IpAddr::V4(ip) => pairs.ip = Some(ip),
            IpAddr::V6(ip) => pairs.ip6 = Some(ip),
        }
        Self::new(seq, pairs, signer)
    }

    /// Validates the identity scheme and derives the node id. The signature is not checked here.
    fn from_parts(signature: H512, seq: u64, pairs: Vec<(Bytes, Bytes)>) -> Result<Self, NodeError> {
        if pairs.windows(2).any(|window| window[0].0 >= window[1].0) {
            return Err(NodeError::InvalidFormat(
                "record keys must be sorted and unique".into(),
            ));
        }
        let decoded = NodeRecordPairs::from_raw_pairs(&pairs);
        if decoded.id.as_deref() != Some(IDENTITY_SCHEME) {
            return Err(NodeError::InvalidFormat(
                "Invalid node record, unsupported identity scheme".into(),
            ));
        }
        let compressed = decoded
            .secp256k1
            .ok_or(NodeError::MissingField("secp256k1".into()))?;
        let public_key = PublicKey::from_slice(&compressed)
            .map_err(|_| NodeError::ParseError("Invalid secp256k1 public key".into()))?;
        let public_key = H512::from_slice(&public_key.serialize_uncompressed()[1..]);

        Ok(Self {
            signature,
            seq,
            pairs,
            node_id: node_id(&public_key),
            public_key,
        })
    }

    /// Returns a copy with `seq + 1` and the given pairs, signed again.
    pub fn update(&self, pairs: NodeRecordPairs, signer: &SecretKey) -> Result<Self, NodeError> {
        Self::new(self.seq + 1, pairs, signer)
    }

    pub fn node_id(&self) -> H256 {
        self.node_id
    }

    pub fn public_key(&self) -> H512 {
        self.public_key
    }

    /// Raw rlp encoded value stored under `key`.
    pub fn get_entry(&self, key: &[u8]) -> Option<&Bytes> {
        self.pairs
            .binary_search_by(|(k, _)| k.as_ref().cmp(key))
            .ok()
            .map(|idx| &self.pairs[idx].1)
    }

    pub fn decode_pairs(&self) -> NodeRecordPairs {
        NodeRecordPairs::from_raw_pairs(&self.pairs)
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        Node::from_enr(self).ok().map(|node| node.udp_addr())
    }

    fn sign_record(&self, signer: &SecretKey) -> Result<H512, NodeError> {
        let digest = self.get_signature_digest();
        let msg = SecpMessage::from_digest_slice(&digest)
            .map_err(|_| NodeError::SignatureError("Invalid message digest".into()))?;
        let signature = SECP256K1.sign_ecdsa(&msg, signer);
        Ok(H512(signature.serialize_compact()))
    }

    /// keccak256(rlp([seq, k, v, ...]))
    pub fn get_signature_digest(&self) -> [u8; 32] {
        let mut content = Vec::new();
        let payload_length = self.seq.length() + self.pairs_length();
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut content);
        self.seq.encode(&mut content);
        self.encode_pairs(&mut content);
        keccak(&content)
    }

    /// Verifies the ENR signature using the embedded public key.
    /// Returns true if the signature is valid, false otherwise.
    pub fn verify_signature(&self) -> bool {
        let Some(pubkey) = crate::utils::public_key_from_h512(&self.public_key) else {
            return false;
        };
        let digest = self.get_signature_digest();
        let Ok(message) = SecpMessage::from_digest_slice(&digest) else {
            return false;
        };
        let Ok(signature) = Signature::from_compact(self.signature.as_bytes()) else {
            return false;
        };
        SECP256K1.verify_ecdsa(&message, &signature, &pubkey).is_ok()
    }

    pub fn enr_url(&self) -> String {
        format!("enr:{}", base64::encode(&alloy_rlp::encode(self)))
    }

    pub fn from_enr_url(enr: &str) -> Result<Self, NodeError> {
        let Some(encoded) = enr.strip_prefix("enr:") else {
            return Err(NodeError::InvalidFormat("missing `enr:` prefix".into()));
        };
        let decoded = base64::decode(encoded.as_bytes())
            .ok_or(NodeError::ParseError("Invalid base64 in enr".into()))?;
        Ok(NodeRecord::decode(&mut decoded.as_slice())?)
    }

    fn pairs_length(&self) -> usize {
        self.pairs
            .iter()
            .map(|(key, value)| key.length() + value.len())
            .sum()
    }

    fn encode_pairs(&self, out: &mut dyn BufMut) {
        for (key, value) in &self.pairs {
            key.encode(out);
            out.put_slice(value);
        }
    }

    fn payload_length(&self) -> usize {
        self.signature.0.length() + self.seq.length() + self.pairs_length()
    }
}

impl FromStr for NodeRecord {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_enr_url(s.trim())
    }
}

impl Encodable for NodeRecord {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.signature.0.encode(out);
        self.seq.encode(out);
        self.encode_pairs(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        alloy_rlp::length_of_length(payload_length) + payload_length
    }
}

impl Decodable for NodeRecord {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let start_len = buf.len();
        let mut payload = rlp::list_payload(buf)?;
        if start_len - buf.len() > MAX_NODE_RECORD_ENCODED_SIZE {
            return Err(RLPError::Custom("node record too large"));
        }
        let signature = <[u8; 64]>::decode(&mut payload)?;
        let seq = u64::decode(&mut payload)?;

        // The NodeRecord optional fields are encoded as key/value pairs, each value is kept
        // with its rlp prefix so it can be decoded as T::decode(value)
        let mut pairs = Vec::new();
        while !payload.is_empty() {
            let key = Bytes::decode(&mut payload)?;
            let value = rlp::split_item(&mut payload)?;
            pairs.push((key, Bytes::copy_from_slice(value)));
        }

        NodeRecord::from_parts(H512(signature), seq, pairs)
            .map_err(|_| RLPError::Custom("invalid node record"))
    }
}
