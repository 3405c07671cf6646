use std::array::TryFromSliceError;

use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherError};
use alloy_rlp::{Decodable, Encodable, Error as RLPError};
use bytes::BufMut;
use ethereum_types::H256;
use rand::RngCore;

use crate::types::NodeRecord;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

// Max and min packet sizes as defined in
// https://github.com/ethereum/devp2p/blob/master/discv5/discv5-wire.md#udp-communication
pub const MIN_PACKET_SIZE: usize = 63;
pub const MAX_PACKET_SIZE: usize = 1280;
pub const MASKING_IV_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
/// protocol-id (6) || version (2) || flag (1) || nonce (12) || authdata-size (2)
pub const STATIC_HEADER_SIZE: usize = 23;
const PROTOCOL_ID: &[u8] = b"discv5";
const PROTOCOL_VERSION: u16 = 0x0001;
const ORDINARY_AUTHDATA_SIZE: usize = 32;
/// id-nonce (16) || enr-seq (8)
const WHOAREYOU_AUTHDATA_SIZE: usize = 24;
/// src-id (32) || sig-size (1) || eph-key-size (1)
const HANDSHAKE_AUTHDATA_HEAD: usize = 34;
/// Size of the random payload sent in place of a message when no session exists yet.
const RANDOM_PAYLOAD_SIZE: usize = 44;

pub type Nonce = [u8; NONCE_SIZE];
pub type MaskingIv = [u8; MASKING_IV_SIZE];

#[derive(Debug, thiserror::Error)]
pub enum PacketCodecError {
    #[error("RLP decoding error: {0}")]
    RLPDecodeError(#[from] RLPError),
    #[error("Invalid packet size: {0}")]
    InvalidSize(usize),
    #[error("Truncated header: authdata needs {needed} bytes, {available} available")]
    TruncatedHeader { needed: usize, available: usize },
    #[error("Invalid protocol: {0}")]
    InvalidProtocol(String),
    #[error("Unknown packet flag: {0}")]
    UnknownFlag(u8),
    #[error("Malformed authdata: {0}")]
    MalformedAuthData(&'static str),
    #[error("Stream cipher error: {0}")]
    CipherError(String),
    #[error("Message authentication failed")]
    DecryptionFailed,
    #[error("TryFromSliceError: {0}")]
    TryFromSliceError(#[from] TryFromSliceError),
    #[error("Io Error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<StreamCipherError> for PacketCodecError {
    fn from(error: StreamCipherError) -> Self {
        PacketCodecError::CipherError(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketFlag {
    Ordinary = 0x00,
    WhoAreYou = 0x01,
    Handshake = 0x02,
}

impl TryFrom<u8> for PacketFlag {
    type Error = PacketCodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketFlag::Ordinary),
            0x01 => Ok(PacketFlag::WhoAreYou),
            0x02 => Ok(PacketFlag::Handshake),
            other => Err(PacketCodecError::UnknownFlag(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAreYouAuthData {
    pub id_nonce: [u8; 16],
    /// Highest record seq the sender of the WHOAREYOU knows for us, 0 if none.
    pub enr_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAuthData {
    pub src_id: H256,
    pub id_signature: Vec<u8>,
    pub eph_pubkey: Vec<u8>,
    /// The record field may be omitted if the enr-seq of WHOAREYOU is recent enough, i.e. when it matches the current sequence number of the sending node.
    /// If enr-seq is zero, the record must be sent.
    pub record: Option<NodeRecord>,
}

/// Per packet type authdata, selected by the header flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthData {
    Ordinary { src_id: H256 },
    WhoAreYou(WhoAreYouAuthData),
    Handshake(HandshakeAuthData),
}

impl AuthData {
    pub fn flag(&self) -> PacketFlag {
        match self {
            AuthData::Ordinary { .. } => PacketFlag::Ordinary,
            AuthData::WhoAreYou(_) => PacketFlag::WhoAreYou,
            AuthData::Handshake(_) => PacketFlag::Handshake,
        }
    }

    /// The node that sent the packet, WHOAREYOU packets don't carry it.
    pub fn src_id(&self) -> Option<H256> {
        match self {
            AuthData::Ordinary { src_id } => Some(*src_id),
            AuthData::WhoAreYou(_) => None,
            AuthData::Handshake(handshake) => Some(handshake.src_id),
        }
    }

    pub fn encode(&self, buf: &mut dyn BufMut) -> Result<(), PacketCodecError> {
        match self {
            AuthData::Ordinary { src_id } => buf.put_slice(src_id.as_bytes()),
            AuthData::WhoAreYou(who_are_you) => {
                buf.put_slice(&who_are_you.id_nonce);
                buf.put_u64(who_are_you.enr_seq);
            }
            AuthData::Handshake(handshake) => {
                let sig_size: u8 = handshake
                    .id_signature
                    .len()
                    .try_into()
                    .map_err(|_| PacketCodecError::MalformedAuthData("id-signature too long"))?;
                let eph_key_size: u8 = handshake
                    .eph_pubkey
                    .len()
                    .try_into()
                    .map_err(|_| PacketCodecError::MalformedAuthData("ephemeral key too long"))?;

                buf.put_slice(handshake.src_id.as_bytes());
                buf.put_u8(sig_size);
                buf.put_u8(eph_key_size);
                buf.put_slice(&handshake.id_signature);
                buf.put_slice(&handshake.eph_pubkey);
                if let Some(record) = &handshake.record {
                    record.encode(buf);
                }
            }
        }
        Ok(())
    }

    pub fn decode(flag: PacketFlag, authdata: &[u8]) -> Result<AuthData, PacketCodecError> {
        match flag {
            PacketFlag::Ordinary => {
                if authdata.len() != ORDINARY_AUTHDATA_SIZE {
                    return Err(PacketCodecError::MalformedAuthData(
                        "ordinary authdata must be 32 bytes",
                    ));
                }
                Ok(AuthData::Ordinary {
                    src_id: H256::from_slice(authdata),
                })
            }
            PacketFlag::WhoAreYou => {
                if authdata.len() != WHOAREYOU_AUTHDATA_SIZE {
                    return Err(PacketCodecError::MalformedAuthData(
                        "whoareyou authdata must be 24 bytes",
                    ));
                }
                Ok(AuthData::WhoAreYou(WhoAreYouAuthData {
                    id_nonce: authdata[..16].try_into()?,
                    enr_seq: u64::from_be_bytes(authdata[16..].try_into()?),
                }))
            }
            PacketFlag::Handshake => {
                if authdata.len() < HANDSHAKE_AUTHDATA_HEAD {
                    return Err(PacketCodecError::MalformedAuthData(
                        "handshake authdata too short",
                    ));
                }
                let src_id = H256::from_slice(&authdata[..32]);
                let sig_size = authdata[32] as usize;
                let eph_key_size = authdata[33] as usize;

                let eph_key_start = HANDSHAKE_AUTHDATA_HEAD + sig_size;
                let authdata_head = eph_key_start + eph_key_size;
                if authdata.len() < authdata_head {
                    return Err(PacketCodecError::MalformedAuthData(
                        "handshake key sizes exceed authdata",
                    ));
                }

                let mut record_bytes = &authdata[authdata_head..];
                let record = if record_bytes.is_empty() {
                    None
                } else {
                    Some(NodeRecord::decode(&mut record_bytes)?)
                };

                Ok(AuthData::Handshake(HandshakeAuthData {
                    src_id,
                    id_signature: authdata[HANDSHAKE_AUTHDATA_HEAD..eph_key_start].to_vec(),
                    eph_pubkey: authdata[eph_key_start..authdata_head].to_vec(),
                    record,
                }))
            }
        }
    }
}

/// Static header plus authdata, kept together with its plaintext encoding since both
/// the AEAD associated data and the WHOAREYOU challenge are computed over those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub flag: PacketFlag,
    pub nonce: Nonce,
    pub authdata: AuthData,
    encoded: Vec<u8>,
}

impl PacketHeader {
    pub fn new(nonce: Nonce, authdata: AuthData) -> Result<Self, PacketCodecError> {
        let mut encoded_authdata = Vec::new();
        authdata.encode(&mut encoded_authdata)?;
        let encoded = build_header(authdata.flag(), &encoded_authdata, &nonce)?;
        Ok(Self {
            flag: authdata.flag(),
            nonce,
            authdata,
            encoded,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    pub fn len(&self) -> usize {
        self.encoded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }
}

/// static-header || authdata, with authdata-size as a big-endian u16.
pub fn build_header(
    flag: PacketFlag,
    authdata: &[u8],
    nonce: &Nonce,
) -> Result<Vec<u8>, PacketCodecError> {
    let authdata_size =
        u16::try_from(authdata.len()).map_err(|_| PacketCodecError::InvalidSize(authdata.len()))?;

    let mut header = Vec::with_capacity(STATIC_HEADER_SIZE + authdata.len());
    header.put_slice(PROTOCOL_ID);
    header.put_u16(PROTOCOL_VERSION);
    header.put_u8(flag as u8);
    header.put_slice(nonce);
    header.put_u16(authdata_size);
    header.put_slice(authdata);
    Ok(header)
}

/// Parses an unmasked header. Trailing bytes past the authdata are ignored.
pub fn parse_header(bytes: &[u8]) -> Result<PacketHeader, PacketCodecError> {
    if bytes.len() < STATIC_HEADER_SIZE {
        return Err(PacketCodecError::TruncatedHeader {
            needed: STATIC_HEADER_SIZE,
            available: bytes.len(),
        });
    }
    check_protocol(&bytes[..STATIC_HEADER_SIZE])?;

    let flag = PacketFlag::try_from(bytes[8])?;
    let nonce: Nonce = bytes[9..21].try_into()?;
    let authdata_size = u16::from_be_bytes(bytes[21..23].try_into()?) as usize;
    let header_end = STATIC_HEADER_SIZE + authdata_size;
    if bytes.len() < header_end {
        return Err(PacketCodecError::TruncatedHeader {
            needed: authdata_size,
            available: bytes.len() - STATIC_HEADER_SIZE,
        });
    }

    let authdata = AuthData::decode(flag, &bytes[STATIC_HEADER_SIZE..header_end])?;
    Ok(PacketHeader {
        flag,
        nonce,
        authdata,
        encoded: bytes[..header_end].to_vec(),
    })
}

fn check_protocol(static_header: &[u8]) -> Result<(), PacketCodecError> {
    // static-header = protocol-id || version || flag || nonce || authdata-size
    let protocol_id = &static_header[..6];
    let version = u16::from_be_bytes(static_header[6..8].try_into()?);
    if protocol_id != PROTOCOL_ID || version != PROTOCOL_VERSION {
        return Err(PacketCodecError::InvalidProtocol(
            match std::str::from_utf8(protocol_id) {
                Ok(result) => format!("{result} v{version}"),
                Err(_) => format!("{protocol_id:?} v{version}"),
            },
        ));
    }
    Ok(())
}

fn header_cipher(node_id: &H256, masking_iv: &MaskingIv) -> Aes128Ctr {
    Aes128Ctr::new(node_id[..16].into(), masking_iv[..].into())
}

/// AES-128-CTR over `header`, keyed by the first 16 bytes of the destination id.
pub fn mask(
    dest_id: &H256,
    masking_iv: &MaskingIv,
    header: &[u8],
) -> Result<Vec<u8>, PacketCodecError> {
    let mut masked = header.to_vec();
    header_cipher(dest_id, masking_iv).try_apply_keystream(&mut masked)?;
    Ok(masked)
}

/// Inverse of [`mask`], only the local id is needed since packets are masked for their receiver.
pub fn unmask(
    local_id: &H256,
    masking_iv: &MaskingIv,
    masked: &[u8],
) -> Result<Vec<u8>, PacketCodecError> {
    mask(local_id, masking_iv, masked)
}

pub fn random_masking_iv<R: RngCore + ?Sized>(rng: &mut R) -> MaskingIv {
    let mut masking_iv = [0u8; MASKING_IV_SIZE];
    rng.fill_bytes(&mut masking_iv);
    masking_iv
}

/// masking-iv || masked-header || message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub masking_iv: MaskingIv,
    pub header: PacketHeader,
    /// AES-GCM ciphertext and tag, empty for WHOAREYOU.
    pub message: Vec<u8>,
}

impl Packet {
    pub fn new(masking_iv: MaskingIv, header: PacketHeader, message: Vec<u8>) -> Self {
        Self {
            masking_iv,
            header,
            message,
        }
    }

    /// An ordinary packet carrying random bytes instead of a message, used to provoke a
    /// WHOAREYOU from a node we have no session with.
    pub fn random<R: RngCore + ?Sized>(
        src_id: H256,
        nonce: Nonce,
        rng: &mut R,
    ) -> Result<Self, PacketCodecError> {
        let header = PacketHeader::new(nonce, AuthData::Ordinary { src_id })?;
        let mut message = vec![0u8; RANDOM_PAYLOAD_SIZE];
        rng.fill_bytes(&mut message);
        Ok(Self::new(random_masking_iv(rng), header, message))
    }

    /// Decodes a datagram addressed to `local_id`. The size bounds are checked before
    /// anything else is touched.
    pub fn decode(local_id: &H256, datagram: &[u8]) -> Result<Packet, PacketCodecError> {
        if datagram.len() < MIN_PACKET_SIZE || datagram.len() > MAX_PACKET_SIZE {
            return Err(PacketCodecError::InvalidSize(datagram.len()));
        }

        let masking_iv: MaskingIv = datagram[..MASKING_IV_SIZE].try_into()?;
        let mut cipher = header_cipher(local_id, &masking_iv);

        let static_header_end = MASKING_IV_SIZE + STATIC_HEADER_SIZE;
        let mut header = datagram[MASKING_IV_SIZE..static_header_end].to_vec();
        cipher.try_apply_keystream(&mut header)?;
        check_protocol(&header)?;

        let authdata_size = u16::from_be_bytes(header[21..23].try_into()?) as usize;
        let header_end = static_header_end + authdata_size;
        if header_end > datagram.len() {
            return Err(PacketCodecError::TruncatedHeader {
                needed: authdata_size,
                available: datagram.len() - static_header_end,
            });
        }

        // the keystream continues where the static header ended
        let mut authdata = datagram[static_header_end..header_end].to_vec();
        cipher.try_apply_keystream(&mut authdata)?;
        header.extend_from_slice(&authdata);

        let header = parse_header(&header)?;
        Ok(Packet {
            masking_iv,
            header,
            message: datagram[header_end..].to_vec(),
        })
    }

    pub fn encode(&self, dest_id: &H256) -> Result<Vec<u8>, PacketCodecError> {
        let mut buf =
            Vec::with_capacity(MASKING_IV_SIZE + self.header.len() + self.message.len());
        buf.put_slice(&self.masking_iv);
        buf.put_slice(&mask(dest_id, &self.masking_iv, self.header.as_bytes())?);
        buf.put_slice(&self.message);
        if buf.len() > MAX_PACKET_SIZE {
            return Err(PacketCodecError::InvalidSize(buf.len()));
        }
        Ok(buf)
    }

    /// message-ad = masking-iv || header. For WHOAREYOU packets this is the challenge data.
    pub fn message_ad(&self) -> Vec<u8> {
        message_ad(&self.masking_iv, &self.header)
    }

    pub fn src_id(&self) -> Option<H256> {
        self.header.authdata.src_id()
    }
}

pub fn message_ad(masking_iv: &MaskingIv, header: &PacketHeader) -> Vec<u8> {
    let mut ad = Vec::with_capacity(MASKING_IV_SIZE + header.len());
    ad.extend_from_slice(masking_iv);
    ad.extend_from_slice(header.as_bytes());
    ad
}
