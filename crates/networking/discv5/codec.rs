use crate::packet::{Packet, PacketCodecError};

use bytes::BytesMut;
use ethereum_types::H256;
use tokio_util::codec::Decoder;

/// Receive side framing for `UdpFramed`: every datagram is one packet masked for us.
/// Sending goes straight through the socket since each packet needs its destination id.
#[derive(Debug)]
pub struct Discv5Codec {
    local_node_id: H256,
}

impl Discv5Codec {
    pub fn new(local_node_id: H256) -> Self {
        Self { local_node_id }
    }
}

impl Decoder for Discv5Codec {
    type Item = Packet;
    type Error = PacketCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !buf.is_empty() {
            Ok(Some(Packet::decode(
                &self.local_node_id,
                &buf.split_to(buf.len()),
            )?))
        } else {
            Ok(None)
        }
    }
}
