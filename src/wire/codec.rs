//! `UdpFramed` glue: frames raw datagrams into/out of [`Packet`]s. AEAD
//! sealing/opening of the message body is layered on top by `handshake.rs`
//! and the protocol event loop, since that needs per-session key state this
//! codec deliberately does not carry.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::node::NodeId;
use crate::wire::header::MASKING_IV_LEN;
use crate::wire::packet::Packet;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("buffer too short to contain a well-formed packet")]
    Truncated,
    #[error("packet carries an unrecognized flag byte {0:#x}")]
    UnknownPacketFlag(u8),
    #[error("message body carries an unrecognized kind byte {0}")]
    UnknownMessageKind(u8),
    #[error("embedded record failed to decode")]
    MalformedRecord,
    /// `UdpFramed`'s `Sink`/`Stream` impls require the codec error to cover
    /// the underlying socket's I/O errors too.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PartialEq for DecodeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Truncated, Self::Truncated) => true,
            (Self::UnknownPacketFlag(a), Self::UnknownPacketFlag(b)) => a == b,
            (Self::UnknownMessageKind(a), Self::UnknownMessageKind(b)) => a == b,
            (Self::MalformedRecord, Self::MalformedRecord) => true,
            _ => false,
        }
    }
}
impl Eq for DecodeError {}

/// A decoded packet plus the datagram's `masking_iv` -- the handshake engine
/// needs the latter to reconstruct `challenge-data` for a `whoareyou` it
/// just received (spec 4.3 step 3). `SocketAddr` is supplied separately by
/// `UdpFramed`, not carried here.
pub struct InboundDatagram {
    pub packet: Packet,
    pub masking_iv: [u8; MASKING_IV_LEN],
}

pub struct Discv5Codec {
    pub local_id: NodeId,
}

impl Discv5Codec {
    pub fn new(local_id: NodeId) -> Self {
        Self { local_id }
    }
}

impl Decoder for Discv5Codec {
    type Item = InboundDatagram;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split().freeze();
        let (packet, masking_iv) = Packet::decode_with_iv(&self.local_id, &datagram)?;
        Ok(Some(InboundDatagram { packet, masking_iv }))
    }
}

/// Encodes an already-built [`Packet`] addressed to `recipient_id`, stamping
/// a fresh `masking_iv` supplied by the caller (the protocol layer owns the
/// RNG so encoding stays deterministic and unit-testable).
pub struct OutboundPacket {
    pub recipient_id: NodeId,
    pub masking_iv: [u8; MASKING_IV_LEN],
    pub packet: Packet,
}

impl Encoder<OutboundPacket> for Discv5Codec {
    type Error = DecodeError;

    fn encode(&mut self, item: OutboundPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.packet.encode(&item.recipient_id, item.masking_iv);
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

/// Convenience for call sites that already hold owned bytes (e.g. tests)
/// rather than a `BytesMut` fed by `UdpFramed`.
pub fn decode_datagram(local_id: &NodeId, datagram: Bytes) -> Result<Packet, DecodeError> {
    Packet::decode(local_id, &datagram)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::packet::OrdinaryAuthdata;

    #[test]
    fn codec_round_trips_an_ordinary_packet() {
        let local_id = NodeId::random();
        let mut codec = Discv5Codec::new(local_id);

        let packet = Packet::Ordinary {
            nonce: [1; 12],
            authdata: OrdinaryAuthdata {
                source: NodeId::random(),
            },
            ciphertext: vec![9, 9, 9],
        };

        let mut dst = BytesMut::new();
        codec
            .encode(
                OutboundPacket {
                    recipient_id: local_id,
                    masking_iv: [2u8; MASKING_IV_LEN],
                    packet: packet.clone(),
                },
                &mut dst,
            )
            .unwrap();

        let decoded = codec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(decoded.packet, packet);
    }

    #[test]
    fn decode_returns_none_on_empty_buffer() {
        let mut codec = Discv5Codec::new(NodeId::random());
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
