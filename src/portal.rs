//! C10: a concrete C8 tenant implementing a small content-routing overlay,
//! identified by the talk protoId `"portal"` (spec 4.10).
//!
//! Wire format mirrors `wire/message.rs`'s tagged union: one `kind` byte
//! followed by a deterministic structural encoding of the body. This module
//! is deliberately ignorant of C6's socket/session machinery -- it only ever
//! talks to a [`ProtocolHandle`] through `registerTalk`/`talkReq`, the same
//! surface any other talk-protocol tenant would use.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::{Buf, BufMut};
use ethereum_types::U256;
use thiserror::Error;

use crate::node::{Node, Record};
use crate::protocol::ProtocolHandle;
use crate::talk::{AlreadyRegistered, TalkHandler};

/// The ASCII talk protoId this overlay registers under (spec 4.10).
pub const PROTO_ID: &[u8] = b"portal";

const KIND_PING: u8 = 1;
const KIND_PONG: u8 = 2;
const KIND_FIND_NODE: u8 = 3;
const KIND_NODES: u8 = 4;
const KIND_FIND_CONTENT: u8 = 5;
const KIND_FOUND_CONTENT: u8 = 6;
const KIND_ADVERTISE: u8 = 7;
const KIND_REQUEST_PROOFS: u8 = 8;

const MAX_DISTANCES: usize = 256;
const MAX_ENRS: usize = 32;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal message buffer too short")]
    Truncated,
    #[error("unrecognized portal message kind {0}")]
    UnknownKind(u8),
    #[error("embedded record failed to decode")]
    MalformedRecord,
    #[error("response kind did not match the call")]
    KindMismatch,
    #[error(transparent)]
    Protocol(#[from] crate::error::ProtocolError),
    #[error(transparent)]
    AlreadyRegistered(#[from] AlreadyRegistered),
}

/// The tagged union of spec 4.10's eight message kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalMessage {
    Ping { enr_seq: u64, data_radius: U256 },
    Pong { enr_seq: u64, data_radius: U256 },
    FindNode { distances: Vec<u16> },
    Nodes { total: u8, enrs: Vec<Record> },
    FindContent { content_key: Vec<u8> },
    FoundContent { enrs: Vec<Record>, payload: Vec<u8> },
    Advertise { content_keys: Vec<Vec<u8>> },
    RequestProofs { connection_id: [u8; 4], content_keys: Vec<Record> },
}

impl PortalMessage {
    fn kind(&self) -> u8 {
        match self {
            Self::Ping { .. } => KIND_PING,
            Self::Pong { .. } => KIND_PONG,
            Self::FindNode { .. } => KIND_FIND_NODE,
            Self::Nodes { .. } => KIND_NODES,
            Self::FindContent { .. } => KIND_FIND_CONTENT,
            Self::FoundContent { .. } => KIND_FOUND_CONTENT,
            Self::Advertise { .. } => KIND_ADVERTISE,
            Self::RequestProofs { .. } => KIND_REQUEST_PROOFS,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.kind()];
        match self {
            Self::Ping { enr_seq, data_radius } | Self::Pong { enr_seq, data_radius } => {
                buf.extend_from_slice(&enr_seq.to_be_bytes());
                encode_u256(&mut buf, *data_radius);
            }
            Self::FindNode { distances } => {
                buf.put_u16(distances.len().min(MAX_DISTANCES) as u16);
                for d in distances.iter().take(MAX_DISTANCES) {
                    buf.put_u16(*d);
                }
            }
            Self::Nodes { total, enrs } => {
                buf.put_u8(*total);
                encode_records(&mut buf, enrs);
            }
            Self::FindContent { content_key } => {
                buf.put_u16(content_key.len() as u16);
                buf.extend_from_slice(content_key);
            }
            Self::FoundContent { enrs, payload } => {
                encode_records(&mut buf, enrs);
                buf.put_u32(payload.len() as u32);
                buf.extend_from_slice(payload);
            }
            Self::Advertise { content_keys } => {
                buf.put_u16(content_keys.len() as u16);
                for key in content_keys {
                    buf.put_u16(key.len() as u16);
                    buf.extend_from_slice(key);
                }
            }
            Self::RequestProofs { connection_id, content_keys } => {
                buf.extend_from_slice(connection_id);
                encode_records(&mut buf, content_keys);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PortalError> {
        if bytes.is_empty() {
            return Err(PortalError::Truncated);
        }
        let kind = bytes[0];
        let mut rest = &bytes[1..];
        match kind {
            KIND_PING | KIND_PONG => {
                if rest.remaining() < 8 {
                    return Err(PortalError::Truncated);
                }
                let enr_seq = rest.get_u64();
                let data_radius = decode_u256(&mut rest)?;
                Ok(if kind == KIND_PING {
                    Self::Ping { enr_seq, data_radius }
                } else {
                    Self::Pong { enr_seq, data_radius }
                })
            }
            KIND_FIND_NODE => {
                if rest.remaining() < 2 {
                    return Err(PortalError::Truncated);
                }
                let count = rest.get_u16() as usize;
                if rest.remaining() < count * 2 {
                    return Err(PortalError::Truncated);
                }
                let distances = (0..count).map(|_| rest.get_u16()).collect();
                Ok(Self::FindNode { distances })
            }
            KIND_NODES => {
                if rest.remaining() < 1 {
                    return Err(PortalError::Truncated);
                }
                let total = rest.get_u8();
                let enrs = decode_records(&mut rest)?;
                Ok(Self::Nodes { total, enrs })
            }
            KIND_FIND_CONTENT => {
                if rest.remaining() < 2 {
                    return Err(PortalError::Truncated);
                }
                let len = rest.get_u16() as usize;
                if rest.remaining() < len {
                    return Err(PortalError::Truncated);
                }
                let content_key = rest[..len].to_vec();
                Ok(Self::FindContent { content_key })
            }
            KIND_FOUND_CONTENT => {
                let enrs = decode_records(&mut rest)?;
                if rest.remaining() < 4 {
                    return Err(PortalError::Truncated);
                }
                let len = rest.get_u32() as usize;
                if rest.remaining() < len {
                    return Err(PortalError::Truncated);
                }
                let payload = rest[..len].to_vec();
                Ok(Self::FoundContent { enrs, payload })
            }
            KIND_ADVERTISE => {
                if rest.remaining() < 2 {
                    return Err(PortalError::Truncated);
                }
                let count = rest.get_u16() as usize;
                let mut content_keys = Vec::with_capacity(count);
                for _ in 0..count {
                    if rest.remaining() < 2 {
                        return Err(PortalError::Truncated);
                    }
                    let len = rest.get_u16() as usize;
                    if rest.remaining() < len {
                        return Err(PortalError::Truncated);
                    }
                    content_keys.push(rest[..len].to_vec());
                    rest.advance(len);
                }
                Ok(Self::Advertise { content_keys })
            }
            KIND_REQUEST_PROOFS => {
                if rest.remaining() < 4 {
                    return Err(PortalError::Truncated);
                }
                let mut connection_id = [0u8; 4];
                connection_id.copy_from_slice(&rest[..4]);
                rest.advance(4);
                let content_keys = decode_records(&mut rest)?;
                Ok(Self::RequestProofs { connection_id, content_keys })
            }
            other => Err(PortalError::UnknownKind(other)),
        }
    }
}

fn encode_u256(buf: &mut Vec<u8>, value: U256) {
    let mut be = [0u8; 32];
    value.to_big_endian(&mut be);
    buf.extend_from_slice(&be);
}

fn decode_u256(rest: &mut &[u8]) -> Result<U256, PortalError> {
    if rest.remaining() < 32 {
        return Err(PortalError::Truncated);
    }
    let value = U256::from_big_endian(&rest[..32]);
    rest.advance(32);
    Ok(value)
}

fn encode_records(buf: &mut Vec<u8>, records: &[Record]) {
    let records = &records[..records.len().min(MAX_ENRS)];
    buf.put_u8(records.len() as u8);
    for record in records {
        let encoded = record.encode();
        buf.put_u16(encoded.len() as u16);
        buf.extend_from_slice(&encoded);
    }
}

fn decode_records(rest: &mut &[u8]) -> Result<Vec<Record>, PortalError> {
    if rest.remaining() < 1 {
        return Err(PortalError::Truncated);
    }
    let count = rest.get_u8() as usize;
    let mut records = Vec::with_capacity(count.min(MAX_ENRS));
    for _ in 0..count {
        if rest.remaining() < 2 {
            return Err(PortalError::Truncated);
        }
        let len = rest.get_u16() as usize;
        if rest.remaining() < len {
            return Err(PortalError::Truncated);
        }
        let record = Record::decode(&rest[..len]).map_err(|_| PortalError::MalformedRecord)?;
        rest.advance(len);
        records.push(record);
    }
    Ok(records)
}

struct PortalState {
    local_record: Record,
    data_radius: U256,
    content: HashMap<Vec<u8>, Vec<u8>>,
}

/// The responder half: owns the handler registered with C8 and the shared
/// state it reads from (local record, data radius, locally-held content).
/// The lock here is the overlay's own bookkeeping, not core protocol state --
/// C2/C4/C5/C6/C8/C9 stay lock-free as spec 5 requires.
pub struct PortalResponder {
    state: Arc<RwLock<PortalState>>,
}

impl PortalResponder {
    pub fn new(local_record: Record) -> Self {
        Self {
            state: Arc::new(RwLock::new(PortalState {
                local_record,
                data_radius: U256::MAX,
                content: HashMap::new(),
            })),
        }
    }

    /// Call whenever the local ENR changes (e.g. after IP-vote auto-update).
    pub fn refresh_local_record(&self, record: Record) {
        self.state.write().expect("portal state lock").local_record = record;
    }

    pub fn store_content(&self, key: Vec<u8>, value: Vec<u8>) {
        self.state.write().expect("portal state lock").content.insert(key, value);
    }

    fn handler(&self) -> TalkHandler {
        let state = Arc::clone(&self.state);
        Arc::new(move |payload: &[u8]| {
            let Ok(request) = PortalMessage::decode(payload) else {
                return Vec::new();
            };
            let guard = state.read().expect("portal state lock");
            let response = match request {
                PortalMessage::Ping { .. } => PortalMessage::Pong {
                    enr_seq: guard.local_record.seq(),
                    data_radius: guard.data_radius,
                },
                PortalMessage::FindNode { distances } => {
                    if distances.is_empty() {
                        PortalMessage::Nodes { total: 1, enrs: vec![] }
                    } else if distances.contains(&0) {
                        PortalMessage::Nodes { total: 1, enrs: vec![guard.local_record.clone()] }
                    } else {
                        PortalMessage::Nodes { total: 1, enrs: vec![] }
                    }
                }
                PortalMessage::FindContent { content_key } => match guard.content.get(&content_key) {
                    Some(payload) => PortalMessage::FoundContent { enrs: vec![], payload: payload.clone() },
                    None => PortalMessage::FoundContent { enrs: vec![], payload: vec![] },
                },
                PortalMessage::Advertise { .. } => {
                    PortalMessage::RequestProofs { connection_id: [0; 4], content_keys: vec![] }
                }
                _ => return Vec::new(),
            };
            response.encode()
        })
    }

    /// Registers this responder's handler with C8 under `"portal"` (spec
    /// 4.10).
    pub async fn register(&self, protocol: &ProtocolHandle) -> Result<(), PortalError> {
        protocol
            .register_talk(PROTO_ID.to_vec(), self.handler())
            .await
            .map_err(PortalError::from)
    }
}

/// The initiator half: wraps C6's `talkReq` and decodes the response back
/// into the tagged union, failing if the response `kind` doesn't match the
/// call (spec 4.10).
pub struct PortalClient<'a> {
    protocol: &'a ProtocolHandle,
}

impl<'a> PortalClient<'a> {
    pub fn new(protocol: &'a ProtocolHandle) -> Self {
        Self { protocol }
    }

    async fn call(&self, node: &Node, request: PortalMessage) -> Result<PortalMessage, PortalError> {
        let payload = self.protocol.talk_req(node, PROTO_ID.to_vec(), request.encode()).await?;
        PortalMessage::decode(&payload)
    }

    pub async fn ping(&self, node: &Node, enr_seq: u64) -> Result<(u64, U256), PortalError> {
        let request = PortalMessage::Ping { enr_seq, data_radius: U256::MAX };
        match self.call(node, request).await? {
            PortalMessage::Pong { enr_seq, data_radius } => Ok((enr_seq, data_radius)),
            _ => Err(PortalError::KindMismatch),
        }
    }

    pub async fn find_node(&self, node: &Node, distances: Vec<u16>) -> Result<Vec<Record>, PortalError> {
        match self.call(node, PortalMessage::FindNode { distances }).await? {
            PortalMessage::Nodes { enrs, .. } => Ok(enrs),
            _ => Err(PortalError::KindMismatch),
        }
    }

    pub async fn find_content(&self, node: &Node, content_key: Vec<u8>) -> Result<(Vec<Record>, Vec<u8>), PortalError> {
        match self.call(node, PortalMessage::FindContent { content_key }).await? {
            PortalMessage::FoundContent { enrs, payload } => Ok((enrs, payload)),
            _ => Err(PortalError::KindMismatch),
        }
    }

    pub async fn advertise(&self, node: &Node, content_keys: Vec<Vec<u8>>) -> Result<([u8; 4], Vec<Record>), PortalError> {
        match self.call(node, PortalMessage::Advertise { content_keys }).await? {
            PortalMessage::RequestProofs { connection_id, content_keys } => Ok((connection_id, content_keys)),
            _ => Err(PortalError::KindMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn local_record() -> Record {
        let signer = SecretKey::new(&mut rand::thread_rng());
        Record::new(1, None, None, None, &signer)
    }

    #[test]
    fn ping_round_trips_through_encode_decode() {
        let message = PortalMessage::Ping { enr_seq: 7, data_radius: U256::MAX };
        let encoded = message.encode();
        assert_eq!(PortalMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn nodes_with_records_round_trips() {
        let message = PortalMessage::Nodes { total: 1, enrs: vec![local_record()] };
        let encoded = message.encode();
        assert_eq!(PortalMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn unknown_kind_byte_is_rejected() {
        assert!(matches!(PortalMessage::decode(&[99]), Err(PortalError::UnknownKind(99))));
    }

    #[test]
    fn responder_answers_find_node_for_distance_zero_with_local_record() {
        let record = local_record();
        let responder = PortalResponder::new(record.clone());
        let handler = responder.handler();
        let request = PortalMessage::FindNode { distances: vec![0] };
        let response = PortalMessage::decode(&handler(&request.encode())).unwrap();
        assert_eq!(response, PortalMessage::Nodes { total: 1, enrs: vec![record] });
    }

    #[test]
    fn responder_answers_ping_with_local_enr_seq() {
        let record = local_record();
        let responder = PortalResponder::new(record.clone());
        let handler = responder.handler();
        let request = PortalMessage::Ping { enr_seq: 0, data_radius: U256::zero() };
        let response = PortalMessage::decode(&handler(&request.encode())).unwrap();
        assert_eq!(response, PortalMessage::Pong { enr_seq: record.seq(), data_radius: U256::MAX });
    }
}
