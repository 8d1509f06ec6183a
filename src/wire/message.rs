//! Message bodies carried inside an Ordinary/Handshake packet once decrypted.
//! Tagged union with exhaustive dispatch (spec Design Note: "adding a kind is
//! a compile-time breaking change (desired)").

use std::net::IpAddr;

use bytes::{Buf, BufMut};

use crate::node::{NodeId, Record};
use crate::wire::codec::DecodeError;

/// discv5.1 message kinds. `RegTopic`/`TopicQuery` are accepted on the wire
/// (spec 4.6) but never constructed locally -- this crate only ever sends the
/// other six.
const KIND_PING: u8 = 1;
const KIND_PONG: u8 = 2;
const KIND_FIND_NODE: u8 = 3;
const KIND_NODES: u8 = 4;
const KIND_TALK_REQ: u8 = 5;
const KIND_TALK_RESP: u8 = 6;
const KIND_REG_TOPIC: u8 = 7;
const KIND_TOPIC_QUERY: u8 = 8;

pub type ReqId = Vec<u8>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping {
        req_id: ReqId,
        enr_seq: u64,
    },
    Pong {
        req_id: ReqId,
        enr_seq: u64,
        observed_ip: IpAddr,
        observed_port: u16,
    },
    FindNode {
        req_id: ReqId,
        distances: Vec<u16>,
    },
    Nodes {
        req_id: ReqId,
        total: u32,
        records: Vec<Record>,
    },
    TalkReq {
        req_id: ReqId,
        proto_id: Vec<u8>,
        payload: Vec<u8>,
    },
    TalkResp {
        req_id: ReqId,
        payload: Vec<u8>,
    },
    RegTopic {
        req_id: ReqId,
    },
    TopicQuery {
        req_id: ReqId,
    },
}

impl Message {
    pub fn req_id(&self) -> &[u8] {
        match self {
            Message::Ping { req_id, .. }
            | Message::Pong { req_id, .. }
            | Message::FindNode { req_id, .. }
            | Message::Nodes { req_id, .. }
            | Message::TalkReq { req_id, .. }
            | Message::TalkResp { req_id, .. }
            | Message::RegTopic { req_id }
            | Message::TopicQuery { req_id } => req_id,
        }
    }

    pub fn kind(&self) -> u8 {
        match self {
            Message::Ping { .. } => KIND_PING,
            Message::Pong { .. } => KIND_PONG,
            Message::FindNode { .. } => KIND_FIND_NODE,
            Message::Nodes { .. } => KIND_NODES,
            Message::TalkReq { .. } => KIND_TALK_REQ,
            Message::TalkResp { .. } => KIND_TALK_RESP,
            Message::RegTopic { .. } => KIND_REG_TOPIC,
            Message::TopicQuery { .. } => KIND_TOPIC_QUERY,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(self.kind());
        encode_req_id(&mut buf, self.req_id());
        match self {
            Message::Ping { enr_seq, .. } => {
                buf.put_u64(*enr_seq);
            }
            Message::Pong {
                enr_seq,
                observed_ip,
                observed_port,
                ..
            } => {
                buf.put_u64(*enr_seq);
                encode_ip(&mut buf, *observed_ip);
                buf.put_u16(*observed_port);
            }
            Message::FindNode { distances, .. } => {
                buf.put_u8(distances.len() as u8);
                for d in distances {
                    buf.put_u16(*d);
                }
            }
            Message::Nodes { total, records, .. } => {
                buf.put_u32(*total);
                buf.put_u8(records.len() as u8);
                for record in records {
                    let encoded = record.encode();
                    buf.put_u16(encoded.len() as u16);
                    buf.extend_from_slice(&encoded);
                }
            }
            Message::TalkReq { proto_id, payload, .. } => {
                buf.put_u8(proto_id.len() as u8);
                buf.extend_from_slice(proto_id);
                buf.put_u16(payload.len() as u16);
                buf.extend_from_slice(payload);
            }
            Message::TalkResp { payload, .. } => {
                buf.put_u16(payload.len() as u16);
                buf.extend_from_slice(payload);
            }
            Message::RegTopic { .. } | Message::TopicQuery { .. } => {}
        }
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Truncated);
        }
        let kind = bytes.get_u8();
        let req_id = decode_req_id(&mut bytes)?;
        let message = match kind {
            KIND_PING => {
                require(bytes.remaining() >= 8)?;
                Message::Ping {
                    req_id,
                    enr_seq: bytes.get_u64(),
                }
            }
            KIND_PONG => {
                require(bytes.remaining() >= 8 + 1)?;
                let enr_seq = bytes.get_u64();
                let observed_ip = decode_ip(&mut bytes)?;
                require(bytes.remaining() >= 2)?;
                let observed_port = bytes.get_u16();
                Message::Pong {
                    req_id,
                    enr_seq,
                    observed_ip,
                    observed_port,
                }
            }
            KIND_FIND_NODE => {
                require(bytes.remaining() >= 1)?;
                let count = bytes.get_u8() as usize;
                require(bytes.remaining() >= count * 2)?;
                let distances = (0..count).map(|_| bytes.get_u16()).collect();
                Message::FindNode { req_id, distances }
            }
            KIND_NODES => {
                require(bytes.remaining() >= 4 + 1)?;
                let total = bytes.get_u32();
                let count = bytes.get_u8() as usize;
                let mut records = Vec::with_capacity(count);
                for _ in 0..count {
                    require(bytes.remaining() >= 2)?;
                    let len = bytes.get_u16() as usize;
                    require(bytes.remaining() >= len)?;
                    let raw = &bytes[..len];
                    bytes.advance(len);
                    records.push(Record::decode(raw).map_err(|_| DecodeError::MalformedRecord)?);
                }
                Message::Nodes { req_id, total, records }
            }
            KIND_TALK_REQ => {
                require(bytes.remaining() >= 1)?;
                let proto_len = bytes.get_u8() as usize;
                require(bytes.remaining() >= proto_len + 2)?;
                let proto_id = bytes[..proto_len].to_vec();
                bytes.advance(proto_len);
                let payload_len = bytes.get_u16() as usize;
                require(bytes.remaining() >= payload_len)?;
                let payload = bytes[..payload_len].to_vec();
                Message::TalkReq {
                    req_id,
                    proto_id,
                    payload,
                }
            }
            KIND_TALK_RESP => {
                require(bytes.remaining() >= 2)?;
                let payload_len = bytes.get_u16() as usize;
                require(bytes.remaining() >= payload_len)?;
                let payload = bytes[..payload_len].to_vec();
                Message::TalkResp { req_id, payload }
            }
            KIND_REG_TOPIC => Message::RegTopic { req_id },
            KIND_TOPIC_QUERY => Message::TopicQuery { req_id },
            other => return Err(DecodeError::UnknownMessageKind(other)),
        };
        Ok(message)
    }
}

fn require(cond: bool) -> Result<(), DecodeError> {
    cond.then_some(()).ok_or(DecodeError::Truncated)
}

fn encode_req_id(buf: &mut Vec<u8>, req_id: &[u8]) {
    buf.put_u8(req_id.len() as u8);
    buf.extend_from_slice(req_id);
}

fn decode_req_id(bytes: &mut &[u8]) -> Result<ReqId, DecodeError> {
    require(bytes.has_remaining())?;
    let len = bytes.get_u8() as usize;
    require(bytes.remaining() >= len)?;
    let id = bytes[..len].to_vec();
    bytes.advance(len);
    Ok(id)
}

fn encode_ip(buf: &mut Vec<u8>, ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(6);
            buf.extend_from_slice(&v6.octets());
        }
    }
}

fn decode_ip(bytes: &mut &[u8]) -> Result<IpAddr, DecodeError> {
    require(bytes.has_remaining())?;
    match bytes.get_u8() {
        4 => {
            require(bytes.remaining() >= 4)?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&bytes[..4]);
            bytes.advance(4);
            Ok(IpAddr::from(octets))
        }
        6 => {
            require(bytes.remaining() >= 16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            bytes.advance(16);
            Ok(IpAddr::from(octets))
        }
        _ => Err(DecodeError::Truncated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn req_id() -> ReqId {
        vec![1, 2, 3, 4]
    }

    #[test]
    fn ping_round_trips() {
        let msg = Message::Ping {
            req_id: req_id(),
            enr_seq: 7,
        };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn pong_round_trips() {
        let msg = Message::Pong {
            req_id: req_id(),
            enr_seq: 7,
            observed_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            observed_port: 9000,
        };
        let encoded = msg.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn find_node_round_trips_with_empty_distances() {
        let msg = Message::FindNode {
            req_id: req_id(),
            distances: vec![],
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn talk_req_round_trips() {
        let msg = Message::TalkReq {
            req_id: req_id(),
            proto_id: b"portal".to_vec(),
            payload: vec![9, 9, 9],
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let msg = Message::Ping {
            req_id: req_id(),
            enr_seq: 7,
        };
        let mut encoded = msg.encode();
        encoded.truncate(encoded.len() - 2);
        assert!(Message::decode(&encoded).is_err());
    }
}
