//! C6 Protocol Core: the event loop that owns the socket, the routing table,
//! the session store, the handshake engine and the request registry, and
//! exposes them to callers through a cloneable, channel-backed handle.
//!
//! The teacher drives this with a `spawned-concurrency` `GenServer` actor.
//! That trait's shape has drifted across the teacher's own `discv4`/`discv5`
//! modules within the same pinned dependency version, so rather than copy a
//! signature we can't check against a compiler, this is a plain `tokio`
//! event loop: one task owns all mutable state and a `mpsc` command channel
//! into it, matching spec 5's "no locks, one event loop" concurrency model
//! directly instead of through an intermediary actor trait. See DESIGN.md for
//! the full rationale.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::SinkExt;
use rand::Rng;
use secp256k1::{PublicKey, SecretKey, ecdsa::Signature};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::udp::UdpFramed;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::crypto;
use crate::error::ProtocolError;
use crate::handshake::{self, HandshakeEngine};
use crate::ip_vote::IpVoteAccumulator;
use crate::lookup::{self, FindNodeClient};
use crate::metrics::METRICS;
use crate::node::{Node, NodeId, Record};
use crate::requests::{PendingRequest, RequestRegistry};
use crate::routing_table::{AddOutcome, RoutingTable};
use crate::session::SessionStore;
use crate::talk::{AlreadyRegistered, TalkDispatcher, TalkHandler};
use crate::wire::codec::{Discv5Codec, InboundDatagram, OutboundPacket};
use crate::wire::header::{FLAG_HANDSHAKE, FLAG_ORDINARY, MASKING_IV_LEN};
use crate::wire::message::Message;
use crate::wire::packet::{HandshakeAuthdata, OrdinaryAuthdata, Packet, WhoAreYouAuthdata, masked_header_bytes};

/// Records split across fragments of a `nodes` reply (spec 4.6, 11.3 of the
/// teacher's `discv5/server.rs`: `MAX_ENRS_PER_MESSAGE`).
const MAX_NODES_PER_MESSAGE: usize = 3;
/// Minimum size of the padded random payload sent in place of real
/// ciphertext when no session exists yet (spec 4.3 step 1).
const MIN_RANDOM_DATA_LEN: usize = 44;
/// Per-source-IP `whoareyou` rate limit (SPEC_FULL 11.1).
const WHOAREYOU_RATE_LIMIT: Duration = Duration::from_secs(1);
/// Cadence of the background stale-entry sweep (SPEC_FULL 11.2).
const PRUNE_INTERVAL: Duration = Duration::from_secs(5);
/// Jitter window for `revalidateLoop` (spec 4.6).
const REVALIDATE_JITTER: Duration = Duration::from_secs(10);
/// Upper bound of the ease-in-out lookup cadence curve (SPEC_FULL 11.3),
/// reached once the table is fully populated.
const LOOKUP_INTERVAL_UPPER_MS: f64 = 60_000.0;

/// `PongInfo`: the caller-facing shape of a `pong` reply (spec 4.6 `ping`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongInfo {
    pub enr_seq: u64,
    pub observed_ip: IpAddr,
    pub observed_port: u16,
}

#[derive(Debug, Clone, Copy)]
enum RequestOutcome {
    Success,
    Timeout,
    Mismatch,
}

type ReplyRx = Result<(Vec<u8>, mpsc::UnboundedReceiver<Message>), ProtocolError>;

enum Command {
    Ping(Node, oneshot::Sender<ReplyRx>),
    FindNode(Node, Vec<u16>, oneshot::Sender<ReplyRx>),
    TalkReq(Node, Vec<u8>, Vec<u8>, oneshot::Sender<ReplyRx>),
    ReportOutcome(NodeId, Vec<u8>, RequestOutcome),
    AddNode(Node, oneshot::Sender<AddOutcome>),
    GetNode(NodeId, oneshot::Sender<Option<Node>>),
    Neighbours(NodeId, usize, oneshot::Sender<Vec<Node>>),
    LookupSeed(NodeId, oneshot::Sender<Vec<Node>>),
    RandomNodes(oneshot::Sender<Vec<Node>>),
    LocalRecord(oneshot::Sender<Record>),
    UpdateRecord(Option<IpAddr>, Option<u16>, Option<u16>, oneshot::Sender<Record>),
    RegisterTalk(Vec<u8>, TalkHandler, oneshot::Sender<Result<(), AlreadyRegistered>>),
    NodeToRevalidate(oneshot::Sender<Option<Node>>),
    SetJustSeen(NodeId),
    ReplaceUnlessBootstrap(NodeId),
    ReplaceRecordIfNewer(NodeId, Record),
    IpVote(NodeId, SocketAddr),
    IpMajority(oneshot::Sender<Option<SocketAddr>>),
    TableFillRatio(oneshot::Sender<f64>),
    Prune,
    Shutdown,
}

/// The owning side: all mutable state, touched only from [`Protocol::run`].
struct Protocol {
    local_id: NodeId,
    static_key: SecretKey,
    local_record: Record,
    bootstrap_ids: std::collections::HashSet<NodeId>,
    config: Config,
    routing_table: RoutingTable,
    session_store: SessionStore,
    handshake_engine: HandshakeEngine,
    registry: RequestRegistry,
    talk: TalkDispatcher,
    ip_vote: IpVoteAccumulator,
    framed: UdpFramed<Discv5Codec>,
    nonce_counter: u32,
    req_id_counter: u32,
    whoareyou_rate_limit: HashMap<IpAddr, Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// A cheap, cloneable front door onto a running [`Protocol`]. Every public
/// operation is a message send into the event loop; the loop is the only
/// piece of code that ever mutates the table, the session store or the
/// handshake engine (spec 5).
#[derive(Clone)]
pub struct ProtocolHandle {
    local_id: NodeId,
    response_timeout: Duration,
    enr_auto_update: bool,
    commands: mpsc::UnboundedSender<Command>,
    core_task: Arc<AsyncMutex<Option<JoinHandle<()>>>>,
    background_tasks: Arc<AsyncMutex<Vec<JoinHandle<()>>>>,
}

impl Protocol {
    async fn bind(config: Config, static_key: SecretKey) -> Result<(Self, mpsc::UnboundedSender<Command>), ProtocolError> {
        let local_record = Record::new(
            1,
            Some(config.bind_address.ip()),
            Some(config.bind_address.port()),
            None,
            &static_key,
        );
        let local_id = local_record.node_id();

        let socket = UdpSocket::bind(config.bind_address)
            .await
            .map_err(|_| ProtocolError::Bind(config.bind_address))?;
        let framed = UdpFramed::new(socket, Discv5Codec::new(local_id));

        let mut routing_table = RoutingTable::new(local_id, config.table_ip_limits);
        let mut bootstrap_ids = std::collections::HashSet::new();
        for record in &config.bootstrap_records {
            let node = Node::new(record.clone());
            bootstrap_ids.insert(node.id);
            routing_table.add(node);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let protocol = Self {
            local_id,
            static_key,
            local_record,
            bootstrap_ids,
            handshake_engine: HandshakeEngine::new(config.handshake_timeout),
            registry: RequestRegistry::new(config.response_timeout),
            session_store: SessionStore::new(crate::session::SESSION_STORE_CAPACITY),
            ip_vote: IpVoteAccumulator::new(config.ip_majority_interval),
            talk: TalkDispatcher::new(),
            routing_table,
            framed,
            nonce_counter: 0,
            req_id_counter: 0,
            whoareyou_rate_limit: HashMap::new(),
            commands: rx,
            config,
        };
        Ok((protocol, tx))
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        self.nonce_counter = self.nonce_counter.wrapping_add(1);
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.nonce_counter.to_be_bytes());
        rand::thread_rng().fill(&mut nonce[4..]);
        nonce
    }

    fn next_req_id(&mut self) -> Vec<u8> {
        self.req_id_counter = self.req_id_counter.wrapping_add(1);
        self.req_id_counter.to_be_bytes().to_vec()
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                datagram = futures::StreamExt::next(&mut self.framed) => {
                    match datagram {
                        Some(Ok((InboundDatagram { packet, masking_iv }, src_addr))) => {
                            self.handle_packet(packet, masking_iv, src_addr).await;
                        }
                        Some(Err(err)) => trace!(%err, "dropping unparsable datagram"),
                        None => break,
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
            }
        }
        debug!(local_id = ?self.local_id, "protocol event loop stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Ping(node, reply) => {
                let message = Message::Ping {
                    req_id: self.next_req_id(),
                    enr_seq: self.local_record.seq(),
                };
                let _ = reply.send(self.send_request(&node, message).await);
            }
            Command::FindNode(node, distances, reply) => {
                let message = Message::FindNode {
                    req_id: self.next_req_id(),
                    distances,
                };
                let _ = reply.send(self.send_request(&node, message).await);
            }
            Command::TalkReq(node, proto_id, payload, reply) => {
                let message = Message::TalkReq {
                    req_id: self.next_req_id(),
                    proto_id,
                    payload,
                };
                let _ = reply.send(self.send_request(&node, message).await);
            }
            Command::ReportOutcome(peer_id, req_id, outcome) => {
                self.registry.complete(peer_id, &req_id);
                match outcome {
                    RequestOutcome::Success => {
                        METRICS.message_requests_outgoing_ok.inc();
                        self.routing_table.set_just_seen(&peer_id);
                    }
                    RequestOutcome::Timeout => {
                        METRICS.message_requests_outgoing_timeout.inc();
                        if !self.bootstrap_ids.contains(&peer_id) {
                            self.routing_table.replace_node(&peer_id);
                        }
                    }
                    RequestOutcome::Mismatch => {
                        METRICS.message_requests_outgoing_mismatch.inc();
                        if !self.bootstrap_ids.contains(&peer_id) {
                            self.routing_table.replace_node(&peer_id);
                        }
                    }
                }
            }
            Command::AddNode(node, reply) => {
                let _ = reply.send(self.routing_table.add(node));
            }
            Command::GetNode(id, reply) => {
                let _ = reply.send(self.routing_table.get(&id).cloned());
            }
            Command::Neighbours(target, k, reply) => {
                let _ = reply.send(self.routing_table.neighbours(&target, k, true));
            }
            Command::LookupSeed(target, reply) => {
                let _ = reply.send(self.routing_table.neighbours(&target, lookup::K, true));
            }
            Command::RandomNodes(reply) => {
                let _ = reply.send(self.routing_table.neighbours(&NodeId::random(), lookup::K, true));
            }
            Command::LocalRecord(reply) => {
                let _ = reply.send(self.local_record.clone());
            }
            Command::UpdateRecord(ip, udp_port, tcp_port, reply) => {
                let seq = self.local_record.seq() + 1;
                self.local_record = self.local_record.with_updates(seq, ip, udp_port, tcp_port, &self.static_key);
                let _ = reply.send(self.local_record.clone());
            }
            Command::RegisterTalk(proto_id, handler, reply) => {
                let _ = reply.send(self.talk.register(proto_id, handler));
            }
            Command::NodeToRevalidate(reply) => {
                let _ = reply.send(self.routing_table.node_to_revalidate());
            }
            Command::SetJustSeen(id) => {
                self.routing_table.set_just_seen(&id);
            }
            Command::ReplaceUnlessBootstrap(id) => {
                if !self.bootstrap_ids.contains(&id) {
                    self.routing_table.replace_node(&id);
                }
            }
            Command::ReplaceRecordIfNewer(id, record) => {
                if let Some(existing) = self.routing_table.get(&id) {
                    if record.seq() > existing.record.seq() && record.verify() {
                        let mut node = Node::new(record);
                        node.address = existing.address;
                        self.routing_table.add(node);
                    }
                }
            }
            Command::IpVote(id, addr) => {
                self.ip_vote.insert(id, addr);
            }
            Command::IpMajority(reply) => {
                let _ = reply.send(self.ip_vote.majority());
            }
            Command::TableFillRatio(reply) => {
                let occupied = (0..256)
                    .filter(|&d| !self.routing_table.neighbours_at_distances(&[d as u16 + 1], true).is_empty())
                    .count();
                let _ = reply.send(occupied as f64 / 256.0);
            }
            Command::Prune => {
                self.registry.expire();
                self.handshake_engine.expire();
                let limit = WHOAREYOU_RATE_LIMIT;
                self.whoareyou_rate_limit.retain(|_, at| at.elapsed() < limit);
            }
            Command::Shutdown => unreachable!("handled in run()"),
        }
    }

    /// Builds, registers and sends an outbound request, returning the
    /// receiver the caller drains for typed replies (spec 4.6/5).
    async fn send_request(&mut self, node: &Node, message: Message) -> ReplyRx {
        let addr = node.address.ok_or(ProtocolError::UnknownNode(node.id))?;
        let message_bytes = message.encode();
        let req_id = message.req_id().to_vec();
        let authdata = OrdinaryAuthdata { source: self.local_id };

        let (nonce, ciphertext) = if let Some(session) = self.session_store.get(node.id, addr).cloned() {
            let nonce = self.next_nonce();
            let masking_iv = random_iv();
            let ad = masked_header_bytes(FLAG_ORDINARY, nonce, authdata.encode(), &node.id, &masking_iv);
            let ciphertext = crypto::seal(&session.write_key, &nonce, &ad, &message_bytes);
            self.send_packet(node.id, addr, masking_iv, Packet::Ordinary { nonce, authdata, ciphertext: ciphertext.clone() })
                .await?;
            (nonce, ciphertext)
        } else {
            let nonce = self.next_nonce();
            let masking_iv = random_iv();
            let mut padding = vec![0u8; MIN_RANDOM_DATA_LEN];
            rand::thread_rng().fill(padding.as_mut_slice());
            self.send_packet(
                node.id,
                addr,
                masking_iv,
                Packet::Ordinary {
                    nonce,
                    authdata: authdata.clone(),
                    ciphertext: padding.clone(),
                },
            )
            .await?;
            (nonce, padding)
        };
        let _ = ciphertext;

        let rx = self.registry.register(nonce, node.id, req_id.clone(), node.clone(), message_bytes);
        Ok((req_id, rx))
    }

    async fn send_packet(
        &mut self,
        recipient_id: NodeId,
        addr: SocketAddr,
        masking_iv: [u8; MASKING_IV_LEN],
        packet: Packet,
    ) -> Result<(), ProtocolError> {
        self.framed
            .send((OutboundPacket { recipient_id, masking_iv, packet }, addr))
            .await?;
        Ok(())
    }

    async fn send_response(&mut self, dest_id: NodeId, dest_addr: SocketAddr, message: Message) {
        let Some(session) = self.session_store.get(dest_id, dest_addr).cloned() else {
            trace!(peer = ?dest_id, "dropping reply with no session");
            return;
        };
        let nonce = self.next_nonce();
        let masking_iv = random_iv();
        let authdata = OrdinaryAuthdata { source: self.local_id };
        let ad = masked_header_bytes(FLAG_ORDINARY, nonce, authdata.encode(), &dest_id, &masking_iv);
        let ciphertext = crypto::seal(&session.write_key, &nonce, &ad, &message.encode());
        let _ = self
            .send_packet(dest_id, dest_addr, masking_iv, Packet::Ordinary { nonce, authdata, ciphertext })
            .await;
    }

    async fn send_nodes(&mut self, dest_id: NodeId, dest_addr: SocketAddr, req_id: Vec<u8>, records: Vec<Record>) {
        if records.is_empty() {
            self.send_response(dest_id, dest_addr, Message::Nodes { req_id, total: 1, records: vec![] })
                .await;
            return;
        }
        let chunks: Vec<Vec<Record>> = records.chunks(MAX_NODES_PER_MESSAGE).map(|c| c.to_vec()).collect();
        let total = chunks.len() as u32;
        for chunk in chunks {
            self.send_response(dest_id, dest_addr, Message::Nodes { req_id: req_id.clone(), total, records: chunk })
                .await;
        }
    }

    async fn handle_packet(&mut self, packet: Packet, masking_iv: [u8; MASKING_IV_LEN], src_addr: SocketAddr) {
        match packet {
            Packet::Ordinary { nonce, authdata, ciphertext } => {
                self.handle_ordinary(nonce, authdata, ciphertext, masking_iv, src_addr).await;
            }
            Packet::WhoAreYou { nonce, authdata } => {
                self.handle_who_are_you(nonce, authdata, masking_iv, src_addr).await;
            }
            Packet::Handshake { nonce, authdata, ciphertext } => {
                self.handle_handshake(nonce, authdata, ciphertext, masking_iv, src_addr).await;
            }
        }
    }

    async fn handle_ordinary(
        &mut self,
        nonce: [u8; 12],
        authdata: OrdinaryAuthdata,
        ciphertext: Vec<u8>,
        masking_iv: [u8; MASKING_IV_LEN],
        src_addr: SocketAddr,
    ) {
        let src_id = authdata.source;
        if let Some(session) = self.session_store.get(src_id, src_addr).cloned() {
            let ad = masked_header_bytes(FLAG_ORDINARY, nonce, authdata.encode(), &self.local_id, &masking_iv);
            if let Ok(plaintext) = crypto::open(&session.read_key, &nonce, &ad, &ciphertext) {
                if let Ok(message) = Message::decode(&plaintext) {
                    self.dispatch_message(src_id, src_addr, message).await;
                }
                return;
            }
        }
        self.send_who_are_you(src_id, src_addr, nonce).await;
    }

    async fn send_who_are_you(&mut self, src_id: NodeId, src_addr: SocketAddr, request_nonce: [u8; 12]) {
        let ip = src_addr.ip();
        if let Some(last) = self.whoareyou_rate_limit.get(&ip) {
            if last.elapsed() < WHOAREYOU_RATE_LIMIT {
                return;
            }
        }

        let mut id_nonce = [0u8; crate::wire::packet::ID_NONCE_LEN];
        rand::thread_rng().fill(&mut id_nonce);
        let enr_seq = self.routing_table.get(&src_id).map(|n| n.record.seq()).unwrap_or(0);
        let packet = Packet::WhoAreYou { nonce: request_nonce, authdata: WhoAreYouAuthdata { id_nonce, enr_seq } };
        let masking_iv = random_iv();
        let Some(challenge_data) = packet.whoareyou_challenge_data(&masking_iv) else {
            return;
        };

        if !self.handshake_engine.begin_as_recipient((src_id, src_addr), challenge_data) {
            // spec 9 open question: a second whoareyou for an in-flight key is dropped.
            return;
        }
        self.whoareyou_rate_limit.insert(ip, Instant::now());
        let _ = self.send_packet(src_id, src_addr, masking_iv, packet).await;
    }

    async fn handle_who_are_you(
        &mut self,
        nonce: [u8; 12],
        authdata: WhoAreYouAuthdata,
        masking_iv: [u8; MASKING_IV_LEN],
        src_addr: SocketAddr,
    ) {
        let Some(pending) = self.registry.take_pending_by_nonce(&nonce) else {
            trace!(?src_addr, "whoareyou with no matching pending request");
            return;
        };
        let node = pending.node;
        let remote_pubkey = node.record.pubkey();
        let packet = Packet::WhoAreYou { nonce, authdata: authdata.clone() };
        let Some(challenge_data) = packet.whoareyou_challenge_data(&masking_iv) else {
            return;
        };
        let ephemeral = handshake::generate_ephemeral_keypair();
        let Ok(out) = handshake::respond_as_initiator(
            &self.static_key,
            &self.local_id,
            &remote_pubkey,
            &node.id,
            &ephemeral,
            &challenge_data,
        ) else {
            warn!(peer = ?node.id, "failed to derive initiator handshake keys");
            return;
        };
        self.session_store.put(node.id, src_addr, out.session.clone());

        let record = (authdata.enr_seq < self.local_record.seq()).then(|| self.local_record.clone());
        let handshake_authdata = HandshakeAuthdata {
            source: self.local_id,
            id_signature: out.id_signature.serialize_compact().to_vec(),
            ephemeral_pubkey: ephemeral.public.serialize().to_vec(),
            record,
        };
        let new_nonce = self.next_nonce();
        let new_masking_iv = random_iv();
        let ad = masked_header_bytes(FLAG_HANDSHAKE, new_nonce, handshake_authdata.encode(), &node.id, &new_masking_iv);
        let ciphertext = crypto::seal(&out.session.write_key, &new_nonce, &ad, &pending.message);
        let send_result = self
            .send_packet(
                node.id,
                src_addr,
                new_masking_iv,
                Packet::Handshake { nonce: new_nonce, authdata: handshake_authdata, ciphertext },
            )
            .await;
        if send_result.is_ok() {
            self.registry.insert_pending(
                new_nonce,
                PendingRequest { node, message: pending.message, sent_at: Instant::now() },
            );
        }
    }

    async fn handle_handshake(
        &mut self,
        nonce: [u8; 12],
        authdata: HandshakeAuthdata,
        ciphertext: Vec<u8>,
        masking_iv: [u8; MASKING_IV_LEN],
        src_addr: SocketAddr,
    ) {
        let src_id = authdata.source;
        let key = (src_id, src_addr);
        let Some(challenge_data) = self.handshake_engine.challenge_data(&key).map(<[u8]>::to_vec) else {
            trace!(peer = ?src_id, "handshake message with no matching challenge");
            return;
        };

        let remote_pubkey = match &authdata.record {
            Some(record) if record.verify() && record.node_id() == src_id => record.pubkey(),
            Some(_) => {
                self.handshake_engine.complete(&key);
                return;
            }
            None => match self.routing_table.get(&src_id) {
                Some(node) => node.record.pubkey(),
                None => {
                    self.handshake_engine.complete(&key);
                    return;
                }
            },
        };

        let (Ok(remote_ephemeral), Ok(id_signature)) = (
            PublicKey::from_slice(&authdata.ephemeral_pubkey),
            Signature::from_compact(&authdata.id_signature),
        ) else {
            self.handshake_engine.complete(&key);
            return;
        };

        let session = match handshake::respond_as_recipient(
            &self.static_key,
            &self.local_id,
            &remote_pubkey,
            &src_id,
            &remote_ephemeral,
            &challenge_data,
            &id_signature,
        ) {
            Ok(session) => session,
            Err(_) => {
                self.handshake_engine.complete(&key);
                return;
            }
        };
        self.handshake_engine.complete(&key);
        self.session_store.put(src_id, src_addr, session.clone());

        if let Some(record) = &authdata.record {
            let mut node = Node::new(record.clone());
            node.address = Some(src_addr);
            self.routing_table.add(node);
        }

        let ad = masked_header_bytes(FLAG_HANDSHAKE, nonce, authdata.encode(), &self.local_id, &masking_iv);
        if let Ok(plaintext) = crypto::open(&session.read_key, &nonce, &ad, &ciphertext) {
            if let Ok(message) = Message::decode(&plaintext) {
                self.dispatch_message(src_id, src_addr, message).await;
            }
        }
    }

    async fn dispatch_message(&mut self, src_id: NodeId, src_addr: SocketAddr, message: Message) {
        METRICS.message_requests_incoming.inc();
        match message {
            Message::Ping { req_id, .. } => {
                let pong = Message::Pong {
                    req_id,
                    enr_seq: self.local_record.seq(),
                    observed_ip: src_addr.ip(),
                    observed_port: src_addr.port(),
                };
                self.send_response(src_id, src_addr, pong).await;
            }
            Message::FindNode { req_id, distances } => {
                let records: Vec<Record> = if distances == [0] {
                    vec![self.local_record.clone()]
                } else {
                    self.routing_table
                        .neighbours_at_distances(&distances, true)
                        .into_iter()
                        .take(lookup::FIND_NODE_RESULT_LIMIT)
                        .map(|n| n.record)
                        .collect()
                };
                self.send_nodes(src_id, src_addr, req_id, records).await;
            }
            Message::TalkReq { req_id, proto_id, payload } => {
                let response = self.talk.dispatch(&proto_id, &payload);
                self.send_response(src_id, src_addr, Message::TalkResp { req_id, payload: response }).await;
            }
            Message::RegTopic { .. } | Message::TopicQuery { .. } => {
                trace!(peer = ?src_id, "ignoring unimplemented topic-advertisement message");
            }
            Message::Pong { .. } | Message::Nodes { .. } | Message::TalkResp { .. } => {
                let req_id = message.req_id().to_vec();
                if !self.registry.resolve(src_id, &req_id, message) {
                    METRICS.unsolicited_messages.inc();
                }
            }
        }
    }
}

fn random_iv() -> [u8; MASKING_IV_LEN] {
    let mut iv = [0u8; MASKING_IV_LEN];
    rand::thread_rng().fill(&mut iv);
    iv
}

impl ProtocolHandle {
    /// Binds the socket and seeds the routing table from `config`'s
    /// bootstrap records, but does not yet start the background loops --
    /// call [`ProtocolHandle::start`] once the caller is ready to run them
    /// (spec 4.6 `open`/`start`).
    pub async fn open(config: Config, static_key: SecretKey) -> Result<Self, ProtocolError> {
        let (protocol, tx) = Protocol::bind(config, static_key).await?;
        let local_id = protocol.local_id;
        let response_timeout = protocol.config.response_timeout;
        let enr_auto_update = protocol.config.enr_auto_update;
        let core_task = tokio::spawn(protocol.run());
        Ok(Self {
            local_id,
            response_timeout,
            enr_auto_update,
            commands: tx,
            core_task: Arc::new(AsyncMutex::new(Some(core_task))),
            background_tasks: Arc::new(AsyncMutex::new(Vec::new())),
        })
    }

    /// Starts the cooperative background tasks: table refresh, revalidation,
    /// the stale-entry prune sweep and IP-majority-driven ENR auto-update
    /// (spec 4.6, SPEC_FULL 11.2).
    pub async fn start(&self, initial_lookups: usize, refresh_interval: Duration, ip_majority_interval: Duration) {
        let mut tasks = self.background_tasks.lock().await;
        tasks.push(tokio::spawn(refresh_loop(self.clone(), initial_lookups, refresh_interval)));
        tasks.push(tokio::spawn(revalidate_loop(self.clone())));
        tasks.push(tokio::spawn(ip_majority_loop(self.clone(), ip_majority_interval)));
        tasks.push(tokio::spawn(prune_loop(self.clone())));
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Whether the local record auto-updates on an IP-vote majority (spec
    /// 4.6 line 129, config.rs `enr_auto_update`).
    fn enr_auto_update(&self) -> bool {
        self.enr_auto_update
    }

    /// Stops the background loops and signals the event loop to exit,
    /// without waiting for it to finish (spec 4.6 `close`).
    pub async fn close(&self) {
        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }
        let _ = self.commands.send(Command::Shutdown);
    }

    /// As [`ProtocolHandle::close`], but waits for the event loop task to
    /// actually finish before returning (spec 4.6 `closeWait`).
    pub async fn close_wait(&self) {
        self.close().await;
        if let Some(task) = self.core_task.lock().await.take() {
            let _ = task.await;
        }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).ok()?;
        rx.await.ok()
    }

    /// Sends a `ping`, reporting the outcome back to the routing table and
    /// returning the peer's observed address (spec 4.6).
    pub async fn ping(&self, node: &Node) -> Result<PongInfo, ProtocolError> {
        let (req_id, mut rx) = self
            .call(|reply| Command::Ping(node.clone(), reply))
            .await
            .ok_or(ProtocolError::UnknownNode(node.id))??;

        let outcome = tokio::time::timeout(self.response_timeout, rx.recv()).await;
        match outcome {
            Ok(Some(Message::Pong { enr_seq, observed_ip, observed_port, .. })) => {
                let _ = self.commands.send(Command::ReportOutcome(node.id, req_id, RequestOutcome::Success));
                Ok(PongInfo { enr_seq, observed_ip, observed_port })
            }
            Ok(Some(_)) => {
                let _ = self.commands.send(Command::ReportOutcome(node.id, req_id, RequestOutcome::Mismatch));
                Err(ProtocolError::Mismatch { peer: node.id })
            }
            Ok(None) | Err(_) => {
                let _ = self.commands.send(Command::ReportOutcome(node.id, req_id, RequestOutcome::Timeout));
                Err(ProtocolError::Timeout(node.id))
            }
        }
    }

    /// Sends a `findNode` for `distances`, accumulating every `nodes`
    /// fragment until `total` is reached or the slot stops producing more --
    /// a timeout mid-stream returns whatever was collected so far rather than
    /// erroring (spec 5, "partial result seen so far is returned
    /// successfully").
    pub async fn find_node(&self, node: &Node, distances: Vec<u16>) -> Result<Vec<Record>, ProtocolError> {
        let (req_id, mut rx) = self
            .call(|reply| Command::FindNode(node.clone(), distances, reply))
            .await
            .ok_or(ProtocolError::UnknownNode(node.id))??;

        let mut records = Vec::new();
        let mut received_fragments = 0u32;
        let mut expected_total = 1u32;
        loop {
            match tokio::time::timeout(self.response_timeout, rx.recv()).await {
                Ok(Some(Message::Nodes { total, records: chunk, .. })) => {
                    expected_total = total.max(1);
                    received_fragments += 1;
                    records.extend(chunk);
                    if received_fragments >= expected_total {
                        let _ = self.commands.send(Command::ReportOutcome(node.id, req_id, RequestOutcome::Success));
                        return Ok(records);
                    }
                }
                Ok(Some(_)) => {
                    let _ = self.commands.send(Command::ReportOutcome(node.id, req_id, RequestOutcome::Mismatch));
                    return Err(ProtocolError::Mismatch { peer: node.id });
                }
                Ok(None) | Err(_) => {
                    if records.is_empty() && received_fragments == 0 {
                        let _ =
                            self.commands.send(Command::ReportOutcome(node.id, req_id, RequestOutcome::Timeout));
                        return Err(ProtocolError::Timeout(node.id));
                    }
                    let _ = self.commands.send(Command::ReportOutcome(node.id, req_id, RequestOutcome::Success));
                    return Ok(records);
                }
            }
        }
    }

    /// Sends a `talkReq` and awaits the matching `talkResp` payload (spec
    /// 4.8).
    pub async fn talk_req(&self, node: &Node, proto_id: Vec<u8>, payload: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
        let (req_id, mut rx) = self
            .call(|reply| Command::TalkReq(node.clone(), proto_id, payload, reply))
            .await
            .ok_or(ProtocolError::UnknownNode(node.id))??;

        match tokio::time::timeout(self.response_timeout, rx.recv()).await {
            Ok(Some(Message::TalkResp { payload, .. })) => {
                let _ = self.commands.send(Command::ReportOutcome(node.id, req_id, RequestOutcome::Success));
                Ok(payload)
            }
            Ok(Some(_)) => {
                let _ = self.commands.send(Command::ReportOutcome(node.id, req_id, RequestOutcome::Mismatch));
                Err(ProtocolError::Mismatch { peer: node.id })
            }
            Ok(None) | Err(_) => {
                let _ = self.commands.send(Command::ReportOutcome(node.id, req_id, RequestOutcome::Timeout));
                Err(ProtocolError::Timeout(node.id))
            }
        }
    }

    pub async fn add_node(&self, node: Node) -> AddOutcome {
        self.call(|reply| Command::AddNode(node, reply)).await.unwrap_or(AddOutcome::LocalNode)
    }

    pub async fn get_node(&self, id: NodeId) -> Option<Node> {
        self.call(|reply| Command::GetNode(id, reply)).await.flatten()
    }

    pub async fn neighbours(&self, target: NodeId, k: usize) -> Vec<Node> {
        self.call(|reply| Command::Neighbours(target, k, reply)).await.unwrap_or_default()
    }

    pub async fn random_nodes(&self) -> Vec<Node> {
        self.call(Command::RandomNodes).await.unwrap_or_default()
    }

    pub async fn local_record(&self) -> Option<Record> {
        self.call(Command::LocalRecord).await
    }

    /// Re-signs and bumps the local record's `seq`, for both manual calls and
    /// IP-vote-driven auto-update (spec 4.6 `updateRecord`).
    pub async fn update_record(
        &self,
        ip: Option<IpAddr>,
        udp_port: Option<u16>,
        tcp_port: Option<u16>,
    ) -> Option<Record> {
        self.call(|reply| Command::UpdateRecord(ip, udp_port, tcp_port, reply)).await
    }

    pub async fn register_talk(&self, proto_id: Vec<u8>, handler: TalkHandler) -> Result<(), AlreadyRegistered> {
        self.call(|reply| Command::RegisterTalk(proto_id, handler, reply))
            .await
            .unwrap_or(Err(AlreadyRegistered(Vec::new())))
    }

    /// Iterative lookup for `target`, truncated to K (spec 4.7).
    pub async fn lookup(&self, target: NodeId) -> Vec<Node> {
        let seed = self.call(|reply| Command::LookupSeed(target, reply)).await.unwrap_or_default();
        lookup::lookup(target, self.local_id, seed, self).await
    }

    /// Untruncated random-target query, used by the refresh loop (spec 4.7).
    pub async fn query(&self, target: NodeId) -> Vec<Node> {
        let seed = self.call(|reply| Command::LookupSeed(target, reply)).await.unwrap_or_default();
        lookup::query(target, self.local_id, seed, self).await
    }

    async fn node_to_revalidate(&self) -> Option<Node> {
        self.call(Command::NodeToRevalidate).await.flatten()
    }

    fn set_just_seen(&self, id: NodeId) {
        let _ = self.commands.send(Command::SetJustSeen(id));
    }

    fn replace_unless_bootstrap(&self, id: NodeId) {
        let _ = self.commands.send(Command::ReplaceUnlessBootstrap(id));
    }

    fn update_neighbour_record_if_newer(&self, id: NodeId, record: Record) {
        let _ = self.commands.send(Command::ReplaceRecordIfNewer(id, record));
    }

    fn cast_ip_vote(&self, id: NodeId, addr: SocketAddr) {
        let _ = self.commands.send(Command::IpVote(id, addr));
    }

    async fn ip_majority(&self) -> Option<SocketAddr> {
        self.call(Command::IpMajority).await.flatten()
    }

    async fn table_fill_ratio(&self) -> f64 {
        self.call(Command::TableFillRatio).await.unwrap_or(0.0)
    }
}

#[async_trait]
impl FindNodeClient for ProtocolHandle {
    async fn find_node(&self, peer: &Node, distances: Vec<u16>) -> Result<Vec<Record>, ProtocolError> {
        ProtocolHandle::find_node(self, peer, distances).await
    }

    /// Opportunistically adds verified lookup results to the routing table
    /// (spec 3, spec 4.7).
    async fn observe_discovered(&self, nodes: &[Node]) {
        for node in nodes {
            let _ = self.add_node(node.clone()).await;
        }
    }
}

/// Ease-in-out cubic cadence between `lower_limit_ms` (empty table) and
/// `upper_limit_ms` (full table), driven by `progress` in `[0, 1]`
/// (SPEC_FULL 11.3, grounded in the teacher's `lookup_interval_function`).
fn lookup_interval_function(progress: f64, lower_limit_ms: f64, upper_limit_ms: f64) -> Duration {
    let t = progress.clamp(0.0, 1.0);
    let eased = if t < 0.5 { 4.0 * t * t * t } else { 1.0 - (-2.0 * t + 2.0).powi(3) / 2.0 };
    let ms = lower_limit_ms + (upper_limit_ms - lower_limit_ms) * eased;
    Duration::from_millis(ms as u64)
}

async fn refresh_loop(handle: ProtocolHandle, initial_lookups: usize, refresh_interval: Duration) {
    let local_id = handle.local_id();
    handle.lookup(local_id).await;
    for _ in 0..initial_lookups {
        handle.query(NodeId::random()).await;
    }
    loop {
        let progress = handle.table_fill_ratio().await;
        let interval = lookup_interval_function(progress, 0.0, LOOKUP_INTERVAL_UPPER_MS).min(refresh_interval);
        tokio::time::sleep(interval).await;
        handle.query(NodeId::random()).await;
    }
}

async fn revalidate_loop(handle: ProtocolHandle) {
    loop {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..REVALIDATE_JITTER.as_millis() as u64));
        tokio::time::sleep(jitter).await;

        let Some(node) = handle.node_to_revalidate().await else {
            tokio::time::sleep(REVALIDATE_JITTER).await;
            continue;
        };
        match handle.ping(&node).await {
            Ok(pong) => {
                handle.set_just_seen(node.id);
                if pong.enr_seq > node.record.seq() {
                    if let Ok(records) = handle.find_node(&node, vec![0]).await {
                        if let Some(record) = records.into_iter().next() {
                            handle.update_neighbour_record_if_newer(node.id, record);
                        }
                    }
                }
                handle.cast_ip_vote(node.id, SocketAddr::new(pong.observed_ip, pong.observed_port));
            }
            Err(_) => handle.replace_unless_bootstrap(node.id),
        }
    }
}

async fn ip_majority_loop(handle: ProtocolHandle, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if !handle.enr_auto_update() {
            continue;
        }
        if let Some(addr) = handle.ip_majority().await {
            if let Some(record) = handle.local_record().await {
                if record.ip() != Some(addr.ip()) || record.udp_port() != Some(addr.port()) {
                    handle.update_record(Some(addr.ip()), Some(addr.port()), record.tcp_port()).await;
                    METRICS.enr_auto_update.inc();
                }
            }
        }
    }
}

async fn prune_loop(handle: ProtocolHandle) {
    loop {
        tokio::time::sleep(PRUNE_INTERVAL).await;
        let _ = handle.commands.send(Command::Prune);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_on(port: u16) -> Config {
        Config {
            bind_address: format!("127.0.0.1:{port}").parse().expect("valid address"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn ping_pong_round_trip_on_loopback() {
        let key_a = SecretKey::new(&mut rand::thread_rng());
        let key_b = SecretKey::new(&mut rand::thread_rng());

        let handle_a = ProtocolHandle::open(config_on(20302), key_a).await.expect("bind a");
        let handle_b = ProtocolHandle::open(config_on(20303), key_b).await.expect("bind b");

        let record_b = handle_b.local_record().await.expect("record b");
        let node_b = Node::new(record_b);

        let pong = handle_a.ping(&node_b).await.expect("ping succeeds");
        assert_eq!(pong.observed_ip, "127.0.0.1".parse::<IpAddr>().unwrap());

        handle_a.close_wait().await;
        handle_b.close_wait().await;
    }

    #[tokio::test]
    async fn find_node_against_empty_table_returns_empty_nodes() {
        let key_a = SecretKey::new(&mut rand::thread_rng());
        let key_b = SecretKey::new(&mut rand::thread_rng());

        let handle_a = ProtocolHandle::open(config_on(20402), key_a).await.expect("bind a");
        let handle_b = ProtocolHandle::open(config_on(20403), key_b).await.expect("bind b");

        let record_b = handle_b.local_record().await.expect("record b");
        let node_b = Node::new(record_b);

        let records = handle_a.find_node(&node_b, vec![200]).await.expect("find_node succeeds");
        assert!(records.is_empty());

        handle_a.close_wait().await;
        handle_b.close_wait().await;
    }

    #[tokio::test]
    async fn talk_dispatch_round_trips_through_two_protocols() {
        let key_a = SecretKey::new(&mut rand::thread_rng());
        let key_b = SecretKey::new(&mut rand::thread_rng());

        let handle_a = ProtocolHandle::open(config_on(20502), key_a).await.expect("bind a");
        let handle_b = ProtocolHandle::open(config_on(20503), key_b).await.expect("bind b");
        handle_b
            .register_talk(b"echo".to_vec(), std::sync::Arc::new(|payload: &[u8]| payload.to_vec()))
            .await
            .expect("register");

        let record_b = handle_b.local_record().await.expect("record b");
        let node_b = Node::new(record_b);

        let response = handle_a.talk_req(&node_b, b"echo".to_vec(), b"hello".to_vec()).await.expect("talk_req");
        assert_eq!(response, b"hello");

        handle_a.close_wait().await;
        handle_b.close_wait().await;
    }

    #[test]
    fn lookup_interval_grows_with_table_progress() {
        let empty = lookup_interval_function(0.0, 100.0, 60_000.0);
        let full = lookup_interval_function(1.0, 100.0, 60_000.0);
        assert!(empty < full);
    }
}
