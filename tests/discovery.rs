//! End-to-end scenarios exercising the protocol core over real loopback UDP
//! sockets, one `ProtocolHandle` per simulated peer. Component-level behavior
//! (wire codec, crypto, routing table, lookup distances) is covered by the
//! `#[cfg(test)]` modules next to the code; these bind sockets and drive the
//! whole handshake-then-request path the way two real nodes would.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use discv5::{Config, Node, ProtocolHandle};
use secp256k1::SecretKey;

fn config_on(port: u16) -> Config {
    Config {
        bind_address: format!("127.0.0.1:{port}").parse().expect("valid loopback address"),
        ..Config::default()
    }
}

fn fresh_key() -> SecretKey {
    SecretKey::new(&mut rand::thread_rng())
}

async fn open(port: u16) -> ProtocolHandle {
    ProtocolHandle::open(config_on(port), fresh_key()).await.expect("bind loopback socket")
}

/// Scenario 1 (spec 8): A pings B cold, with no prior session -- the
/// handshake runs inline and the pong carries B's view of A's address.
#[tokio::test]
async fn ping_establishes_a_session_and_reports_the_observed_address() {
    let a = open(23010).await;
    let b = open(23011).await;

    let node_b = Node::new(b.local_record().await.expect("b's record"));
    let pong = a.ping(&node_b).await.expect("ping succeeds");

    assert_eq!(pong.observed_ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    assert_eq!(pong.enr_seq, 1);

    a.close_wait().await;
    b.close_wait().await;
}

/// Scenario 2 (spec 8): `findNode(peer, [0])` returns exactly the peer's own
/// record, independent of anything in its routing table.
#[tokio::test]
async fn find_node_with_distance_zero_returns_the_peers_own_record() {
    let a = open(23020).await;
    let b = open(23021).await;

    let node_b = Node::new(b.local_record().await.expect("b's record"));
    let records = a.find_node(&node_b, vec![0]).await.expect("find_node succeeds");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].node_id(), node_b.id);

    a.close_wait().await;
    b.close_wait().await;
}

/// Scenario 3 (spec 8): querying an empty table at an arbitrary distance
/// comes back `Ok(vec![])`, not an error.
#[tokio::test]
async fn find_node_against_an_empty_table_returns_no_nodes() {
    let a = open(23030).await;
    let b = open(23031).await;

    let node_b = Node::new(b.local_record().await.expect("b's record"));
    let records = a.find_node(&node_b, vec![128]).await.expect("find_node succeeds");
    assert!(records.is_empty());

    a.close_wait().await;
    b.close_wait().await;
}

/// Scenario 4 (spec 8): a three-node ring where A only knows B and B only
/// knows C. A transitive `lookup(C)` has to ask B before it can find C.
#[tokio::test]
async fn lookup_discovers_a_node_two_hops_away() {
    let a = open(23040).await;
    let b = open(23041).await;
    let c = open(23042).await;

    let node_b = Node::new(b.local_record().await.expect("b's record"));
    let node_c = Node::new(c.local_record().await.expect("c's record"));

    a.add_node(node_b.clone()).await;
    b.add_node(node_c.clone()).await;

    let found = a.lookup(node_c.id).await;
    assert!(found.iter().any(|n| n.id == node_c.id), "lookup did not surface the two-hop peer");

    a.close_wait().await;
    b.close_wait().await;
    c.close_wait().await;
}

/// Scenario 5 (spec 8): a ping against a dead peer times out, and the dead
/// peer -- having been seeded into the table first -- is evicted rather than
/// left sitting there.
#[tokio::test]
async fn ping_timeout_evicts_the_unresponsive_peer() {
    let config = Config {
        response_timeout: Duration::from_millis(200),
        ..config_on(23050)
    };
    let a = ProtocolHandle::open(config, fresh_key()).await.expect("bind a");

    // Nothing is listening on this port: every datagram sent here is dropped.
    let dead_record = discv5::Record::new(
        1,
        Some("127.0.0.1".parse().unwrap()),
        Some(23051),
        None,
        &fresh_key(),
    );
    let dead_node = Node::new(dead_record);

    assert!(matches!(a.add_node(dead_node.clone()).await, discv5::AddOutcome::Added));
    assert!(a.get_node(dead_node.id).await.is_some());

    let outcome = a.ping(&dead_node).await;
    assert!(matches!(outcome, Err(discv5::ProtocolError::Timeout(id)) if id == dead_node.id));
    assert!(a.get_node(dead_node.id).await.is_none());

    a.close_wait().await;
}

/// Scenario 6 (spec 8): a talk sub-protocol round trip through the Portal
/// overlay's ping/pong pair, not the bare `talk` echo used elsewhere.
#[tokio::test]
async fn portal_ping_round_trips_through_the_talk_dispatcher() {
    use discv5::portal::{PortalClient, PortalResponder};

    let a = open(23060).await;
    let b = open(23061).await;

    let record_b = b.local_record().await.expect("b's record");
    let responder = PortalResponder::new(record_b.clone());
    responder.register(&b).await.expect("register portal handler");

    let node_b = Node::new(record_b.clone());
    let client = PortalClient::new(&a);
    let (enr_seq, _data_radius) = client.ping(&node_b, 0).await.expect("portal ping succeeds");
    assert_eq!(enr_seq, record_b.seq());

    a.close_wait().await;
    b.close_wait().await;
}

/// Not one of the six literal scenarios, but the natural follow-on to
/// scenario 4: two independently-opened handles never collide on node id
/// even when racing to bind adjacent loopback ports.
#[tokio::test]
async fn three_independently_opened_handles_have_distinct_ids() {
    let a = open(23070).await;
    let b = open(23071).await;
    let c = open(23072).await;

    let ids: std::collections::HashSet<_> = [a.local_id(), b.local_id(), c.local_id()].into_iter().collect();
    assert_eq!(ids.len(), 3);

    a.close_wait().await;
    b.close_wait().await;
    c.close_wait().await;
}

/// Registering the same talk protoId twice is rejected, independent of which
/// handler would have won (spec 4.8 "at most one handler per protoId").
#[tokio::test]
async fn registering_a_talk_protocol_twice_is_rejected() {
    let a = open(23080).await;
    let handler: discv5::TalkHandler = Arc::new(|payload: &[u8]| payload.to_vec());

    a.register_talk(b"dup".to_vec(), handler.clone()).await.expect("first registration succeeds");
    let second = a.register_talk(b"dup".to_vec(), handler).await;
    assert!(second.is_err());

    a.close_wait().await;
}
