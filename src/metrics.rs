//! The four counters spec 6 requires as externally-visible telemetry. Kept
//! deliberately small relative to the teacher's `metrics.rs` -- this crate's
//! Non-goals exclude the broader sync/peer-count dashboard that module feeds.

use std::sync::LazyLock;

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::default);

#[derive(Debug)]
pub struct Metrics {
    _registry: Registry,
    /// `message_requests_outgoing{response="ok"|"timeout"|"mismatch"}` (spec
    /// 6) -- split by how the request was ultimately resolved.
    pub message_requests_outgoing_ok: IntCounter,
    pub message_requests_outgoing_timeout: IntCounter,
    pub message_requests_outgoing_mismatch: IntCounter,
    pub message_requests_incoming: IntCounter,
    pub unsolicited_messages: IntCounter,
    pub enr_auto_update: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        let registry = Registry::new();

        let outgoing = IntCounterVec::new(
            Opts::new(
                "message_requests_outgoing",
                "outbound requests, split by whether a typed response arrived",
            ),
            &["response"],
        )
        .expect("static metric descriptor");

        let incoming = IntCounter::new("message_requests_incoming", "inbound requests handled")
            .expect("static metric descriptor");
        let unsolicited = IntCounter::new(
            "unsolicited_messages",
            "inbound messages with no matching awaited slot",
        )
        .expect("static metric descriptor");
        let enr_auto_update = IntCounter::new(
            "enr_auto_update",
            "local record updates driven by IP-vote majority",
        )
        .expect("static metric descriptor");

        registry
            .register(Box::new(outgoing.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(incoming.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(unsolicited.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(enr_auto_update.clone()))
            .expect("unique metric name");

        Self {
            message_requests_outgoing_ok: outgoing.with_label_values(&["ok"]),
            message_requests_outgoing_timeout: outgoing.with_label_values(&["timeout"]),
            message_requests_outgoing_mismatch: outgoing.with_label_values(&["mismatch"]),
            message_requests_incoming: incoming,
            unsolicited_messages: unsolicited,
            enr_auto_update,
            _registry: registry,
        }
    }
}
