//! Configuration surface (spec 6), defaults matching the reference exactly.

use std::net::SocketAddr;
use std::time::Duration;

use crate::node::Record;

/// Per-bucket and per-table IP-subnet caps (spec 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpLimits {
    pub per_bucket: usize,
    pub per_table: usize,
}

impl Default for IpLimits {
    fn default() -> Self {
        Self {
            per_bucket: 2,
            per_table: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub bootstrap_records: Vec<Record>,
    pub enr_auto_update: bool,
    pub table_ip_limits: IpLimits,
    pub handshake_timeout: Duration,
    pub response_timeout: Duration,
    pub refresh_interval: Duration,
    pub ip_majority_interval: Duration,
    /// Number of random-target lookups run once at `open`, after the initial
    /// self-lookup (spec 4.6 refreshLoop).
    pub initial_lookups: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".parse().expect("static address"),
            bootstrap_records: Vec::new(),
            enr_auto_update: false,
            table_ip_limits: IpLimits::default(),
            handshake_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(4),
            refresh_interval: Duration::from_secs(5 * 60),
            ip_majority_interval: Duration::from_secs(5 * 60),
            initial_lookups: 3,
        }
    }
}
