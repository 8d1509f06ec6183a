//! C4 Routing Table: buckets by log-distance, IP-limit enforcement,
//! replacement cache (spec 3, 4.4).

pub mod bucket;
pub mod table;

pub use table::{AddOutcome, RoutingTable};
