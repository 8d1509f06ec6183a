//! C9 IP-Vote Accumulator: majority external-address estimator driving
//! ENR auto-update (spec 4.9).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::node::{Address, NodeId};

struct Vote {
    address: Address,
    cast_at: Instant,
}

pub struct IpVoteAccumulator {
    ttl: Duration,
    votes: HashMap<NodeId, Vote>,
}

impl IpVoteAccumulator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            votes: HashMap::new(),
        }
    }

    /// One vote per node id; a repeat vote overwrites the previous one.
    pub fn insert(&mut self, node_id: NodeId, address: Address) {
        self.votes.insert(
            node_id,
            Vote {
                address,
                cast_at: Instant::now(),
            },
        );
    }

    fn prune_expired(&mut self) {
        let ttl = self.ttl;
        let now = Instant::now();
        self.votes.retain(|_, vote| now.duration_since(vote.cast_at) < ttl);
    }

    /// The address voted by strictly more than half of active voters.
    pub fn majority(&mut self) -> Option<Address> {
        self.prune_expired();
        if self.votes.is_empty() {
            return None;
        }
        let mut tally: HashMap<Address, usize> = HashMap::new();
        for vote in self.votes.values() {
            *tally.entry(vote.address).or_default() += 1;
        }
        let total = self.votes.len();
        tally
            .into_iter()
            .find(|(_, count)| *count * 2 > total)
            .map(|(addr, _)| addr)
    }
}
