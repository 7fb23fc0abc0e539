//! In-memory transport for tests and the simulator.
//!
//! Models the same contract as the real datagram transport: `send` is
//! non-blocking and best-effort, `poll` is non-blocking, nothing is
//! ordered. Loss, duplication and reordering are driven by a seeded RNG so
//! a simulation run is reproducible from its seed alone.

use std::collections::{HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::message::{Envelope, NodeId};

/// Fault knobs applied on every send/poll.
#[derive(Debug, Clone, Copy)]
pub struct NetworkOptions {
    /// Probability that a sent message is silently dropped.
    pub drop_rate: f64,
    /// Probability that a sent message is delivered twice.
    pub duplicate_rate: f64,
    /// Deliver inbox messages in random order instead of FIFO.
    pub reorder: bool,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        NetworkOptions {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            reorder: false,
        }
    }
}

/// A best-effort, lossy, unordered datagram network between N nodes.
pub struct InMemoryNetwork {
    inboxes: Vec<VecDeque<Envelope>>,
    /// Disabled nodes neither send nor receive (a crashed or fully
    /// isolated server).
    enabled: Vec<bool>,
    /// Pairs that cannot talk to each other (symmetric).
    partitions: HashSet<(NodeId, NodeId)>,
    opts: NetworkOptions,
    rng: StdRng,
}

impl InMemoryNetwork {
    pub fn new(cluster_size: u32, seed: u64, opts: NetworkOptions) -> Self {
        InMemoryNetwork {
            inboxes: (0..cluster_size).map(|_| VecDeque::new()).collect(),
            enabled: vec![true; cluster_size as usize],
            partitions: HashSet::new(),
            opts,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Best-effort send: may drop or duplicate, never errors.
    pub fn send(&mut self, env: Envelope) {
        if !self.enabled[env.from as usize] || !self.enabled[env.to as usize] {
            return;
        }
        if self.partitions.contains(&ordered(env.from, env.to)) {
            return;
        }
        if self.opts.drop_rate > 0.0 && self.rng.gen::<f64>() < self.opts.drop_rate {
            return;
        }
        let duplicate = self.opts.duplicate_rate > 0.0
            && self.rng.gen::<f64>() < self.opts.duplicate_rate;
        let inbox = &mut self.inboxes[env.to as usize];
        if duplicate {
            inbox.push_back(env.clone());
        }
        inbox.push_back(env);
    }

    /// Next available message for `node`, if any.
    pub fn poll(&mut self, node: NodeId) -> Option<Envelope> {
        if !self.enabled[node as usize] {
            return None;
        }
        let inbox = &mut self.inboxes[node as usize];
        if inbox.is_empty() {
            return None;
        }
        if self.opts.reorder && inbox.len() > 1 {
            let pick = self.rng.gen_range(0..inbox.len());
            inbox.swap(0, pick);
        }
        inbox.pop_front()
    }

    /// Take `node` off the network entirely.
    pub fn disable(&mut self, node: NodeId) {
        self.enabled[node as usize] = false;
    }

    pub fn enable(&mut self, node: NodeId) {
        self.enabled[node as usize] = true;
    }

    /// Drop whatever is queued for `node` (a crashed server loses its
    /// undelivered datagrams).
    pub fn clear_inbox(&mut self, node: NodeId) {
        self.inboxes[node as usize].clear();
    }

    /// Cut the link between two nodes, both directions.
    pub fn partition(&mut self, a: NodeId, b: NodeId) {
        self.partitions.insert(ordered(a, b));
    }

    pub fn heal(&mut self, a: NodeId, b: NodeId) {
        self.partitions.remove(&ordered(a, b));
    }

    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    pub fn pending(&self, node: NodeId) -> usize {
        self.inboxes[node as usize].len()
    }

    pub fn is_idle(&self) -> bool {
        self.inboxes.iter().all(|inbox| inbox.is_empty())
    }
}

fn ordered(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
