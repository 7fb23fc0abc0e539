//! Deterministic cluster simulator.
//!
//! Runs N consensus cores against the in-memory network under a logical
//! tick clock. All randomness — election timeouts, message loss,
//! duplication, reordering, fault injection — flows from a single seed, so
//! any failing run replays exactly from its seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::app::{Applier, KvStore};
use crate::raft::message::NodeId;
use crate::raft::network::{InMemoryNetwork, NetworkOptions};
use crate::raft::node::{Event, RaftNode, Receipt};
use crate::store::MemoryStorage;

use super::checker::Checker;

/// Simulation parameters. Tick durations mirror the real runtime's shape:
/// heartbeats fire an order of magnitude more often than election
/// timeouts.
#[derive(Debug, Clone, Copy)]
pub struct SimOptions {
    pub cluster_size: u32,
    /// Election timeout range, in ticks, redrawn per firing.
    pub election_ticks: (u64, u64),
    /// Heartbeat cadence, in ticks.
    pub heartbeat_ticks: u64,
    pub network: NetworkOptions,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            cluster_size: 3,
            election_ticks: (15, 30),
            heartbeat_ticks: 5,
            network: NetworkOptions::default(),
        }
    }
}

pub struct SimCluster {
    pub(crate) nodes: Vec<Option<RaftNode<MemoryStorage>>>,
    /// Persisted state of crashed nodes, waiting for a restart.
    crashed: Vec<Option<MemoryStorage>>,
    pub(crate) net: InMemoryNetwork,
    pub(crate) rng: StdRng,
    now: u64,
    election_deadline: Vec<u64>,
    appliers: Vec<Applier>,
    stores: Vec<KvStore>,
    pub(crate) checker: Checker,
    opts: SimOptions,
    seed: u64,
}

impl SimCluster {
    pub fn new(seed: u64, opts: SimOptions) -> Self {
        let n = opts.cluster_size;
        let mut rng = StdRng::seed_from_u64(seed);
        let nodes = (0..n)
            .map(|id| {
                Some(RaftNode::new(
                    id,
                    n,
                    MemoryStorage::new(),
                    Default::default(),
                ))
            })
            .collect();
        let election_deadline = (0..n)
            .map(|_| rng.gen_range(opts.election_ticks.0..=opts.election_ticks.1))
            .collect();
        SimCluster {
            nodes,
            crashed: (0..n).map(|_| None).collect(),
            // Derive the network's stream from the same seed.
            net: InMemoryNetwork::new(n, seed.wrapping_add(1), opts.network),
            rng,
            now: 0,
            election_deadline,
            appliers: (0..n).map(|_| Applier::new()).collect(),
            stores: (0..n).map(|_| KvStore::new()).collect(),
            checker: Checker::new(),
            opts,
            seed,
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn cluster_size(&self) -> u32 {
        self.opts.cluster_size
    }

    pub fn node(&self, id: NodeId) -> Option<&RaftNode<MemoryStorage>> {
        self.nodes[id as usize].as_ref()
    }

    pub fn store(&self, id: NodeId) -> &KvStore {
        &self.stores[id as usize]
    }

    pub fn checker(&self) -> &Checker {
        &self.checker
    }

    pub fn is_crashed(&self, id: NodeId) -> bool {
        self.nodes[id as usize].is_none()
    }

    pub fn crashed_count(&self) -> u32 {
        self.nodes.iter().filter(|n| n.is_none()).count() as u32
    }

    /// The live leader with the highest term. Stale leaders in older terms
    /// can coexist briefly; the highest term is the real one.
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .flatten()
            .filter(|n| n.is_leader())
            .max_by_key(|n| n.current_term())
            .map(|n| n.id())
    }

    /// Advance logical time by one tick: deliver mail, fire timers, apply
    /// committed entries, then check every safety property.
    pub fn tick(&mut self) {
        self.now += 1;
        let n = self.opts.cluster_size as usize;

        // Deliver everything currently queued.
        for id in 0..n {
            while let Some(env) = self.net.poll(id as NodeId) {
                if let Some(node) = self.nodes[id].as_mut() {
                    node.step(Event::Receive(env)).expect("memory storage");
                }
                self.flush(id);
            }
        }

        // Heartbeat cadence; non-leaders ignore the event.
        if self.now % self.opts.heartbeat_ticks == 0 {
            for id in 0..n {
                if let Some(node) = self.nodes[id].as_mut() {
                    node.step(Event::HeartbeatTimeout).expect("memory storage");
                }
                self.flush(id);
            }
        }

        // Per-node randomized election deadlines.
        for id in 0..n {
            if self.now >= self.election_deadline[id] {
                if let Some(node) = self.nodes[id].as_mut() {
                    node.step(Event::ElectionTimeout).expect("memory storage");
                }
                self.flush(id);
                self.reset_election_deadline(id as NodeId);
            }
        }

        // Apply newly committed entries and record them for the
        // state-machine safety check.
        for id in 0..n {
            let applied = match self.nodes[id].as_ref() {
                Some(node) => self.appliers[id].drain(node, &mut self.stores[id]),
                None => continue,
            };
            for (index, _response) in applied {
                let command = self.nodes[id]
                    .as_ref()
                    .unwrap()
                    .log()
                    .get(index)
                    .expect("applied entries exist in the log")
                    .command
                    .clone();
                if let Err(violation) = self.checker.record_applied(id as NodeId, index, command) {
                    panic!("safety violation (seed {}): {}", self.seed, violation);
                }
            }
        }

        if let Err(violation) = self.checker.check(&self.nodes) {
            panic!("safety violation (seed {}): {}", self.seed, violation);
        }
    }

    pub fn tick_n(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Tick until the predicate holds, up to `max_ticks`.
    pub fn run_until<F: Fn(&SimCluster) -> bool>(&mut self, max_ticks: u64, pred: F) -> bool {
        for _ in 0..max_ticks {
            if pred(self) {
                return true;
            }
            self.tick();
        }
        pred(self)
    }

    /// Submit a command to the current leader, if there is one.
    pub fn client_append(&mut self, command: Vec<u8>) -> Option<Receipt> {
        let leader = self.leader()?;
        let node = self.nodes[leader as usize].as_mut()?;
        let receipt = node
            .client_append(command)
            .expect("memory storage")
            .ok()?;
        self.flush(leader as usize);
        Some(receipt)
    }

    /// Stop a node dead: volatile state is gone, queued datagrams are
    /// lost, only its persisted storage survives for `restart`.
    pub fn crash(&mut self, id: NodeId) {
        if let Some(node) = self.nodes[id as usize].take() {
            log::info!("[sim t={}] crash node {}", self.now, id);
            self.crashed[id as usize] = Some(node.into_storage());
            self.net.disable(id);
            self.net.clear_inbox(id);
        }
    }

    /// Bring a crashed node back from its persisted state.
    pub fn restart(&mut self, id: NodeId) {
        if let Some(storage) = self.crashed[id as usize].take() {
            log::info!("[sim t={}] restart node {}", self.now, id);
            let boot = storage.boot_state();
            self.nodes[id as usize] = Some(RaftNode::new(
                id,
                self.opts.cluster_size,
                storage,
                boot,
            ));
            // The state machine rebuilds by replaying the log from the top.
            self.appliers[id as usize] = Applier::new();
            self.stores[id as usize] = KvStore::new();
            self.net.enable(id);
            self.reset_election_deadline(id);
        }
    }

    pub fn restart_all_crashed(&mut self) {
        for id in 0..self.opts.cluster_size {
            self.restart(id);
        }
    }

    /// Cut one link, both directions.
    pub fn partition(&mut self, a: NodeId, b: NodeId) {
        log::info!("[sim t={}] partition {} | {}", self.now, a, b);
        self.net.partition(a, b);
    }

    /// Cut a node off from every peer.
    pub fn isolate(&mut self, id: NodeId) {
        log::info!("[sim t={}] isolate node {}", self.now, id);
        for other in 0..self.opts.cluster_size {
            if other != id {
                self.net.partition(id, other);
            }
        }
    }

    pub fn heal_all(&mut self) {
        log::info!("[sim t={}] heal all partitions", self.now);
        self.net.heal_all();
    }

    /// Logs of two live nodes are identical.
    pub fn logs_equal(&self, a: NodeId, b: NodeId) -> bool {
        match (self.node(a), self.node(b)) {
            (Some(a), Some(b)) => a.log().entries() == b.log().entries(),
            _ => false,
        }
    }

    /// Every live node carries the same log and commit index.
    pub fn converged(&self) -> bool {
        let mut live = self.nodes.iter().flatten();
        let first = match live.next() {
            Some(node) => node,
            None => return false,
        };
        live.all(|node| {
            node.log().entries() == first.log().entries()
                && node.commit_index() == first.commit_index()
        })
    }

    fn flush(&mut self, id: usize) {
        if let Some(node) = self.nodes[id].as_mut() {
            for env in node.take_outbox() {
                self.net.send(env);
            }
        }
    }

    fn reset_election_deadline(&mut self, id: NodeId) {
        let (lo, hi) = self.opts.election_ticks;
        self.election_deadline[id as usize] = self.now + self.rng.gen_range(lo..=hi);
    }
}
