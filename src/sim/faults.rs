//! Fault injection for simulation runs.
//!
//! The nemesis periodically disrupts the cluster — crashing the leader,
//! partitioning it away from a majority, healing everything — with all
//! decisions drawn from the cluster's seeded RNG, so a run's fault
//! schedule replays from its seed.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::raft::message::NodeId;

use super::cluster::SimCluster;

/// Faults the nemesis can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Crash the current leader (skipped if it would exceed a minority).
    CrashLeader,
    /// Partition the current leader away from a majority of its peers.
    PartitionLeader,
    /// Heal all partitions and restart every crashed node.
    Heal,
    /// Do nothing this round.
    Noop,
}

/// A fault that was actually injected, for the run report.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    pub at_tick: u64,
    pub fault: Fault,
    pub target: Option<NodeId>,
}

#[derive(Debug, Clone, Copy)]
pub struct NemesisConfig {
    /// How often to consider injecting, in ticks.
    pub tick_interval: u64,
    /// Probability of injecting on each consideration.
    pub fault_probability: f64,
    /// Relative weights for CrashLeader, PartitionLeader, Heal.
    pub fault_weights: [f64; 3],
    /// Minimum ticks between injected faults.
    pub min_fault_interval: u64,
}

impl Default for NemesisConfig {
    fn default() -> Self {
        NemesisConfig {
            tick_interval: 10,
            fault_probability: 0.3,
            // Favor healing so the cluster keeps making progress.
            fault_weights: [1.0, 1.0, 2.0],
            min_fault_interval: 40,
        }
    }
}

/// The fault injector. Owns no randomness of its own; every decision
/// comes from the cluster RNG it is handed.
#[derive(Debug)]
pub struct Nemesis {
    config: NemesisConfig,
    last_fault: Option<u64>,
    history: Vec<FaultEvent>,
}

impl Default for Nemesis {
    fn default() -> Self {
        Nemesis::new(NemesisConfig::default())
    }
}

impl Nemesis {
    pub fn new(config: NemesisConfig) -> Self {
        Nemesis {
            config,
            last_fault: None,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[FaultEvent] {
        &self.history
    }
}

impl SimCluster {
    /// Give the nemesis a chance to act. Call once per tick.
    pub fn nemesis_tick(&mut self, nemesis: &mut Nemesis) {
        let config = nemesis.config;
        if self.now() % config.tick_interval != 0 {
            return;
        }
        if let Some(last) = nemesis.last_fault {
            if self.now() - last < config.min_fault_interval {
                return;
            }
        }
        if self.rng.gen::<f64>() >= config.fault_probability {
            return;
        }

        let fault = choose_fault(&config.fault_weights, &mut self.rng);
        let target = self.inject(fault);
        nemesis.last_fault = Some(self.now());
        nemesis.history.push(FaultEvent {
            at_tick: self.now(),
            fault,
            target,
        });
    }

    /// Inject a specific fault. Returns the targeted node, if any.
    pub fn inject(&mut self, fault: Fault) -> Option<NodeId> {
        match fault {
            Fault::CrashLeader => {
                let leader = self.leader()?;
                // Never take down a majority: the run should keep living.
                if self.crashed_count() + 1 > (self.cluster_size() - 1) / 2 {
                    return None;
                }
                self.crash(leader);
                Some(leader)
            }
            Fault::PartitionLeader => {
                let leader = self.leader()?;
                let mut peers: Vec<NodeId> = (0..self.cluster_size())
                    .filter(|&p| p != leader)
                    .collect();
                peers.shuffle(&mut self.rng);
                let cut = (self.cluster_size() / 2 + 1).min(peers.len() as u32);
                for &peer in peers.iter().take(cut as usize) {
                    self.partition(leader, peer);
                }
                Some(leader)
            }
            Fault::Heal => {
                self.heal_all();
                self.restart_all_crashed();
                None
            }
            Fault::Noop => None,
        }
    }
}

fn choose_fault(weights: &[f64; 3], rng: &mut impl Rng) -> Fault {
    let total: f64 = weights.iter().sum();
    let mut draw = rng.gen::<f64>() * total;
    if draw < weights[0] {
        return Fault::CrashLeader;
    }
    draw -= weights[0];
    if draw < weights[1] {
        return Fault::PartitionLeader;
    }
    Fault::Heal
}
