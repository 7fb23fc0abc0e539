use std::io;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::message::NodeId;
use super::progress::MAX_CLUSTER_SIZE;

fn default_heartbeat_ms() -> u64 {
    50
}

fn default_election_ms_min() -> u64 {
    150
}

fn default_election_ms_max() -> u64 {
    300
}

fn default_data_dir() -> String {
    "./floe-data".to_string()
}

/// Static cluster configuration, loaded from a JSON file at startup.
///
/// Node ids are positions in `addresses`; the file needs nothing beyond
/// the address list:
///
/// ```json
/// { "addresses": ["127.0.0.1:5001", "127.0.0.1:5002", "127.0.0.1:5003"] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// One UDP address per server; a server's id is its index here.
    pub addresses: Vec<String>,
    /// Leader heartbeat interval.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Election timeouts are drawn uniformly from this range, per firing.
    #[serde(default = "default_election_ms_min")]
    pub election_ms_min: u64,
    #[serde(default = "default_election_ms_max")]
    pub election_ms_max: u64,
    /// Base directory for per-server durable state (`<dir>/<id>/`).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ClusterConfig = serde_json::from_str(&text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> io::Result<()> {
        let n = self.addresses.len();
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "config needs at least one server address",
            ));
        }
        if n > MAX_CLUSTER_SIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cluster size {} exceeds maximum {}", n, MAX_CLUSTER_SIZE),
            ));
        }
        if n % 2 == 0 {
            log::warn!(
                "cluster size {} is even; an odd size tolerates the same \
                 number of failures with one server fewer",
                n
            );
        }
        if self.election_ms_min <= self.heartbeat_ms {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "election_ms_min must be strictly greater than heartbeat_ms",
            ));
        }
        if self.election_ms_max < self.election_ms_min {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "election_ms_max must be at least election_ms_min",
            ));
        }
        Ok(())
    }

    pub fn cluster_size(&self) -> u32 {
        self.addresses.len() as u32
    }

    pub fn address(&self, id: NodeId) -> &str {
        &self.addresses[id as usize]
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Draw a fresh randomized election timeout. Randomization is what
    /// breaks split votes; the range must dominate the heartbeat interval.
    pub fn random_election_timeout(&self, rng: &mut impl Rng) -> Duration {
        Duration::from_millis(rng.gen_range(self.election_ms_min..=self.election_ms_max))
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            addresses: Vec::new(),
            heartbeat_ms: default_heartbeat_ms(),
            election_ms_min: default_election_ms_min(),
            election_ms_max: default_election_ms_max(),
            data_dir: default_data_dir(),
        }
    }
}
