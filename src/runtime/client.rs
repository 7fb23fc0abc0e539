//! Client helpers for the CLI: try each server, follow leader hints.

use std::collections::VecDeque;
use std::io;
use std::net::UdpSocket;
use std::time::Duration;

use rand::Rng;

use crate::raft::config::ClusterConfig;
use crate::raft::message::NodeId;

use super::udp::resolve;
use super::{ClientReply, ClientRequest, Datagram};

/// How long to wait for a single server's answer. Writes are acknowledged
/// only on commit, so this must cover a few heartbeat rounds.
const REPLY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Send `command` to the cluster, chasing leader hints.
///
/// Returns `None` if no server produced a definitive answer. Retrying a
/// timed-out write may commit it twice; request deduplication is the
/// application's concern, not the consensus core's.
pub fn execute(config: &ClusterConfig, command: ClientRequest) -> io::Result<Option<ClientReply>> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(REPLY_TIMEOUT))?;
    let mut rng = rand::thread_rng();

    let mut targets: VecDeque<NodeId> = (0..config.cluster_size()).collect();
    let mut attempts = 0;
    let mut buf = [0u8; 64 * 1024];

    while let Some(target) = targets.pop_front() {
        attempts += 1;
        if attempts > 3 * config.cluster_size() {
            break;
        }
        let addr = resolve(config.address(target))?;
        let request_id: u64 = rng.gen();
        let request = Datagram::Request {
            id: request_id,
            command: command.clone(),
        };
        if socket.send_to(&request.to_bytes(), addr).is_err() {
            targets.push_back(target);
            continue;
        }

        match socket.recv_from(&mut buf) {
            Ok((len, _)) => match Datagram::from_bytes(&buf[..len]) {
                Ok(Datagram::Reply { id, reply }) if id == request_id => match reply {
                    ClientReply::NotLeader { hint: Some(leader) } if leader != target => {
                        log::debug!("server {} redirects to {}", target, leader);
                        targets.push_front(leader);
                    }
                    ClientReply::NotLeader { .. } => {
                        log::debug!("server {} is not the leader", target);
                        targets.push_back(target);
                    }
                    reply => return Ok(Some(reply)),
                },
                _ => {
                    // Stale or foreign datagram; move on.
                    targets.push_back(target);
                }
            },
            Err(_) => {
                log::debug!("no reply from server {}", target);
            }
        }
    }
    Ok(None)
}
