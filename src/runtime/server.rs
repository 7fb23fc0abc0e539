//! The server event loop: one thread multiplexing socket traffic, wall
//! clock timers, client requests and the apply path into the consensus
//! core's event step.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use crate::app::{Applier, KvCommand, KvStore};
use crate::raft::config::ClusterConfig;
use crate::raft::message::NodeId;
use crate::raft::node::{ConfirmToken, Event, RaftNode};
use crate::store::FileStorage;

use super::udp::UdpTransport;
use super::{ClientReply, ClientRequest, Datagram};

/// A write waiting for its log index to commit.
struct PendingWrite {
    /// Term of the receipt; a different term at the index means the entry
    /// was overwritten by another leader and the write is lost.
    term: u64,
    addr: SocketAddr,
    request_id: u64,
}

/// Run a server until the process dies. Only storage faults return.
pub fn run(id: NodeId, config: ClusterConfig) -> std::io::Result<()> {
    config.validate()?;
    let dir = PathBuf::from(&config.data_dir).join(id.to_string());
    let (storage, boot) = FileStorage::open(&dir)?;
    log::info!(
        "node {}: starting at term {} with {} recovered entries",
        id,
        boot.current_term,
        boot.entries.len()
    );

    let mut node = RaftNode::new(id, config.cluster_size(), storage, boot);
    let transport = UdpTransport::bind(&config, id)?;
    let mut kv = KvStore::new();
    let mut applier = Applier::new();
    let mut rng = rand::thread_rng();

    let heartbeat = config.heartbeat_interval();
    let mut heartbeat_deadline = Instant::now() + heartbeat;
    let mut election_deadline = Instant::now() + config.random_election_timeout(&mut rng);

    let mut pending_writes: HashMap<u64, PendingWrite> = HashMap::new();
    let mut pending_reads: HashMap<ConfirmToken, (SocketAddr, u64, String)> = HashMap::new();
    let mut was_leader = false;

    loop {
        // Sleep until the next timer unless traffic arrives first.
        let now = Instant::now();
        let next_deadline = heartbeat_deadline.min(election_deadline);
        let timeout = next_deadline.saturating_duration_since(now);

        if let Some((src, dgram)) = transport.recv_timeout(timeout) {
            match dgram {
                Datagram::Raft(env) => {
                    if env.to == id {
                        node.step(Event::Receive(env))?;
                    } else {
                        log::warn!("datagram for node {} arrived at node {}", env.to, id);
                    }
                }
                Datagram::Request {
                    id: request_id,
                    command,
                } => match command {
                    ClientRequest::Set { key, value } => {
                        let cmd = KvCommand::Set { key, value };
                        submit_write(
                            &mut node,
                            &transport,
                            &mut pending_writes,
                            src,
                            request_id,
                            cmd,
                        )?;
                    }
                    ClientRequest::Delete { key } => {
                        let cmd = KvCommand::Delete { key };
                        submit_write(
                            &mut node,
                            &transport,
                            &mut pending_writes,
                            src,
                            request_id,
                            cmd,
                        )?;
                    }
                    ClientRequest::Get { key } => {
                        // Served only once leadership is confirmed by a
                        // majority-acknowledged heartbeat round.
                        let token = node.request_leader_confirm();
                        pending_reads.insert(token, (src, request_id, key));
                    }
                },
                // Servers do not consume replies.
                Datagram::Reply { .. } => {}
            }
        }

        let now = Instant::now();
        if now >= heartbeat_deadline {
            node.step(Event::HeartbeatTimeout)?;
            heartbeat_deadline = now + heartbeat;
        }
        if now >= election_deadline {
            node.step(Event::ElectionTimeout)?;
            election_deadline = now + config.random_election_timeout(&mut rng);
        }

        for env in node.take_outbox() {
            transport.send_raft(env);
        }

        // Apply committed entries; acknowledge writes whose entry made it.
        for (index, _response) in applier.drain(&node, &mut kv) {
            if let Some(write) = pending_writes.remove(&index) {
                let reply = if node.log().term_at(index) == Some(write.term) {
                    ClientReply::Committed { index }
                } else {
                    ClientReply::NotLeader {
                        hint: node.leader_hint(),
                    }
                };
                transport.reply(write.addr, write.request_id, reply);
            }
        }

        for (token, confirmed) in node.take_confirmations() {
            if let Some((addr, request_id, key)) = pending_reads.remove(&token) {
                let reply = if confirmed {
                    ClientReply::Value {
                        value: kv.get(&key).map(str::to_string),
                    }
                } else {
                    ClientReply::NotLeader {
                        hint: node.leader_hint(),
                    }
                };
                transport.reply(addr, request_id, reply);
            }
        }

        // Losing leadership orphans in-flight writes; tell the clients.
        if was_leader && !node.is_leader() {
            for (_, write) in pending_writes.drain() {
                transport.reply(
                    write.addr,
                    write.request_id,
                    ClientReply::NotLeader {
                        hint: node.leader_hint(),
                    },
                );
            }
        }
        was_leader = node.is_leader();
    }
}

fn submit_write(
    node: &mut RaftNode<FileStorage>,
    transport: &UdpTransport,
    pending_writes: &mut HashMap<u64, PendingWrite>,
    addr: SocketAddr,
    request_id: u64,
    cmd: KvCommand,
) -> std::io::Result<()> {
    match node.client_append(cmd.to_bytes())? {
        Ok(receipt) => {
            pending_writes.insert(
                receipt.index,
                PendingWrite {
                    term: receipt.term,
                    addr,
                    request_id,
                },
            );
        }
        Err(not_leader) => {
            transport.reply(
                addr,
                request_id,
                ClientReply::NotLeader {
                    hint: not_leader.hint,
                },
            );
        }
    }
    Ok(())
}
