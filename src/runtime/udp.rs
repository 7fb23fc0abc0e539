//! UDP transport: one bound socket per server, a reader thread feeding a
//! channel, best-effort sends.
//!
//! UDP matches the transport contract exactly: sends return immediately
//! and may be lost, nothing is ordered, and the consensus protocol is
//! what makes that acceptable.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};

use crate::raft::config::ClusterConfig;
use crate::raft::message::{Envelope, NodeId};

use super::Datagram;

pub struct UdpTransport {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    rx: Receiver<(SocketAddr, Datagram)>,
}

impl UdpTransport {
    /// Bind this server's address and start the reader thread.
    pub fn bind(config: &ClusterConfig, id: NodeId) -> io::Result<Self> {
        let addr = resolve(config.address(id))?;
        let socket = UdpSocket::bind(addr)?;
        let peers = config
            .addresses
            .iter()
            .map(|a| resolve(a))
            .collect::<io::Result<Vec<_>>>()?;

        let reader = socket.try_clone()?;
        let (tx, rx) = unbounded();
        // The reader thread runs until the process exits.
        let _reader = thread::Builder::new()
            .name("udp-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; 64 * 1024];
                loop {
                    match reader.recv_from(&mut buf) {
                        Ok((len, src)) => match Datagram::from_bytes(&buf[..len]) {
                            Ok(dgram) => {
                                if tx.send((src, dgram)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                log::warn!("dropping undecodable datagram from {}: {}", src, e);
                            }
                        },
                        Err(e) => {
                            log::warn!("udp receive error: {}", e);
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                }
            })?;

        Ok(UdpTransport { socket, peers, rx })
    }

    /// Best-effort send to a peer server. Errors are logged and swallowed;
    /// the protocol treats an undelivered message like a lost one.
    pub fn send_raft(&self, env: Envelope) {
        let dst = self.peers[env.to as usize];
        self.send_to(dst, &Datagram::Raft(env));
    }

    /// Reply to a client at its source address.
    pub fn reply(&self, addr: SocketAddr, id: u64, reply: super::ClientReply) {
        self.send_to(addr, &Datagram::Reply { id, reply });
    }

    fn send_to(&self, dst: SocketAddr, dgram: &Datagram) {
        if let Err(e) = self.socket.send_to(&dgram.to_bytes(), dst) {
            log::debug!("send to {} failed: {}", dst, e);
        }
    }

    /// Next datagram, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(SocketAddr, Datagram)> {
        self.rx.recv_timeout(timeout).ok()
    }
}

pub(crate) fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address resolves to nothing: {}", addr),
        )
    })
}
