//! Peer-group message transport.
//!
//! The peer group is a fixed set of processes indexed `0..size`, with peer 0
//! acting as coordinator. Messaging is two-sided and blocking: a send pairs
//! with exactly one matching receive, messages between a (sender, receiver,
//! tag) triple arrive in order, and nothing else is guaranteed or needed.
//!
//! Two implementations are provided: [`tcp::TcpGroup`] is the real transport,
//! a hub where every peer holds one blocking socket to the coordinator;
//! [`local::LocalGroup`] wires a group together over in-process channels for
//! tests. [`Solo`] stands in when there is no group at all.

use std::io;

use snafu::Snafu;

/// Message tags. One tag per protocol channel.
pub mod tag {
    /// Serialized work-queue byte length (`u64`), possibly zero.
    pub const QUEUE_LEN: u32 = 10;
    /// Serialized work-queue payload.
    pub const QUEUE_PAYLOAD: u32 = 11;
    /// Usage-record count (`u32`) for one tree reduction.
    pub const REDUCE_COUNT: u32 = 20;
    /// Packed usage records for one tree reduction.
    pub const REDUCE_RECORDS: u32 = 21;
    /// Transport-internal: barrier gather/release exchange.
    pub(super) const BARRIER: u32 = 30;
    /// Transport-internal: rank introduction on connect.
    pub(super) const HELLO: u32 = 1;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CommError {
    #[snafu(display("unable to reach coordinator at {addr}: {source}"))]
    Connect { addr: String, source: io::Error },

    #[snafu(display("unable to listen at {addr}: {source}"))]
    Listen { addr: String, source: io::Error },

    #[snafu(display("handshake with a connecting peer failed: {source}"))]
    Accept { source: io::Error },

    #[snafu(display("send to peer {peer} (tag {tag}) failed: {source}"))]
    Send {
        peer: usize,
        tag: u32,
        source: io::Error,
    },

    #[snafu(display("receive from peer {peer} (tag {tag}) failed: {source}"))]
    Recv {
        peer: usize,
        tag: u32,
        source: io::Error,
    },

    #[snafu(display("peer {peer} sent tag {actual} where {expected} was expected"))]
    TagMismatch {
        peer: usize,
        expected: u32,
        actual: u32,
    },

    #[snafu(display("no link between this peer and peer {peer}"))]
    NoRoute { peer: usize },

    #[snafu(display("peer {peer} disconnected"))]
    Disconnected { peer: usize },

    #[snafu(display("malformed payload from peer {peer}: {source}"))]
    Decode {
        peer: usize,
        source: byte_stream::DecodeError,
    },

    #[snafu(display("invalid peer-group configuration {var}={value}"))]
    Config { var: String, value: String },
}

/// Blocking, tagged, two-sided messaging within the peer group.
pub trait Transport {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn send(&mut self, to: usize, tag: u32, payload: &[u8]) -> Result<(), CommError>;
    fn recv(&mut self, from: usize, tag: u32) -> Result<Vec<u8>, CommError>;

    /// Block until every peer has arrived. Gather to the coordinator, then
    /// release.
    fn barrier(&mut self) -> Result<(), CommError> {
        if self.rank() == 0 {
            for peer in 1..self.size() {
                self.recv(peer, tag::BARRIER)?;
            }
            for peer in 1..self.size() {
                self.send(peer, tag::BARRIER, &[])?;
            }
        } else {
            self.send(0, tag::BARRIER, &[])?;
            self.recv(0, tag::BARRIER)?;
        }
        Ok(())
    }
}

/// The one-peer group: no links, barriers are no-ops.
pub struct Solo;

impl Transport for Solo {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&mut self, to: usize, _tag: u32, _payload: &[u8]) -> Result<(), CommError> {
        Err(CommError::NoRoute { peer: to })
    }

    fn recv(&mut self, from: usize, _tag: u32) -> Result<Vec<u8>, CommError> {
        Err(CommError::NoRoute { peer: from })
    }
}

pub mod tcp {
    //! The socket transport: peer 0 listens, everyone else connects.

    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use snafu::ResultExt;
    use tracing::{debug, info};

    use super::*;

    const CONNECT_ATTEMPTS: u32 = 50;
    const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

    /// Peer-group shape, read from the environment the launcher populates.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct GroupConfig {
        pub rank: usize,
        pub size: usize,
        pub coordinator: String,
    }

    pub const RANK_VAR: &str = "DUSCAN_RANK";
    pub const PEERS_VAR: &str = "DUSCAN_PEERS";
    pub const COORDINATOR_VAR: &str = "DUSCAN_COORDINATOR";
    const DEFAULT_COORDINATOR: &str = "127.0.0.1:24320";

    impl GroupConfig {
        /// `None` when the launcher variables are absent (solo mode). Setting
        /// only one of rank/peers is a configuration error, not solo mode.
        pub fn from_env() -> Result<Option<GroupConfig>, CommError> {
            let (rank, size) = match (std::env::var(RANK_VAR), std::env::var(PEERS_VAR)) {
                (Err(_), Err(_)) => return Ok(None),
                (Ok(rank), Ok(size)) => {
                    (parse_var(RANK_VAR, &rank)?, parse_var(PEERS_VAR, &size)?)
                }
                (Ok(_), Err(_)) => {
                    return Err(CommError::Config {
                        var: PEERS_VAR.to_string(),
                        value: "<unset>".to_string(),
                    })
                }
                (Err(_), Ok(_)) => {
                    return Err(CommError::Config {
                        var: RANK_VAR.to_string(),
                        value: "<unset>".to_string(),
                    })
                }
            };
            if size == 0 || rank >= size {
                return Err(CommError::Config {
                    var: RANK_VAR.to_string(),
                    value: format!("{rank} of {size}"),
                });
            }
            let coordinator = std::env::var(COORDINATOR_VAR)
                .unwrap_or_else(|_| DEFAULT_COORDINATOR.to_string());
            Ok(Some(GroupConfig {
                rank,
                size,
                coordinator,
            }))
        }
    }

    fn parse_var(var: &str, value: &str) -> Result<usize, CommError> {
        value.parse().map_err(|_| CommError::Config {
            var: var.to_string(),
            value: value.to_string(),
        })
    }

    pub struct TcpGroup {
        rank: usize,
        size: usize,
        // Indexed by peer rank on the coordinator; non-coordinators hold a
        // single link in slot 0.
        links: Vec<Option<TcpStream>>,
    }

    impl TcpGroup {
        /// Rendezvous with the rest of the group.
        pub fn establish(config: &GroupConfig) -> Result<TcpGroup, CommError> {
            if config.rank == 0 {
                Self::listen(config)
            } else {
                Self::join(config)
            }
        }

        fn listen(config: &GroupConfig) -> Result<TcpGroup, CommError> {
            let listener = TcpListener::bind(&config.coordinator).context(ListenSnafu {
                addr: config.coordinator.clone(),
            })?;
            info!(addr = %config.coordinator, peers = config.size, "waiting for peer group");

            let mut links: Vec<Option<TcpStream>> = Vec::new();
            links.resize_with(config.size, || None);
            for _ in 1..config.size {
                let (mut stream, addr) = listener.accept().context(AcceptSnafu)?;
                stream.set_nodelay(true).context(AcceptSnafu)?;
                let (tag, payload) = read_frame(&mut stream).context(AcceptSnafu)?;
                let rank = hello_rank(tag, &payload).ok_or(CommError::TagMismatch {
                    peer: 0,
                    expected: tag::HELLO,
                    actual: tag,
                })?;
                debug!(%addr, rank, "peer joined");
                if rank == 0 || rank >= config.size || links[rank].is_some() {
                    return Err(CommError::Config {
                        var: RANK_VAR.to_string(),
                        value: rank.to_string(),
                    });
                }
                links[rank] = Some(stream);
            }
            Ok(TcpGroup {
                rank: 0,
                size: config.size,
                links,
            })
        }

        fn join(config: &GroupConfig) -> Result<TcpGroup, CommError> {
            let mut attempt = 0;
            let stream = loop {
                match TcpStream::connect(&config.coordinator) {
                    Ok(stream) => break stream,
                    Err(source) => {
                        attempt += 1;
                        if attempt >= CONNECT_ATTEMPTS {
                            return Err(CommError::Connect {
                                addr: config.coordinator.clone(),
                                source,
                            });
                        }
                        std::thread::sleep(CONNECT_BACKOFF);
                    }
                }
            };
            let mut stream = stream;
            stream.set_nodelay(true).context(ConnectSnafu {
                addr: config.coordinator.clone(),
            })?;
            write_frame(&mut stream, tag::HELLO, &(config.rank as u32).to_le_bytes()).context(
                SendSnafu {
                    peer: 0usize,
                    tag: tag::HELLO,
                },
            )?;
            debug!(rank = config.rank, addr = %config.coordinator, "joined peer group");
            Ok(TcpGroup {
                rank: config.rank,
                size: config.size,
                links: vec![None],
            })
        }

        fn link(&mut self, peer: usize) -> Result<&mut TcpStream, CommError> {
            let slot = if self.rank == 0 {
                self.links.get_mut(peer)
            } else if peer == 0 {
                self.links.get_mut(0)
            } else {
                None
            };
            match slot {
                Some(Some(stream)) => Ok(stream),
                _ => Err(CommError::NoRoute { peer }),
            }
        }
    }

    impl Transport for TcpGroup {
        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn send(&mut self, to: usize, tag: u32, payload: &[u8]) -> Result<(), CommError> {
            let stream = self.link(to)?;
            write_frame(stream, tag, payload).context(SendSnafu { peer: to, tag })
        }

        fn recv(&mut self, from: usize, tag: u32) -> Result<Vec<u8>, CommError> {
            let stream = self.link(from)?;
            let (actual, payload) = read_frame(stream).context(RecvSnafu { peer: from, tag })?;
            if actual != tag {
                return Err(CommError::TagMismatch {
                    peer: from,
                    expected: tag,
                    actual,
                });
            }
            Ok(payload)
        }
    }

    fn hello_rank(tag: u32, payload: &[u8]) -> Option<usize> {
        if tag != tag::HELLO || payload.len() != 4 {
            return None;
        }
        let raw: [u8; 4] = payload.try_into().ok()?;
        Some(u32::from_le_bytes(raw) as usize)
    }

    // Frames are {u32 tag, u64 length, payload}, little-endian.
    fn write_frame(stream: &mut TcpStream, tag: u32, payload: &[u8]) -> io::Result<()> {
        let mut header = [0u8; 12];
        header[..4].copy_from_slice(&tag.to_le_bytes());
        header[4..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        stream.write_all(&header)?;
        stream.write_all(payload)?;
        stream.flush()
    }

    fn read_frame(stream: &mut TcpStream) -> io::Result<(u32, Vec<u8>)> {
        let mut header = [0u8; 12];
        stream.read_exact(&mut header)?;
        let tag = u32::from_le_bytes(header[..4].try_into().expect("sized header"));
        let len = u64::from_le_bytes(header[4..].try_into().expect("sized header"));
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload)?;
        Ok((tag, payload))
    }
}

pub mod local {
    //! In-process transport over channels, for exercising the protocol in
    //! tests without sockets.

    use std::collections::VecDeque;
    use std::sync::mpsc::{channel, Receiver, Sender};

    use super::*;

    type Frame = (usize, u32, Vec<u8>);

    pub struct LocalGroup {
        rank: usize,
        size: usize,
        outbound: Vec<Option<Sender<Frame>>>,
        inbound: Receiver<Frame>,
        // Frames that arrived while a receive for a different sender was
        // outstanding, queued per sender.
        stashed: Vec<VecDeque<(u32, Vec<u8>)>>,
    }

    impl LocalGroup {
        /// Build a fully wired group of `size` peers.
        pub fn group(size: usize) -> Vec<LocalGroup> {
            let mut senders = Vec::with_capacity(size);
            let mut receivers = Vec::with_capacity(size);
            for _ in 0..size {
                let (sender, receiver) = channel();
                senders.push(sender);
                receivers.push(receiver);
            }
            receivers
                .into_iter()
                .enumerate()
                .map(|(rank, inbound)| LocalGroup {
                    rank,
                    size,
                    outbound: senders.iter().map(|s| Some(s.clone())).collect(),
                    inbound,
                    stashed: (0..size).map(|_| VecDeque::new()).collect(),
                })
                .collect()
        }
    }

    impl Transport for LocalGroup {
        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn send(&mut self, to: usize, tag: u32, payload: &[u8]) -> Result<(), CommError> {
            let sender = self
                .outbound
                .get(to)
                .and_then(|s| s.as_ref())
                .ok_or(CommError::NoRoute { peer: to })?;
            sender
                .send((self.rank, tag, payload.to_vec()))
                .map_err(|_| CommError::Disconnected { peer: to })
        }

        fn recv(&mut self, from: usize, tag: u32) -> Result<Vec<u8>, CommError> {
            if from >= self.size {
                return Err(CommError::NoRoute { peer: from });
            }
            loop {
                if let Some((actual, payload)) = self.stashed[from].pop_front() {
                    if actual != tag {
                        return Err(CommError::TagMismatch {
                            peer: from,
                            expected: tag,
                            actual,
                        });
                    }
                    return Ok(payload);
                }
                let (sender, actual, payload) = self
                    .inbound
                    .recv()
                    .map_err(|_| CommError::Disconnected { peer: from })?;
                self.stashed[sender].push_back((actual, payload));
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn frames_are_fifo_per_sender_and_tag() {
            let mut group = LocalGroup::group(2);
            let mut b = group.pop().unwrap();
            let mut a = group.pop().unwrap();

            a.send(1, tag::QUEUE_LEN, b"one").unwrap();
            a.send(1, tag::QUEUE_LEN, b"two").unwrap();
            assert_eq!(b.recv(0, tag::QUEUE_LEN).unwrap(), b"one");
            assert_eq!(b.recv(0, tag::QUEUE_LEN).unwrap(), b"two");
        }

        #[test]
        fn interleaved_senders_do_not_steal_frames() {
            let mut group = LocalGroup::group(3);
            let mut c = group.pop().unwrap();
            let mut b = group.pop().unwrap();
            let mut root = group.pop().unwrap();

            c.send(0, tag::REDUCE_COUNT, b"from-c").unwrap();
            b.send(0, tag::REDUCE_COUNT, b"from-b").unwrap();

            // Asking for b first must not consume c's frame.
            assert_eq!(root.recv(1, tag::REDUCE_COUNT).unwrap(), b"from-b");
            assert_eq!(root.recv(2, tag::REDUCE_COUNT).unwrap(), b"from-c");
        }

        #[test]
        fn unexpected_tag_is_an_error() {
            let mut group = LocalGroup::group(2);
            let mut b = group.pop().unwrap();
            let mut a = group.pop().unwrap();

            a.send(1, tag::QUEUE_PAYLOAD, b"payload").unwrap();
            let err = b.recv(0, tag::QUEUE_LEN).unwrap_err();
            assert!(matches!(
                err,
                CommError::TagMismatch {
                    expected: tag::QUEUE_LEN,
                    actual: tag::QUEUE_PAYLOAD,
                    ..
                }
            ));
        }

        #[test]
        fn barrier_releases_every_peer() {
            let peers = LocalGroup::group(4);
            let handles: Vec<_> = peers
                .into_iter()
                .map(|mut peer| std::thread::spawn(move || peer.barrier().is_ok()))
                .collect();
            for handle in handles {
                assert!(handle.join().unwrap());
            }
        }

        #[test]
        fn solo_group_has_no_links() {
            let mut solo = Solo;
            assert_eq!(solo.size(), 1);
            assert!(solo.barrier().is_ok());
            assert!(matches!(
                solo.send(1, tag::QUEUE_LEN, &[]),
                Err(CommError::NoRoute { peer: 1 })
            ));
        }
    }
}
