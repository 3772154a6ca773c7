use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::time::{self, Duration, Instant};

use net::error::PeerError;
use net::wire_protocol::chain::ChainParams;
use net::wire_protocol::connection::NodeConnection;
use net::wire_protocol::messages::NetAddr;
use net::wire_protocol::probe::{AddrExchangeTopic, HandshakeTopic};

/// Sub-timeout for each read while waiting for the handshake response.
const VERSION_CHUNK_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a node may take to answer getaddr before we settle for an
/// empty peer list.
const ADDR_WAIT: Duration = Duration::from_secs(60);
const ADDR_CHUNK_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of probing one `ip:port`, ordered by how far the probe got:
/// nothing, a TCP connection, or a completed handshake.
#[derive(Debug)]
pub enum DialResult {
    Up(Box<ProbeInfo>),
    Reachable { latency_ms: f64 },
    Unreachable,
}

impl DialResult {
    pub fn rank(&self) -> u8 {
        match self {
            DialResult::Unreachable => 0,
            DialResult::Reachable { .. } => 1,
            DialResult::Up(_) => 2,
        }
    }
}

/// Everything a completed handshake yields.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub protocol_version: i32,
    pub services: u64,
    pub start_height: i32,
    pub user_agent: String,
    pub latency_ms: f64,
    pub peers: Vec<NetAddr>,
}

/// Seam between the retry schedule and the socket work, so the schedule is
/// testable against a scripted dialer.
#[async_trait]
pub trait Dial: Send + Sync {
    async fn try_dial(
        &self,
        addr: SocketAddr,
        protocol_version: i32,
        timeout: Duration,
    ) -> DialResult;
}

/// Performs one full probe: connect, version handshake, address request.
pub struct PeerDialer {
    chain: ChainParams,
    getaddr_delay: Duration,
}

impl PeerDialer {
    pub fn new(chain: ChainParams, getaddr_delay: Duration) -> Self {
        PeerDialer {
            chain,
            getaddr_delay,
        }
    }
}

#[async_trait]
impl Dial for PeerDialer {
    /// A single attempt against one target with one protocol version.
    ///
    /// The connection is dropped (and with it the socket closed) on every
    /// path out of this function.
    async fn try_dial(
        &self,
        addr: SocketAddr,
        protocol_version: i32,
        timeout: Duration,
    ) -> DialResult {
        let dial_start = Instant::now();

        let mut connection = match NodeConnection::connect(self.chain.magic, addr, timeout).await {
            Ok(connection) => connection,
            Err(err) => {
                log::debug!("connection attempt to {addr} failed: {err}");
                return DialResult::Unreachable;
            }
        };
        let tcp_latency_ms = dial_start.elapsed().as_secs_f64() * 1000.0;

        let handshake = HandshakeTopic::new(&self.chain, protocol_version, addr);
        let remote = match connection
            .proceed_conversation(handshake, timeout, VERSION_CHUNK_TIMEOUT)
            .await
        {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                log::debug!("{addr} accepted tcp but sent no usable version handshake");
                return DialResult::Reachable {
                    latency_ms: tcp_latency_ms,
                };
            }
            Err(PeerError::Io(err)) => {
                log::debug!("transport failure during handshake with {addr}: {err}");
                return DialResult::Unreachable;
            }
            Err(err) => {
                log::debug!("handshake with {addr} failed: {err}");
                return DialResult::Reachable {
                    latency_ms: tcp_latency_ms,
                };
            }
        };
        let latency_ms = dial_start.elapsed().as_secs_f64() * 1000.0;

        // nodes tend to ignore a getaddr fired in the same instant as the
        // handshake, so give them a moment
        time::sleep(self.getaddr_delay).await;

        let peers = match connection
            .proceed_conversation(AddrExchangeTopic::new(), ADDR_WAIT, ADDR_CHUNK_TIMEOUT)
            .await
        {
            Ok(peers) => peers,
            Err(err) => {
                log::debug!("error while waiting for addr from {addr}: {err}");
                Vec::new()
            }
        };
        if peers.is_empty() {
            log::debug!("no addr response from {addr}");
        }

        DialResult::Up(Box::new(ProbeInfo {
            protocol_version: remote.protocol_version,
            services: remote.services,
            start_height: remote.start_height,
            user_agent: remote.user_agent,
            latency_ms,
            peers,
        }))
    }
}
