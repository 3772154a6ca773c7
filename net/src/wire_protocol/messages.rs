use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{thread_rng, Rng};

use crate::error::{PeerError, PeerResult};
use crate::wire_protocol::buffer::{unmap_ip, ByteBufferComposer, ByteBufferParser};
use crate::wire_protocol::chain::ChainParams;
use crate::wire_protocol::raw_message::{Command, RawMessage};

#[derive(Debug)]
pub enum ProtocolMessage {
    Version(VersionMessage),
    Verack,
    Getaddr,
    Addr(AddrMessage),
    Ping(PingMessage),
    Pong(PongMessage),
}

impl ProtocolMessage {
    pub fn to_bytes(self, magic: [u8; 4]) -> Vec<u8> {
        RawMessage::from(self).to_bytes(magic)
    }
}

impl From<ProtocolMessage> for RawMessage {
    fn from(message: ProtocolMessage) -> Self {
        match message {
            ProtocolMessage::Version(message) => message.to_raw_message(),
            ProtocolMessage::Verack => RawMessage::new(Command::Verack, vec![]),
            ProtocolMessage::Getaddr => RawMessage::new(Command::Getaddr, vec![]),
            ProtocolMessage::Addr(message) => message.to_raw_message(),
            ProtocolMessage::Ping(message) => message.to_raw_message(),
            ProtocolMessage::Pong(message) => message.to_raw_message(),
        }
    }
}

/// https://en.bitcoin.it/wiki/Protocol_documentation#version
///
/// size | field        | type     | description
/// ---  | -----        | ----     | ------------
/// 4    | version      | i32      | Identifies protocol version being used by the node
/// 8    | services     | u64      | bitfield of features to be enabled for this connection
/// 8    | timestamp    | i64      | standard UNIX timestamp in seconds
/// 26   | addr_recv    | net_addr | The network address of the node receiving this message
/// 26   | addr_from    | net_addr | Field can be ignored.
/// 8    | nonce        | u64      | Node random nonce
/// ?    | user_agent   | var_str  | User Agent (0x00 if string is 0 bytes long)
/// 4    | start_height | i32      | The last block received by the emitting node
/// 1    | relay        | bool     | Whether the remote peer should announce relayed transactions
#[derive(Clone, Debug)]
pub struct VersionMessage {
    pub protocol_version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: SocketAddr,
    pub user_agent: String,
    pub start_height: i32,
}

impl VersionMessage {
    /// Builds our side of the handshake. Everything except the negotiated
    /// protocol version comes from the chain parameters.
    pub fn new(chain: &ChainParams, protocol_version: i32, addr_recv: SocketAddr) -> Self {
        let timestamp = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(v) => v.as_secs() as i64,
            Err(_) => panic!("SystemTime too low"),
        };

        VersionMessage {
            protocol_version,
            services: chain.services.as_bitmask(),
            timestamp,
            addr_recv,
            user_agent: chain.user_agent.clone(),
            start_height: chain.start_height,
        }
    }

    /// Everything past the timestamp is absent on ancient protocol
    /// versions, so those fields fall back to neutral defaults instead of
    /// failing the parse.
    pub(super) fn from_raw_message(raw: &RawMessage) -> PeerResult<Self> {
        let mut parser = ByteBufferParser::new(&raw.payload);

        let protocol_version = parser
            .read_i32_le()
            .map_err(|_| PeerError::malformed("version", "payload shorter than 20 bytes"))?;
        let services = parser
            .read_u64_le()
            .map_err(|_| PeerError::malformed("version", "payload shorter than 20 bytes"))?;
        let timestamp = parser
            .read_i64_le()
            .map_err(|_| PeerError::malformed("version", "payload shorter than 20 bytes"))?;

        let addr_recv = if parser.remaining() >= 26 {
            parser.parse_net_addr()?.1
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        if parser.remaining() >= 26 {
            parser.skip_bytes(26)?; // addr_from
        }
        if parser.remaining() >= 8 {
            parser.skip_bytes(8)?; // nonce
        }
        let user_agent = if parser.remaining() > 0 {
            parser
                .read_var_string()
                .map_err(|err| PeerError::malformed("version", err.to_string()))?
        } else {
            String::new()
        };
        let start_height = if parser.remaining() >= 4 {
            parser.read_i32_le()?
        } else {
            0
        };

        Ok(VersionMessage {
            protocol_version,
            services,
            timestamp,
            addr_recv,
            user_agent,
            start_height,
        })
    }

    pub(super) fn to_raw_message(&self) -> RawMessage {
        let mut rng = thread_rng();
        let mut composer = ByteBufferComposer::new();

        composer.append(&self.protocol_version.to_le_bytes());
        composer.append(&self.services.to_le_bytes());
        composer.append(&self.timestamp.to_le_bytes());
        composer.append_net_addr(self.services, &self.addr_recv);
        composer.append(&[0x0_u8; 26]); // addr_from is ignored by receivers
        composer.append(&rng.gen::<u64>().to_le_bytes());
        composer.append_var_string(&self.user_agent);
        composer.append(&self.start_height.to_le_bytes());
        composer.append(&[0]); // no relay, we only gossip addresses

        RawMessage::new(Command::Version, composer.result())
    }
}

/// One entry of an addr payload: where a peer can be reached, what services
/// it claimed and when the advertising node last heard from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetAddr {
    pub ip: IpAddr,
    pub port: u16,
    pub services: u64,
    pub timestamp: u32,
}

/// https://en.bitcoin.it/wiki/Protocol_documentation#addr
#[derive(Clone, Debug, Default)]
pub struct AddrMessage {
    pub addrs: Vec<NetAddr>,
}

impl AddrMessage {
    pub fn new(addrs: Vec<NetAddr>) -> Self {
        AddrMessage { addrs }
    }

    pub(super) fn from_raw_message(raw: &RawMessage) -> PeerResult<Self> {
        let mut parser = ByteBufferParser::new(&raw.payload);
        let count = parser
            .read_var_int()
            .map_err(|err| PeerError::malformed("addr", err.to_string()))?;

        let mut addrs = Vec::with_capacity(count.min(1000) as usize);
        for _ in 0..count {
            let timestamp = parser
                .read_u32_le()
                .map_err(|_| PeerError::malformed("addr", "entry list ends early"))?;
            let services = parser
                .read_u64_le()
                .map_err(|_| PeerError::malformed("addr", "entry list ends early"))?;
            let octets: [u8; 16] = parser
                .read(16)
                .map_err(|_| PeerError::malformed("addr", "entry list ends early"))?
                .try_into()
                .unwrap();
            let port = u16::from_be_bytes(
                parser
                    .read(2)
                    .map_err(|_| PeerError::malformed("addr", "entry list ends early"))?
                    .try_into()
                    .unwrap(),
            );

            addrs.push(NetAddr {
                ip: unmap_ip(octets),
                port,
                services,
                timestamp,
            });
        }

        Ok(AddrMessage { addrs })
    }

    pub(super) fn to_raw_message(&self) -> RawMessage {
        let mut composer = ByteBufferComposer::new();
        composer.append_var_int(self.addrs.len() as u64);
        for addr in &self.addrs {
            composer.append(&addr.timestamp.to_le_bytes());
            composer.append_net_addr(addr.services, &SocketAddr::new(addr.ip, addr.port));
        }
        RawMessage::new(Command::Addr, composer.result())
    }
}

/// Pings are answered while we wait for an addr response; nodes drop
/// connections that go deaf. Pre-BIP31 pings carry no nonce and expect no
/// pong.
#[derive(Clone, Debug)]
pub struct PingMessage {
    pub nonce: Option<u64>,
}

impl PingMessage {
    pub(super) fn from_raw_message(raw: &RawMessage) -> Self {
        let mut parser = ByteBufferParser::new(&raw.payload);
        PingMessage {
            nonce: parser.read_u64_le().ok(),
        }
    }

    pub(super) fn to_raw_message(&self) -> RawMessage {
        let payload = match self.nonce {
            Some(nonce) => nonce.to_le_bytes().to_vec(),
            None => vec![],
        };
        RawMessage::new(Command::Ping, payload)
    }
}

#[derive(Clone, Debug)]
pub struct PongMessage {
    pub nonce: u64,
}

impl PongMessage {
    pub fn new(nonce: u64) -> Self {
        PongMessage { nonce }
    }

    pub(super) fn from_raw_message(raw: &RawMessage) -> Self {
        let mut parser = ByteBufferParser::new(&raw.payload);
        PongMessage {
            nonce: parser.read_u64_le().unwrap_or(0),
        }
    }

    pub(super) fn to_raw_message(&self) -> RawMessage {
        RawMessage::new(Command::Pong, self.nonce.to_le_bytes().to_vec())
    }
}
