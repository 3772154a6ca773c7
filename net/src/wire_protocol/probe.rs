use std::net::SocketAddr;

use crate::conversation::{ConversationAction, ConversationTopicHandler};
use crate::error::PeerResult;
use crate::wire_protocol::chain::ChainParams;
use crate::wire_protocol::messages::{NetAddr, PongMessage, ProtocolMessage, VersionMessage};

/// What a peer told us about itself during the handshake.
#[derive(Clone, Debug)]
pub struct RemoteNode {
    pub protocol_version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub verack_received: bool,
}

/// Crawl handshake:
///
/// - send __version__ (with the protocol version this attempt negotiates)
/// - expect the peer's __version__, answer it with __verack__
///
/// The topic finishes as soon as the peer's version arrives; a verack from
/// the peer is noted when it comes first but is not waited for. No version
/// before the deadline means the outcome is `None`.
pub struct HandshakeTopic<'a> {
    chain: &'a ChainParams,
    protocol_version: i32,
    remote_addr: SocketAddr,
    verack_received: bool,
    version_received: Option<VersionMessage>,
}

impl<'a> HandshakeTopic<'a> {
    pub fn new(chain: &'a ChainParams, protocol_version: i32, remote_addr: SocketAddr) -> Self {
        HandshakeTopic {
            chain,
            protocol_version,
            remote_addr,
            verack_received: false,
            version_received: None,
        }
    }
}

impl ConversationTopicHandler for HandshakeTopic<'_> {
    type Outcome = Option<RemoteNode>;

    fn initial_action(&mut self) -> ConversationAction {
        ConversationAction::respond(ProtocolMessage::Version(VersionMessage::new(
            self.chain,
            self.protocol_version,
            self.remote_addr,
        )))
    }

    fn on_message(&mut self, message: ProtocolMessage) -> PeerResult<ConversationAction> {
        match message {
            ProtocolMessage::Version(m) => {
                self.version_received = Some(m);
                Ok(ConversationAction::finish_with(ProtocolMessage::Verack))
            }
            ProtocolMessage::Verack => {
                self.verack_received = true;
                Ok(ConversationAction::nop())
            }
            ProtocolMessage::Ping(ping) => Ok(match ping.nonce {
                Some(nonce) => {
                    ConversationAction::respond(ProtocolMessage::Pong(PongMessage::new(nonce)))
                }
                None => ConversationAction::nop(),
            }),
            _ => Ok(ConversationAction::nop()),
        }
    }

    fn outcome(self) -> PeerResult<Option<RemoteNode>> {
        Ok(self.version_received.map(|msg| RemoteNode {
            protocol_version: msg.protocol_version,
            services: msg.services,
            user_agent: msg.user_agent,
            start_height: msg.start_height,
            verack_received: self.verack_received,
        }))
    }
}

/// Address request: send __getaddr__, collect the first __addr__ that comes
/// back. Peers interleave other traffic (a late verack, inv announcements,
/// pings) before answering; everything but the addr is ignored or, for
/// pings, answered so the peer keeps the connection open.
#[derive(Default)]
pub struct AddrExchangeTopic {
    addrs: Option<Vec<NetAddr>>,
}

impl AddrExchangeTopic {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationTopicHandler for AddrExchangeTopic {
    type Outcome = Vec<NetAddr>;

    fn initial_action(&mut self) -> ConversationAction {
        ConversationAction::respond(ProtocolMessage::Getaddr)
    }

    fn on_message(&mut self, message: ProtocolMessage) -> PeerResult<ConversationAction> {
        match message {
            ProtocolMessage::Addr(addr) => {
                self.addrs = Some(addr.addrs);
                Ok(ConversationAction::finish())
            }
            ProtocolMessage::Ping(ping) => Ok(match ping.nonce {
                Some(nonce) => {
                    ConversationAction::respond(ProtocolMessage::Pong(PongMessage::new(nonce)))
                }
                None => ConversationAction::nop(),
            }),
            _ => Ok(ConversationAction::nop()),
        }
    }

    fn outcome(self) -> PeerResult<Vec<NetAddr>> {
        Ok(self.addrs.unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::wire_protocol::chain::{NodeService, NodeServiceSet};
    use crate::wire_protocol::messages::{AddrMessage, PingMessage};

    fn chain() -> ChainParams {
        ChainParams {
            name: "Testnet".to_string(),
            magic: [0x0b, 0x11, 0x09, 0x07],
            p2p_port: 18333,
            protocol_version: 70016,
            user_agent: "/crawler-test:0.0.1/".to_string(),
            services: NodeServiceSet(vec![NodeService::NodeNetwork]),
            start_height: 0,
        }
    }

    fn remote_version() -> VersionMessage {
        VersionMessage {
            protocol_version: 70015,
            services: 1,
            timestamp: 1_700_000_000,
            addr_recv: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8333),
            user_agent: "/Satoshi:25.0.0/".to_string(),
            start_height: 812_000,
        }
    }

    #[test]
    fn handshake_opens_with_the_negotiated_protocol() {
        let chain = chain();
        let mut topic = HandshakeTopic::new(
            &chain,
            70015,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8333),
        );
        let action = topic.initial_action();
        match action.message {
            Some(ProtocolMessage::Version(v)) => assert_eq!(v.protocol_version, 70015),
            other => panic!("expected a version message, got {other:?}"),
        }
        assert!(!action.topic_finished);
    }

    #[test]
    fn handshake_finishes_on_version_and_answers_verack() {
        let chain = chain();
        let mut topic = HandshakeTopic::new(
            &chain,
            70016,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8333),
        );
        topic.initial_action();

        let action = topic
            .on_message(ProtocolMessage::Version(remote_version()))
            .unwrap();
        assert!(action.topic_finished);
        assert!(matches!(action.message, Some(ProtocolMessage::Verack)));

        let remote = topic.outcome().unwrap().expect("version was captured");
        assert_eq!(remote.protocol_version, 70015);
        assert_eq!(remote.user_agent, "/Satoshi:25.0.0/");
        assert_eq!(remote.start_height, 812_000);
        assert!(!remote.verack_received);
    }

    #[test]
    fn handshake_without_version_yields_nothing() {
        let chain = chain();
        let mut topic = HandshakeTopic::new(
            &chain,
            70016,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8333),
        );
        topic.initial_action();
        topic.on_message(ProtocolMessage::Verack).unwrap();

        assert!(topic.outcome().unwrap().is_none());
    }

    #[test]
    fn addr_exchange_ignores_noise_and_answers_pings() {
        let mut topic = AddrExchangeTopic::new();
        topic.initial_action();

        assert!(topic
            .on_message(ProtocolMessage::Verack)
            .unwrap()
            .message
            .is_none());

        let pong = topic
            .on_message(ProtocolMessage::Ping(PingMessage { nonce: Some(7) }))
            .unwrap();
        match pong.message {
            Some(ProtocolMessage::Pong(p)) => assert_eq!(p.nonce, 7),
            other => panic!("expected a pong, got {other:?}"),
        }

        let addrs = vec![NetAddr {
            ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
            port: 8333,
            services: 1,
            timestamp: 1_700_000_000,
        }];
        let action = topic
            .on_message(ProtocolMessage::Addr(AddrMessage::new(addrs.clone())))
            .unwrap();
        assert!(action.topic_finished);
        assert_eq!(topic.outcome().unwrap(), addrs);
    }

    #[test]
    fn addr_exchange_without_answer_is_empty() {
        let topic = AddrExchangeTopic::new();
        assert!(topic.outcome().unwrap().is_empty());
    }
}
