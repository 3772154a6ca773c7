use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::dialer::DialResult;
use net::wire_protocol::messages::NetAddr;

/// Reachability classification of a node within the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Up,
    Reachable,
    Down,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Up => "up",
            NodeStatus::Reachable => "reachable",
            NodeStatus::Down => "down",
        }
    }
}

/// Everything observed about one `ip:port` during a pass. Attribute fields
/// stay empty until a handshake fills them in.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol_version: Option<i32>,
    pub services: Option<u64>,
    pub start_height: Option<i32>,
    pub user_agent: Option<String>,
    pub latency_ms: Option<f64>,
    pub status: NodeStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub times_seen: u32,
    pub peers: Vec<NetAddr>,
}

impl NodeInfo {
    fn new(addr: SocketAddr) -> Self {
        let now = Utc::now();
        NodeInfo {
            ip: addr.ip(),
            port: addr.port(),
            protocol_version: None,
            services: None,
            start_height: None,
            user_agent: None,
            latency_ms: None,
            status: NodeStatus::Pending,
            first_seen: now,
            last_seen: now,
            times_seen: 1,
            peers: vec![],
        }
    }
}

/// Per-pass counters, reported at the end of a pass and reset with it.
#[derive(Debug, Default, Clone)]
pub struct CrawlStats {
    pub connections_attempted: u64,
    pub connections_successful: u64,
    pub connections_failed: u64,
    pub nodes_discovered: u64,
    pub peers_from_db: u64,
    pub peers_from_rpc: u64,
    pub peers_from_dns: u64,
    pub peers_from_config: u64,
    pub peers_from_p2p: u64,
}

/// The per-pass work queue and bookkeeping, shared by all crawl workers
/// behind a mutex.
///
/// A target moves `pending -> in_flight -> crawled`; admission checks all
/// three sets, so an address a peer advertises while its own probe is still
/// running cannot be queued a second time. That ordering is what keeps the
/// queue from growing without bound on densely connected networks.
pub struct DiscoverySet {
    accept_private: bool,
    pending: HashSet<SocketAddr>,
    in_flight: HashSet<SocketAddr>,
    crawled: HashSet<SocketAddr>,
    nodes: HashMap<SocketAddr, NodeInfo>,
    pub stats: CrawlStats,
}

impl DiscoverySet {
    pub fn new(accept_private: bool) -> Self {
        DiscoverySet {
            accept_private,
            pending: HashSet::new(),
            in_flight: HashSet::new(),
            crawled: HashSet::new(),
            nodes: HashMap::new(),
            stats: CrawlStats::default(),
        }
    }

    /// Starts a fresh pass: every node is re-discovered from scratch.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.in_flight.clear();
        self.crawled.clear();
        self.nodes.clear();
        self.stats = CrawlStats::default();
    }

    /// Queues a target unless it is filtered out or already known to this
    /// pass (queued, being dialed right now, or done).
    pub fn admit(&mut self, addr: SocketAddr) -> bool {
        if !crawlable_ip(&addr.ip(), self.accept_private) {
            return false;
        }
        if self.crawled.contains(&addr) || self.in_flight.contains(&addr) {
            return false;
        }
        self.pending.insert(addr)
    }

    /// Moves up to `n` targets from `pending` into `in_flight` and hands
    /// them to the caller for dialing.
    pub fn take_batch(&mut self, n: usize) -> Vec<SocketAddr> {
        let batch: Vec<SocketAddr> = self.pending.iter().take(n).copied().collect();
        for addr in &batch {
            self.pending.remove(addr);
            self.in_flight.insert(*addr);
        }
        batch
    }

    /// Files the outcome of a probe: classification, learned attributes,
    /// and any peer addresses the node advertised.
    pub fn record(&mut self, addr: SocketAddr, result: DialResult) {
        self.in_flight.remove(&addr);
        self.crawled.insert(addr);

        let now = Utc::now();
        let is_new = !self.nodes.contains_key(&addr);

        match result {
            DialResult::Up(info) => {
                self.stats.connections_successful += 1;
                if is_new {
                    self.stats.nodes_discovered += 1;
                }

                let peer_addrs: Vec<SocketAddr> = info
                    .peers
                    .iter()
                    .map(|peer| SocketAddr::new(peer.ip, peer.port))
                    .collect();

                let node = self.nodes.entry(addr).or_insert_with(|| NodeInfo::new(addr));
                node.protocol_version = Some(info.protocol_version);
                node.services = Some(info.services);
                node.start_height = Some(info.start_height);
                node.user_agent = Some(info.user_agent.clone());
                node.latency_ms = Some(info.latency_ms);
                node.status = NodeStatus::Up;
                node.last_seen = now;
                if !is_new {
                    node.times_seen += 1;
                }
                node.peers = info.peers;

                self.stats.peers_from_p2p += peer_addrs.len() as u64;
                for peer_addr in peer_addrs {
                    self.admit(peer_addr);
                }
            }
            DialResult::Reachable { latency_ms } => {
                self.stats.connections_successful += 1;
                if is_new {
                    self.stats.nodes_discovered += 1;
                }
                let node = self.nodes.entry(addr).or_insert_with(|| NodeInfo::new(addr));
                node.latency_ms = Some(latency_ms);
                node.status = NodeStatus::Reachable;
                node.last_seen = now;
                if !is_new {
                    node.times_seen += 1;
                }
            }
            DialResult::Unreachable => {
                self.stats.connections_failed += 1;
                // discovered-but-dead nodes are kept and stored too; the
                // map should show the whole known network, not only the
                // live part
                if is_new {
                    self.stats.nodes_discovered += 1;
                    let mut node = NodeInfo::new(addr);
                    node.status = NodeStatus::Down;
                    node.times_seen = 0;
                    self.nodes.insert(addr, node);
                } else if let Some(node) = self.nodes.get_mut(&addr) {
                    node.status = NodeStatus::Down;
                    node.last_seen = now;
                }
            }
        }
    }

    /// Records a node as up without dialing it. Used for the local node,
    /// whose liveness is already proven over RPC.
    pub fn mark_up_directly(
        &mut self,
        addr: SocketAddr,
        protocol_version: Option<i32>,
        user_agent: &str,
    ) {
        let mut node = NodeInfo::new(addr);
        node.protocol_version = protocol_version;
        node.services = Some(1);
        node.user_agent = Some(user_agent.to_string());
        node.latency_ms = Some(1.0);
        node.status = NodeStatus::Up;
        self.nodes.insert(addr, node);

        self.pending.remove(&addr);
        self.crawled.insert(addr);
    }

    /// Takes a target out of the pass without probing it.
    pub fn exclude(&mut self, addr: SocketAddr) {
        self.pending.remove(&addr);
        self.crawled.insert(addr);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn crawled_len(&self) -> usize {
        self.crawled.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn up_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| node.status == NodeStatus::Up)
            .count()
    }

    pub fn snapshot(&self) -> Vec<NodeInfo> {
        self.nodes.values().cloned().collect()
    }
}

/// Whether an advertised address is worth dialing. Loopback, link-local and
/// unique-local IPv6 never are; private IPv4 ranges only in development
/// mode; `0.0.0.0/8` never.
pub fn crawlable_ip(ip: &IpAddr, accept_private: bool) -> bool {
    match ip {
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return false;
            }
            let segments = v6.segments();
            if segments[0] & 0xffc0 == 0xfe80 {
                return false; // fe80::/10
            }
            if segments[0] & 0xfe00 == 0xfc00 {
                return false; // fc00::/7, which covers fd00::/8
            }
            true
        }
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            if octets[0] == 0 {
                return false;
            }
            let private = octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
                || octets[0] == 127;
            if private {
                return accept_private;
            }
            true
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::super::dialer::ProbeInfo;
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn up_with_peers(peers: Vec<NetAddr>) -> DialResult {
        DialResult::Up(Box::new(ProbeInfo {
            protocol_version: 70016,
            services: 1,
            start_height: 812_000,
            user_agent: "/Satoshi:25.0.0/".to_string(),
            latency_ms: 42.0,
            peers,
        }))
    }

    fn peer(ip: &str, port: u16) -> NetAddr {
        NetAddr {
            ip: ip.parse().unwrap(),
            port,
            services: 1,
            timestamp: 1_700_000_000,
        }
    }

    #[rstest]
    #[case("8.8.8.8", false, true)]
    #[case("0.1.2.3", false, false)]
    #[case("0.1.2.3", true, false)]
    #[case("10.0.0.1", false, false)]
    #[case("10.0.0.1", true, true)]
    #[case("172.16.0.1", false, false)]
    #[case("172.31.255.255", false, false)]
    #[case("172.32.0.1", false, true)]
    #[case("192.168.1.1", false, false)]
    #[case("192.168.1.1", true, true)]
    #[case("127.0.0.1", false, false)]
    #[case("127.0.0.1", true, true)]
    #[case("::1", false, false)]
    #[case("::1", true, false)]
    #[case("fe80::1", false, false)]
    #[case("fc00::1", false, false)]
    #[case("fd12::34", false, false)]
    #[case("2400:6180:10:200::1167:7000", false, true)]
    fn ip_filter(#[case] ip: &str, #[case] accept_private: bool, #[case] expected: bool) {
        let ip: IpAddr = ip.parse().unwrap();
        assert_eq!(crawlable_ip(&ip, accept_private), expected);
    }

    #[test]
    fn admit_is_idempotent() {
        let mut set = DiscoverySet::new(false);
        assert!(set.admit(addr("198.51.100.5:8333")));
        assert!(!set.admit(addr("198.51.100.5:8333")));
        assert_eq!(set.pending_len(), 1);
    }

    #[test]
    fn admit_filters_private_addresses() {
        let mut set = DiscoverySet::new(false);
        assert!(!set.admit(addr("10.0.0.1:8333")));

        let mut dev_set = DiscoverySet::new(true);
        assert!(dev_set.admit(addr("10.0.0.1:8333")));
    }

    #[test]
    fn in_flight_targets_cannot_be_requeued() {
        let mut set = DiscoverySet::new(false);
        set.admit(addr("198.51.100.5:8333"));

        let batch = set.take_batch(10);
        assert_eq!(batch, vec![addr("198.51.100.5:8333")]);
        assert_eq!(set.pending_len(), 0);

        // a peer advertising the in-flight target must not re-queue it
        assert!(!set.admit(addr("198.51.100.5:8333")));
        assert_eq!(set.pending_len(), 0);
    }

    #[test]
    fn crawled_targets_cannot_be_requeued() {
        let mut set = DiscoverySet::new(false);
        set.admit(addr("198.51.100.5:8333"));
        set.take_batch(1);
        set.record(addr("198.51.100.5:8333"), DialResult::Unreachable);

        assert!(!set.admit(addr("198.51.100.5:8333")));
        assert_eq!(set.crawled_len(), 1);
    }

    #[test]
    fn record_up_stores_attributes_and_admits_peers() {
        let mut set = DiscoverySet::new(false);
        let target = addr("198.51.100.5:8333");
        set.admit(target);
        set.take_batch(1);

        set.record(
            target,
            up_with_peers(vec![peer("203.0.113.7", 8333), peer("203.0.113.8", 8333)]),
        );

        let nodes = set.snapshot();
        let node = nodes.iter().find(|n| n.port == 8333).unwrap();
        assert_eq!(node.status, NodeStatus::Up);
        assert_eq!(node.protocol_version, Some(70016));
        assert_eq!(node.user_agent.as_deref(), Some("/Satoshi:25.0.0/"));
        assert_eq!(node.times_seen, 1);

        assert_eq!(set.pending_len(), 2);
        assert_eq!(set.stats.peers_from_p2p, 2);
        assert_eq!(set.stats.connections_successful, 1);
    }

    #[test]
    fn record_up_does_not_requeue_the_advertiser() {
        let mut set = DiscoverySet::new(false);
        let target = addr("198.51.100.5:8333");
        set.admit(target);
        set.take_batch(1);

        // the peer advertises the crawler's own target back at it
        set.record(target, up_with_peers(vec![peer("198.51.100.5", 8333)]));
        assert_eq!(set.pending_len(), 0);
    }

    #[test]
    fn record_filters_advertised_private_peers() {
        let mut set = DiscoverySet::new(false);
        let target = addr("198.51.100.5:8333");
        set.admit(target);
        set.take_batch(1);

        set.record(target, up_with_peers(vec![peer("10.0.0.1", 8333)]));
        assert_eq!(set.pending_len(), 0);

        let mut dev_set = DiscoverySet::new(true);
        dev_set.admit(target);
        dev_set.take_batch(1);
        dev_set.record(target, up_with_peers(vec![peer("10.0.0.1", 8333)]));
        assert_eq!(dev_set.pending_len(), 1);
    }

    #[test]
    fn record_unreachable_keeps_the_node_as_down() {
        let mut set = DiscoverySet::new(false);
        let target = addr("198.51.100.99:1");
        set.admit(target);
        set.take_batch(1);
        set.record(target, DialResult::Unreachable);

        let nodes = set.snapshot();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].status, NodeStatus::Down);
        assert_eq!(nodes[0].times_seen, 0);
        assert!(nodes[0].user_agent.is_none());
        assert_eq!(set.stats.connections_failed, 1);
    }

    #[test]
    fn reachable_then_up_promotes_in_place() {
        let mut set = DiscoverySet::new(false);
        let target = addr("198.51.100.5:8333");
        set.admit(target);
        set.take_batch(1);
        set.record(target, DialResult::Reachable { latency_ms: 5.0 });

        // next pass would re-admit; within a pass a second record only
        // happens through direct bookkeeping, but the upsert must still
        // promote correctly
        set.record(target, up_with_peers(vec![]));

        let nodes = set.snapshot();
        assert_eq!(nodes[0].status, NodeStatus::Up);
        assert_eq!(nodes[0].times_seen, 2);
    }

    #[test]
    fn mark_up_directly_bypasses_the_dialer() {
        let mut set = DiscoverySet::new(false);
        let local = addr("198.51.100.44:8333");
        set.admit(local);
        set.mark_up_directly(local, Some(70016), "/Satoshi:25.0.0/");

        assert_eq!(set.pending_len(), 0);
        assert!(!set.admit(local));
        let nodes = set.snapshot();
        assert_eq!(nodes[0].status, NodeStatus::Up);
        assert_eq!(nodes[0].latency_ms, Some(1.0));
    }

    #[test]
    fn reset_clears_everything() {
        let mut set = DiscoverySet::new(false);
        set.admit(addr("198.51.100.5:8333"));
        set.take_batch(1);
        set.record(addr("198.51.100.5:8333"), DialResult::Unreachable);
        set.stats.peers_from_dns = 7;

        set.reset();
        assert_eq!(set.pending_len(), 0);
        assert_eq!(set.crawled_len(), 0);
        assert_eq!(set.node_count(), 0);
        assert_eq!(set.stats.peers_from_dns, 0);
    }
}
