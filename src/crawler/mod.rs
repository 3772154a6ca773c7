use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use regex::Regex;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::{self, Duration};

use net::wire_protocol::chain::ChainParams;

use crate::config::{ChainSection, Config, CrawlerSection};
use crate::geoip::GeoLookup;
use crate::rpc::RpcClient;
use crate::store::{NodeRecord, NodeStore, StoredNode};
use crate::webapi::WebApi;

pub mod dialer;
pub mod discovery;
pub mod retry;
pub mod seeds;
pub mod version;

use dialer::PeerDialer;
use discovery::{DiscoverySet, NodeStatus};
use retry::{RetrySchedule, RetryStrategy};
use version::{parse_user_agent, versions_match};

/// Down nodes are re-probed after this many minutes, nodes with unknown
/// status after `UNKNOWN_RESEED_MINUTES`; up and reachable nodes every
/// pass.
const DOWN_RESEED_MINUTES: i64 = 30;
const UNKNOWN_RESEED_MINUTES: i64 = 10;
/// TCP probe used to pick the externally reachable address of the local
/// node.
const LOCAL_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The pass controller: seeds the discovery set, drains it through a
/// bounded worker pool, and flushes the results.
pub struct Crawler {
    chain: ChainParams,
    chain_cfg: ChainSection,
    cfg: CrawlerSection,
    ua_regex: Regex,
    state: Arc<Mutex<DiscoverySet>>,
    semaphore: Arc<Semaphore>,
    strategy: Arc<RetryStrategy<PeerDialer>>,
    store: Arc<dyn NodeStore>,
    geo: Arc<dyn GeoLookup>,
    rpc: Option<Arc<RpcClient>>,
    web: WebApi,
}

impl Crawler {
    pub fn new(
        config: Config,
        store: Arc<dyn NodeStore>,
        geo: Arc<dyn GeoLookup>,
    ) -> anyhow::Result<Self> {
        let chain = config.chain_params();
        let ua_regex = Regex::new(&config.chain.user_agent_pattern)
            .context("invalid userAgentPattern in chain config")?;
        let web = WebApi::new(
            config.web_base_url(),
            config.web.as_ref().and_then(|web| web.api_key.clone()),
        );

        let rpc = config.rpc.as_ref().map(|section| Arc::new(RpcClient::new(section)));
        match &rpc {
            Some(client) => log::info!("rpc client initialized against {}", client.endpoint()),
            None => log::warn!(
                "rpc not configured - peer discovery relies on the store, dns and p2p gossip"
            ),
        }

        let dialer = PeerDialer::new(
            chain.clone(),
            Duration::from_millis(config.crawler.getaddr_delay_ms),
        );
        let mut protocol_versions = vec![config.chain.protocol_version];
        protocol_versions.extend(&config.chain.fallback_protocol_versions);
        let strategy = Arc::new(RetryStrategy::new(
            dialer,
            RetrySchedule {
                protocol_versions,
                max_retries: config.crawler.max_retries,
                initial_delay: Duration::from_secs_f64(config.crawler.initial_retry_delay),
                backoff_multiplier: config.crawler.retry_backoff_multiplier,
                connection_timeout: Duration::from_secs(config.crawler.connection_timeout),
                extended_timeout: Duration::from_secs(config.crawler.extended_timeout),
            },
        ));

        Ok(Crawler {
            state: Arc::new(Mutex::new(DiscoverySet::new(config.dev_mode))),
            semaphore: Arc::new(Semaphore::new(config.crawler.max_concurrent)),
            strategy,
            store,
            geo,
            rpc,
            web,
            ua_regex,
            chain,
            chain_cfg: config.chain,
            cfg: config.crawler,
        })
    }

    /// Runs passes forever, sleeping `intervalMinutes` between them. A
    /// failed pass is logged and the loop carries on.
    pub async fn run(&self) {
        log::info!(
            "starting continuous crawler for {} (interval {} minutes)",
            self.chain.name,
            self.cfg.interval_minutes
        );

        let mut iteration = 0_u64;
        loop {
            iteration += 1;
            log::info!("crawl iteration {iteration}");
            if let Err(err) = self.run_single_pass().await {
                log::error!("crawl iteration {iteration} failed: {err:#}");
            }
            log::info!("next crawl pass in {} minutes", self.cfg.interval_minutes);
            time::sleep(Duration::from_secs(self.cfg.interval_minutes * 60)).await;
        }
    }

    pub async fn run_single_pass(&self) -> anyhow::Result<()> {
        log::info!("starting crawl pass on {}", self.chain.name);

        let current_version = match self.web.fetch_current_version().await {
            Some(version) => version,
            None => self.chain_cfg.current_version.clone(),
        };
        log::info!("comparing node versions against {current_version}");

        self.state.lock().reset();

        self.seed_from_store().await;
        self.seed_from_rpc().await;
        self.mark_local_node_up().await;
        self.seed_from_dns().await;
        self.seed_from_config();

        {
            let state = self.state.lock();
            if state.pending_len() == 0 {
                log::error!("no seed nodes found from any source");
                return Ok(());
            }
            let stats = &state.stats;
            log::info!(
                "starting crawl with {} seeds (db={} rpc={} dns={} config={})",
                state.pending_len(),
                stats.peers_from_db,
                stats.peers_from_rpc,
                stats.peers_from_dns,
                stats.peers_from_config
            );
        }

        self.crawl_pending().await;

        {
            let state = self.state.lock();
            log::info!(
                "crawl pass complete: {} nodes ({} up), attempted={} successful={} failed={} gossip_peers={}",
                state.node_count(),
                state.up_count(),
                state.stats.connections_attempted,
                state.stats.connections_successful,
                state.stats.connections_failed,
                state.stats.peers_from_p2p
            );
        }

        self.flush(&current_version).await;

        if let Err(err) = self.store.create_network_snapshot().await {
            log::error!("failed to create network snapshot: {err:#}");
        }
        match self.store.prune_stale_nodes(self.cfg.prune_after_hours).await {
            Ok(pruned) if pruned > 0 => log::info!("pruned {pruned} stale nodes"),
            Ok(_) => {}
            Err(err) => log::error!("failed to prune stale nodes: {err:#}"),
        }

        self.web.process_alerts().await;
        Ok(())
    }

    /// Drains `pending` through the worker pool, batch by batch. Newly
    /// gossiped addresses show up in `pending` while a batch runs and are
    /// picked up by the next one.
    async fn crawl_pending(&self) {
        loop {
            let batch = self.state.lock().take_batch(self.cfg.max_concurrent);
            if batch.is_empty() {
                break;
            }

            let tasks: Vec<_> = batch
                .into_iter()
                .map(|addr| {
                    let state = Arc::clone(&self.state);
                    let semaphore = Arc::clone(&self.semaphore);
                    let strategy = Arc::clone(&self.strategy);
                    tokio::spawn(crawl_node(state, semaphore, strategy, addr))
                })
                .collect();

            for handle in join_all(tasks).await {
                if let Err(err) = handle {
                    log::error!("crawl worker aborted: {err}");
                }
            }

            let state = self.state.lock();
            log::info!(
                "crawl progress: pending={} crawled={} discovered={}",
                state.pending_len(),
                state.crawled_len(),
                state.node_count()
            );
        }
    }

    async fn seed_from_store(&self) {
        log::info!("seeding from store");
        let rows = match self.store.get_all_nodes().await {
            Ok(rows) => rows,
            Err(err) => {
                log::error!("failed to seed from store: {err:#}");
                return;
            }
        };

        let now = Utc::now();
        let mut state = self.state.lock();
        for row in rows {
            if !should_reseed(&row, now) {
                continue;
            }
            if state.admit(SocketAddr::new(row.ip, row.port)) {
                state.stats.peers_from_db += 1;
            }
        }
        log::info!("seeded {} nodes from store", state.stats.peers_from_db);
    }

    async fn seed_from_rpc(&self) {
        let Some(rpc) = &self.rpc else { return };

        if !rpc.test_connection().await {
            log::warn!("rpc connection test failed, skipping rpc seeding");
            return;
        }

        let peers = rpc.get_all_peers().await;
        let mut state = self.state.lock();
        for (ip, port) in peers {
            if state.admit(SocketAddr::new(ip, port)) {
                state.stats.peers_from_rpc += 1;
            }
        }
        log::info!("seeded {} nodes from rpc", state.stats.peers_from_rpc);
    }

    /// The local node answered RPC a moment ago, so it is up by definition;
    /// probing it from inside its own host would only misclassify it.
    /// Prefers an externally reachable IPv4 address, then IPv6, then
    /// whatever is listed first; the unchosen addresses are excluded from
    /// the pass so one physical node yields one entry.
    async fn mark_local_node_up(&self) {
        let Some(rpc) = &self.rpc else { return };
        let Some(info) = rpc.get_local_node_info().await else {
            return;
        };
        if info.local_addresses.is_empty() {
            log::debug!("local node advertises no addresses");
            return;
        }

        let (v4, v6): (Vec<_>, Vec<_>) = info
            .local_addresses
            .iter()
            .copied()
            .partition(|(ip, _)| ip.is_ipv4());

        let mut selected = None;
        for &(ip, port) in v4.iter().chain(v6.iter()) {
            if probe_tcp(SocketAddr::new(ip, port)).await {
                log::info!("local node reachable at {ip}:{port}");
                selected = Some((ip, port));
                break;
            }
            log::debug!("local address {ip}:{port} not reachable from here");
        }
        let (ip, port) = match selected {
            Some(reachable) => reachable,
            None => {
                let Some(&first) = v4.first().or(v6.first()) else {
                    return;
                };
                log::warn!(
                    "no local address externally reachable, using {}:{} anyway",
                    first.0,
                    first.1
                );
                first
            }
        };

        let addr = SocketAddr::new(ip, port);
        let mut state = self.state.lock();
        state.mark_up_directly(addr, info.protocol_version, &info.subversion);
        for &(other_ip, other_port) in &info.local_addresses {
            let other = SocketAddr::new(other_ip, other_port);
            if other != addr {
                state.exclude(other);
            }
        }
        log::info!("marked local node as up at {addr}");
    }

    async fn seed_from_dns(&self) {
        for seed in &self.chain_cfg.dns_seeds {
            match seeds::resolve_dns_seed(seed, self.chain.p2p_port).await {
                Ok(ips) => {
                    let mut state = self.state.lock();
                    let mut admitted = 0_u64;
                    for ip in &ips {
                        if state.admit(SocketAddr::new(*ip, self.chain.p2p_port)) {
                            admitted += 1;
                        }
                    }
                    state.stats.peers_from_dns += admitted;
                    log::info!("resolved dns seed {seed}: {} addresses", ips.len());
                }
                Err(err) => log::warn!("failed to resolve dns seed {seed}: {err}"),
            }
        }
    }

    fn seed_from_config(&self) {
        if self.chain_cfg.seed_nodes.is_empty() {
            log::debug!("no static seed nodes configured");
            return;
        }

        let mut state = self.state.lock();
        for raw in &self.chain_cfg.seed_nodes {
            match seeds::parse_seed_addr(raw, self.chain.p2p_port) {
                Some(addr) => {
                    if state.admit(addr) {
                        state.stats.peers_from_config += 1;
                    }
                }
                None => log::warn!("invalid seed node address: {raw}"),
            }
        }
        if state.stats.peers_from_config > 0 {
            log::info!(
                "seeded {} nodes from config",
                state.stats.peers_from_config
            );
        }
    }

    /// Writes every node of the pass to the store, enriched with geo data
    /// and the parsed client version. One node failing does not stop the
    /// others.
    async fn flush(&self, current_version: &str) {
        let nodes = self.state.lock().snapshot();
        log::info!("saving {} nodes", nodes.len());

        let mut saved = 0_u64;
        let mut skipped_no_version = 0_u64;
        for node in nodes {
            if self.cfg.require_version_for_save
                && (node.user_agent.is_none() || node.protocol_version.is_none())
            {
                skipped_no_version += 1;
                log::debug!(
                    "skipping {}:{} without version data (status {})",
                    node.ip,
                    node.port,
                    node.status.as_str()
                );
                continue;
            }

            let geo = self.geo.lookup(node.ip).await;
            let ua = parse_user_agent(
                &self.ua_regex,
                node.user_agent.as_deref().unwrap_or(""),
                &self.chain_cfg.name,
            );
            let is_current = versions_match(&ua.client_version, current_version);

            let record = NodeRecord {
                ip: node.ip,
                port: node.port,
                chain: self.chain.name.clone(),
                version: node.user_agent.clone(),
                protocol_version: node.protocol_version,
                services: node.services,
                start_height: node.start_height,
                client_name: ua.client_name,
                client_version: ua.client_version,
                version_major: ua.version_major,
                version_minor: ua.version_minor,
                version_patch: ua.version_patch,
                is_current_version: is_current,
                geo,
                status: node.status,
                latency_ms: node.latency_ms,
                first_seen: node.first_seen,
                last_seen: node.last_seen,
                times_seen: node.times_seen,
            };

            match self.store.upsert_node(&record).await {
                Ok(node_id) => {
                    saved += 1;
                    let is_online = node.status == NodeStatus::Up;
                    if let Err(err) = self
                        .store
                        .create_node_snapshot(
                            node_id,
                            is_online,
                            if is_online { node.latency_ms } else { None },
                            if is_online { node.start_height } else { None },
                        )
                        .await
                    {
                        log::error!("failed to snapshot node {}:{}: {err:#}", node.ip, node.port);
                    }
                }
                Err(err) => log::error!("failed to save node {}:{}: {err:#}", node.ip, node.port),
            }
        }

        log::info!("nodes saved: saved={saved} skipped_no_version={skipped_no_version}");
    }
}

/// One worker. The target has already left `pending` via `take_batch`; the
/// semaphore bounds actual socket work.
async fn crawl_node(
    state: Arc<Mutex<DiscoverySet>>,
    semaphore: Arc<Semaphore>,
    strategy: Arc<RetryStrategy<PeerDialer>>,
    addr: SocketAddr,
) {
    let _permit = match semaphore.acquire().await {
        Ok(permit) => permit,
        Err(_) => return, // semaphore closed, pass is over
    };

    state.lock().stats.connections_attempted += 1;
    let result = strategy.dial_with_retry(addr).await;
    state.lock().record(addr, result);
}

/// Store re-seed policy: live nodes every pass, dead nodes after half an
/// hour, anything unclear after ten minutes.
fn should_reseed(row: &StoredNode, now: DateTime<Utc>) -> bool {
    let Some(last_seen) = row.last_seen else {
        return true;
    };
    let minutes_since = (now - last_seen).num_minutes();
    match row.status.as_str() {
        "up" | "reachable" => true,
        "down" => minutes_since > DOWN_RESEED_MINUTES,
        _ => minutes_since > UNKNOWN_RESEED_MINUTES,
    }
}

async fn probe_tcp(addr: SocketAddr) -> bool {
    matches!(
        time::timeout(LOCAL_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
