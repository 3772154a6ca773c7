use std::env;
use std::fs;
use std::path::Path;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Deserializer};

use net::wire_protocol::chain::{ChainParams, NodeService, NodeServiceSet};

/// Contents of `project.config.yaml`. The chain section describes the
/// network being crawled; the crawler section tunes the engine; rpc and web
/// are optional integrations.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub chain: ChainSection,
    #[serde(default, rename = "crawlerConfig")]
    pub crawler: CrawlerSection,
    #[serde(default)]
    pub rpc: Option<RpcSection>,
    #[serde(default)]
    pub web: Option<WebSection>,
    /// Set from `NODE_ENV`, not from the file: development mode admits
    /// private and loopback addresses into the crawl.
    #[serde(skip)]
    pub dev_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSection {
    pub name: String,
    #[serde(deserialize_with = "magic_from_hex")]
    pub magic: [u8; 4],
    pub p2p_port: u16,
    pub protocol_version: i32,
    #[serde(default)]
    pub fallback_protocol_versions: Vec<i32>,
    #[serde(default)]
    pub dns_seeds: Vec<String>,
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    /// Captures `(client_name, version)` or just `(version)` out of a peer
    /// user agent like `/Satoshi:25.0.0/`.
    pub user_agent_pattern: String,
    pub current_version: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlerSection {
    pub max_concurrent: usize,
    /// Seconds for the initial connect-and-handshake deadline.
    pub connection_timeout: u64,
    /// Seconds granted to a node that accepted TCP on an earlier attempt.
    pub extended_timeout: u64,
    pub max_retries: u32,
    /// Seconds before the first retry; grows by the backoff multiplier.
    pub initial_retry_delay: f64,
    pub retry_backoff_multiplier: f64,
    pub getaddr_delay_ms: u64,
    pub prune_after_hours: u32,
    pub interval_minutes: u64,
    pub require_version_for_save: bool,
}

impl Default for CrawlerSection {
    fn default() -> Self {
        CrawlerSection {
            max_concurrent: 50,
            connection_timeout: 5,
            extended_timeout: 10,
            max_retries: 2,
            initial_retry_delay: 1.0,
            retry_backoff_multiplier: 2.0,
            getaddr_delay_ms: 500,
            prune_after_hours: 24,
            interval_minutes: 10,
            require_version_for_save: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcSection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_user_agent() -> String {
    concat!("/atlas-crawler:", env!("CARGO_PKG_VERSION"), "/").to_string()
}

fn magic_from_hex<'de, D>(deserializer: D) -> Result<[u8; 4], D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let bytes = hex::decode(raw.trim()).map_err(serde::de::Error::custom)?;
    bytes
        .try_into()
        .map_err(|_| serde::de::Error::custom("network magic must be exactly 4 hex-encoded bytes"))
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Config =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Regex::new(&config.chain.user_agent_pattern).context("invalid userAgentPattern")?;
        config.dev_mode = development_mode();
        Ok(config)
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            name: self.chain.name.clone(),
            magic: self.chain.magic,
            p2p_port: self.chain.p2p_port,
            protocol_version: self.chain.protocol_version,
            user_agent: self.chain.user_agent.clone(),
            services: NodeServiceSet(vec![NodeService::NodeNetwork]),
            start_height: 0,
        }
    }

    /// Base URL of the companion web app, used for the version override and
    /// alert processing endpoints. `WEB_PORT` shapes the default.
    pub fn web_base_url(&self) -> String {
        if let Some(url) = self.web.as_ref().and_then(|web| web.base_url.as_ref()) {
            return url.trim_end_matches('/').to_string();
        }
        let port = env::var("WEB_PORT")
            .ok()
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(4000);
        format!("http://localhost:{port}")
    }
}

pub fn development_mode() -> bool {
    env::var("NODE_ENV")
        .map(|value| value.eq_ignore_ascii_case("development"))
        .unwrap_or(false)
}
