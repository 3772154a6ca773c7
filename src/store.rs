use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::crawler::discovery::NodeStatus;
use crate::geoip::GeoInfo;

/// The full attribute set written for a node at the end of a pass.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub ip: IpAddr,
    pub port: u16,
    pub chain: String,
    pub version: Option<String>,
    pub protocol_version: Option<i32>,
    pub services: Option<u64>,
    pub start_height: Option<i32>,
    pub client_name: String,
    pub client_version: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patch: u32,
    pub is_current_version: bool,
    #[serde(flatten)]
    pub geo: GeoInfo,
    pub status: NodeStatus,
    pub latency_ms: Option<f64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub times_seen: u32,
}

/// What the store remembers about a node between passes; enough to decide
/// whether it is due for a re-probe.
#[derive(Debug, Clone)]
pub struct StoredNode {
    pub ip: IpAddr,
    pub port: u16,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Persistence seam for crawl results. Upserts are keyed on `(ip, port)`
/// and must be idempotent; snapshots are append-only history.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get_all_nodes(&self) -> anyhow::Result<Vec<StoredNode>>;
    async fn upsert_node(&self, record: &NodeRecord) -> anyhow::Result<i64>;
    async fn create_node_snapshot(
        &self,
        node_id: i64,
        is_online: bool,
        response_time_ms: Option<f64>,
        block_height: Option<i32>,
    ) -> anyhow::Result<()>;
    async fn create_network_snapshot(&self) -> anyhow::Result<()>;
    async fn prune_stale_nodes(&self, hours: u32) -> anyhow::Result<u64>;
}

/// In-memory store. Backs the default binary when no database is wired up,
/// and the tests.
#[derive(Default)]
pub struct MemoryNodeStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    nodes: HashMap<(IpAddr, u16), (i64, NodeRecord)>,
    node_snapshots: Vec<NodeSnapshotRow>,
    last_network_snapshot: Option<DateTime<Utc>>,
    network_snapshots: u64,
}

#[derive(Debug, Clone)]
pub struct NodeSnapshotRow {
    pub node_id: i64,
    pub is_online: bool,
    pub response_time_ms: Option<f64>,
    pub block_height: Option<i32>,
    pub taken_at: DateTime<Utc>,
}

impl MemoryNodeStore {
    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn get(&self, ip: IpAddr, port: u16) -> Option<NodeRecord> {
        self.inner
            .lock()
            .nodes
            .get(&(ip, port))
            .map(|(_, record)| record.clone())
    }

    pub fn node_snapshot_count(&self) -> usize {
        self.inner.lock().node_snapshots.len()
    }

    pub fn network_snapshot_count(&self) -> u64 {
        self.inner.lock().network_snapshots
    }

    pub fn put_stored_node(&self, record: NodeRecord) {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.nodes.insert((record.ip, record.port), (id, record));
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn get_all_nodes(&self) -> anyhow::Result<Vec<StoredNode>> {
        let inner = self.inner.lock();
        Ok(inner
            .nodes
            .values()
            .map(|(_, record)| StoredNode {
                ip: record.ip,
                port: record.port,
                status: record.status.as_str().to_string(),
                last_seen: Some(record.last_seen),
            })
            .collect())
    }

    async fn upsert_node(&self, record: &NodeRecord) -> anyhow::Result<i64> {
        let mut inner = self.inner.lock();
        let key = (record.ip, record.port);
        if let Some((id, existing)) = inner.nodes.get_mut(&key) {
            let id = *id;
            // the store owns history continuity across passes
            let first_seen = existing.first_seen.min(record.first_seen);
            let times_seen = existing.times_seen + record.times_seen;
            *existing = record.clone();
            existing.first_seen = first_seen;
            existing.times_seen = times_seen;
            Ok(id)
        } else {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.nodes.insert(key, (id, record.clone()));
            Ok(id)
        }
    }

    async fn create_node_snapshot(
        &self,
        node_id: i64,
        is_online: bool,
        response_time_ms: Option<f64>,
        block_height: Option<i32>,
    ) -> anyhow::Result<()> {
        self.inner.lock().node_snapshots.push(NodeSnapshotRow {
            node_id,
            is_online,
            response_time_ms,
            block_height,
            taken_at: Utc::now(),
        });
        Ok(())
    }

    async fn create_network_snapshot(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        // idempotent within the hour
        if let Some(last) = inner.last_network_snapshot {
            if last.date_naive() == now.date_naive() && last.hour() == now.hour() {
                return Ok(());
            }
        }
        inner.last_network_snapshot = Some(now);
        inner.network_snapshots += 1;
        Ok(())
    }

    async fn prune_stale_nodes(&self, hours: u32) -> anyhow::Result<u64> {
        let cutoff = Utc::now() - Duration::hours(hours as i64);
        let mut inner = self.inner.lock();
        let before = inner.nodes.len();
        inner.nodes.retain(|_, (_, record)| record.last_seen >= cutoff);
        Ok((before - inner.nodes.len()) as u64)
    }
}
