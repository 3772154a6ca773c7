use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::RpcSection;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC client against the local full node, used purely as a seed
/// source: its connected peers, its manually added nodes and its own
/// listening addresses.
pub struct RpcClient {
    url: String,
    user: String,
    password: String,
    client: reqwest::Client,
}

/// What the local node reports about itself.
#[derive(Debug, Clone)]
pub struct LocalNodeInfo {
    pub local_addresses: Vec<(IpAddr, u16)>,
    pub protocol_version: Option<i32>,
    pub subversion: String,
    pub connections: u64,
}

impl RpcClient {
    pub fn new(config: &RpcSection) -> Self {
        RpcClient {
            url: format!("http://{}:{}", config.host, config.port),
            user: config.user.clone(),
            password: config.password.clone(),
            client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let payload = json!({
            "jsonrpc": "1.0",
            "id": "crawler",
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&payload)
            .timeout(RPC_TIMEOUT)
            .send()
            .await?;
        let body: Value = response.json().await?;

        if let Some(error) = body.get("error").filter(|error| !error.is_null()) {
            // -24 just means no nodes were ever added manually
            if method == "getaddednodeinfo"
                && error.get("code").and_then(Value::as_i64) == Some(-24)
            {
                return Ok(Value::Array(vec![]));
            }
            anyhow::bail!("rpc error from {method}: {error}");
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn get_peer_info(&self) -> anyhow::Result<Vec<Value>> {
        let result = self.call("getpeerinfo", json!([])).await?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    pub async fn get_added_node_info(&self) -> anyhow::Result<Vec<Value>> {
        let result = self.call("getaddednodeinfo", json!([true])).await?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    pub async fn get_connection_count(&self) -> anyhow::Result<u64> {
        let result = self.call("getconnectioncount", json!([])).await?;
        Ok(result.as_u64().unwrap_or(0))
    }

    pub async fn get_network_info(&self) -> anyhow::Result<Value> {
        self.call("getnetworkinfo", json!([])).await
    }

    /// Union of currently connected peers and manually added nodes that are
    /// connected, deduplicated.
    pub async fn get_all_peers(&self) -> Vec<(IpAddr, u16)> {
        let mut peers = HashSet::new();

        match self.get_peer_info().await {
            Ok(list) => {
                for peer in list {
                    let Some(addr) = peer.get("addr").and_then(Value::as_str) else {
                        continue;
                    };
                    match split_host_port(addr) {
                        Some(parsed) => {
                            peers.insert(parsed);
                        }
                        None => log::debug!("unparseable peer address from rpc: {addr}"),
                    }
                }
            }
            Err(err) => log::warn!("getpeerinfo failed: {err:#}"),
        }

        match self.get_added_node_info().await {
            Ok(list) => {
                for node in list {
                    if node.get("connected").and_then(Value::as_bool) != Some(true) {
                        continue;
                    }
                    let Some(addresses) = node.get("addresses").and_then(Value::as_array) else {
                        continue;
                    };
                    for entry in addresses {
                        if let Some(parsed) = entry
                            .get("address")
                            .and_then(Value::as_str)
                            .and_then(split_host_port)
                        {
                            peers.insert(parsed);
                        }
                    }
                }
            }
            Err(err) => log::debug!("getaddednodeinfo failed: {err:#}"),
        }

        let peers: Vec<(IpAddr, u16)> = peers.into_iter().collect();
        log::info!("retrieved {} peers from rpc", peers.len());
        peers
    }

    pub async fn test_connection(&self) -> bool {
        match self.get_connection_count().await {
            Ok(count) => {
                log::info!("rpc connection test successful, {count} connections");
                true
            }
            Err(err) => {
                log::error!("rpc connection test failed: {err:#}");
                false
            }
        }
    }

    pub async fn get_local_node_info(&self) -> Option<LocalNodeInfo> {
        let info = match self.get_network_info().await {
            Ok(info) => info,
            Err(err) => {
                log::warn!("failed to get local node info: {err:#}");
                return None;
            }
        };
        if info.is_null() {
            return None;
        }

        let mut local_addresses = Vec::new();
        if let Some(entries) = info.get("localaddresses").and_then(Value::as_array) {
            for entry in entries {
                let ip = entry
                    .get("address")
                    .and_then(Value::as_str)
                    .and_then(|raw| raw.parse::<IpAddr>().ok());
                let port = entry
                    .get("port")
                    .and_then(Value::as_u64)
                    .and_then(|port| u16::try_from(port).ok());
                if let (Some(ip), Some(port)) = (ip, port) {
                    local_addresses.push((ip, port));
                }
            }
        }

        Some(LocalNodeInfo {
            local_addresses,
            protocol_version: info
                .get("protocolversion")
                .and_then(Value::as_i64)
                .map(|version| version as i32),
            subversion: info
                .get("subversion")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            connections: info.get("connections").and_then(Value::as_u64).unwrap_or(0),
        })
    }
}

/// Splits the address forms the node hands out: `1.2.3.4:33117` and
/// `[2400:6180::1]:33117`.
fn split_host_port(addr: &str) -> Option<(IpAddr, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        Some((host.parse().ok()?, port.parse().ok()?))
    } else {
        let (host, port) = addr.rsplit_once(':')?;
        Some((host.parse().ok()?, port.parse().ok()?))
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case("158.220.104.128:33117", Some(("158.220.104.128", 33117)))]
    #[case("[2400:6180:10:200::1167:7000]:33117", Some(("2400:6180:10:200::1167:7000", 33117)))]
    #[case("[::1]:8333", Some(("::1", 8333)))]
    #[case("158.220.104.128", None)]
    #[case("2400:6180::1", None)]
    #[case("[2400:6180::1]", None)]
    #[case("host.example.org:8333", None)]
    fn host_port_forms(#[case] raw: &str, #[case] expected: Option<(&str, u16)>) {
        let expected = expected.map(|(ip, port)| (ip.parse::<IpAddr>().unwrap(), port));
        assert_eq!(split_host_port(raw), expected);
    }
}
