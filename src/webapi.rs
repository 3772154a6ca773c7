use std::time::Duration;

use serde::Deserialize;

/// Endpoints of the companion web app. Both calls are best-effort; the
/// crawl never depends on them succeeding.
pub struct WebApi {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainOverrides {
    current_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AlertsOutcome {
    #[serde(default)]
    processed: u64,
}

impl WebApi {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        WebApi {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// Fetches the operator-maintained "current version" string. `None`
    /// means no override; the chain-config default applies.
    pub async fn fetch_current_version(&self) -> Option<String> {
        let url = format!("{}/api/config/chain", self.base_url);
        log::debug!("fetching current version override from {url}");

        let response = match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                log::warn!("failed to fetch version override, using config value: {err}");
                return None;
            }
        };
        if !response.status().is_success() {
            log::warn!("version override endpoint returned {}", response.status());
            return None;
        }

        match response.json::<ChainOverrides>().await {
            Ok(overrides) => {
                let version = overrides.current_version?;
                log::info!("using current version override {version}");
                Some(version)
            }
            Err(err) => {
                log::warn!("unreadable version override response: {err}");
                None
            }
        }
    }

    /// Kicks the alert pipeline after a flush so status-change alerts go
    /// out while the data is fresh.
    pub async fn process_alerts(&self) {
        let url = format!("{}/api/alerts/process", self.base_url);
        let mut request = self.client.post(&url).timeout(Duration::from_secs(30));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let outcome = response.json::<AlertsOutcome>().await.unwrap_or_default();
                if outcome.processed > 0 {
                    log::info!("alerts processed: {}", outcome.processed);
                }
            }
            Ok(response) => log::warn!("alert processing failed with status {}", response.status()),
            Err(err) => log::debug!("alert processing error: {err}"),
        }
    }
}
