use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use url::Url;

use shelfwatch_core::resource::{ProviderError, ResourceProvider};

/// Configuration for the window-farm API client.
///
/// The farm is a local daemon (BitBrowser-style) exposing a JSON API:
/// every response carries `success`, `msg` and a `data` object.
#[derive(Debug, Clone)]
pub struct WindowFarmConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    /// Timeout for the TCP liveness probe of a DevTools endpoint.
    pub probe_timeout: Duration,
}

impl Default for WindowFarmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:54345".to_string(),
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl WindowFarmConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// Window-farm client: opens/closes browser windows and lists the
/// windows of a group.
#[derive(Clone)]
pub struct HttpWindowProvider {
    client: Client,
    config: WindowFarmConfig,
}

impl HttpWindowProvider {
    pub fn new(config: WindowFarmConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ProviderError> {
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Failed(format!("Window farm unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Failed(format!(
                "Window farm returned HTTP {}",
                status.as_u16()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Failed(format!("Invalid farm response: {e}")))?;

        if payload["success"].as_bool().unwrap_or(false) {
            return Ok(payload);
        }

        let msg = payload["msg"].as_str().unwrap_or("unknown error").to_string();
        let lowered = msg.to_lowercase();
        if lowered.contains("closing") || lowered.contains("is being closed") {
            Err(ProviderError::ClosingInProgress(msg))
        } else {
            Err(ProviderError::Failed(msg))
        }
    }

    /// Window ids of a group, paging through `/browser/list`.
    pub async fn list_group_windows(&self, group_id: &str) -> Result<Vec<String>, ProviderError> {
        const PAGE_SIZE: usize = 100;
        let mut ids = Vec::new();
        let mut page = 0;

        loop {
            let payload = self
                .post(
                    "/browser/list",
                    json!({"page": page, "pageSize": PAGE_SIZE, "groupId": group_id}),
                )
                .await?;

            let list = payload["data"]["list"].as_array().cloned().unwrap_or_default();
            let count = list.len();
            for window in list {
                if let Some(id) = window["id"].as_str() {
                    ids.push(id.to_string());
                }
            }
            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        tracing::debug!(group_id, count = ids.len(), "Listed group windows");
        Ok(ids)
    }
}

/// Pull the DevTools endpoint out of an open response. Farms differ in
/// where they put it.
fn extract_conn_ref(payload: &Value) -> Option<String> {
    for source in [&payload["data"], payload] {
        for key in ["ws", "wsEndpoint", "debuggerAddress", "http"] {
            if let Some(conn) = source[key].as_str()
                && !conn.is_empty()
            {
                return Some(conn.to_string());
            }
        }
    }
    None
}

impl ResourceProvider for HttpWindowProvider {
    async fn open(&self, handle_id: &str) -> Result<String, ProviderError> {
        let payload = self.post("/browser/open", json!({"id": handle_id})).await?;
        let conn = extract_conn_ref(&payload).ok_or_else(|| {
            ProviderError::Failed(format!(
                "Open succeeded but no DevTools endpoint for window {handle_id}"
            ))
        })?;
        tracing::info!(handle_id, %conn, "Window opened");
        Ok(conn)
    }

    async fn close(&self, handle_id: &str) -> Result<(), ProviderError> {
        self.post("/browser/close", json!({"id": handle_id})).await?;
        tracing::info!(handle_id, "Window closed");
        Ok(())
    }

    /// TCP-connect to the DevTools endpoint. Anything unparseable or
    /// unreachable counts as dead.
    async fn probe(&self, conn_ref: &str) -> bool {
        let Some(addr) = probe_addr(conn_ref) else {
            tracing::debug!(conn_ref, "Unparseable connection reference");
            return false;
        };
        matches!(
            tokio::time::timeout(
                self.config.probe_timeout,
                tokio::net::TcpStream::connect(&addr),
            )
            .await,
            Ok(Ok(_))
        )
    }
}

fn probe_addr(conn_ref: &str) -> Option<String> {
    // Bare "host:port" debugger addresses are accepted as-is.
    if !conn_ref.contains("://") {
        let (host, port) = conn_ref.rsplit_once(':')?;
        port.parse::<u16>().ok()?;
        return Some(format!("{host}:{port}"));
    }
    let parsed = Url::parse(conn_ref).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}
