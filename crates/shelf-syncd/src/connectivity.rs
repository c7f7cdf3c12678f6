use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use shelf_core::{ConnectivitySource, ConnectivityState};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connectivity derived from the backend itself: a TCP connect to the server
/// host stands in for "interface up", an HTTP answer from the REST root for
/// "internet reachable".
pub struct ProbeConnectivity {
    client: reqwest::Client,
    base_url: String,
    host: String,
    port: u16,
    api_key: Option<String>,
}

impl ProbeConnectivity {
    pub fn new(server_url: &str, api_key: Option<String>) -> Result<Self> {
        let url = Url::parse(server_url)
            .with_context(|| format!("Invalid server URL: {}", server_url))?;
        let host = url
            .host_str()
            .context("Server URL has no host")?
            .to_string();
        let port = url
            .port_or_known_default()
            .context("Server URL has no port")?;
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: server_url.trim_end_matches('/').to_string(),
            host,
            port,
            api_key,
        })
    }

    async fn can_connect(&self) -> bool {
        matches!(
            tokio::time::timeout(
                PROBE_TIMEOUT,
                TcpStream::connect((self.host.as_str(), self.port))
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn backend_answers(&self) -> bool {
        let mut request = self.client.get(format!("{}/rest/v1/", self.base_url));
        if let Some(ref key) = self.api_key {
            request = request.header("apikey", key);
        }
        match request.send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                debug!(error = %e, "reachability probe failed");
                false
            }
        }
    }

    /// Probe every `interval` and emit a state whenever it differs from the
    /// last one sent. The first probe is always emitted.
    pub fn watch(
        self: Arc<Self>,
        interval: Duration,
    ) -> mpsc::UnboundedReceiver<ConnectivityState> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last: Option<ConnectivityState> = None;
            loop {
                ticker.tick().await;
                let state = match self.fetch().await {
                    Ok(state) => state,
                    Err(e) => {
                        debug!(error = %format!("{e:#}"), "connectivity probe failed");
                        continue;
                    }
                };
                if last.as_ref() == Some(&state) {
                    continue;
                }
                if tx.send(state.clone()).is_err() {
                    // Receiver dropped, daemon is shutting down
                    break;
                }
                last = Some(state);
            }
        });
        rx
    }
}

#[async_trait]
impl ConnectivitySource for ProbeConnectivity {
    async fn fetch(&self) -> Result<ConnectivityState> {
        if !self.can_connect().await {
            return Ok(ConnectivityState {
                is_connected: false,
                is_internet_reachable: Some(false),
                connection_type: "none".to_string(),
            });
        }
        Ok(ConnectivityState {
            is_connected: true,
            is_internet_reachable: Some(self.backend_answers().await),
            connection_type: "other".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_core::network::classify;
    use shelf_core::NetworkStatus;

    #[tokio::test]
    async fn test_answering_backend_is_online() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/v1/")
            .match_header("apikey", "anon")
            .with_status(200)
            .create_async()
            .await;

        let probe = ProbeConnectivity::new(&server.url(), Some("anon".to_string())).unwrap();
        let state = probe.fetch().await.unwrap();
        mock.assert_async().await;
        assert_eq!(
            classify(state.is_connected, state.is_internet_reachable),
            NetworkStatus::Online
        );
    }

    #[tokio::test]
    async fn test_failing_backend_is_unknown() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/rest/v1/")
            .with_status(503)
            .create_async()
            .await;

        let probe = ProbeConnectivity::new(&server.url(), None).unwrap();
        let state = probe.fetch().await.unwrap();
        assert!(state.is_connected);
        assert_eq!(state.is_internet_reachable, Some(false));
        assert_eq!(
            classify(state.is_connected, state.is_internet_reachable),
            NetworkStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_closed_port_is_offline() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = ProbeConnectivity::new(&format!("http://127.0.0.1:{}", port), None).unwrap();
        let state = probe.fetch().await.unwrap();
        assert!(!state.is_connected);
        assert_eq!(state.connection_type, "none");
    }

    #[test]
    fn test_rejects_url_without_host() {
        assert!(ProbeConnectivity::new("not a url", None).is_err());
    }
}
