//! Per-server connection state and downstream client plumbing.
//!
//! Each configured server gets exactly one [`ServerConnection`] with an
//! explicit `Disconnected -> Connecting -> {Connected | Failed}` state
//! machine and an explicit shutdown, independent of any scoping rules.
//! Catalog snapshots are swapped atomically through an `ArcSwap` so readers
//! never take a lock and never observe a partial replacement.

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, Tool},
    service::RunningService,
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use serde_json::{Map, Value};
use tokio::{sync::mpsc, time::Instant};
use tracing::{error, info, warn};

use super::{
    config::{ServerConfig, ServerTransport},
    handler::CatalogEventHandler,
};
use crate::{
    catalog::ToolDescriptor,
    error::{StrataError, StrataResult},
};

/// Connection lifecycle. `Failed -> Connecting` only via an explicit,
/// backoff-gated retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Wholesale-replaced view of one server's advertised tools.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub tools: Vec<ToolDescriptor>,
    pub fetched_at: Option<Instant>,
}

impl CatalogSnapshot {
    pub fn empty() -> Self {
        Self {
            tools: Vec::new(),
            fetched_at: None,
        }
    }

    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools,
            fetched_at: Some(Instant::now()),
        }
    }

    /// A snapshot that was never fetched is always stale.
    pub fn is_stale(&self, ttl: Duration) -> bool {
        match self.fetched_at {
            Some(at) => at.elapsed() > ttl,
            None => true,
        }
    }
}

/// The only contract a downstream server must satisfy: list its tools and
/// call one of them. Implemented by the rmcp-backed client in production and
/// by fakes in tests.
#[async_trait]
pub trait ToolServerClient: Send + Sync {
    async fn list_tools(&self) -> StrataResult<Vec<Tool>>;

    async fn call_tool(
        &self,
        action: &str,
        args: Option<Map<String, Value>>,
    ) -> StrataResult<CallToolResult>;

    async fn shutdown(&self) -> StrataResult<()>;
}

type RunningClient = RunningService<RoleClient, CatalogEventHandler>;

/// Production downstream client over an rmcp transport.
pub struct RmcpToolClient {
    inner: parking_lot::Mutex<Option<Arc<RunningClient>>>,
    server: String,
}

impl RmcpToolClient {
    /// Connect to a downstream server. Remote transports are retried with
    /// exponential backoff; stdio (child process) gets a single attempt.
    pub async fn connect(
        config: &ServerConfig,
        handler: CatalogEventHandler,
    ) -> StrataResult<Self> {
        let client = if config.transport.is_remote() {
            Self::dial_with_retry(config, handler).await?
        } else {
            Self::dial(config, handler).await?
        };

        Ok(Self {
            inner: parking_lot::Mutex::new(Some(Arc::new(client))),
            server: config.name.clone(),
        })
    }

    async fn dial_with_retry(
        config: &ServerConfig,
        handler: CatalogEventHandler,
    ) -> StrataResult<RunningClient> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(Some(config.connect_timeout()))
            .build();

        backoff::future::retry(backoff, || {
            let handler = handler.clone();
            async move {
                match Self::dial(config, handler).await {
                    Ok(client) => Ok(client),
                    Err(e) if e.is_transient() => {
                        warn!("Failed to connect to '{}', retrying: {}", config.name, e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => {
                        error!(
                            "Permanent error connecting to '{}': {} - not retrying",
                            config.name, e
                        );
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        })
        .await
    }

    async fn dial(config: &ServerConfig, handler: CatalogEventHandler) -> StrataResult<RunningClient> {
        info!(
            "Connecting to server '{}' via {:?}",
            config.name, config.transport
        );

        match &config.transport {
            ServerTransport::Stdio {
                command,
                args,
                envs,
            } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(envs.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| StrataError::Transport(format!("create stdio transport: {}", e)))?;

                handler.serve(transport).await.map_err(|e| {
                    StrataError::ConnectionFailed(format!("initialize stdio client: {}", e))
                })
            }

            ServerTransport::Sse { url, token } => {
                let http_client = build_http_client(token.as_deref())?;
                let cfg = SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                };
                let transport = SseClientTransport::start_with_client(http_client, cfg)
                    .await
                    .map_err(|e| StrataError::Transport(format!("create SSE transport: {}", e)))?;

                handler.serve(transport).await.map_err(|e| {
                    StrataError::ConnectionFailed(format!("initialize SSE client: {}", e))
                })
            }

            ServerTransport::Streamable { url, token } => {
                let http_client = build_http_client(token.as_deref())?;
                let cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                let transport = StreamableHttpClientTransport::with_client(http_client, cfg);

                handler.serve(transport).await.map_err(|e| {
                    StrataError::ConnectionFailed(format!("initialize streamable client: {}", e))
                })
            }
        }
    }

    fn running(&self) -> StrataResult<Arc<RunningClient>> {
        self.inner
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| StrataError::ServerUnavailable(self.server.clone()))
    }
}

fn build_http_client(token: Option<&str>) -> StrataResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

    if let Some(token) = token {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", token)
                .parse()
                .map_err(|e| StrataError::Transport(format!("auth token: {}", e)))?,
        );
        builder = builder.default_headers(headers);
    }

    builder
        .build()
        .map_err(|e| StrataError::Transport(format!("build HTTP client: {}", e)))
}

#[async_trait]
impl ToolServerClient for RmcpToolClient {
    async fn list_tools(&self) -> StrataResult<Vec<Tool>> {
        let client = self.running()?;
        client
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| StrataError::Transport(format!("list tools: {}", e)))
    }

    async fn call_tool(
        &self,
        action: &str,
        args: Option<Map<String, Value>>,
    ) -> StrataResult<CallToolResult> {
        let client = self.running()?;
        let request = CallToolRequestParam {
            name: std::borrow::Cow::Owned(action.to_string()),
            arguments: args,
        };
        client
            .call_tool(request)
            .await
            .map_err(|e| StrataError::Transport(format!("call tool: {}", e)))
    }

    async fn shutdown(&self) -> StrataResult<()> {
        let taken = self.inner.lock().take();
        if let Some(client) = taken {
            match Arc::try_unwrap(client) {
                Ok(client) => {
                    client
                        .cancel()
                        .await
                        .map_err(|e| StrataError::Transport(format!("disconnect: {}", e)))?;
                }
                Err(_) => {
                    warn!(
                        "Client for '{}' still has active references on shutdown",
                        self.server
                    );
                }
            }
        }
        Ok(())
    }
}

/// Dialing seam used by the manager. The production connector establishes
/// rmcp transports; tests substitute fakes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &ServerConfig,
        refresh_tx: Option<mpsc::Sender<String>>,
    ) -> StrataResult<Arc<dyn ToolServerClient>>;
}

#[derive(Default)]
pub struct RmcpConnector;

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(
        &self,
        config: &ServerConfig,
        refresh_tx: Option<mpsc::Sender<String>>,
    ) -> StrataResult<Arc<dyn ToolServerClient>> {
        let handler = CatalogEventHandler::new(config.name.clone(), refresh_tx);
        let client = RmcpToolClient::connect(config, handler).await?;
        Ok(Arc::new(client))
    }
}

/// Retry bookkeeping for `Failed -> Connecting` transitions.
#[derive(Debug, Default)]
pub(crate) struct RetryState {
    pub attempts: u32,
    pub next_allowed: Option<Instant>,
}

/// One connection per configured server. State mutation is serialized through
/// `op_lock`; catalog reads go through the atomic snapshot without locking.
pub struct ServerConnection {
    config: ServerConfig,
    state: parking_lot::Mutex<ConnectionState>,
    client: parking_lot::RwLock<Option<Arc<dyn ToolServerClient>>>,
    catalog: ArcSwap<CatalogSnapshot>,
    retry: parking_lot::Mutex<RetryState>,
    /// Serializes connect/refresh for this server only; requests touching
    /// other servers never contend on it.
    pub(crate) op_lock: tokio::sync::Mutex<()>,
}

impl ServerConnection {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: parking_lot::Mutex::new(ConnectionState::Disconnected),
            client: parking_lot::RwLock::new(None),
            catalog: ArcSwap::from_pointee(CatalogSnapshot::empty()),
            retry: parking_lot::Mutex::new(RetryState::default()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn last_error(&self) -> Option<String> {
        match self.state() {
            ConnectionState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn client(&self) -> Option<Arc<dyn ToolServerClient>> {
        self.client.read().clone()
    }

    pub fn attach_client(&self, client: Arc<dyn ToolServerClient>) {
        *self.client.write() = Some(client);
        self.set_state(ConnectionState::Connected);
        *self.retry.lock() = RetryState::default();
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        *self.client.write() = None;
        self.set_state(ConnectionState::Failed(reason.into()));
    }

    /// Current catalog snapshot. Lock-free.
    pub fn catalog(&self) -> Arc<CatalogSnapshot> {
        self.catalog.load_full()
    }

    /// Atomically replace the catalog; readers see either the old or the new
    /// snapshot, never a mix.
    pub fn store_catalog(&self, tools: Vec<ToolDescriptor>) {
        self.catalog.store(Arc::new(CatalogSnapshot::new(tools)));
    }

    pub(crate) fn retry_state(&self) -> &parking_lot::Mutex<RetryState> {
        &self.retry
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn connection() -> ServerConnection {
        ServerConnection::new(ServerConfig::new(
            "github",
            ServerTransport::Stdio {
                command: "uvx".to_string(),
                args: vec![],
                envs: HashMap::new(),
            },
        ))
    }

    #[test]
    fn starts_disconnected_with_empty_catalog() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.client().is_none());
        assert!(conn.catalog().tools.is_empty());
        assert!(conn.catalog().is_stale(Duration::from_secs(300)));
    }

    #[test]
    fn mark_failed_records_reason_and_drops_client() {
        let conn = connection();
        conn.mark_failed("process exited");
        assert_eq!(
            conn.state(),
            ConnectionState::Failed("process exited".to_string())
        );
        assert_eq!(conn.last_error().as_deref(), Some("process exited"));
        assert!(conn.client().is_none());
    }

    #[tokio::test]
    async fn catalog_swap_is_wholesale() {
        let conn = connection();
        conn.store_catalog(vec![ToolDescriptor::new(
            "github",
            "create_issue",
            "Open an issue",
            json!({"type": "object"}),
        )]);

        let before = conn.catalog();
        conn.store_catalog(vec![
            ToolDescriptor::new("github", "create_pr", "Open a PR", json!({"type": "object"})),
            ToolDescriptor::new("github", "merge_pr", "Merge a PR", json!({"type": "object"})),
        ]);

        // The old snapshot is unaffected by the swap.
        assert_eq!(before.tools.len(), 1);
        assert_eq!(conn.catalog().tools.len(), 2);
        assert!(!conn.catalog().is_stale(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn fresh_snapshot_goes_stale_after_ttl() {
        tokio::time::pause();
        let snapshot = CatalogSnapshot::new(vec![]);
        assert!(!snapshot.is_stale(Duration::from_secs(10)));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(snapshot.is_stale(Duration::from_secs(10)));
    }
}
