//! Connection manager for downstream tool servers.
//!
//! Owns one [`ServerConnection`] per configured server, establishes
//! connections concurrently at startup, keeps per-server catalog snapshots
//! fresh within a TTL, and routes tool calls with cancellation support.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    config::ServerRegistry,
    connection::{ConnectionState, Connector, RmcpConnector, ServerConnection},
    metrics::GatewayMetrics,
    reconnect::{ReconnectPolicy, RetryDecision},
};
use crate::{
    catalog::ToolDescriptor,
    error::{StrataError, StrataResult},
};

const REFRESH_QUEUE_DEPTH: usize = 32;

/// Per-request execution context threaded through tool calls.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: String,
    pub cancellation: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancellation: CancellationToken::new(),
        }
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate connection statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    pub total_servers: usize,
    pub connected_servers: usize,
    pub failed_servers: usize,
    pub total_tools: usize,
}

/// Manages the lifecycle of all downstream server connections.
pub struct ClientManager {
    connections: DashMap<String, Arc<ServerConnection>>,
    /// Registry order, used whenever "all servers" are enumerated.
    order: Vec<String>,
    registry: ServerRegistry,
    connector: Arc<dyn Connector>,
    reconnect_policy: ReconnectPolicy,
    metrics: Arc<GatewayMetrics>,
    refresh_tx: mpsc::Sender<String>,
    shutdown_token: CancellationToken,
}

impl ClientManager {
    pub fn new(registry: ServerRegistry) -> StrataResult<Arc<Self>> {
        Self::with_connector(registry, Arc::new(RmcpConnector))
    }

    /// Build a manager with a custom dialing seam. Used by tests.
    pub fn with_connector(
        registry: ServerRegistry,
        connector: Arc<dyn Connector>,
    ) -> StrataResult<Arc<Self>> {
        registry.validate()?;

        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE_DEPTH);
        let connections = DashMap::new();
        let mut order = Vec::new();

        for config in &registry.servers {
            if !config.enabled {
                debug!("Server '{}' is disabled, skipping", config.name);
                continue;
            }
            order.push(config.name.clone());
            connections.insert(
                config.name.clone(),
                Arc::new(ServerConnection::new(config.clone())),
            );
        }

        let manager = Arc::new(Self {
            connections,
            order,
            registry,
            connector,
            reconnect_policy: ReconnectPolicy::default(),
            metrics: Arc::new(GatewayMetrics::new()),
            refresh_tx,
            shutdown_token: CancellationToken::new(),
        });
        manager.spawn_refresh_worker(refresh_rx);
        Ok(manager)
    }

    /// Drains catalog refresh requests queued by downstream
    /// `tools/list_changed` notifications.
    fn spawn_refresh_worker(self: &Arc<Self>, mut rx: mpsc::Receiver<String>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.shutdown_token.cancelled() => break,
                    request = rx.recv() => {
                        let Some(server) = request else { break };
                        if let Err(e) = manager.refresh_catalog(&server).await {
                            warn!("Background catalog refresh for '{}' failed: {}", server, e);
                        }
                    }
                }
            }
        });
    }

    /// Connect to every enabled server concurrently. A failing server never
    /// aborts the others; under the default policy this errors only when no
    /// server at all comes up.
    pub async fn initialize(&self) -> StrataResult<ManagerStats> {
        let connect_futures: Vec<_> = self
            .order
            .iter()
            .filter_map(|name| self.connections.get(name).map(|c| Arc::clone(&c)))
            .map(|conn| async move {
                match self.connect_server(&conn).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Failed to connect to '{}': {}", conn.name(), e);
                        false
                    }
                }
            })
            .collect();

        let results = futures::future::join_all(connect_futures).await;
        let connected = results.iter().filter(|ok| **ok).count();

        info!(
            "Connected to {}/{} tool servers",
            connected,
            self.order.len()
        );

        if connected == 0 && !self.order.is_empty() && self.registry.connect.require_any {
            return Err(StrataError::ConnectionFailed(
                "no tool servers could be reached".to_string(),
            ));
        }
        Ok(self.stats())
    }

    /// Dial one server. The dial is bounded by the server's connect timeout,
    /// so a wedged transport cannot stall callers indefinitely.
    async fn connect_server(&self, conn: &Arc<ServerConnection>) -> StrataResult<()> {
        let _guard = conn.op_lock.lock().await;
        if conn.state().is_connected() {
            return Ok(());
        }
        conn.set_state(ConnectionState::Connecting);

        let timeout = conn.config().connect_timeout();
        let dialed = match tokio::time::timeout(
            timeout,
            self.connector.connect(conn.config(), Some(self.refresh_tx.clone())),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(StrataError::ConnectionFailed(format!(
                "connection to '{}' timed out after {:?}",
                conn.name(),
                timeout
            ))),
        };

        match dialed {
            Ok(client) => {
                conn.attach_client(client);
                self.metrics.record_connection_opened();
                info!("Connected to server '{}'", conn.name());
                // Prime the catalog; a listing failure degrades the catalog,
                // not the connection.
                if let Err(e) = self.fetch_catalog(conn).await {
                    warn!("Initial catalog fetch for '{}' failed: {}", conn.name(), e);
                }
                Ok(())
            }
            Err(e) => {
                conn.mark_failed(e.to_string());
                self.metrics.record_connection_error();
                Err(e)
            }
        }
    }

    /// Fetch the tool list and swap the snapshot. Caller holds `op_lock`.
    async fn fetch_catalog(&self, conn: &Arc<ServerConnection>) -> StrataResult<Vec<ToolDescriptor>> {
        let client = conn
            .client()
            .ok_or_else(|| self.unavailable(conn))?;

        let timeout = self.registry.catalog.list_timeout();
        let tools = match tokio::time::timeout(timeout, client.list_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                conn.mark_failed(e.to_string());
                self.metrics.record_connection_error();
                return Err(e);
            }
            Err(_) => {
                return Err(StrataError::Transport(format!(
                    "listing tools on '{}' timed out after {:?}",
                    conn.name(),
                    timeout
                )));
            }
        };

        let descriptors: Vec<ToolDescriptor> = tools
            .iter()
            .map(|tool| ToolDescriptor::from_tool(conn.name(), tool))
            .collect();
        debug!(
            "Catalog for '{}' now has {} tools",
            conn.name(),
            descriptors.len()
        );
        conn.store_catalog(descriptors.clone());
        Ok(descriptors)
    }

    /// Current tools for one server. Serves the cached snapshot while it is
    /// within TTL; on a refresh failure, a previously fetched snapshot is
    /// served stale rather than erroring.
    pub async fn list_tools(&self, server: &str) -> StrataResult<Vec<ToolDescriptor>> {
        let conn = self.connection(server)?;
        let ttl = self.registry.catalog.ttl();

        let snapshot = conn.catalog();
        if !snapshot.is_stale(ttl) {
            return Ok(snapshot.tools.clone());
        }

        self.ensure_connected(&conn).await?;

        let _guard = conn.op_lock.lock().await;
        // Another task may have refreshed while we waited.
        let snapshot = conn.catalog();
        if !snapshot.is_stale(ttl) {
            return Ok(snapshot.tools.clone());
        }

        match self.fetch_catalog(&conn).await {
            Ok(tools) => Ok(tools),
            Err(e) if snapshot.fetched_at.is_some() => {
                warn!(
                    "Serving stale catalog for '{}' after refresh failure: {}",
                    server, e
                );
                Ok(snapshot.tools.clone())
            }
            Err(e) => Err(e),
        }
    }

    /// Force a catalog refetch regardless of TTL.
    pub async fn refresh_catalog(&self, server: &str) -> StrataResult<Vec<ToolDescriptor>> {
        let conn = self.connection(server)?;
        self.ensure_connected(&conn).await?;
        self.metrics.record_catalog_refresh();

        let _guard = conn.op_lock.lock().await;
        self.fetch_catalog(&conn).await
    }

    /// Invoke a downstream tool, racing the context's cancellation token.
    pub async fn call_tool(
        &self,
        server: &str,
        action: &str,
        args: Option<serde_json::Map<String, serde_json::Value>>,
        ctx: &CallContext,
    ) -> StrataResult<rmcp::model::CallToolResult> {
        let conn = self.connection(server)?;
        let client = conn.client().ok_or_else(|| self.unavailable(&conn))?;

        let result = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => {
                return Err(StrataError::Cancelled(ctx.request_id.clone()));
            }
            result = client.call_tool(action, args) => result,
        };

        match result {
            Ok(result) => Ok(result),
            Err(e) => {
                if matches!(e, StrataError::Transport(_)) {
                    conn.mark_failed(e.to_string());
                    self.metrics.record_connection_error();
                }
                Err(StrataError::Downstream {
                    server: server.to_string(),
                    action: action.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Retry a failed connection if the backoff gate allows it. Disconnected
    /// servers connect immediately; connected servers are a no-op.
    async fn ensure_connected(&self, conn: &Arc<ServerConnection>) -> StrataResult<()> {
        match conn.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Connecting => {
                // Another task is mid-connect; wait for it and take its outcome.
                let _guard = conn.op_lock.lock().await;
                if conn.state().is_connected() {
                    Ok(())
                } else {
                    Err(self.unavailable(conn))
                }
            }
            ConnectionState::Disconnected => self.connect_server(conn).await,
            ConnectionState::Failed(reason) => {
                let decision = self.reconnect_policy.check(&mut conn.retry_state().lock());
                match decision {
                    RetryDecision::Proceed => self.connect_server(conn).await,
                    RetryDecision::Backoff(wait) => Err(StrataError::ServerUnavailable(format!(
                        "{}: {} (retry in {:?})",
                        conn.name(),
                        reason,
                        wait
                    ))),
                    RetryDecision::Exhausted => Err(StrataError::ServerUnavailable(format!(
                        "{}: {} (retries exhausted)",
                        conn.name(),
                        reason
                    ))),
                }
            }
        }
    }

    fn unavailable(&self, conn: &Arc<ServerConnection>) -> StrataError {
        match conn.last_error() {
            Some(reason) => {
                StrataError::ServerUnavailable(format!("{}: {}", conn.name(), reason))
            }
            None => StrataError::ServerUnavailable(conn.name().to_string()),
        }
    }

    pub fn connection(&self, server: &str) -> StrataResult<Arc<ServerConnection>> {
        self.connections
            .get(server)
            .map(|c| Arc::clone(&c))
            .ok_or_else(|| StrataError::ServerNotFound(server.to_string()))
    }

    /// Enabled server names in registry order.
    pub fn server_names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Every cached tool across all servers, in registry order.
    pub fn cached_tools(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.connections.get(name))
            .flat_map(|conn| conn.catalog().tools.clone())
            .collect()
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn stats(&self) -> ManagerStats {
        let mut connected = 0;
        let mut failed = 0;
        let mut tools = 0;
        for name in &self.order {
            if let Some(conn) = self.connections.get(name) {
                match conn.state() {
                    ConnectionState::Connected => connected += 1,
                    ConnectionState::Failed(_) => failed += 1,
                    _ => {}
                }
                tools += conn.catalog().tools.len();
            }
        }
        ManagerStats {
            total_servers: self.order.len(),
            connected_servers: connected,
            failed_servers: failed,
            total_tools: tools,
        }
    }

    /// Disconnect every server and stop background work.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        for name in &self.order {
            let Some(conn) = self.connections.get(name).map(|c| Arc::clone(&c)) else {
                continue;
            };
            let _guard = conn.op_lock.lock().await;
            if let Some(client) = conn.client() {
                if let Err(e) = client.shutdown().await {
                    warn!("Error disconnecting from '{}': {}", name, e);
                }
                self.metrics.record_connection_closed();
            }
            conn.mark_failed("shut down");
            conn.set_state(ConnectionState::Disconnected);
        }
        info!("All tool server connections closed");
    }
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("servers", &self.order)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        borrow::Cow,
        collections::{HashMap, HashSet},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use rmcp::model::{CallToolResult, Content, Tool};
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::core::{
        config::{CatalogConfig, ServerConfig, ServerTransport},
        connection::ToolServerClient,
    };

    pub(crate) fn tool(name: &str, description: &str) -> Tool {
        let schema = match json!({
            "type": "object",
            "properties": {"query": {"type": "string"}}
        }) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Tool {
            name: Cow::Owned(name.to_string()),
            title: None,
            description: Some(Cow::Owned(description.to_string())),
            input_schema: Arc::new(schema),
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }

    pub(crate) fn stdio_config(name: &str) -> ServerConfig {
        ServerConfig::new(
            name,
            ServerTransport::Stdio {
                command: "test-server".to_string(),
                args: vec![],
                envs: HashMap::new(),
            },
        )
    }

    pub(crate) struct FakeClient {
        pub tools: Vec<Tool>,
        pub list_calls: AtomicUsize,
        pub fail_list: AtomicBool,
        pub fail_call: AtomicBool,
        pub hang_call: AtomicBool,
        pub reply: Value,
    }

    impl FakeClient {
        pub fn with_tools(tools: Vec<Tool>) -> Self {
            Self {
                tools,
                list_calls: AtomicUsize::new(0),
                fail_list: AtomicBool::new(false),
                fail_call: AtomicBool::new(false),
                hang_call: AtomicBool::new(false),
                reply: json!({"ok": true}),
            }
        }
    }

    #[async_trait]
    impl ToolServerClient for FakeClient {
        async fn list_tools(&self) -> StrataResult<Vec<Tool>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(StrataError::Transport("connection reset".to_string()));
            }
            Ok(self.tools.clone())
        }

        async fn call_tool(
            &self,
            _action: &str,
            _args: Option<Map<String, Value>>,
        ) -> StrataResult<CallToolResult> {
            if self.hang_call.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_call.load(Ordering::SeqCst) {
                return Err(StrataError::Transport("broken pipe".to_string()));
            }
            Ok(CallToolResult::success(vec![Content::text(
                self.reply.to_string(),
            )]))
        }

        async fn shutdown(&self) -> StrataResult<()> {
            Ok(())
        }
    }

    pub(crate) struct FakeConnector {
        pub clients: HashMap<String, Arc<FakeClient>>,
        pub refuse: parking_lot::Mutex<HashSet<String>>,
        pub delays: parking_lot::Mutex<HashMap<String, Duration>>,
        pub dials: AtomicUsize,
    }

    impl FakeConnector {
        pub fn new(clients: HashMap<String, Arc<FakeClient>>) -> Self {
            Self {
                clients,
                refuse: parking_lot::Mutex::new(HashSet::new()),
                delays: parking_lot::Mutex::new(HashMap::new()),
                dials: AtomicUsize::new(0),
            }
        }

        pub fn refuse(&self, server: &str) {
            self.refuse.lock().insert(server.to_string());
        }

        pub fn allow(&self, server: &str) {
            self.refuse.lock().remove(server);
        }

        pub fn delay_dial(&self, server: &str, delay: Duration) {
            self.delays.lock().insert(server.to_string(), delay);
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            config: &ServerConfig,
            _refresh_tx: Option<mpsc::Sender<String>>,
        ) -> StrataResult<Arc<dyn ToolServerClient>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let delay = self.delays.lock().get(&config.name).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.refuse.lock().contains(&config.name) {
                return Err(StrataError::ConnectionFailed(format!(
                    "connection refused: {}",
                    config.name
                )));
            }
            match self.clients.get(&config.name) {
                Some(client) => Ok(Arc::clone(client) as Arc<dyn ToolServerClient>),
                None => Err(StrataError::ConnectionFailed(format!(
                    "no route to {}",
                    config.name
                ))),
            }
        }
    }

    pub(crate) fn manager_with(
        servers: Vec<ServerConfig>,
        connector: FakeConnector,
    ) -> Arc<ClientManager> {
        let registry = ServerRegistry::new(servers);
        ClientManager::with_connector(registry, Arc::new(connector))
            .unwrap()
    }

    #[tokio::test]
    async fn initialize_tolerates_partial_failure() {
        let notion = Arc::new(FakeClient::with_tools(vec![tool("search", "Search pages")]));
        let connector = FakeConnector::new(HashMap::from([("notion".to_string(), notion)]));
        connector.refuse("github");

        let manager = manager_with(
            vec![stdio_config("github"), stdio_config("notion")],
            connector,
        );

        let stats = manager.initialize().await.unwrap();
        assert_eq!(stats.connected_servers, 1);
        assert_eq!(stats.failed_servers, 1);
        assert_eq!(stats.total_tools, 1);

        let tools = manager.list_tools("notion").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[0].server, "notion");

        let err = manager.list_tools("github").await.unwrap_err();
        assert!(matches!(err, StrataError::ServerUnavailable(_)));
    }

    #[tokio::test]
    async fn initialize_fails_when_nothing_connects() {
        let connector = FakeConnector::new(HashMap::new());
        connector.refuse("github");

        let manager = manager_with(vec![stdio_config("github")], connector);
        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, StrataError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn list_tools_serves_cached_snapshot_within_ttl() {
        let notion = Arc::new(FakeClient::with_tools(vec![tool("search", "Search pages")]));
        let connector =
            FakeConnector::new(HashMap::from([("notion".to_string(), Arc::clone(&notion))]));
        let manager = manager_with(vec![stdio_config("notion")], connector);
        manager.initialize().await.unwrap();

        manager.list_tools("notion").await.unwrap();
        manager.list_tools("notion").await.unwrap();

        // One fetch at connect time, none for the cached reads.
        assert_eq!(notion.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_catalog_bypasses_ttl() {
        let notion = Arc::new(FakeClient::with_tools(vec![tool("search", "Search pages")]));
        let connector =
            FakeConnector::new(HashMap::from([("notion".to_string(), Arc::clone(&notion))]));
        let manager = manager_with(vec![stdio_config("notion")], connector);
        manager.initialize().await.unwrap();

        manager.refresh_catalog("notion").await.unwrap();
        assert_eq!(notion.list_calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.metrics().snapshot().catalog_refreshes, 1);
    }

    #[tokio::test]
    async fn stale_snapshot_is_served_when_refresh_fails() {
        tokio::time::pause();
        let notion = Arc::new(FakeClient::with_tools(vec![tool("search", "Search pages")]));
        let connector =
            FakeConnector::new(HashMap::from([("notion".to_string(), Arc::clone(&notion))]));

        let mut registry = ServerRegistry::new(vec![stdio_config("notion")]);
        registry.catalog = CatalogConfig {
            ttl_secs: 1,
            list_timeout_secs: 5,
        };
        let manager = ClientManager::with_connector(registry, Arc::new(connector)).unwrap();
        manager.initialize().await.unwrap();

        notion.fail_list.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(2)).await;

        let tools = manager.list_tools("notion").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
    }

    #[tokio::test]
    async fn cancellation_detaches_the_call_but_keeps_the_connection() {
        let notion = Arc::new(FakeClient {
            hang_call: AtomicBool::new(true),
            ..FakeClient::with_tools(vec![])
        });
        let connector =
            FakeConnector::new(HashMap::from([("notion".to_string(), Arc::clone(&notion))]));
        let manager = manager_with(vec![stdio_config("notion")], connector);
        manager.initialize().await.unwrap();

        let ctx = CallContext::new();
        ctx.cancellation.cancel();

        let err = manager
            .call_tool("notion", "search", None, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Cancelled(_)));

        // The connection survives and serves the next request.
        let conn = manager.connection("notion").unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        notion.hang_call.store(false, Ordering::SeqCst);
        manager
            .call_tool("notion", "search", None, &CallContext::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transport_error_marks_connection_failed() {
        let notion = Arc::new(FakeClient::with_tools(vec![]));
        notion.fail_call.store(true, Ordering::SeqCst);
        let connector =
            FakeConnector::new(HashMap::from([("notion".to_string(), notion)]));
        let manager = manager_with(vec![stdio_config("notion")], connector);
        manager.initialize().await.unwrap();

        let ctx = CallContext::new();
        let err = manager
            .call_tool("notion", "search", None, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Downstream { .. }));

        let conn = manager.connection("notion").unwrap();
        assert!(matches!(conn.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn redial_is_bounded_by_the_connect_timeout() {
        tokio::time::pause();
        let notion = Arc::new(FakeClient::with_tools(vec![tool("search", "Search pages")]));
        let connector = Arc::new(FakeConnector::new(HashMap::from([(
            "notion".to_string(),
            Arc::clone(&notion),
        )])));
        connector.refuse("notion");

        let mut registry = ServerRegistry::new(vec![stdio_config("notion")]);
        registry.connect.require_any = false;
        let manager = ClientManager::with_connector(
            registry,
            Arc::clone(&connector) as Arc<dyn Connector>,
        )
        .unwrap();
        manager.initialize().await.unwrap();
        assert_eq!(manager.stats().failed_servers, 1);

        // The server answers the redial but wedges mid-handshake.
        connector.allow("notion");
        connector.delay_dial("notion", Duration::from_secs(3600));

        let err = manager.list_tools("notion").await.unwrap_err();
        assert!(matches!(err, StrataError::ConnectionFailed(_)));
        assert!(matches!(
            manager.connection("notion").unwrap().state(),
            ConnectionState::Failed(_)
        ));
    }

    #[tokio::test]
    async fn request_racing_a_slow_connect_waits_for_it() {
        tokio::time::pause();
        let notion = Arc::new(FakeClient::with_tools(vec![tool("search", "Search pages")]));
        let connector = Arc::new(FakeConnector::new(HashMap::from([(
            "notion".to_string(),
            Arc::clone(&notion),
        )])));
        connector.delay_dial("notion", Duration::from_secs(5));

        let registry = ServerRegistry::new(vec![stdio_config("notion")]);
        let manager = ClientManager::with_connector(
            registry,
            Arc::clone(&connector) as Arc<dyn Connector>,
        )
        .unwrap();

        let background = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.initialize().await })
        };
        while manager.connection("notion").unwrap().state() != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }

        // Rather than a spurious unavailable error, the racing request rides
        // out the in-flight connect.
        let tools = manager.list_tools("notion").await.unwrap();
        assert_eq!(tools.len(), 1);
        background.await.unwrap().unwrap();
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let manager = manager_with(vec![], FakeConnector::new(HashMap::new()));
        let err = manager.list_tools("nope").await.unwrap_err();
        assert!(matches!(err, StrataError::ServerNotFound(_)));
    }

    #[tokio::test]
    async fn failed_server_reconnects_through_the_backoff_gate() {
        tokio::time::pause();
        let notion = Arc::new(FakeClient::with_tools(vec![tool("search", "Search pages")]));
        let connector = Arc::new(FakeConnector::new(HashMap::from([(
            "notion".to_string(),
            Arc::clone(&notion),
        )])));
        connector.refuse("notion");

        let mut registry = ServerRegistry::new(vec![stdio_config("notion")]);
        registry.connect.require_any = false;
        let manager = ClientManager::with_connector(
            registry,
            Arc::clone(&connector) as Arc<dyn Connector>,
        )
        .unwrap();
        manager.initialize().await.unwrap();
        assert_eq!(manager.stats().failed_servers, 1);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);

        // Server comes back. The first gated retry proceeds immediately and
        // succeeds.
        connector.allow("notion");
        let tools = manager.list_tools("notion").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().connected_servers, 1);

        // A second failure is gated: the next attempt is held behind backoff.
        connector.refuse("notion");
        manager.connection("notion").unwrap().mark_failed("broken pipe");

        let err = manager.refresh_catalog("notion").await.unwrap_err();
        assert!(matches!(err, StrataError::ConnectionFailed(_)));
        let err = manager.refresh_catalog("notion").await.unwrap_err();
        assert!(matches!(err, StrataError::ServerUnavailable(_)));
    }
}
