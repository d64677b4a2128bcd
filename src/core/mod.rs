//! Connection management, configuration, and downstream client plumbing.

pub mod config;
pub mod connection;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod reconnect;

pub use config::{AuthRequirement, CatalogConfig, ConnectPolicy, ServerConfig, ServerRegistry, ServerTransport};
pub use connection::{ConnectionState, Connector, RmcpConnector, ServerConnection, ToolServerClient};
pub use handler::CatalogEventHandler;
pub use manager::{CallContext, ClientManager, ManagerStats};
pub use metrics::{GatewayMetrics, LatencySummary, MetricsSnapshot};
pub use reconnect::ReconnectPolicy;
