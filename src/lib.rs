//! Strata: an aggregating gateway over many downstream tool servers.
//!
//! Instead of surfacing every downstream action's schema at once, the
//! gateway exposes five fixed meta-tools that let a client progressively
//! discover, inspect, and invoke the right action.
//!
//! ## Modules
//!
//! - [`core`]: connection lifecycle (manager, config, per-server state)
//! - [`catalog`]: tool descriptors and the ranked search index
//! - [`executor`]: parameter merging and the action call pipeline
//! - [`auth`]: credential-recovery negotiation
//! - [`server`]: the outward meta-tool surface

pub mod auth;
pub mod catalog;
pub mod core;
pub mod error;
pub mod executor;
pub mod server;

pub use auth::{AuthFailureHandler, AuthNegotiation, CredentialStore, MemoryCredentialStore};
pub use catalog::{CatalogIndex, QualifiedActionName, SearchHit, ToolDescriptor};
pub use core::{
    AuthRequirement, CallContext, CatalogConfig, ClientManager, ConnectPolicy, ConnectionState,
    Connector, GatewayMetrics, LatencySummary, ManagerStats, MetricsSnapshot, ReconnectPolicy,
    ServerConfig, ServerConnection, ServerRegistry, ServerTransport, ToolServerClient,
};
pub use error::{StrataError, StrataResult};
pub use executor::{ActionExecutor, ActionRequest};
pub use server::MetaToolServer;
