//! Server registry and configuration types.
//!
//! Defines the static list of configured downstream servers, their launch
//! specs (transports), and the policies governing connection establishment
//! and catalog freshness. The registry is loaded once and treated as
//! immutable until explicit reconfiguration.

use std::{collections::HashMap, fmt, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};

/// One configured downstream tool server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Unique key identifying the server across the whole aggregator.
    pub name: String,

    #[serde(flatten)]
    pub transport: ServerTransport,

    /// Disabled servers stay registered but are never dialed.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Credential material this server needs; consulted by the auth-failure
    /// protocol without any network call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthRequirement>,

    /// Per-server connect timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, transport: ServerTransport) -> Self {
        Self {
            name: name.into(),
            transport,
            enabled: true,
            auth: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Launch spec for a downstream server.
#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ServerTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    Sse {
        url: String,
        /// Bearer token for the Authorization header.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Streamable {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

impl ServerTransport {
    /// Remote transports get dial retries with backoff; stdio does not.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            ServerTransport::Sse { .. } | ServerTransport::Streamable { .. }
        )
    }
}

impl fmt::Debug for ServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerTransport::Stdio { command, args, .. } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .finish(),
            ServerTransport::Sse { url, token } => f
                .debug_struct("Sse")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .finish(),
            ServerTransport::Streamable { url, token } => f
                .debug_struct("Streamable")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .finish(),
        }
    }
}

/// Credential material a server needs for authentication recovery.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthRequirement {
    /// Human-readable setup instructions surfaced to the caller.
    #[serde(default)]
    pub instructions: Option<String>,

    /// Field names the caller must supply via `save_auth_data`.
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
}

impl Default for AuthRequirement {
    fn default() -> Self {
        Self {
            instructions: None,
            required_fields: default_required_fields(),
        }
    }
}

/// The static list of configured downstream servers. Pure data.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerRegistry {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Connection establishment policy.
    #[serde(default)]
    pub connect: ConnectPolicy,

    /// Catalog cache freshness settings.
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl ServerRegistry {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self {
            servers,
            connect: ConnectPolicy::default(),
            catalog: CatalogConfig::default(),
        }
    }

    /// Server names must be unique (a connection is keyed by name) and
    /// remote endpoints must be well-formed URLs.
    pub fn validate(&self) -> StrataResult<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(StrataError::Config("server name must not be empty".into()));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(StrataError::Config(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
            match &server.transport {
                ServerTransport::Sse { url, .. } | ServerTransport::Streamable { url, .. } => {
                    url::Url::parse(url).map_err(|e| {
                        StrataError::Config(format!(
                            "invalid URL for server '{}': {}",
                            server.name, e
                        ))
                    })?;
                }
                ServerTransport::Stdio { command, .. } => {
                    if command.is_empty() {
                        return Err(StrataError::Config(format!(
                            "server '{}' has an empty command",
                            server.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Registry order of all server names, connected or not.
    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    pub fn add_server(&mut self, config: ServerConfig) -> StrataResult<()> {
        if self.get(&config.name).is_some() {
            return Err(StrataError::Config(format!(
                "duplicate server name '{}'",
                config.name
            )));
        }
        self.servers.push(config);
        Ok(())
    }

    /// Load a registry from a YAML file and validate it.
    pub async fn load(path: impl AsRef<Path>) -> StrataResult<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let registry: ServerRegistry = serde_yaml::from_str(&raw)
            .map_err(|e| StrataError::Config(format!("parse registry: {}", e)))?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> StrataResult<()> {
        let raw = serde_yaml::to_string(self)
            .map_err(|e| StrataError::Config(format!("serialize registry: {}", e)))?;
        tokio::fs::write(path.as_ref(), raw).await?;
        Ok(())
    }
}

/// Policy for `ClientManager::initialize`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectPolicy {
    /// Fail initialization only when zero enabled servers connect.
    #[serde(default = "default_true")]
    pub require_any: bool,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self { require_any: true }
    }
}

/// Catalog cache freshness configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// How long a fetched catalog is considered fresh (seconds).
    #[serde(default = "default_catalog_ttl")]
    pub ttl_secs: u64,

    /// Per-server timeout for catalog fetches during discovery fan-out (seconds).
    #[serde(default = "default_list_timeout")]
    pub list_timeout_secs: u64,
}

impl CatalogConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_catalog_ttl(),
            list_timeout_secs: default_list_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_catalog_ttl() -> u64 {
    300
}

fn default_list_timeout() -> u64 {
    15
}

fn default_required_fields() -> Vec<String> {
    vec!["api_key".to_string()]
}
