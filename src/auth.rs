//! Auth failure negotiation.
//!
//! Stateless two-step flow: `get_auth_url` tells the caller what credentials
//! a server needs, `save_auth_data` records them. Neither intention touches
//! the downstream server, and unknown servers get the default requirement so
//! guidance is always available.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    core::{AuthRequirement, ServerRegistry},
    error::{StrataError, StrataResult},
};

/// Where saved credentials go. The in-memory store is the default; anything
/// durable implements the same trait.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save(&self, server: &str, data: Value) -> StrataResult<()>;
    async fn read(&self, server: &str) -> StrataResult<Option<Value>>;
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: DashMap<String, Value>,
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn save(&self, server: &str, data: Value) -> StrataResult<()> {
        self.entries.insert(server.to_string(), data);
        Ok(())
    }

    async fn read(&self, server: &str) -> StrataResult<Option<Value>> {
        Ok(self.entries.get(server).map(|v| v.clone()))
    }
}

/// Raw `handle_auth_failure` arguments before validation.
#[derive(Debug, Default, Clone)]
pub struct AuthNegotiation {
    pub server: Option<String>,
    pub intention: Option<String>,
    pub auth_data: Option<Value>,
}

pub struct AuthFailureHandler {
    requirements: HashMap<String, AuthRequirement>,
    store: Arc<dyn CredentialStore>,
}

impl AuthFailureHandler {
    pub fn new(registry: &ServerRegistry) -> Self {
        Self::with_store(registry, Arc::new(MemoryCredentialStore::default()))
    }

    pub fn with_store(registry: &ServerRegistry, store: Arc<dyn CredentialStore>) -> Self {
        let requirements = registry
            .servers
            .iter()
            .filter_map(|s| s.auth.clone().map(|auth| (s.name.clone(), auth)))
            .collect();
        Self {
            requirements,
            store,
        }
    }

    /// Dispatch one negotiation step. Never contacts the downstream server.
    pub async fn handle(&self, negotiation: AuthNegotiation) -> StrataResult<Value> {
        let server = negotiation
            .server
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StrataError::MissingArgument("server".to_string()))?;
        let intention = negotiation
            .intention
            .filter(|i| !i.is_empty())
            .ok_or_else(|| StrataError::MissingArgument("intention".to_string()))?;

        match intention.as_str() {
            "get_auth_url" => Ok(self.auth_guidance(&server)),
            "save_auth_data" => self.save_auth_data(&server, negotiation.auth_data).await,
            other => Err(StrataError::InvalidIntention(other.to_string())),
        }
    }

    fn auth_guidance(&self, server: &str) -> Value {
        let default = AuthRequirement::default();
        let requirement = self.requirements.get(server).unwrap_or(&default);
        let instructions = requirement.instructions.clone().unwrap_or_else(|| {
            format!(
                "Provide credentials for '{}' via save_auth_data, then retry the action",
                server
            )
        });
        json!({
            "server": server,
            "message": format!("Authentication required for '{}'", server),
            "instructions": instructions,
            "required_fields": requirement.required_fields,
        })
    }

    async fn save_auth_data(&self, server: &str, auth_data: Option<Value>) -> StrataResult<Value> {
        let data = match auth_data {
            Some(Value::Object(map)) if !map.is_empty() => Value::Object(map),
            Some(Value::Null) | None => {
                return Err(StrataError::MissingArgument("auth_data".to_string()));
            }
            Some(Value::Object(_)) => {
                return Err(StrataError::MissingArgument("auth_data".to_string()));
            }
            Some(other) => other,
        };

        self.store.save(server, data).await?;
        info!("Credentials saved for '{}'", server);
        Ok(json!({
            "server": server,
            "status": "success",
            "message": format!("Credentials for '{}' saved", server),
        }))
    }
}
