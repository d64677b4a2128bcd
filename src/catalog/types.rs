//! Core types for the tool catalog.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique action identifier: `server:action`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedActionName {
    pub server: String,
    pub action: String,
}

impl QualifiedActionName {
    pub fn new(server: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            action: action.into(),
        }
    }

    /// Parse from "server:action" format.
    pub fn parse(s: &str) -> Option<Self> {
        let (server, action) = s.split_once(':')?;
        Some(Self::new(server, action))
    }
}

impl fmt::Display for QualifiedActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server, self.action)
    }
}

/// Immutable snapshot of one downstream tool. Replaced wholesale on refresh,
/// never patched in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// Name of the owning downstream server.
    pub server: String,
}

impl ToolDescriptor {
    pub fn new(
        server: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            server: server.into(),
        }
    }

    pub fn qualified_name(&self) -> QualifiedActionName {
        QualifiedActionName::new(&self.server, &self.name)
    }

    pub fn from_tool(server: &str, tool: &rmcp::model::Tool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool
                .description
                .as_deref()
                .unwrap_or_default()
                .to_string(),
            input_schema: Value::Object((*tool.input_schema).clone()),
            server: server.to_string(),
        }
    }
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub server: String,
    pub tool: String,
    pub description: String,
    pub score: u32,
}
