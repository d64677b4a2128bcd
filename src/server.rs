//! The outward protocol surface.
//!
//! Exposes exactly five fixed meta-tools whose schemas never change as
//! downstream catalogs churn. Every dispatch failure is converted into
//! `{"error": ...}` content at this boundary; a malformed call degrades one
//! response, never the process.

use std::{borrow::Cow, sync::Arc};

use futures::future::join_all;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, ErrorData, Implementation, ListToolsResult,
        PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
    RoleServer, ServerHandler,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    auth::{AuthFailureHandler, AuthNegotiation},
    catalog::CatalogIndex,
    core::{CallContext, ClientManager},
    error::{StrataError, StrataResult},
    executor::{ActionExecutor, ActionRequest},
};

const DEFAULT_MAX_RESULTS: usize = 10;

/// Aggregating tool server: five meta-tools over many downstream catalogs.
pub struct MetaToolServer {
    manager: Arc<ClientManager>,
    executor: ActionExecutor,
    auth: AuthFailureHandler,
}

impl MetaToolServer {
    pub fn new(manager: Arc<ClientManager>) -> Self {
        let auth = AuthFailureHandler::new(manager.registry());
        Self {
            executor: ActionExecutor::new(Arc::clone(&manager)),
            manager,
            auth,
        }
    }

    pub fn with_auth_handler(manager: Arc<ClientManager>, auth: AuthFailureHandler) -> Self {
        Self {
            executor: ActionExecutor::new(Arc::clone(&manager)),
            manager,
            auth,
        }
    }

    /// The fixed meta-tool descriptors advertised to clients.
    pub fn meta_tools() -> Vec<Tool> {
        vec![
            meta_tool(
                "discover_server_actions",
                "Discover available actions across the configured tool servers, \
                 optionally filtered by a free-text query",
                json!({
                    "type": "object",
                    "properties": {
                        "user_query": {
                            "type": "string",
                            "description": "Free-text description of what you want to do"
                        },
                        "server_names": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Restrict discovery to these servers; omit for all"
                        }
                    }
                }),
            ),
            meta_tool(
                "get_action_details",
                "Get the full input schema for one action on one server",
                json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string"},
                        "action": {"type": "string"}
                    },
                    "required": ["server", "action"]
                }),
            ),
            meta_tool(
                "execute_action",
                "Execute one action on one server with merged parameters",
                json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string"},
                        "action": {"type": "string"},
                        "path_params": {
                            "type": ["object", "string"],
                            "description": "Path parameters, as an object or JSON-encoded string"
                        },
                        "query_params": {
                            "type": ["object", "string"],
                            "description": "Query parameters, as an object or JSON-encoded string"
                        },
                        "body_schema": {
                            "type": ["object", "string"],
                            "description": "Request body, as an object or JSON-encoded string"
                        }
                    },
                    "required": ["server", "action"]
                }),
            ),
            meta_tool(
                "search_documentation",
                "Search one server's action catalog by keyword",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "server": {"type": "string"},
                        "max_results": {"type": "integer", "default": DEFAULT_MAX_RESULTS}
                    },
                    "required": ["query", "server"]
                }),
            ),
            meta_tool(
                "handle_auth_failure",
                "Negotiate credential recovery after an authentication failure",
                json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string"},
                        "intention": {
                            "type": "string",
                            "enum": ["get_auth_url", "save_auth_data"]
                        },
                        "auth_data": {"type": "object"}
                    },
                    "required": ["server", "intention"]
                }),
            ),
        ]
    }

    /// Route one meta-tool call.
    pub async fn dispatch(
        &self,
        name: &str,
        args: Map<String, Value>,
        ctx: &CallContext,
    ) -> StrataResult<Value> {
        match name {
            "discover_server_actions" => {
                let user_query = optional_str(&args, "user_query");
                let server_names = optional_str_list(&args, "server_names")?;
                Ok(self.discover(user_query.as_deref(), server_names).await)
            }
            "get_action_details" => {
                let server = required_str(&args, "server")?;
                let action = required_str(&args, "action")?;
                self.action_details(&server, &action).await
            }
            "execute_action" => {
                let request = ActionRequest {
                    server: optional_str(&args, "server"),
                    action: optional_str(&args, "action"),
                    path_params: args.get("path_params").cloned(),
                    query_params: args.get("query_params").cloned(),
                    body_schema: args.get("body_schema").cloned(),
                };
                self.executor.execute(request, ctx).await
            }
            "search_documentation" => {
                let query = required_str(&args, "query")?;
                let server = required_str(&args, "server")?;
                let max_results = args
                    .get("max_results")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_MAX_RESULTS);
                Ok(self.search_documentation(&query, &server, max_results).await)
            }
            "handle_auth_failure" => {
                let negotiation = AuthNegotiation {
                    server: optional_str(&args, "server"),
                    intention: optional_str(&args, "intention"),
                    auth_data: args.get("auth_data").cloned(),
                };
                self.auth.handle(negotiation).await
            }
            other => Err(StrataError::Validation(format!(
                "unknown meta-tool '{}'",
                other
            ))),
        }
    }

    /// Concurrent per-server catalog fan-out. Entries keep the requested (or
    /// registry) order; a failing server degrades only its own entry.
    async fn discover(&self, user_query: Option<&str>, server_names: Option<Vec<String>>) -> Value {
        let targets = server_names.unwrap_or_else(|| self.manager.server_names());
        let query = user_query.unwrap_or_default();

        let futures: Vec<_> = targets
            .iter()
            .map(|name| async move { (name.clone(), self.server_entry(name, query).await) })
            .collect();

        let mut servers = Map::new();
        for (name, entry) in join_all(futures).await {
            servers.insert(name, entry);
        }
        json!({"servers": servers})
    }

    async fn server_entry(&self, server: &str, query: &str) -> Value {
        let tools = match self.manager.list_tools(server).await {
            Ok(tools) => tools,
            Err(e) => return json!({"error": e.to_string()}),
        };

        if query.trim().is_empty() {
            return serde_json::to_value(&tools).unwrap_or_else(|_| Value::Array(vec![]));
        }

        let index = CatalogIndex::build(&tools);
        let ranked: Vec<_> = index
            .search(query, tools.len())
            .into_iter()
            .filter_map(|hit| tools.iter().find(|t| t.name == hit.tool).cloned())
            .collect();
        serde_json::to_value(&ranked).unwrap_or_else(|_| Value::Array(vec![]))
    }

    /// Full descriptor for one action, with the same refresh-once rule the
    /// executor applies.
    async fn action_details(&self, server: &str, action: &str) -> StrataResult<Value> {
        let tools = self.manager.list_tools(server).await?;
        if let Some(tool) = tools.iter().find(|t| t.name == action) {
            return Ok(serde_json::to_value(tool)?);
        }

        let refreshed = self.manager.refresh_catalog(server).await?;
        match refreshed.iter().find(|t| t.name == action) {
            Some(tool) => Ok(serde_json::to_value(tool)?),
            None => Err(StrataError::ActionNotFound {
                server: server.to_string(),
                action: action.to_string(),
            }),
        }
    }

    async fn search_documentation(&self, query: &str, server: &str, max_results: usize) -> Value {
        self.manager.metrics().record_search();
        let tools = match self.manager.list_tools(server).await {
            Ok(tools) => tools,
            Err(_) => {
                return json!({"error": format!("{} not found or not connected", server)});
            }
        };

        let index = CatalogIndex::build(&tools);
        let hits = index.search(query, max_results);
        json!({"server": server, "results": hits})
    }
}

impl ServerHandler for MetaToolServer {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: Self::meta_tools(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let args = request.arguments.unwrap_or_default();
        let ctx = CallContext::new();
        debug!(request_id = %ctx.request_id, "Meta-tool call: {}", request.name);

        match self.dispatch(&request.name, args, &ctx).await {
            Ok(value) => Ok(CallToolResult::success(vec![Content::text(
                value.to_string(),
            )])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(
                json!({"error": e.to_string()}).to_string(),
            )])),
        }
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            protocol_version: ProtocolVersion::LATEST,
            server_info: Implementation {
                name: "strata".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Progressively discover and invoke downstream actions: \
                 1) discover_server_actions to see what is available, \
                 2) get_action_details for the schema of one action, \
                 3) execute_action to run it. Use search_documentation to \
                 search one server's catalog and handle_auth_failure when a \
                 server rejects credentials."
                    .to_string(),
            ),
            ..Default::default()
        }
    }
}

fn meta_tool(name: &'static str, description: &'static str, schema: Value) -> Tool {
    let schema = match schema {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Tool {
        name: Cow::Borrowed(name),
        title: None,
        description: Some(Cow::Borrowed(description)),
        input_schema: Arc::new(schema),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

fn required_str(args: &Map<String, Value>, key: &str) -> StrataResult<String> {
    optional_str(args, key).ok_or_else(|| StrataError::MissingArgument(key.to_string()))
}

fn optional_str(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn optional_str_list(args: &Map<String, Value>, key: &str) -> StrataResult<Option<Vec<String>>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => names.push(s.to_string()),
                    None => {
                        return Err(StrataError::Validation(format!(
                            "'{}' must be an array of strings",
                            key
                        )));
                    }
                }
            }
            Ok(Some(names))
        }
        Some(_) => Err(StrataError::Validation(format!(
            "'{}' must be an array of strings",
            key
        ))),
    }
}
