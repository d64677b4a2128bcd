//! Client-side event handler for downstream connections.
//!
//! Bridges downstream notifications into the gateway: `tools/list_changed`
//! schedules a catalog refresh through the manager's channel, and downstream
//! log messages are forwarded to tracing.

use rmcp::{
    model::{ClientInfo, LoggingLevel, LoggingMessageNotificationParam},
    service::NotificationContext,
    ClientHandler, RoleClient,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handler attached to every downstream client connection.
#[derive(Clone)]
pub struct CatalogEventHandler {
    server: String,
    refresh_tx: Option<mpsc::Sender<String>>,
}

impl CatalogEventHandler {
    pub fn new(server: impl Into<String>, refresh_tx: Option<mpsc::Sender<String>>) -> Self {
        Self {
            server: server.into(),
            refresh_tx,
        }
    }

    fn send_refresh(&self) {
        if let Some(tx) = &self.refresh_tx {
            // Drop-on-full: a pending refresh already covers this change.
            if let Err(e) = tx.try_send(self.server.clone()) {
                debug!("Refresh for '{}' not queued: {}", self.server, e);
            }
        }
    }
}

impl ClientHandler for CatalogEventHandler {
    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        info!("Server '{}' reported a tool list change", self.server);
        self.send_refresh();
    }

    async fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        let message = params.data.to_string();
        match params.level {
            LoggingLevel::Debug => debug!("[{}] {}", self.server, message),
            LoggingLevel::Info | LoggingLevel::Notice => info!("[{}] {}", self.server, message),
            _ => warn!("[{}] {}", self.server, message),
        }
    }

    fn get_info(&self) -> ClientInfo {
        let mut info = ClientInfo::default();
        info.client_info.name = "strata".to_string();
        info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
        info
    }
}
