//! Message router for dispatching incoming calls to the portals.
//!
//! This module provides the `MessageRouter` struct that receives calls from
//! bus connections, resolves the caller's identity and routes each call to
//! the request registry or the matching portal.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use portal_protocol::{BrokerStatus, Call, Reply};
use serde_json::Value;
use tracing::{debug, info};

use crate::bus::Connection;
use crate::identity::{AppInfo, IdentityResolver};
use crate::portals::{
    ActionsPortal, ActivateAction, FileTransferPortal, NotificationPortal, PortalError,
};
use crate::request::RequestRegistry;

/// Result type for router operations.
pub type RouterResult = Result<Reply, PortalError>;

/// Routes calls to the request registry and the portals.
pub struct MessageRouter {
    identity: Arc<dyn IdentityResolver>,
    requests: RequestRegistry,
    file_transfer: FileTransferPortal,
    actions: ActionsPortal,
    notifications: NotificationPortal,
    connections: AtomicUsize,
    started: Instant,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("connections", &self.connections.load(Ordering::Relaxed))
            .field("requests", &self.requests.len())
            .finish_non_exhaustive()
    }
}

impl MessageRouter {
    /// Create a new message router with the given dependencies.
    pub fn new(
        identity: Arc<dyn IdentityResolver>,
        requests: RequestRegistry,
        file_transfer: FileTransferPortal,
        actions: ActionsPortal,
        notifications: NotificationPortal,
    ) -> Self {
        Self {
            identity,
            requests,
            file_transfer,
            actions,
            notifications,
            connections: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// The request registry.
    pub fn requests(&self) -> &RequestRegistry {
        &self.requests
    }

    /// The notification portal.
    pub fn notifications(&self) -> &NotificationPortal {
        &self.notifications
    }

    /// The file transfer portal.
    pub fn file_transfer(&self) -> &FileTransferPortal {
        &self.file_transfer
    }

    /// Current broker statistics.
    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            uptime_secs: self.started.elapsed().as_secs(),
            connections: self.connections.load(Ordering::SeqCst),
            requests: self.requests.len(),
            transfers: self.file_transfer.transfers().len(),
            notifications: self.notifications.active_count(),
        }
    }

    /// Record a new connection.
    pub fn sender_connected(&self, connection: &Connection) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        debug!(sender = connection.unique_name(), pid = ?connection.pid(), "Sender connected");
    }

    /// Tear down everything owned by a departed connection.
    ///
    /// The connection is marked closed first, so a request exported after
    /// the sweep has started closes itself instead of escaping it.
    pub fn sender_disconnected(&self, connection: &Connection) {
        connection.mark_closed();
        let sender = connection.unique_name();
        let closed = self.requests.close_requests_for_sender(sender);
        let purged = self.notifications.sender_disconnected(sender);
        self.connections.fetch_sub(1, Ordering::SeqCst);
        info!(sender, closed, purged, "Sender disconnected");
    }

    fn app_info(&self, connection: &Connection) -> Result<AppInfo, PortalError> {
        if let Some(info) = connection.cached_app_info() {
            return Ok(info.clone());
        }
        let info = self
            .identity
            .resolve(connection)
            .map_err(PortalError::Identity)?;
        connection.cache_app_info(info.clone());
        Ok(info)
    }

    /// Route a call to the appropriate handler.
    ///
    /// `fds` are the descriptors that arrived with the call.
    pub async fn route(
        &self,
        connection: &Arc<Connection>,
        call: Call,
        fds: Vec<OwnedFd>,
    ) -> RouterResult {
        debug!(sender = connection.unique_name(), method = call.name(), fds = fds.len(), "Routing call");

        match call {
            Call::Hello => Ok(Reply::Hello {
                unique_name: connection.unique_name().to_string(),
            }),
            Call::Status => Ok(Reply::Status(self.status())),
            Call::CloseRequest { handle } => self.handle_close_request(connection, &handle),

            Call::StartTransfer { options } => {
                let app_info = self.app_info(connection)?;
                let key = self
                    .file_transfer
                    .start_transfer(connection, &app_info, &options)?;
                Ok(Reply::TransferKey { key })
            }
            Call::AddFiles { key, fds: indices, .. } => {
                let app_info = self.app_info(connection)?;
                self.file_transfer
                    .add_files(connection, &app_info, &key, &indices, &fds)?;
                Ok(Reply::Empty)
            }
            Call::RetrieveFiles { key, .. } => {
                let app_info = self.app_info(connection)?;
                let files = self.file_transfer.retrieve_files(&app_info, &key).await?;
                Ok(Reply::Files { files })
            }
            Call::StopTransfer { key } => {
                self.file_transfer.stop_transfer(connection, &key)?;
                Ok(Reply::Empty)
            }

            Call::AddNotification { id, notification } => {
                let app_info = self.app_info(connection)?;
                self.notifications
                    .add_notification(connection, &app_info, &id, notification)?;
                Ok(Reply::Empty)
            }
            Call::RemoveNotification { id } => {
                let app_info = self.app_info(connection)?;
                self.notifications.remove_notification(&app_info, &id);
                Ok(Reply::Empty)
            }

            Call::ActivateAction {
                parent_window,
                application,
                action,
                parameters,
                options,
            } => {
                let app_info = self.app_info(connection)?;
                let handle_token = match options.get("handle_token") {
                    None => None,
                    Some(Value::String(token)) => Some(token.clone()),
                    Some(_) => {
                        return Err(PortalError::InvalidArgument(
                            "handle_token must be a string".to_string(),
                        ))
                    }
                };
                let call = ActivateAction::from_call(
                    parent_window,
                    application,
                    action,
                    parameters,
                    &options,
                )?;
                let (handle, _task) = self.actions.activate_action(
                    connection,
                    &app_info,
                    call,
                    handle_token.as_deref(),
                )?;
                Ok(Reply::Handle { handle })
            }
        }
    }

    fn handle_close_request(&self, connection: &Connection, handle: &str) -> RouterResult {
        // Requests are only visible to their owner.
        let request = self
            .requests
            .lookup(handle)
            .filter(|request| request.sender() == connection.unique_name())
            .ok_or_else(|| PortalError::UnknownObject(format!("No such object path '{}'", handle)))?;

        request.close();
        Ok(Reply::Empty)
    }
}
