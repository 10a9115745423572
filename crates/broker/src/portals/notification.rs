//! Notification portal.
//!
//! Notifications are validated synchronously, then handed to the backend
//! from a task. Sandboxed apps denied in the `notifications` table are
//! dropped silently; an unreadable table lets notifications through.
//!
//! Actions the user activates on a shown notification are relayed as an
//! `ActionInvoked` signal to the connection that added it.

use std::sync::Arc;

use dashmap::DashMap;
use portal_protocol::{Options, Signal};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::PortalError;
use crate::backend::{ActionListener, NotificationBackend};
use crate::bus::Connection;
use crate::identity::AppInfo;
use crate::permissions::PermissionStoreClient;

/// Permission table consulted before showing a notification.
pub const TABLE: &str = "notifications";

/// Object id within [`TABLE`].
pub const OBJECT_ID: &str = "notification";

const PRIORITIES: [&str; 4] = ["low", "normal", "high", "urgent"];

const ICON_KINDS: [&str; 5] = ["themed", "file", "bytes", "emblem", "emblemed"];

/// Active notifications: (app id, notification id) to owning connection.
type ActiveTable = DashMap<(String, String), Arc<Connection>>;

/// Routes backend action activations to the owning connection.
struct ActionRelay {
    active: Arc<ActiveTable>,
}

impl ActionListener for ActionRelay {
    fn action_invoked(&self, app_id: &str, id: &str, action: &str, parameter: Vec<Value>) {
        let key = (app_id.to_string(), id.to_string());
        let Some(owner) = self.active.get(&key).map(|entry| Arc::clone(entry.value())) else {
            trace!(app_id, id, action, "Action for unknown notification");
            return;
        };

        debug!(
            app_id,
            id,
            action,
            sender = owner.unique_name(),
            "Relaying notification action"
        );
        owner.emit_signal(Signal::ActionInvoked {
            id: id.to_string(),
            action: action.to_string(),
            parameter,
        });
    }
}

/// Portal calls for notifications.
#[derive(Clone)]
pub struct NotificationPortal {
    backend: Arc<dyn NotificationBackend>,
    permissions: PermissionStoreClient,
    active: Arc<ActiveTable>,
}

impl std::fmt::Debug for NotificationPortal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationPortal")
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl NotificationPortal {
    pub fn new(backend: Arc<dyn NotificationBackend>, permissions: PermissionStoreClient) -> Self {
        Self {
            backend,
            permissions,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Number of notifications currently shown.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Sender owning the notification `id` of `app_id`, if shown.
    pub fn owner_of(&self, app_id: &str, id: &str) -> Option<String> {
        self.active
            .get(&(app_id.to_string(), id.to_string()))
            .map(|entry| entry.value().unique_name().to_string())
    }

    /// Listener handed to the backend along with each notification.
    pub fn action_listener(&self) -> Arc<dyn ActionListener> {
        Arc::new(ActionRelay {
            active: Arc::clone(&self.active),
        })
    }

    /// Validate and show a notification.
    ///
    /// Returns once validated; the backend call runs in the background and
    /// the returned handle completes after it.
    pub fn add_notification(
        &self,
        connection: &Arc<Connection>,
        app_info: &AppInfo,
        id: &str,
        notification: Options,
    ) -> Result<tokio::task::JoinHandle<()>, PortalError> {
        validate_notification(&notification)
            .map_err(|e| PortalError::InvalidArgument(format!("invalid notification: {}", e)))?;

        let backend = Arc::clone(&self.backend);
        let permissions = self.permissions.clone();
        let active = Arc::clone(&self.active);
        let app_id = app_info.id().to_string();
        let id = id.to_string();
        let owner = Arc::clone(connection);
        let listener = self.action_listener();

        Ok(tokio::spawn(async move {
            if !app_id.is_empty() && !notification_allowed(&permissions, &app_id) {
                debug!(app_id = %app_id, id = %id, "Notifications disabled for app, dropping");
                return;
            }

            // Registered first so an immediate activation finds its owner.
            active.insert((app_id.clone(), id.clone()), Arc::clone(&owner));
            match backend
                .add_notification(&app_id, &id, &notification, listener)
                .await
            {
                Ok(()) => {
                    debug!(
                        app_id = %app_id,
                        id = %id,
                        sender = owner.unique_name(),
                        "Notification shown"
                    );
                }
                Err(e) => {
                    warn!(app_id = %app_id, id = %id, error = %e, "Backend call failed");
                    active.remove_if(&(app_id, id), |_, current| Arc::ptr_eq(current, &owner));
                }
            }
        }))
    }

    /// Withdraw a notification.
    pub fn remove_notification(
        &self,
        app_info: &AppInfo,
        id: &str,
    ) -> tokio::task::JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let active = Arc::clone(&self.active);
        let app_id = app_info.id().to_string();
        let id = id.to_string();

        tokio::spawn(async move {
            match backend.remove_notification(&app_id, &id).await {
                Ok(()) => {
                    active.remove(&(app_id, id));
                }
                Err(e) => warn!(app_id = %app_id, id = %id, error = %e, "Backend call failed"),
            }
        })
    }

    /// Forget the notifications owned by a departed sender.
    pub fn sender_disconnected(&self, sender: &str) -> usize {
        let before = self.active.len();
        self.active.retain(|_, owner| owner.unique_name() != sender);
        let purged = before.saturating_sub(self.active.len());
        if purged > 0 {
            debug!(sender, purged, "Purged notifications of departed sender");
        }
        purged
    }
}

fn notification_allowed(permissions: &PermissionStoreClient, app_id: &str) -> bool {
    match permissions.get_permission_strv(TABLE, OBJECT_ID, app_id) {
        Some(values) => !values.iter().any(|value| value == "no"),
        None => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn expect_string<'a>(key: &str, value: &'a Value) -> Result<&'a str, String> {
    value.as_str().ok_or_else(|| {
        format!(
            "expected type for key {} is string, found {}",
            key,
            type_name(value)
        )
    })
}

fn check_icon(value: &Value) -> Result<(), String> {
    let valid = match value {
        Value::String(name) => !name.is_empty(),
        Value::Array(parts) => matches!(
            parts.as_slice(),
            [Value::String(kind), _] if ICON_KINDS.contains(&kind.as_str())
        ),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err("invalid icon".to_string())
    }
}

fn check_button(button: &Value) -> Result<(), String> {
    let Value::Object(fields) = button else {
        return Err(format!(
            "expected type for button is object, found {}",
            type_name(button)
        ));
    };
    for key in fields.keys() {
        if !matches!(key.as_str(), "label" | "action" | "target") {
            return Err(format!("{} not valid key", key));
        }
    }
    if !fields.contains_key("label") {
        return Err("label key is missing".to_string());
    }
    if !fields.contains_key("action") {
        return Err("action key is missing".to_string());
    }
    Ok(())
}

/// Checks keys and value types of a notification.
pub fn validate_notification(notification: &Options) -> Result<(), String> {
    for (key, value) in notification {
        match key.as_str() {
            "title" | "body" | "default-action" => {
                expect_string(key, value)?;
            }
            "icon" => check_icon(value)?,
            "priority" => {
                let priority = expect_string(key, value)?;
                if !PRIORITIES.contains(&priority) {
                    return Err(format!("{} not a priority", priority));
                }
            }
            "default-action-target" => {}
            "buttons" => {
                let Value::Array(buttons) = value else {
                    return Err(format!(
                        "expected type for key buttons is array, found {}",
                        type_name(value)
                    ));
                };
                for button in buttons {
                    check_button(button).map_err(|e| format!("invalid button: {}", e))?;
                }
            }
            other => return Err(format!("{} not valid key", other)),
        }
    }
    Ok(())
}
