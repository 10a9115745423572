//! Backends implemented by running desktop helper programs.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use portal_protocol::{Options, ResponseCode};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    AccessBackend, AccessDialog, AccessResponse, ActionActivator, ActionListener, BackendError,
    BackendHandle, NotificationBackend,
};
use crate::config::BackendConfig;

/// Runs `zenity`, `notify-send` and `gapplication` (or configured
/// replacements) to talk to the user's desktop.
#[derive(Debug, Clone)]
pub struct ExecBackend {
    config: BackendConfig,
}

impl ExecBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    fn dialog_command(&self, parent_window: &str, dialog: &AccessDialog) -> Command {
        let mut command = Command::new(&self.config.dialog_command);
        command.arg("--question");
        command.arg(format!("--title={}", dialog.title));

        let mut text = dialog.subtitle.clone();
        if !dialog.body.is_empty() {
            text.push_str("\n\n");
            text.push_str(&dialog.body);
        }
        command.arg(format!("--text={}", text));

        if let Some(label) = &dialog.options.grant_label {
            command.arg(format!("--ok-label={}", label));
        }
        if let Some(label) = &dialog.options.deny_label {
            command.arg(format!("--cancel-label={}", label));
        }
        if let Some(icon) = &dialog.options.icon {
            command.arg(format!("--icon-name={}", icon));
        }
        if let Some(xid) = parent_window.strip_prefix("x11:") {
            command.arg(format!("--attach={}", xid));
        }
        command
    }
}

#[async_trait]
impl AccessBackend for ExecBackend {
    async fn access_dialog(
        &self,
        handle: &BackendHandle,
        app_id: &str,
        parent_window: &str,
        dialog: &AccessDialog,
    ) -> Result<AccessResponse, BackendError> {
        let program = self.config.dialog_command.clone();
        let mut child = self
            .dialog_command(parent_window, dialog)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                command: program.clone(),
                source,
            })?;

        debug!(handle = handle.path(), app_id, "Showing access dialog");

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = handle.closed() => None,
        };

        let response = match status {
            None => {
                debug!(handle = handle.path(), "Access dialog closed by request owner");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill access dialog");
                }
                ResponseCode::Cancelled
            }
            Some(status) => match status.code() {
                Some(0) => ResponseCode::Success,
                Some(1) => ResponseCode::Cancelled,
                _ => {
                    return Err(BackendError::CommandFailed {
                        command: program,
                        status: status.to_string(),
                    })
                }
            },
        };

        Ok(AccessResponse {
            response,
            results: Options::new(),
        })
    }
}

/// Maps a notification priority to a `notify-send` urgency.
fn urgency(priority: &str) -> Option<&'static str> {
    match priority {
        "low" => Some("low"),
        "normal" => Some("normal"),
        "high" | "urgent" => Some("critical"),
        _ => None,
    }
}

/// An action offered on a notification.
#[derive(Debug, Clone, PartialEq)]
struct OfferedAction {
    /// Key `notify-send` prints when the action is chosen.
    key: String,
    label: String,
    action: String,
    parameter: Vec<Value>,
}

fn offered_action(
    key: String,
    label: &str,
    action: &Value,
    target: Option<&Value>,
) -> Option<OfferedAction> {
    Some(OfferedAction {
        key,
        label: label.to_string(),
        action: action.as_str()?.to_string(),
        parameter: target.cloned().into_iter().collect(),
    })
}

/// The default action followed by the buttons of a validated notification.
fn offered_actions(notification: &Options) -> Vec<OfferedAction> {
    let mut offered = Vec::new();
    if let Some(action) = notification.get("default-action") {
        offered.extend(offered_action(
            "default".to_string(),
            "Default",
            action,
            notification.get("default-action-target"),
        ));
    }
    let buttons = notification
        .get("buttons")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for (index, button) in buttons.iter().enumerate() {
        let label = button.get("label").and_then(Value::as_str).unwrap_or_default();
        if let Some(action) = button.get("action") {
            offered.extend(offered_action(
                index.to_string(),
                label,
                action,
                button.get("target"),
            ));
        }
    }
    offered
}

#[async_trait]
impl NotificationBackend for ExecBackend {
    async fn add_notification(
        &self,
        app_id: &str,
        id: &str,
        notification: &Options,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), BackendError> {
        let title = notification
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut command = Command::new(&self.config.notify_command);
        let app_name = if app_id.is_empty() { "portal-broker" } else { app_id };
        command.arg(format!("--app-name={}", app_name));

        if let Some(level) = notification
            .get("priority")
            .and_then(Value::as_str)
            .and_then(urgency)
        {
            command.arg(format!("--urgency={}", level));
        }
        if let Some(icon) = notification.get("icon").and_then(Value::as_str) {
            command.arg(format!("--icon={}", icon));
        }
        command.arg("--").arg(title);
        if let Some(body) = notification.get("body").and_then(Value::as_str) {
            command.arg(body);
        }

        let offered = offered_actions(notification);
        if offered.is_empty() {
            debug!(app_id, id, "Sending notification");
            return run_to_completion(&self.config.notify_command, &mut command).await;
        }

        for entry in &offered {
            command.arg(format!("--action={}={}", entry.key, entry.label));
        }
        command.arg("--wait");

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                command: self.config.notify_command.clone(),
                source,
            })?;

        debug!(app_id, id, actions = offered.len(), "Sending notification with actions");

        let app_id = app_id.to_string();
        let id = id.to_string();
        tokio::spawn(async move {
            let output = match child.wait_with_output().await {
                Ok(output) => output,
                Err(e) => {
                    warn!(app_id = %app_id, id = %id, error = %e, "Notification helper failed");
                    return;
                }
            };
            let chosen = String::from_utf8_lossy(&output.stdout);
            let chosen = chosen.trim();
            match offered.into_iter().find(|entry| entry.key == chosen) {
                Some(entry) => {
                    listener.action_invoked(&app_id, &id, &entry.action, entry.parameter)
                }
                None => debug!(app_id = %app_id, id = %id, "Notification closed without action"),
            }
        });
        Ok(())
    }

    async fn remove_notification(&self, app_id: &str, id: &str) -> Result<(), BackendError> {
        // notify-send has no way to withdraw a notification; it expires on its own.
        debug!(app_id, id, "Notification withdrawal not supported by helper");
        Ok(())
    }
}

/// Renders a parameter in GVariant text format for `gapplication`.
fn gvariant_text(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "@mv nothing".to_string(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(gvariant_text).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("'{}': <{}>", k, gvariant_text(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

#[async_trait]
impl ActionActivator for ExecBackend {
    async fn activate_action(
        &self,
        application: &str,
        action: &str,
        parameters: &[Value],
        platform_data: &Options,
    ) -> Result<(), BackendError> {
        if parameters.len() > 1 {
            return Err(BackendError::Unsupported(format!(
                "{} parameters given, at most one is supported",
                parameters.len()
            )));
        }

        let mut command = Command::new(&self.config.action_command);
        command.arg("action").arg(application).arg(action);
        if let Some(parameter) = parameters.first() {
            command.arg(gvariant_text(parameter));
        }
        if !platform_data.is_empty() {
            debug!(application, "Ignoring platform data for helper activation");
        }

        debug!(application, action, "Activating action");
        run_to_completion(&self.config.action_command, &mut command).await
    }
}

async fn run_to_completion(program: &str, command: &mut Command) -> Result<(), BackendError> {
    let status = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|source| BackendError::Spawn {
            command: program.to_string(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(BackendError::CommandFailed {
            command: program.to_string(),
            status: status.to_string(),
        })
    }
}
