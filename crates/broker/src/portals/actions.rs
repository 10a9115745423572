//! Actions portal: activate another application's action after consent.

use std::sync::Arc;

use portal_protocol::{Options, ResponseCode};
use serde_json::Value;
use tracing::{debug, warn};

use super::PortalError;
use crate::backend::{AccessDialog, AccessOptions, ActionActivator};
use crate::bus::Connection;
use crate::consent::{ConsentGate, ConsentRequest, PersistPolicy};
use crate::identity::{desktop, AppInfo};
use crate::request::{Request, RequestRegistry};

/// Permission table for action activation.
pub const TABLE: &str = "actions";

const ICON: &str = "emblem-system-symbolic";

/// Arguments of one `ActivateAction` call, carried into its worker task.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivateAction {
    pub parent_window: String,
    pub application: String,
    pub action: String,
    pub parameters: Vec<Value>,
    pub platform_data: Options,
}

impl ActivateAction {
    /// Build from the wire arguments, extracting `platform-data` from `options`.
    pub fn from_call(
        parent_window: String,
        application: String,
        action: String,
        parameters: Vec<Value>,
        options: &Options,
    ) -> Result<Self, PortalError> {
        if application.is_empty() {
            return Err(PortalError::InvalidArgument("application must not be empty".to_string()));
        }
        if action.is_empty() {
            return Err(PortalError::InvalidArgument("action must not be empty".to_string()));
        }

        let platform_data = match options.get("platform-data") {
            None => Options::new(),
            Some(Value::Object(data)) => data.clone(),
            Some(_) => {
                return Err(PortalError::InvalidArgument(
                    "platform-data must be a dictionary".to_string(),
                ))
            }
        };

        Ok(Self {
            parent_window,
            application,
            action,
            parameters,
            platform_data,
        })
    }

    /// Object id in the permission table.
    pub fn object_id(&self) -> String {
        format!("{}::{}", self.application, self.action)
    }

    fn dialog(&self, requester: Option<String>) -> AccessDialog {
        let target =
            desktop::display_name(&self.application).unwrap_or_else(|| self.application.clone());
        let subtitle = match requester {
            Some(name) => format!("{} wants to activate {}", name, target),
            None => format!("An application wants to activate {}", target),
        };

        AccessDialog {
            title: format!("Activate the '{}' action in {}?", self.action, target),
            subtitle,
            body: "Access to application actions can be changed from the privacy settings at any time."
                .to_string(),
            options: AccessOptions {
                icon: Some(ICON.to_string()),
                ..Default::default()
            },
        }
    }
}

/// Portal calls for action activation.
#[derive(Clone)]
pub struct ActionsPortal {
    requests: RequestRegistry,
    consent: ConsentGate,
    activator: Arc<dyn ActionActivator>,
}

impl std::fmt::Debug for ActionsPortal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionsPortal").finish_non_exhaustive()
    }
}

impl ActionsPortal {
    pub fn new(
        requests: RequestRegistry,
        consent: ConsentGate,
        activator: Arc<dyn ActionActivator>,
    ) -> Self {
        Self {
            requests,
            consent,
            activator,
        }
    }

    /// Create and export a request, then run consent and activation on a task.
    ///
    /// Returns the request handle and the worker task.
    pub fn activate_action(
        &self,
        connection: &Arc<Connection>,
        app_info: &AppInfo,
        call: ActivateAction,
        handle_token: Option<&str>,
    ) -> Result<(String, tokio::task::JoinHandle<()>), PortalError> {
        let request = self
            .requests
            .create(app_info.clone(), connection.unique_name(), handle_token)?;
        request.export(connection)?;
        let handle = request.id().to_string();

        debug!(
            handle = %handle,
            application = %call.application,
            action = %call.action,
            "Activating action"
        );

        let consent = self.consent.clone();
        let activator = Arc::clone(&self.activator);
        let task = tokio::spawn(run_activation(request, call, consent, activator));
        Ok((handle, task))
    }
}

async fn run_activation(
    request: Arc<Request>,
    call: ActivateAction,
    consent: ConsentGate,
    activator: Arc<dyn ActionActivator>,
) {
    let consent_request = ConsentRequest {
        table: TABLE.to_string(),
        object_id: call.object_id(),
        parent_window: call.parent_window.clone(),
        dialog: call.dialog(request.app_info().display_name()),
        policy: PersistPolicy::FirstDecision,
    };

    let decision = consent.check(&request, &consent_request).await;

    let response = if !decision.allowed {
        ResponseCode::Cancelled
    } else if !request.is_exported() {
        debug!(handle = request.id(), "Request closed, not activating");
        return;
    } else {
        match activator
            .activate_action(
                &call.application,
                &call.action,
                &call.parameters,
                &call.platform_data,
            )
            .await
        {
            Ok(()) => ResponseCode::Success,
            Err(e) => {
                warn!(
                    application = %call.application,
                    action = %call.action,
                    error = %e,
                    "Failed to activate action"
                );
                ResponseCode::Other
            }
        }
    };

    request.emit_response(response, Options::new());
}
