//! Consent orchestration: stored decisions first, then the user.
//!
//! A [`ConsentGate`] checks the permission store for an (object, app)
//! decision. Without one it asks through the access backend on behalf of a
//! request, then records the outcome according to the feature's policy.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::backend::{AccessBackend, AccessDialog, BackendHandle};
use crate::permissions::{Permission, PermissionStoreClient};
use crate::request::Request;

/// When a dialog outcome is written back to the store.
///
/// The actions portal uses [`PersistPolicy::FirstDecision`].
/// [`PersistPolicy::Timestamped`] is the location-style policy for features
/// that track when an app last used a grant; the store keeps
/// `[yes|no, last_used]` for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPolicy {
    /// Record only the first decision; later dialogs (for `ask`) are not stored.
    FirstDecision,
    /// Record every outcome. A grant refreshes the last-used timestamp, a
    /// denial keeps the previous one.
    Timestamped,
}

/// What to ask and where to record the answer.
#[derive(Debug, Clone)]
pub struct ConsentRequest {
    /// Permission table.
    pub table: String,
    /// Object id within the table.
    pub object_id: String,
    /// Window the dialog should be attached to.
    pub parent_window: String,
    /// Dialog content.
    pub dialog: AccessDialog,
    pub policy: PersistPolicy,
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Stored,
    Dialog,
}

/// Outcome of a consent check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentDecision {
    pub allowed: bool,
    pub source: DecisionSource,
}

/// Shared consent checker.
#[derive(Clone)]
pub struct ConsentGate {
    permissions: PermissionStoreClient,
    access: Arc<dyn AccessBackend>,
}

impl std::fmt::Debug for ConsentGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentGate").finish_non_exhaustive()
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ConsentGate {
    pub fn new(permissions: PermissionStoreClient, access: Arc<dyn AccessBackend>) -> Self {
        Self {
            permissions,
            access,
        }
    }

    /// The permission client used for lookups.
    pub fn permissions(&self) -> &PermissionStoreClient {
        &self.permissions
    }

    /// Decide whether the owner of `request` may proceed.
    ///
    /// A stored `yes`/`no` answers directly. Otherwise a dialog is shown
    /// with a backend handle attached to the request, so closing the
    /// request dismisses the dialog. Outcomes of failed or abandoned
    /// dialogs deny without being recorded.
    pub async fn check(&self, request: &Request, consent: &ConsentRequest) -> ConsentDecision {
        let app_id = request.app_info().id();
        let stored = self
            .permissions
            .get_permission(&consent.table, &consent.object_id, app_id);

        match stored.permission {
            Permission::Yes | Permission::No => {
                let allowed = stored.permission == Permission::Yes;
                debug!(
                    table = %consent.table,
                    id = %consent.object_id,
                    app_id,
                    allowed,
                    "Using stored permission"
                );
                if consent.policy == PersistPolicy::Timestamped && allowed {
                    self.permissions.set_permission(
                        &consent.table,
                        &consent.object_id,
                        app_id,
                        Permission::Yes,
                        Some(now_secs()),
                    );
                }
                return ConsentDecision {
                    allowed,
                    source: DecisionSource::Stored,
                };
            }
            Permission::Unset | Permission::Ask => {}
        }

        let handle = BackendHandle::new(request.id());
        request.set_backend_handle(Some(handle.clone()));
        if !request.is_exported() {
            debug!(handle = request.id(), "Request closed before dialog");
            return ConsentDecision {
                allowed: false,
                source: DecisionSource::Dialog,
            };
        }

        let result = self
            .access
            .access_dialog(&handle, app_id, &consent.parent_window, &consent.dialog)
            .await;

        request.set_backend_handle(None);

        let allowed = match result {
            Ok(response) if handle.is_closed() => {
                debug!(handle = request.id(), ?response.response, "Dialog abandoned by owner");
                return ConsentDecision {
                    allowed: false,
                    source: DecisionSource::Dialog,
                };
            }
            Ok(response) => response.granted(),
            Err(e) => {
                warn!(handle = request.id(), error = %e, "Access dialog failed");
                return ConsentDecision {
                    allowed: false,
                    source: DecisionSource::Dialog,
                };
            }
        };

        info!(
            table = %consent.table,
            id = %consent.object_id,
            app_id,
            allowed,
            "User decided"
        );

        let decision = if allowed { Permission::Yes } else { Permission::No };
        match consent.policy {
            PersistPolicy::FirstDecision if stored.permission == Permission::Unset => {
                self.permissions.set_permission(
                    &consent.table,
                    &consent.object_id,
                    app_id,
                    decision,
                    None,
                );
            }
            PersistPolicy::FirstDecision => {}
            PersistPolicy::Timestamped => {
                let last_used = if allowed {
                    Some(now_secs())
                } else {
                    stored.last_used
                };
                self.permissions.set_permission(
                    &consent.table,
                    &consent.object_id,
                    app_id,
                    decision,
                    last_used,
                );
            }
        }

        ConsentDecision {
            allowed,
            source: DecisionSource::Dialog,
        }
    }
}
