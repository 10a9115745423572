//! Interfaces to the desktop-side services the broker delegates to.
//!
//! The broker decides policy; backends do the work: show a consent dialog,
//! register documents, display notifications, activate actions. Each is a
//! trait so tests and alternative desktops can provide their own.

pub mod documents;
pub mod exec;

use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use portal_protocol::{Options, ResponseCode};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::identity::AppInfo;

pub use documents::PassthroughDocumentStore;
pub use exec::ExecBackend;

/// Errors reported by backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The helper program could not be started.
    #[error("failed to run {command}: {source}")]
    Spawn {
        /// Program name.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The helper program exited unsuccessfully.
    #[error("{command} failed: {status}")]
    CommandFailed {
        /// Program name.
        command: String,
        /// Exit status description.
        status: String,
    },

    /// The backend cannot represent the given input.
    #[error("unsupported input: {0}")]
    Unsupported(String),

    /// The backend returned something unexpected.
    #[error("malformed backend reply: {0}")]
    Malformed(String),

    /// I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The backend-side counterpart of a request.
///
/// Closing the handle asks the backend to abandon the interaction it is
/// running on behalf of the request.
#[derive(Debug, Clone)]
pub struct BackendHandle {
    path: Arc<str>,
    token: CancellationToken,
}

impl BackendHandle {
    /// Create a handle mirroring the request at `path`.
    pub fn new(path: &str) -> Self {
        Self {
            path: Arc::from(path),
            token: CancellationToken::new(),
        }
    }

    /// Object path of the mirrored request.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Ask the backend to abandon the interaction.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether the handle was closed.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the handle is closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// Labels and icon of an access dialog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessOptions {
    /// Label of the deny button.
    pub deny_label: Option<String>,
    /// Label of the grant button.
    pub grant_label: Option<String>,
    /// Themed icon name.
    pub icon: Option<String>,
}

/// Content of an access dialog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessDialog {
    /// Question shown as the heading.
    pub title: String,
    /// Who is asking for what.
    pub subtitle: String,
    /// Additional explanation.
    pub body: String,
    /// Buttons and icon.
    pub options: AccessOptions,
}

/// Outcome of an access dialog.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessResponse {
    /// `Success` means granted.
    pub response: ResponseCode,
    /// Backend-specific results.
    pub results: Options,
}

impl AccessResponse {
    /// Whether access was granted.
    pub fn granted(&self) -> bool {
        self.response == ResponseCode::Success
    }
}

/// Shows consent dialogs.
#[async_trait]
pub trait AccessBackend: Send + Sync {
    /// Ask the user whether `app_id` may proceed.
    ///
    /// Must return promptly with `Cancelled` once `handle` is closed.
    async fn access_dialog(
        &self,
        handle: &BackendHandle,
        app_id: &str,
        parent_window: &str,
        dialog: &AccessDialog,
    ) -> Result<AccessResponse, BackendError>;
}

bitflags! {
    /// Flags for [`DocumentStore::batch_add`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DocumentAddFlags: u32 {
        /// Return the existing document id if the file is already exported.
        const REUSE_EXISTING   = 1 << 0;
        /// Only create a document if the app cannot already see the file.
        const AS_NEEDED_BY_APP = 1 << 2;
    }
}

bitflags! {
    /// Permissions granted to the target app on added documents.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DocumentPermissions: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl DocumentPermissions {
    /// Permission names as used by the document store.
    pub fn names(self) -> Vec<String> {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect()
    }
}

/// The document store exposing host files inside sandboxes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Directory under which document ids are mounted.
    fn mount_point(&self) -> &Path;

    /// Register `fds` on behalf of `owner` for `target_app_id`.
    ///
    /// Returns one id per descriptor, in order. An empty id means the
    /// target can already see the file at its host path.
    async fn batch_add(
        &self,
        fds: &[OwnedFd],
        flags: DocumentAddFlags,
        owner: &AppInfo,
        target_app_id: &str,
        permissions: DocumentPermissions,
    ) -> Result<Vec<String>, BackendError>;
}

/// Receives the actions a user activates on shown notifications.
pub trait ActionListener: Send + Sync {
    /// `action` of notification `id` of `app_id` was activated.
    fn action_invoked(&self, app_id: &str, id: &str, action: &str, parameter: Vec<Value>);
}

/// Displays desktop notifications.
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    /// Show or replace the notification `id` of `app_id`.
    ///
    /// Activations of the notification's default action or buttons are
    /// reported to `listener` for as long as the notification is shown.
    async fn add_notification(
        &self,
        app_id: &str,
        id: &str,
        notification: &Options,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), BackendError>;

    /// Withdraw the notification `id` of `app_id`.
    async fn remove_notification(&self, app_id: &str, id: &str) -> Result<(), BackendError>;
}

/// Activates actions exported by other applications.
#[async_trait]
pub trait ActionActivator: Send + Sync {
    /// Activate `action` of `application`.
    async fn activate_action(
        &self,
        application: &str,
        action: &str,
        parameters: &[Value],
        platform_data: &Options,
    ) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_handle_close() {
        let handle = BackendHandle::new("/org/freedesktop/portal/desktop/request/1_1/t");
        let clone = handle.clone();
        assert!(!clone.is_closed());

        handle.close();
        assert!(clone.is_closed());
        assert_eq!(clone.path(), "/org/freedesktop/portal/desktop/request/1_1/t");
    }

    #[tokio::test]
    async fn test_backend_handle_closed_resolves() {
        let handle = BackendHandle::new("/x");
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.closed().await });

        handle.close();
        task.await.unwrap();
    }

    #[test]
    fn test_document_flags() {
        let flags = DocumentAddFlags::REUSE_EXISTING | DocumentAddFlags::AS_NEEDED_BY_APP;
        assert_eq!(flags.bits(), 0b101);
        assert!(flags.contains(DocumentAddFlags::REUSE_EXISTING));
        assert!(!DocumentAddFlags::REUSE_EXISTING.contains(DocumentAddFlags::AS_NEEDED_BY_APP));
        assert!(DocumentAddFlags::empty().contains(DocumentAddFlags::empty()));
    }

    #[test]
    fn test_document_permission_names() {
        let perms = DocumentPermissions::READ | DocumentPermissions::WRITE;
        assert_eq!(perms.names(), vec!["read", "write"]);
        assert!(DocumentPermissions::empty().names().is_empty());
    }
}
