//! Document store used when no document service is available.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{BackendError, DocumentAddFlags, DocumentPermissions, DocumentStore};
use crate::identity::AppInfo;

/// Registers nothing and reports every file as already visible to the
/// target, so recipients receive host paths.
#[derive(Debug, Clone)]
pub struct PassthroughDocumentStore {
    mount_point: PathBuf,
}

impl PassthroughDocumentStore {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
        }
    }
}

#[async_trait]
impl DocumentStore for PassthroughDocumentStore {
    fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    async fn batch_add(
        &self,
        fds: &[OwnedFd],
        flags: DocumentAddFlags,
        owner: &AppInfo,
        target_app_id: &str,
        permissions: DocumentPermissions,
    ) -> Result<Vec<String>, BackendError> {
        debug!(
            count = fds.len(),
            flags = flags.bits(),
            owner = owner.id(),
            target = target_app_id,
            permissions = ?permissions.names(),
            "Passing files through without documents"
        );
        Ok(vec![String::new(); fds.len()])
    }
}
