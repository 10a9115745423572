//! Resolving the application identity of a connected peer.

use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::{debug, warn};

use super::{AppInfo, IdentityError};
use crate::bus::Connection;

/// Maps a bus connection to the identity of the application behind it.
pub trait IdentityResolver: Send + Sync {
    /// Resolve the identity of `connection`.
    fn resolve(&self, connection: &Connection) -> Result<AppInfo, IdentityError>;
}

/// Resolves identities from the peer's process credentials.
///
/// A Flatpak sandbox is recognised by the `.flatpak-info` file at the root
/// of the peer's mount namespace; everything else is the host.
#[derive(Debug, Clone)]
pub struct ProcIdentityResolver {
    proc_root: PathBuf,
}

impl Default for ProcIdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcIdentityResolver {
    /// Resolver reading from `/proc`.
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Resolver reading from an alternative proc mount.
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn resolve_pid(&self, pid: i32) -> Result<AppInfo, IdentityError> {
        let info_path = self
            .proc_root
            .join(pid.to_string())
            .join("root")
            .join(".flatpak-info");

        match std::fs::read_to_string(&info_path) {
            Ok(contents) => {
                let id = parse_flatpak_info(&contents)?;
                debug!(pid, app_id = %id, "Resolved sandboxed peer");
                Ok(AppInfo::sandboxed(id))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(AppInfo::host()),
            Err(e) => {
                warn!(pid, error = %e, "Failed to inspect peer root");
                Err(IdentityError::Io(e))
            }
        }
    }
}

impl IdentityResolver for ProcIdentityResolver {
    fn resolve(&self, connection: &Connection) -> Result<AppInfo, IdentityError> {
        let pid = connection.pid().ok_or_else(|| {
            IdentityError::UnknownPeer(format!(
                "no credentials for {}",
                connection.unique_name()
            ))
        })?;
        self.resolve_pid(pid)
    }
}

/// Extracts the application id from a `.flatpak-info` keyfile.
fn parse_flatpak_info(contents: &str) -> Result<String, IdentityError> {
    let mut in_application = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_application = line == "[Application]";
            continue;
        }
        if !in_application {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "name" && !value.trim().is_empty() {
                return Ok(value.trim().to_string());
            }
        }
    }
    Err(IdentityError::Malformed(
        "no application name in .flatpak-info".to_string(),
    ))
}
