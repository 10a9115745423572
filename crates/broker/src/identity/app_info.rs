//! Resolved application identity of a caller.

use std::fs::File;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use super::desktop;
use super::IdentityError;

/// Identity of the application behind a bus connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppInfo {
    id: String,
    sandboxed: bool,
}

/// A descriptor resolved to the file it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Absolute path of the file.
    pub path: PathBuf,
    /// Whether the descriptor was opened for writing.
    pub writable: bool,
}

impl AppInfo {
    /// The unsandboxed host identity. Its id is the empty string.
    pub fn host() -> Self {
        Self {
            id: String::new(),
            sandboxed: false,
        }
    }

    /// A sandboxed application with the given id.
    pub fn sandboxed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sandboxed: true,
        }
    }

    /// Application id; empty for the host.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this is the unsandboxed host identity.
    pub fn is_host(&self) -> bool {
        !self.sandboxed
    }

    /// The declared display name from the application's desktop entry.
    ///
    /// `None` for the host or when no desktop entry names the application.
    pub fn display_name(&self) -> Option<String> {
        if self.id.is_empty() {
            return None;
        }
        desktop::display_name(&self.id)
    }

    /// Resolves a descriptor passed by this application to a real path.
    ///
    /// The descriptor must refer to an existing regular file. It is writable
    /// when opened `O_WRONLY` or `O_RDWR`; `O_PATH` descriptors never are.
    pub fn resolve_fd_path(&self, fd: BorrowedFd<'_>) -> Result<ResolvedPath, IdentityError> {
        let raw = fd.as_raw_fd();

        let flags = fcntl(raw, FcntlArg::F_GETFL)
            .map_err(|e| IdentityError::InvalidDescriptor(format!("fd {}: {}", raw, e)))?;
        let flags = OFlag::from_bits_truncate(flags);
        let access = flags & OFlag::O_ACCMODE;
        let writable = !flags.contains(OFlag::O_PATH)
            && (access == OFlag::O_WRONLY || access == OFlag::O_RDWR);

        let link = std::fs::read_link(format!("/proc/self/fd/{}", raw))
            .map_err(|e| IdentityError::InvalidDescriptor(format!("fd {}: {}", raw, e)))?;

        // Sockets, pipes and anonymous inodes read back as e.g. "socket:[1234]".
        if !link.is_absolute() {
            return Err(IdentityError::NotRegularFile(link));
        }
        if link.to_string_lossy().ends_with(" (deleted)") {
            return Err(IdentityError::Deleted(link));
        }

        let file = File::from(fd.try_clone_to_owned()?);
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(IdentityError::NotRegularFile(link));
        }

        Ok(ResolvedPath {
            path: link,
            writable,
        })
    }
}
