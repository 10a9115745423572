//! Persistent per-application permission decisions.

pub mod client;
pub mod store;

pub use client::{Permission, PermissionStoreClient, StoredPermission};
pub use store::{FilePermissionStore, PermissionEntry, PermissionStore};
