//! Typed access to the permission store for portal code.
//!
//! Store failures never reach callers: reads degrade to "unset" and writes
//! are logged and dropped, so a broken store cannot wedge a portal.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::store::PermissionStore;

/// Recorded decision for an (object, application) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    /// Nothing recorded.
    #[default]
    Unset,
    No,
    Yes,
    Ask,
}

impl Permission {
    /// Stored string form; `Unset` has none.
    pub fn as_str(self) -> Option<&'static str> {
        match self {
            Permission::Unset => None,
            Permission::No => Some("no"),
            Permission::Yes => Some("yes"),
            Permission::Ask => Some("ask"),
        }
    }

    /// Parse the stored string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no" => Some(Permission::No),
            "yes" => Some(Permission::Yes),
            "ask" => Some(Permission::Ask),
            _ => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("unset"))
    }
}

/// A decision together with the time it was last used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoredPermission {
    pub permission: Permission,
    /// Unix timestamp in seconds.
    pub last_used: Option<i64>,
}

/// Permission store client shared by the portals.
#[derive(Clone)]
pub struct PermissionStoreClient {
    store: Arc<dyn PermissionStore>,
}

impl fmt::Debug for PermissionStoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionStoreClient").finish_non_exhaustive()
    }
}

impl PermissionStoreClient {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn PermissionStore> {
        &self.store
    }

    /// Raw permission strings of `app_id` on `id`, or `None` if unavailable.
    pub fn get_permission_strv(&self, table: &str, id: &str, app_id: &str) -> Option<Vec<String>> {
        match self.store.lookup(table, id) {
            Ok(entry) => entry.permissions.get(app_id).cloned(),
            Err(e) => {
                debug!(table, id, error = %e, "No permissions found");
                None
            }
        }
    }

    /// Store raw permission strings for `app_id` on `id`.
    pub fn set_permission_strv(&self, table: &str, id: &str, app_id: &str, values: &[String]) {
        if let Err(e) = self.store.set_permission(table, true, id, app_id, values) {
            warn!(table, id, app_id, error = %e, "Error updating permission store");
        }
    }

    /// Decision and last-use time of `app_id` on `id`.
    pub fn get_permission(&self, table: &str, id: &str, app_id: &str) -> StoredPermission {
        let Some(values) = self.get_permission_strv(table, id, app_id) else {
            return StoredPermission::default();
        };

        if values.is_empty() || values.len() > 2 {
            warn!(table, id, app_id, "Wrong permission format, ignoring");
            return StoredPermission::default();
        }

        let Some(permission) = Permission::parse(&values[0]) else {
            warn!(table, id, app_id, value = %values[0], "Unknown permission, ignoring");
            return StoredPermission::default();
        };

        let last_used = values.get(1).and_then(|stamp| match stamp.parse::<i64>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(table, id, app_id, value = %stamp, "Malformed timestamp, ignoring");
                None
            }
        });

        StoredPermission {
            permission,
            last_used,
        }
    }

    /// Record a decision for `app_id` on `id`. `Unset` is not storable and is ignored.
    pub fn set_permission(
        &self,
        table: &str,
        id: &str,
        app_id: &str,
        permission: Permission,
        last_used: Option<i64>,
    ) {
        let Some(value) = permission.as_str() else {
            warn!(table, id, app_id, "Refusing to store unset permission");
            return;
        };
        let mut values = vec![value.to_string()];
        if let Some(stamp) = last_used {
            values.push(stamp.to_string());
        }
        self.set_permission_strv(table, id, app_id, &values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::store::FilePermissionStore;

    fn client() -> PermissionStoreClient {
        PermissionStoreClient::new(Arc::new(FilePermissionStore::in_memory()))
    }

    fn strv(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_permission_strings() {
        for permission in [Permission::No, Permission::Yes, Permission::Ask] {
            let s = permission.as_str().unwrap();
            assert_eq!(Permission::parse(s), Some(permission));
        }
        assert_eq!(Permission::Unset.as_str(), None);
        assert_eq!(Permission::parse("maybe"), None);
        assert_eq!(Permission::Unset.to_string(), "unset");
    }

    #[test]
    fn test_unset_when_missing() {
        let client = client();
        assert_eq!(client.get_permission("t", "id", "app"), StoredPermission::default());
        assert!(client.get_permission_strv("t", "id", "app").is_none());
    }

    #[test]
    fn test_set_and_get_with_timestamp() {
        let client = client();
        client.set_permission("t", "id", "app", Permission::Yes, Some(1_700_000_000));

        assert_eq!(
            client.get_permission_strv("t", "id", "app"),
            Some(strv(&["yes", "1700000000"]))
        );
        assert_eq!(
            client.get_permission("t", "id", "app"),
            StoredPermission {
                permission: Permission::Yes,
                last_used: Some(1_700_000_000),
            }
        );
    }

    #[test]
    fn test_set_unset_is_ignored() {
        let client = client();
        client.set_permission("t", "id", "app", Permission::Unset, None);
        assert!(client.get_permission_strv("t", "id", "app").is_none());
    }

    #[test]
    fn test_malformed_values_degrade() {
        let client = client();
        client.set_permission_strv("t", "id", "empty", &[]);
        client.set_permission_strv("t", "id", "long", &strv(&["yes", "1", "2"]));
        client.set_permission_strv("t", "id", "bogus", &strv(&["perhaps"]));
        client.set_permission_strv("t", "id", "badstamp", &strv(&["no", "soon"]));

        assert_eq!(client.get_permission("t", "id", "empty").permission, Permission::Unset);
        assert_eq!(client.get_permission("t", "id", "long").permission, Permission::Unset);
        assert_eq!(client.get_permission("t", "id", "bogus").permission, Permission::Unset);
        assert_eq!(
            client.get_permission("t", "id", "badstamp"),
            StoredPermission {
                permission: Permission::No,
                last_used: None,
            }
        );
    }
}
