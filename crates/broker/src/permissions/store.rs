//! Persistent permission tables.
//!
//! Permissions are kept per table, per object id, per application id as a
//! list of strings. The store persists to `permissions.json` in the
//! broker's data directory.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// All permissions recorded for one object id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionEntry {
    /// Per-application permission strings.
    #[serde(default)]
    pub permissions: BTreeMap<String, Vec<String>>,
    /// Opaque data attached to the object.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Access to the permission tables.
pub trait PermissionStore: Send + Sync {
    /// Look up all permissions recorded for `id` in `table`.
    fn lookup(&self, table: &str, id: &str) -> Result<PermissionEntry>;

    /// Replace the permissions of `app_id` on `id`.
    ///
    /// Creates `table` if `create` is set; otherwise a missing table is an error.
    fn set_permission(
        &self,
        table: &str,
        create: bool,
        id: &str,
        app_id: &str,
        permissions: &[String],
    ) -> Result<()>;

    /// Remove the permissions of `app_id` on `id`.
    fn delete_permission(&self, table: &str, id: &str, app_id: &str) -> Result<()>;

    /// Object ids present in `table`, sorted.
    fn list(&self, table: &str) -> Result<Vec<String>>;
}

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct PermissionStoreData {
    version: u32,
    #[serde(default)]
    tables: BTreeMap<String, BTreeMap<String, PermissionEntry>>,
}

type Tables = HashMap<String, HashMap<String, PermissionEntry>>;

/// JSON-file backed permission store.
///
/// The tables live in a `RwLock<HashMap>`; every mutation is written back
/// with an atomic temp-file rename. A store without a path stays in memory.
///
/// Mutations snapshot the tables under the lock and write the snapshot
/// after releasing it. Writes are serialized by a separate lock that
/// remembers the newest generation on disk, so a late older snapshot never
/// replaces a newer one.
#[derive(Debug)]
pub struct FilePermissionStore {
    path: Option<PathBuf>,
    tables: RwLock<Tables>,
    /// Bumped on every mutation, under the tables write lock.
    generation: AtomicU64,
    /// Generation of the snapshot last written to disk.
    saved: Mutex<u64>,
}

impl FilePermissionStore {
    /// Creates a store persisting to `path`. Call [`load`](Self::load) to read it.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            tables: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            saved: Mutex::new(0),
        }
    }

    /// Creates a store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            saved: Mutex::new(0),
        }
    }

    /// Creates a store at `path` and loads it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Table names, sorted.
    pub fn tables(&self) -> Result<Vec<String>> {
        let tables = self.read()?;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Load the store from disk, replacing the in-memory tables.
    pub fn load(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            tracing::debug!("Permission store not found at {:?}, starting empty", path);
            return Ok(());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read permission store: {}", path.display()))?;
        let data: PermissionStoreData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse permission store: {}", path.display()))?;

        let mut tables = self.write()?;
        tables.clear();
        for (name, entries) in data.tables {
            tables.insert(name, entries.into_iter().collect());
        }

        tracing::info!("Loaded {} permission tables from {:?}", tables.len(), path);
        Ok(())
    }

    /// Persist the store to disk.
    pub fn save(&self) -> Result<()> {
        let snapshot = {
            let tables = self.read()?;
            Self::snapshot(&tables)
        };
        self.persist(self.generation.load(Ordering::SeqCst), snapshot)
    }

    fn snapshot(tables: &Tables) -> PermissionStoreData {
        PermissionStoreData {
            version: 1,
            tables: tables
                .iter()
                .map(|(name, entries)| {
                    let entries = entries
                        .iter()
                        .map(|(id, entry)| (id.clone(), entry.clone()))
                        .collect();
                    (name.clone(), entries)
                })
                .collect(),
        }
    }

    /// Snapshot of a just-mutated table set, tagged with a new generation.
    /// Must be called with the tables write lock held.
    fn mutated(&self, tables: &Tables) -> (u64, PermissionStoreData) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        (generation, Self::snapshot(tables))
    }

    fn persist(&self, generation: u64, data: PermissionStoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut saved = self
            .saved
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire save lock on permission store"))?;
        if generation < *saved {
            tracing::trace!(generation, saved = *saved, "Skipping stale permission snapshot");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create permission store directory: {}",
                    parent.display()
                )
            })?;
        }

        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize permission store")?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp permission store: {}", temp_path.display())
        })?;
        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "Failed to rename temp permission store {} to {}",
                temp_path.display(),
                path.display()
            )
        })?;

        *saved = generation;
        tracing::debug!("Saved {} permission tables to {:?}", data.tables.len(), path);
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on permission store"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on permission store"))
    }
}

impl PermissionStore for FilePermissionStore {
    fn lookup(&self, table: &str, id: &str) -> Result<PermissionEntry> {
        let tables = self.read()?;
        let entry = tables
            .get(table)
            .with_context(|| format!("No such table: {}", table))?
            .get(id)
            .with_context(|| format!("No entry for {} in table {}", id, table))?;
        Ok(entry.clone())
    }

    fn set_permission(
        &self,
        table: &str,
        create: bool,
        id: &str,
        app_id: &str,
        permissions: &[String],
    ) -> Result<()> {
        let (generation, snapshot) = {
            let mut tables = self.write()?;
            if !create && !tables.contains_key(table) {
                anyhow::bail!("No such table: {}", table);
            }
            tables
                .entry(table.to_string())
                .or_default()
                .entry(id.to_string())
                .or_default()
                .permissions
                .insert(app_id.to_string(), permissions.to_vec());
            self.mutated(&tables)
        };

        self.persist(generation, snapshot)
    }

    fn delete_permission(&self, table: &str, id: &str, app_id: &str) -> Result<()> {
        let (generation, snapshot) = {
            let mut tables = self.write()?;
            let entries = tables
                .get_mut(table)
                .with_context(|| format!("No such table: {}", table))?;
            let entry = entries
                .get_mut(id)
                .with_context(|| format!("No entry for {} in table {}", id, table))?;
            if entry.permissions.remove(app_id).is_none() {
                anyhow::bail!("No permissions for {} on {} in table {}", app_id, id, table);
            }
            if entry.permissions.is_empty() && entry.data.is_null() {
                entries.remove(id);
            }
            self.mutated(&tables)
        };

        self.persist(generation, snapshot)
    }

    fn list(&self, table: &str) -> Result<Vec<String>> {
        let tables = self.read()?;
        let mut ids: Vec<String> = tables
            .get(table)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }
}
