//! Field registry boundary
//!
//! A field is a named value on the host form. The core never sees selectors
//! or commit events; it only reads and writes values by key through the
//! [`FieldRegistry`] trait. [`FieldCatalog`] owns the descriptor list (ten
//! built-in defaults plus admin-defined fields) and [`MemoryFieldRegistry`]
//! is an in-process host stand-in used by the terminal driver and tests.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::storage::{keys, Persistence, PersistenceExt};

/// What a field is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    /// Shown in the status ticker
    Ticker,
    /// Included in the snapshot handed to the rule engine
    Read,
    /// May be written by rules and macros
    Write,
}

/// Describes how to reach one value on the host form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub key: String,
    pub label: String,
    pub selector: String,
    /// Event dispatched after a write so the host form notices the change
    pub commit_event: String,
    pub roles: BTreeSet<FieldRole>,
    /// Seeded by default rather than defined by an admin
    #[serde(default)]
    pub builtin: bool,
    /// A built-in that an admin has edited
    #[serde(default)]
    pub modified: bool,
}

impl FieldDescriptor {
    pub fn new(key: &str, label: &str, roles: &[FieldRole]) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            selector: format!("[data-field=\"{}\"]", key),
            commit_event: "change".to_string(),
            roles: roles.iter().copied().collect(),
            builtin: false,
            modified: false,
        }
    }

    pub fn has_role(&self, role: FieldRole) -> bool {
        self.roles.contains(&role)
    }

    fn builtin(key: &str, label: &str, roles: &[FieldRole]) -> Self {
        Self {
            builtin: true,
            ..Self::new(key, label, roles)
        }
    }
}

/// The ten descriptors every installation starts with
pub fn default_descriptors() -> Vec<FieldDescriptor> {
    use FieldRole::{Read, Ticker, Write};
    vec![
        FieldDescriptor::builtin("asset_tag", "Asset tag", &[Ticker, Read, Write]),
        FieldDescriptor::builtin("serial_number", "Serial number", &[Ticker, Read, Write]),
        FieldDescriptor::builtin("type", "Type", &[Ticker, Read, Write]),
        FieldDescriptor::builtin("model", "Model", &[Read, Write]),
        FieldDescriptor::builtin("assigned_to", "Assigned to", &[Ticker, Read, Write]),
        FieldDescriptor::builtin("location", "Location", &[Read, Write]),
        FieldDescriptor::builtin("department", "Department", &[Read, Write]),
        FieldDescriptor::builtin("state", "State", &[Ticker, Read, Write]),
        FieldDescriptor::builtin("ticket", "Ticket", &[Read, Write]),
        FieldDescriptor::builtin("comments", "Comments", &[Read, Write]),
    ]
}

/// Field errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("Field '{0}' already exists")]
    DuplicateKey(String),

    #[error("Field '{0}' is built in and cannot be removed")]
    BuiltinField(String),

    #[error("Field key cannot be empty")]
    EmptyKey,

    #[error("Field '{0}' is not writable")]
    NotWritable(String),

    #[error("Write to '{key}' failed: {reason}")]
    WriteFailed { key: String, reason: String },
}

/// Options for a single field write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Dispatch the descriptor's commit event after writing
    pub commit: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { commit: true }
    }
}

/// Read/write access to host form values
pub trait FieldRegistry: Send + Sync {
    /// Current value of `key`; empty when the field is unknown or blank
    fn read(&self, key: &str) -> String;

    /// Write `value` to `key`. Returns `Ok(false)` when the field already
    /// held `value` and nothing was written.
    fn write(&self, key: &str, value: &str, opts: WriteOptions) -> Result<bool, FieldError>;

    fn exists(&self, key: &str) -> bool;

    fn for_role(&self, role: FieldRole) -> Vec<FieldDescriptor>;

    /// Every known key, in catalog order
    fn keys(&self) -> Vec<String>;

    /// Read every known key
    fn snapshot(&self) -> HashMap<String, String> {
        self.keys()
            .into_iter()
            .map(|key| {
                let value = self.read(&key);
                (key, value)
            })
            .collect()
    }
}

/// Ordered, persisted set of field descriptors with unique keys
#[derive(Clone)]
pub struct FieldCatalog {
    descriptors: Arc<RwLock<Arc<Vec<FieldDescriptor>>>>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl std::fmt::Debug for FieldCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCatalog")
            .field("descriptors", &self.descriptors.read().len())
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

impl Default for FieldCatalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl FieldCatalog {
    /// Catalog holding only the built-in descriptors, not persisted
    pub fn with_defaults() -> Self {
        Self {
            descriptors: Arc::new(RwLock::new(Arc::new(default_descriptors()))),
            persistence: None,
        }
    }

    /// Load the catalog from `persistence`, seeding defaults on first use.
    /// Built-ins missing from the stored list are re-added.
    pub fn load(persistence: Arc<dyn Persistence>) -> Self {
        let mut stored: Vec<FieldDescriptor> = persistence.load(keys::FIELDS, Vec::new());
        let present: HashSet<String> = stored.iter().map(|d| d.key.clone()).collect();
        for builtin in default_descriptors() {
            if !present.contains(&builtin.key) {
                stored.push(builtin);
            }
        }
        tracing::debug!("Field catalog loaded with {} descriptors", stored.len());
        Self {
            descriptors: Arc::new(RwLock::new(Arc::new(stored))),
            persistence: Some(persistence),
        }
    }

    pub fn all(&self) -> Arc<Vec<FieldDescriptor>> {
        self.descriptors.read().clone()
    }

    pub fn get(&self, key: &str) -> Option<FieldDescriptor> {
        self.descriptors.read().iter().find(|d| d.key == key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.descriptors.read().iter().any(|d| d.key == key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.descriptors.read().iter().map(|d| d.key.clone()).collect()
    }

    pub fn for_role(&self, role: FieldRole) -> Vec<FieldDescriptor> {
        self.descriptors
            .read()
            .iter()
            .filter(|d| d.has_role(role))
            .cloned()
            .collect()
    }

    /// Add an admin-defined descriptor
    pub fn add(&self, mut descriptor: FieldDescriptor) -> Result<(), FieldError> {
        if descriptor.key.trim().is_empty() {
            return Err(FieldError::EmptyKey);
        }
        descriptor.builtin = false;
        descriptor.modified = false;

        self.update_list(|list| {
            if list.iter().any(|d| d.key == descriptor.key) {
                return Err(FieldError::DuplicateKey(descriptor.key.clone()));
            }
            tracing::info!("Added field '{}'", descriptor.key);
            list.push(descriptor);
            Ok(())
        })
    }

    /// Replace the descriptor for `key`. Editing a built-in marks it modified.
    pub fn update(&self, key: &str, mut descriptor: FieldDescriptor) -> Result<(), FieldError> {
        self.update_list(|list| {
            let index = list
                .iter()
                .position(|d| d.key == key)
                .ok_or_else(|| FieldError::UnknownField(key.to_string()))?;

            if descriptor.key != key && list.iter().any(|d| d.key == descriptor.key) {
                return Err(FieldError::DuplicateKey(descriptor.key.clone()));
            }

            let existing = &list[index];
            descriptor.builtin = existing.builtin;
            descriptor.modified = existing.builtin;
            list[index] = descriptor;
            tracing::info!("Updated field '{}'", key);
            Ok(())
        })
    }

    /// Remove `key`. Unmodified built-ins cannot be removed.
    pub fn remove(&self, key: &str) -> Result<FieldDescriptor, FieldError> {
        let mut removed = None;
        self.update_list(|list| {
            let index = list
                .iter()
                .position(|d| d.key == key)
                .ok_or_else(|| FieldError::UnknownField(key.to_string()))?;
            if list[index].builtin && !list[index].modified {
                return Err(FieldError::BuiltinField(key.to_string()));
            }
            removed = Some(list.remove(index));
            Ok(())
        })?;
        tracing::info!("Removed field '{}'", key);
        removed.ok_or_else(|| FieldError::UnknownField(key.to_string()))
    }

    /// Drop every customisation and restore the built-ins
    pub fn reset_defaults(&self) {
        *self.descriptors.write() = Arc::new(default_descriptors());
        self.persist();
        tracing::info!("Field catalog reset to defaults");
    }

    /// Copy-on-write edit: readers holding the old list are unaffected
    fn update_list<F>(&self, edit: F) -> Result<(), FieldError>
    where
        F: FnOnce(&mut Vec<FieldDescriptor>) -> Result<(), FieldError>,
    {
        {
            let mut guard = self.descriptors.write();
            let mut next = guard.as_ref().clone();
            edit(&mut next)?;
            *guard = Arc::new(next);
        }
        self.persist();
        Ok(())
    }

    fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            let snapshot = self.all();
            if let Err(e) = persistence.save(keys::FIELDS, snapshot.as_ref()) {
                tracing::error!("Failed to persist field catalog: {}", e);
            }
        }
    }
}

/// In-process host form: values live in a map keyed by field key
#[derive(Debug, Default)]
pub struct MemoryFieldRegistry {
    catalog: FieldCatalog,
    values: RwLock<HashMap<String, String>>,
    writes: Mutex<Vec<(String, String)>>,
    failing: RwLock<HashSet<String>>,
}

impl MemoryFieldRegistry {
    pub fn new(catalog: FieldCatalog) -> Self {
        Self {
            catalog,
            ..Self::default()
        }
    }

    pub fn catalog(&self) -> &FieldCatalog {
        &self.catalog
    }

    /// Set a value directly, as if the user had typed it
    pub fn set_value(&self, key: &str, value: &str) {
        self.values
            .write()
            .insert(key.to_string(), value.to_string());
    }

    /// Every write performed through [`FieldRegistry::write`], oldest first
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    /// Make subsequent writes to `key` fail
    pub fn fail_writes_to(&self, key: &str) {
        self.failing.write().insert(key.to_string());
    }
}

impl FieldRegistry for MemoryFieldRegistry {
    fn read(&self, key: &str) -> String {
        self.values.read().get(key).cloned().unwrap_or_default()
    }

    fn write(&self, key: &str, value: &str, opts: WriteOptions) -> Result<bool, FieldError> {
        let descriptor = self
            .catalog
            .get(key)
            .ok_or_else(|| FieldError::UnknownField(key.to_string()))?;
        if !descriptor.has_role(FieldRole::Write) {
            return Err(FieldError::NotWritable(key.to_string()));
        }
        if self.failing.read().contains(key) {
            return Err(FieldError::WriteFailed {
                key: key.to_string(),
                reason: "host rejected the value".to_string(),
            });
        }

        let mut values = self.values.write();
        if values.get(key).map(String::as_str) == Some(value) {
            return Ok(false);
        }
        values.insert(key.to_string(), value.to_string());
        self.writes.lock().push((key.to_string(), value.to_string()));

        if opts.commit {
            tracing::debug!(
                "Field '{}' written, dispatching '{}'",
                key,
                descriptor.commit_event
            );
        }
        Ok(true)
    }

    fn exists(&self, key: &str) -> bool {
        self.catalog.contains(key)
    }

    fn for_role(&self, role: FieldRole) -> Vec<FieldDescriptor> {
        self.catalog.for_role(role)
    }

    fn keys(&self) -> Vec<String> {
        self.catalog.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    // =========================================================================
    // Catalog tests
    // =========================================================================

    #[test]
    fn test_ten_builtin_descriptors() {
        let defaults = default_descriptors();
        assert_eq!(defaults.len(), 10);
        assert!(defaults.iter().all(|d| d.builtin && !d.modified));

        let keys: HashSet<_> = defaults.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys.len(), 10, "built-in keys must be unique");
    }

    #[test]
    fn test_add_rejects_duplicate_and_empty_keys() {
        let catalog = FieldCatalog::with_defaults();
        assert_eq!(
            catalog.add(FieldDescriptor::new("type", "Again", &[FieldRole::Read])),
            Err(FieldError::DuplicateKey("type".to_string()))
        );
        assert_eq!(
            catalog.add(FieldDescriptor::new("  ", "Blank", &[])),
            Err(FieldError::EmptyKey)
        );

        catalog
            .add(FieldDescriptor::new("rack", "Rack", &[FieldRole::Write]))
            .unwrap();
        assert!(catalog.contains("rack"));
        assert_eq!(catalog.all().len(), 11);
    }

    #[test]
    fn test_builtin_cannot_be_removed_until_modified() {
        let catalog = FieldCatalog::with_defaults();
        assert_eq!(
            catalog.remove("ticket"),
            Err(FieldError::BuiltinField("ticket".to_string()))
        );

        let mut edited = catalog.get("ticket").unwrap();
        edited.label = "Incident".to_string();
        catalog.update("ticket", edited).unwrap();
        assert!(catalog.get("ticket").unwrap().modified);

        let removed = catalog.remove("ticket").unwrap();
        assert_eq!(removed.label, "Incident");
        assert!(!catalog.contains("ticket"));
    }

    #[test]
    fn test_custom_field_can_be_removed() {
        let catalog = FieldCatalog::with_defaults();
        catalog
            .add(FieldDescriptor::new("rack", "Rack", &[FieldRole::Write]))
            .unwrap();
        assert!(catalog.remove("rack").is_ok());
    }

    #[test]
    fn test_for_role_filters() {
        let catalog = FieldCatalog::with_defaults();
        let ticker = catalog.for_role(FieldRole::Ticker);
        assert!(ticker.iter().all(|d| d.has_role(FieldRole::Ticker)));
        assert!(ticker.iter().any(|d| d.key == "asset_tag"));
        assert!(!ticker.iter().any(|d| d.key == "comments"));
    }

    #[test]
    fn test_catalog_persists_and_reseeds_builtins() {
        let store: Arc<dyn Persistence> = Arc::new(MemoryStore::new("test"));
        let catalog = FieldCatalog::load(store.clone());
        catalog
            .add(FieldDescriptor::new("rack", "Rack", &[FieldRole::Write]))
            .unwrap();

        let reloaded = FieldCatalog::load(store);
        assert!(reloaded.contains("rack"));
        assert_eq!(reloaded.all().len(), 11);
    }

    #[test]
    fn test_reset_defaults_drops_custom_fields() {
        let catalog = FieldCatalog::with_defaults();
        catalog
            .add(FieldDescriptor::new("rack", "Rack", &[FieldRole::Write]))
            .unwrap();
        catalog.reset_defaults();
        assert!(!catalog.contains("rack"));
        assert_eq!(catalog.all().len(), 10);
    }

    #[test]
    fn test_old_readers_keep_their_snapshot() {
        let catalog = FieldCatalog::with_defaults();
        let before = catalog.all();
        catalog
            .add(FieldDescriptor::new("rack", "Rack", &[FieldRole::Write]))
            .unwrap();
        assert_eq!(before.len(), 10);
        assert_eq!(catalog.all().len(), 11);
    }

    // =========================================================================
    // Registry tests
    // =========================================================================

    #[test]
    fn test_write_if_changed() {
        let registry = MemoryFieldRegistry::default();
        assert_eq!(
            registry.write("type", "Return", WriteOptions::default()),
            Ok(true)
        );
        assert_eq!(
            registry.write("type", "Return", WriteOptions::default()),
            Ok(false)
        );
        assert_eq!(registry.write_count(), 1);
        assert_eq!(registry.read("type"), "Return");
    }

    #[test]
    fn test_write_unknown_field_errors() {
        let registry = MemoryFieldRegistry::default();
        assert_eq!(
            registry.write("nope", "x", WriteOptions::default()),
            Err(FieldError::UnknownField("nope".to_string()))
        );
        assert_eq!(registry.read("nope"), "");
        assert!(!registry.exists("nope"));
    }

    #[test]
    fn test_failing_write() {
        let registry = MemoryFieldRegistry::default();
        registry.fail_writes_to("state");
        assert!(matches!(
            registry.write("state", "x", WriteOptions::default()),
            Err(FieldError::WriteFailed { .. })
        ));
    }

    #[test]
    fn test_snapshot_reads_every_key() {
        let registry = MemoryFieldRegistry::default();
        registry.set_value("asset_tag", "A-1");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 10);
        assert_eq!(snapshot["asset_tag"], "A-1");
        assert_eq!(snapshot["type"], "");
    }

    #[test]
    fn test_descriptor_serialisation_uses_camel_case() {
        let descriptor = FieldDescriptor::new("rack", "Rack", &[FieldRole::Write]);
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(json.contains("\"commitEvent\":\"change\""));
        assert!(json.contains("\"roles\":[\"write\"]"));
    }
}
