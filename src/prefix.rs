//! Scan prefixes
//!
//! A prefix is prepended to every scan before rule matching. Admins keep a
//! list of them and pick at most one as active; activating a prefix
//! deactivates every other one.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::{keys, Persistence, PersistenceExt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prefix {
    pub id: String,
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Prefix {
    pub fn new(id: &str, name: &str, value: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            value: value.to_string(),
            active: false,
            description: None,
        }
    }

    /// `self.value + scan`
    pub fn apply(&self, scan: &str) -> String {
        format!("{}{}", self.value, scan)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrefixError {
    #[error("Prefix '{0}' not found")]
    NotFound(String),

    #[error("Prefix '{0}' already exists")]
    DuplicateId(String),

    #[error("Prefix name cannot be empty")]
    EmptyName,
}

/// Persisted prefix list with exclusive activation
pub struct PrefixStore {
    prefixes: RwLock<Arc<Vec<Prefix>>>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl std::fmt::Debug for PrefixStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixStore")
            .field("prefixes", &self.prefixes.read().len())
            .field("active", &self.active().map(|p| p.id))
            .finish()
    }
}

impl Default for PrefixStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixStore {
    pub fn new() -> Self {
        Self {
            prefixes: RwLock::new(Arc::new(Vec::new())),
            persistence: None,
        }
    }

    /// Load stored prefixes. If the stored list has several active entries
    /// only the first keeps its flag.
    pub fn load(persistence: Arc<dyn Persistence>) -> Self {
        let mut stored: Vec<Prefix> = persistence.load(keys::PREFIXES, Vec::new());
        let mut seen_active = false;
        for prefix in stored.iter_mut() {
            if prefix.active {
                if seen_active {
                    tracing::warn!("Stored prefix '{}' was also active, deactivated", prefix.id);
                    prefix.active = false;
                }
                seen_active = true;
            }
        }
        Self {
            prefixes: RwLock::new(Arc::new(stored)),
            persistence: Some(persistence),
        }
    }

    pub fn all(&self) -> Arc<Vec<Prefix>> {
        self.prefixes.read().clone()
    }

    pub fn active(&self) -> Option<Prefix> {
        self.prefixes.read().iter().find(|p| p.active).cloned()
    }

    /// Add a prefix. A prefix added as active takes over the active slot.
    pub fn add(&self, prefix: Prefix) -> Result<(), PrefixError> {
        if prefix.name.trim().is_empty() {
            return Err(PrefixError::EmptyName);
        }
        self.edit(|list| {
            if list.iter().any(|p| p.id == prefix.id) {
                return Err(PrefixError::DuplicateId(prefix.id.clone()));
            }
            if prefix.active {
                list.iter_mut().for_each(|p| p.active = false);
            }
            list.push(prefix);
            Ok(())
        })
    }

    pub fn remove(&self, id: &str) -> Result<Prefix, PrefixError> {
        let mut removed = None;
        self.edit(|list| {
            let index = list
                .iter()
                .position(|p| p.id == id)
                .ok_or_else(|| PrefixError::NotFound(id.to_string()))?;
            removed = Some(list.remove(index));
            Ok(())
        })?;
        removed.ok_or_else(|| PrefixError::NotFound(id.to_string()))
    }

    /// Make `id` the only active prefix
    pub fn activate(&self, id: &str) -> Result<(), PrefixError> {
        self.edit(|list| {
            if !list.iter().any(|p| p.id == id) {
                return Err(PrefixError::NotFound(id.to_string()));
            }
            for prefix in list.iter_mut() {
                prefix.active = prefix.id == id;
            }
            Ok(())
        })?;
        tracing::info!("Prefix '{}' activated", id);
        Ok(())
    }

    pub fn deactivate_all(&self) {
        {
            let mut guard = self.prefixes.write();
            let next = guard
                .iter()
                .cloned()
                .map(|p| Prefix { active: false, ..p })
                .collect();
            *guard = Arc::new(next);
        }
        self.persist();
        tracing::info!("All prefixes deactivated");
    }

    /// Apply the active prefix (if any) to `scan`
    pub fn apply(&self, scan: &str) -> String {
        match self.active() {
            Some(prefix) => prefix.apply(scan),
            None => scan.to_string(),
        }
    }

    fn edit<F>(&self, f: F) -> Result<(), PrefixError>
    where
        F: FnOnce(&mut Vec<Prefix>) -> Result<(), PrefixError>,
    {
        {
            let mut guard = self.prefixes.write();
            let mut next = guard.as_ref().clone();
            f(&mut next)?;
            *guard = Arc::new(next);
        }
        self.persist();
        Ok(())
    }

    fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.save(keys::PREFIXES, self.all().as_ref()) {
                tracing::error!("Failed to persist prefixes: {}", e);
            }
        }
    }
}
