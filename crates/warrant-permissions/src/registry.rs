//! Registry of permission definitions.
//!
//! Definitions are registered once and referenced afterwards. Registering a
//! name that already exists is a no-op, so `init_perms` can run at every
//! startup without creating duplicates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{PermissionError, PermissionResult};
use crate::matcher;
use crate::permission::Permission;

/// Permissions the engine itself defines under the `core` namespace.
pub const CORE_PERMISSIONS: &[(&str, &str)] = &[
    ("core.key.list.all", "List every user's API keys"),
    ("core.user.list", "List user accounts"),
    ("core.user.permission.list", "List the permissions held by a user"),
    ("core.application.manage", "Create and edit any application"),
    ("core.grant.migrate", "Run the legacy grant migration"),
    ("core.maintenance.run", "Run credential and identity maintenance jobs"),
];

/// A registered permission and its human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDefinition {
    /// The permission name. Never a wildcard.
    pub name: Permission,
    /// What the permission allows.
    pub description: String,
}

impl PermissionDefinition {
    /// Create a definition from a name and description.
    ///
    /// # Errors
    ///
    /// Returns an error if the name does not parse or is a wildcard.
    pub fn new(name: &str, description: impl Into<String>) -> PermissionResult<Self> {
        let name = Permission::new(name)?;
        if name.is_wildcard() {
            return Err(PermissionError::WildcardDefinition(name.to_string()));
        }
        Ok(Self {
            name,
            description: description.into(),
        })
    }
}

/// Thread-safe registry of permission definitions.
#[derive(Debug, Default)]
pub struct PermissionRegistry {
    definitions: RwLock<BTreeMap<Permission, PermissionDefinition>>,
}

impl PermissionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with [`CORE_PERMISSIONS`].
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn with_core() -> PermissionResult<Self> {
        let registry = Self::new();
        registry.init_perms(CORE_PERMISSIONS.iter().copied())?;
        Ok(registry)
    }

    /// Register a batch of `(name, description)` definitions.
    ///
    /// Existing names are left untouched. Returns the number of newly
    /// registered definitions.
    ///
    /// # Errors
    ///
    /// Returns an error if any name is invalid or a wildcard; nothing is
    /// registered in that case.
    pub fn init_perms<'a, I>(&self, defs: I) -> PermissionResult<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let parsed = defs
            .into_iter()
            .map(|(name, description)| PermissionDefinition::new(name, description))
            .collect::<PermissionResult<Vec<_>>>()?;

        let mut definitions = self
            .definitions
            .write()
            .map_err(|e| PermissionError::StorageError(e.to_string()))?;

        let mut added: usize = 0;
        for def in parsed {
            if definitions.contains_key(&def.name) {
                continue;
            }
            tracing::debug!(permission = %def.name, "registered permission");
            definitions.insert(def.name.clone(), def);
            added = added.saturating_add(1);
        }

        Ok(added)
    }

    /// Register a single definition. Returns `false` if it already existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn register(&self, def: PermissionDefinition) -> PermissionResult<bool> {
        let mut definitions = self
            .definitions
            .write()
            .map_err(|e| PermissionError::StorageError(e.to_string()))?;
        if definitions.contains_key(&def.name) {
            return Ok(false);
        }
        definitions.insert(def.name.clone(), def);
        Ok(true)
    }

    /// Look up a definition.
    #[must_use]
    pub fn get(&self, name: &Permission) -> Option<PermissionDefinition> {
        let definitions = self.definitions.read().unwrap_or_else(|e| {
            tracing::warn!("PermissionRegistry read lock poisoned, recovering");
            e.into_inner()
        });
        definitions.get(name).cloned()
    }

    /// Whether a definition exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &Permission) -> bool {
        self.get(name).is_some()
    }

    /// Number of registered definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.read().map_or(0, |d| d.len())
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered permissions that `held` currently covers.
    ///
    /// Computed on every call against the current registry contents.
    #[must_use]
    pub fn covered_by<'a, H>(&self, held: H) -> Vec<Permission>
    where
        H: IntoIterator<Item = &'a Permission> + Clone,
    {
        let definitions = self.definitions.read().unwrap_or_else(|e| {
            tracing::warn!("PermissionRegistry read lock poisoned, recovering");
            e.into_inner()
        });
        definitions
            .keys()
            .filter(|name| matcher::matches(held.clone(), name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_perms_is_idempotent() {
        let registry = PermissionRegistry::new();
        let defs = [("core.user.list", "list"), ("core.key.list.all", "keys")];

        assert_eq!(registry.init_perms(defs).unwrap(), 2);
        assert_eq!(registry.init_perms(defs).unwrap(), 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_init_perms_keeps_first_description() {
        let registry = PermissionRegistry::new();
        registry.init_perms([("core.user.list", "first")]).unwrap();
        registry.init_perms([("core.user.list", "second")]).unwrap();

        let def = registry
            .get(&Permission::new("core.user.list").unwrap())
            .unwrap();
        assert_eq!(def.description, "first");
    }

    #[test]
    fn test_wildcard_definition_rejected() {
        let registry = PermissionRegistry::new();
        let result = registry.init_perms([("core.user.list", "ok"), ("core.*", "bad")]);
        assert!(matches!(result, Err(PermissionError::WildcardDefinition(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_covered_by_sees_later_registrations() {
        let registry = PermissionRegistry::with_core().unwrap();
        let held = [Permission::new("core.*").unwrap()];

        let before = registry.covered_by(&held).len();
        assert_eq!(before, CORE_PERMISSIONS.len());

        registry
            .init_perms([("core.audit.read", "Read the audit log")])
            .unwrap();
        assert_eq!(registry.covered_by(&held).len(), before + 1);
    }

    #[test]
    fn test_covered_by_respects_namespace() {
        let registry = PermissionRegistry::with_core().unwrap();
        registry.init_perms([("jabber.send", "send")]).unwrap();

        let held = [Permission::new("jabber.*").unwrap()];
        let covered = registry.covered_by(&held);
        assert_eq!(covered, vec![Permission::new("jabber.send").unwrap()]);
    }
}
