//! Registered client applications.
//!
//! An application's short name is the root of its permission namespace
//! (`jabber.*`). Once set it never changes, since grants and wildcard
//! permissions already refer to it.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warrant_core::{ApplicationId, KeyKind, KeyMask, UserId};

use crate::error::{EngineError, EngineResult};

/// Namespace roots applications may not claim.
const RESERVED_SHORT_NAMES: &[&str] = &["core"];

const MAX_SHORT_NAME_LEN: usize = 32;

/// A registered client application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Internal id.
    pub id: ApplicationId,
    /// Display name, unique.
    pub name: String,
    /// Permission namespace root, unique and immutable once set.
    pub short_name: Option<String>,
    /// Scopes a key must grant to be used with this application.
    pub required_mask: KeyMask,
    /// Key kind the application requires, if any.
    pub required_kind: Option<KeyKind>,
    /// Developer who registered the application.
    pub owner: UserId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Application {
    /// Build an application without a short name.
    #[must_use]
    pub fn new(owner: UserId, name: impl Into<String>, required_mask: KeyMask) -> Self {
        Self {
            id: ApplicationId::new(),
            name: name.into(),
            short_name: None,
            required_mask,
            required_kind: None,
            owner,
            created_at: Utc::now(),
        }
    }

    /// Whether the application can be authorized.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.short_name.is_some()
    }
}

/// Check that `name` can serve as a permission namespace root.
///
/// # Errors
///
/// Returns [`EngineError::InvalidShortName`] describing the problem.
pub fn validate_short_name(name: &str) -> EngineResult<()> {
    let invalid = |reason: &str| EngineError::InvalidShortName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };

    if name.is_empty() || name.len() > MAX_SHORT_NAME_LEN {
        return Err(invalid("must be 1 to 32 characters"));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(invalid("must start with a lowercase letter"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(invalid("may only contain lowercase letters, digits, '_' and '-'"));
    }
    if RESERVED_SHORT_NAMES.contains(&name) {
        return Err(invalid("reserved namespace"));
    }
    Ok(())
}

/// Thread-safe application registry.
#[derive(Debug, Default)]
pub struct ApplicationRegistry {
    apps: RwLock<HashMap<ApplicationId, Application>>,
}

impl ApplicationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an application.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NameTaken`] if another application uses `name`.
    pub fn create(
        &self,
        owner: UserId,
        name: &str,
        required_mask: KeyMask,
        required_kind: Option<KeyKind>,
    ) -> EngineResult<Application> {
        let name = name.trim();
        let mut apps = self.apps.write().map_err(|e| EngineError::poisoned(&e))?;
        if apps.values().any(|a| a.name.eq_ignore_ascii_case(name)) {
            return Err(EngineError::NameTaken(name.to_owned()));
        }

        let mut app = Application::new(owner, name, required_mask);
        app.required_kind = required_kind;
        apps.insert(app.id, app.clone());
        tracing::info!(application = %app.id, name = %app.name, "registered application");
        Ok(app)
    }

    /// Assign the short name. Setting the same name again is a no-op.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidShortName`] for an unusable name.
    /// - [`EngineError::ShortNameImmutable`] if a different name is set.
    /// - [`EngineError::NameTaken`] if another application uses it.
    /// - [`EngineError::NotFound`] for an unknown application.
    pub fn set_short_name(&self, id: ApplicationId, short_name: &str) -> EngineResult<Application> {
        validate_short_name(short_name)?;

        let mut apps = self.apps.write().map_err(|e| EngineError::poisoned(&e))?;
        if apps
            .values()
            .any(|a| a.id != id && a.short_name.as_deref() == Some(short_name))
        {
            return Err(EngineError::NameTaken(short_name.to_owned()));
        }

        let app = apps.get_mut(&id).ok_or_else(|| EngineError::not_found(id))?;
        match app.short_name.as_deref() {
            Some(current) if current == short_name => {},
            Some(current) => {
                return Err(EngineError::ShortNameImmutable {
                    application: id,
                    current: current.to_owned(),
                });
            },
            None => {
                app.short_name = Some(short_name.to_owned());
                tracing::info!(application = %id, short_name, "assigned short name");
            },
        }
        Ok(app.clone())
    }

    /// Change the key requirements.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown application.
    pub fn set_requirements(
        &self,
        id: ApplicationId,
        required_mask: KeyMask,
        required_kind: Option<KeyKind>,
    ) -> EngineResult<Application> {
        let mut apps = self.apps.write().map_err(|e| EngineError::poisoned(&e))?;
        let app = apps.get_mut(&id).ok_or_else(|| EngineError::not_found(id))?;
        app.required_mask = required_mask;
        app.required_kind = required_kind;
        Ok(app.clone())
    }

    /// Look up an application.
    #[must_use]
    pub fn get(&self, id: ApplicationId) -> Option<Application> {
        self.read_apps().get(&id).cloned()
    }

    /// Look up an application by short name.
    #[must_use]
    pub fn by_short_name(&self, short_name: &str) -> Option<Application> {
        self.read_apps()
            .values()
            .find(|a| a.short_name.as_deref() == Some(short_name))
            .cloned()
    }

    /// Applications registered by `owner`.
    #[must_use]
    pub fn by_owner(&self, owner: UserId) -> Vec<Application> {
        let mut owned: Vec<Application> = self
            .read_apps()
            .values()
            .filter(|a| a.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.name.cmp(&b.name));
        owned
    }

    /// Remove an application.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn remove(&self, id: ApplicationId) -> EngineResult<Option<Application>> {
        let mut apps = self.apps.write().map_err(|e| EngineError::poisoned(&e))?;
        Ok(apps.remove(&id))
    }

    fn read_apps(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ApplicationId, Application>> {
        self.apps.read().unwrap_or_else(|e| {
            tracing::warn!("ApplicationRegistry read lock poisoned, recovering");
            e.into_inner()
        })
    }
}
