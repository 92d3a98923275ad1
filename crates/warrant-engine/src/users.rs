//! User accounts.
//!
//! A user's primary identity is a single optional field, so a user can
//! never have two primaries. Losing the primary without a replacement
//! leaves `primary = None` and raises `needs_attention`.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warrant_core::{IdentityId, UserId};
use warrant_permissions::Permission;

use crate::error::{EngineError, EngineResult};
use crate::policy::KeyPolicyValidator;

/// One successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRecord {
    /// When the login happened.
    pub at: DateTime<Utc>,
    /// Remote address, if the caller knows it.
    pub ip: Option<String>,
}

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Internal id.
    pub id: UserId,
    /// Login name, unique case-insensitively.
    pub username: String,
    /// Primary identity.
    pub primary: Option<IdentityId>,
    /// Set when the account lost its primary identity and has none left.
    pub needs_attention: bool,
    /// Permissions held directly by the user.
    pub permissions: BTreeSet<Permission>,
    /// Other accounts that claimed one of this user's identities.
    pub duplicates: BTreeSet<UserId>,
    /// Logins, oldest first.
    pub login_history: Vec<LoginRecord>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl User {
    fn new(username: &str) -> Self {
        Self {
            id: UserId::new(),
            username: username.to_owned(),
            primary: None,
            needs_attention: false,
            permissions: BTreeSet::new(),
            duplicates: BTreeSet::new(),
            login_history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Whether the user holds `core.*` or `*`.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        Permission::namespace("core")
            .is_ok_and(|core| warrant_permissions::matches(&self.permissions, &core))
    }
}

/// Thread-safe user store.
#[derive(Debug, Default)]
pub struct UserStore {
    users: RwLock<HashMap<UserId, User>>,
}

impl UserStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an account.
    ///
    /// `password_score` is the 0-4 strength estimate computed by the caller;
    /// passwords themselves never reach the engine.
    ///
    /// # Errors
    ///
    /// - [`EngineError::WeakPassword`] below the policy threshold.
    /// - [`EngineError::NameTaken`] if the username exists.
    pub fn create(
        &self,
        username: &str,
        password_score: u8,
        policy: &KeyPolicyValidator,
    ) -> EngineResult<User> {
        policy.check_password(password_score)?;

        let username = username.trim();
        let mut users = self.users.write().map_err(|e| EngineError::poisoned(&e))?;
        if users
            .values()
            .any(|u| u.username.eq_ignore_ascii_case(username))
        {
            return Err(EngineError::NameTaken(username.to_owned()));
        }
        let user = User::new(username);
        users.insert(user.id, user.clone());
        tracing::info!(user = %user.id, username, "created user");
        Ok(user)
    }

    /// Look up a user.
    #[must_use]
    pub fn get(&self, id: UserId) -> Option<User> {
        self.read_users().get(&id).cloned()
    }

    /// Look up a user by username, ignoring case.
    #[must_use]
    pub fn by_username(&self, username: &str) -> Option<User> {
        self.read_users()
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned()
    }

    /// Every user.
    #[must_use]
    pub fn all(&self) -> Vec<User> {
        let mut users: Vec<User> = self.read_users().values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        users
    }

    /// Give `permission` to a user. Returns whether it was new.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown user.
    pub fn grant_permission(&self, id: UserId, permission: Permission) -> EngineResult<bool> {
        self.update(id, |u| u.permissions.insert(permission))
    }

    /// Take `permission` from a user. Returns whether it was held.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown user.
    pub fn revoke_permission(&self, id: UserId, permission: &Permission) -> EngineResult<bool> {
        self.update(id, |u| u.permissions.remove(permission))
    }

    /// Record that `a` and `b` claimed the same identity.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if either user is unknown.
    pub fn add_duplicate(&self, a: UserId, b: UserId) -> EngineResult<()> {
        if a == b {
            return Ok(());
        }
        let mut users = self.users.write().map_err(|e| EngineError::poisoned(&e))?;
        if !users.contains_key(&a) {
            return Err(EngineError::not_found(a));
        }
        if !users.contains_key(&b) {
            return Err(EngineError::not_found(b));
        }
        if let Some(user) = users.get_mut(&a) {
            user.duplicates.insert(b);
        }
        if let Some(user) = users.get_mut(&b) {
            user.duplicates.insert(a);
        }
        tracing::warn!(%a, %b, "users share an identity, marked as duplicates");
        Ok(())
    }

    /// Set the primary identity and the attention flag together.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown user.
    pub fn set_primary(
        &self,
        id: UserId,
        primary: Option<IdentityId>,
        needs_attention: bool,
    ) -> EngineResult<User> {
        self.update(id, |u| {
            u.primary = primary;
            u.needs_attention = needs_attention;
            u.clone()
        })
    }

    /// Append a login record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown user.
    pub fn record_login(
        &self,
        id: UserId,
        at: DateTime<Utc>,
        ip: Option<String>,
    ) -> EngineResult<()> {
        self.update(id, |u| u.login_history.push(LoginRecord { at, ip }))
    }

    /// Drop login records older than `cutoff` for every user. Returns the
    /// number of records dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn prune_login_history(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let mut users = self.users.write().map_err(|e| EngineError::poisoned(&e))?;
        let mut pruned = 0usize;
        for user in users.values_mut() {
            let before = user.login_history.len();
            user.login_history.retain(|r| r.at >= cutoff);
            pruned = pruned.saturating_add(before.saturating_sub(user.login_history.len()));
        }
        Ok(pruned)
    }

    /// Delete a user and drop it from everyone's duplicate set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn remove(&self, id: UserId) -> EngineResult<Option<User>> {
        let mut users = self.users.write().map_err(|e| EngineError::poisoned(&e))?;
        let removed = users.remove(&id);
        if removed.is_some() {
            for user in users.values_mut() {
                user.duplicates.remove(&id);
            }
        }
        Ok(removed)
    }

    /// Number of users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_users().len()
    }

    /// Whether there are no users.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<T, F>(&self, id: UserId, apply: F) -> EngineResult<T>
    where
        F: FnOnce(&mut User) -> T,
    {
        let mut users = self.users.write().map_err(|e| EngineError::poisoned(&e))?;
        let user = users.get_mut(&id).ok_or_else(|| EngineError::not_found(id))?;
        Ok(apply(user))
    }

    fn read_users(&self) -> std::sync::RwLockReadGuard<'_, HashMap<UserId, User>> {
        self.users.read().unwrap_or_else(|e| {
            tracing::warn!("UserStore read lock poisoned, recovering");
            e.into_inner()
        })
    }
}
