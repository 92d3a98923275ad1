//! Grants between users and applications.
//!
//! The current format holds one grant per (user, application) spanning a
//! set of identities. Legacy grants, imported from the per-identity model,
//! carry exactly one identity each and are folded into the current format
//! by [`migrate_legacy_grants`](crate::migration::migrate_legacy_grants).
//!
//! Upserts merge by set union; removing anything from a grant is always an
//! explicit revoke. A grant whose identity set becomes empty is deleted in
//! the same critical section, so an empty grant is never observable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use warrant_core::{ApplicationId, GrantId, IdentityId, UserId};
use warrant_permissions::{Permission, matcher};

use crate::application::ApplicationRegistry;
use crate::credential::CredentialStore;
use crate::error::{EngineError, EngineResult};
use crate::identity::IdentityStore;
use crate::policy::KeyPolicyValidator;
use crate::users::UserStore;

/// Storage format of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantFormat {
    /// One identity per record, several records per (user, application).
    Legacy,
    /// One record per (user, application).
    Current,
}

/// Permissions a user authorized an application to exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Internal id.
    pub id: GrantId,
    /// Authorizing user.
    pub user: UserId,
    /// Authorized application.
    pub application: ApplicationId,
    /// Identities the application may act for. Never empty.
    pub identities: BTreeSet<IdentityId>,
    /// Granted permissions, possibly wildcards.
    pub permissions: BTreeSet<Permission>,
    /// Storage format.
    pub format: GrantFormat,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl Grant {
    fn new(
        user: UserId,
        application: ApplicationId,
        identities: BTreeSet<IdentityId>,
        permissions: BTreeSet<Permission>,
        format: GrantFormat,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: GrantId::new(),
            user,
            application,
            identities,
            permissions,
            format,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the grant lets the application use `permission` as `identity`.
    #[must_use]
    pub fn allows(&self, identity: IdentityId, permission: &Permission) -> bool {
        self.identities.contains(&identity) && matcher::matches(&self.permissions, permission)
    }
}

/// What to take out of a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RevokeTarget {
    /// Stop the application acting for this identity.
    Identity(IdentityId),
    /// Take back this exact permission.
    Permission(Permission),
}

impl fmt::Display for RevokeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity(id) => write!(f, "{id}"),
            Self::Permission(p) => write!(f, "permission {p}"),
        }
    }
}

/// Grants touched by a revoke or identity removal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantChanges {
    /// Grants that were modified and still exist.
    pub updated: Vec<Grant>,
    /// Grants deleted because their identity set became empty.
    pub deleted: Vec<GrantId>,
}

impl GrantChanges {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty()
    }

    fn record(&mut self, grants: &mut HashMap<GrantId, Grant>, id: GrantId) {
        let Some(grant) = grants.get(&id) else {
            return;
        };
        if grant.identities.is_empty() {
            grants.remove(&id);
            self.deleted.push(id);
        } else {
            self.updated.push(grant.clone());
        }
    }
}

#[derive(Debug, Default)]
struct GrantTable {
    grants: HashMap<GrantId, Grant>,
    current: HashMap<(UserId, ApplicationId), GrantId>,
    migration_version: u32,
}

impl GrantTable {
    fn pair_ids(&self, user: UserId, application: ApplicationId) -> Vec<GrantId> {
        self.grants
            .values()
            .filter(|g| g.user == user && g.application == application)
            .map(|g| g.id)
            .collect()
    }

    fn legacy_ids(&self, user: UserId, application: ApplicationId) -> BTreeSet<GrantId> {
        self.grants
            .values()
            .filter(|g| {
                g.user == user && g.application == application && g.format == GrantFormat::Legacy
            })
            .map(|g| g.id)
            .collect()
    }

    fn delete(&mut self, id: GrantId) -> Option<Grant> {
        let grant = self.grants.remove(&id)?;
        if self.current.get(&(grant.user, grant.application)) == Some(&id) {
            self.current.remove(&(grant.user, grant.application));
        }
        Some(grant)
    }

    fn drop_dangling_current(&mut self) {
        let grants = &self.grants;
        self.current.retain(|_, id| grants.contains_key(id));
    }

    fn merge_current(
        &mut self,
        user: UserId,
        application: ApplicationId,
        identities: BTreeSet<IdentityId>,
        permissions: BTreeSet<Permission>,
    ) -> Grant {
        let existing = self
            .current
            .get(&(user, application))
            .and_then(|id| self.grants.get_mut(id));
        if let Some(grant) = existing {
            grant.identities.extend(identities);
            grant.permissions.extend(permissions);
            grant.updated_at = Utc::now();
            return grant.clone();
        }

        let grant = Grant::new(user, application, identities, permissions, GrantFormat::Current);
        self.current.insert((user, application), grant.id);
        self.grants.insert(grant.id, grant.clone());
        grant
    }
}

/// Thread-safe grant storage.
///
/// Every method runs inside one critical section of the grant table lock.
#[derive(Debug, Default)]
pub struct GrantStore {
    table: RwLock<GrantTable>,
}

impl GrantStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current-format grant for a pair.
    #[must_use]
    pub fn current_for(&self, user: UserId, application: ApplicationId) -> Option<Grant> {
        let table = self.read_table();
        table
            .current
            .get(&(user, application))
            .and_then(|id| table.grants.get(id))
            .cloned()
    }

    /// Every grant for a pair, legacy records included.
    #[must_use]
    pub fn for_pair(&self, user: UserId, application: ApplicationId) -> Vec<Grant> {
        self.filtered(|g| g.user == user && g.application == application)
    }

    /// Look up a grant.
    #[must_use]
    pub fn get(&self, id: GrantId) -> Option<Grant> {
        self.read_table().grants.get(&id).cloned()
    }

    /// Every grant of `user`.
    #[must_use]
    pub fn for_user(&self, user: UserId) -> Vec<Grant> {
        self.filtered(|g| g.user == user)
    }

    /// Every grant referencing `identity`.
    #[must_use]
    pub fn for_identity(&self, identity: IdentityId) -> Vec<Grant> {
        self.filtered(|g| g.identities.contains(&identity))
    }

    /// Every stored grant.
    #[must_use]
    pub fn all(&self) -> Vec<Grant> {
        self.filtered(|_| true)
    }

    fn filtered<P>(&self, predicate: P) -> Vec<Grant>
    where
        P: Fn(&Grant) -> bool,
    {
        let mut found: Vec<Grant> = self
            .read_table()
            .grants
            .values()
            .filter(|g| predicate(g))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found
    }

    /// Merge identities and permissions into the pair's current grant,
    /// creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoIdentities`] if the grant would be empty.
    pub fn upsert_current(
        &self,
        user: UserId,
        application: ApplicationId,
        identities: BTreeSet<IdentityId>,
        permissions: BTreeSet<Permission>,
    ) -> EngineResult<Grant> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        let has_current = table.current.contains_key(&(user, application));
        if identities.is_empty() && !has_current {
            return Err(EngineError::NoIdentities);
        }
        Ok(table.merge_current(user, application, identities, permissions))
    }

    /// Store a per-identity record in the legacy format.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn insert_legacy(
        &self,
        user: UserId,
        application: ApplicationId,
        identity: IdentityId,
        permissions: BTreeSet<Permission>,
    ) -> EngineResult<Grant> {
        let grant = Grant::new(
            user,
            application,
            BTreeSet::from([identity]),
            permissions,
            GrantFormat::Legacy,
        );
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        table.grants.insert(grant.id, grant.clone());
        Ok(grant)
    }

    /// Remove `target` from every grant of the pair.
    ///
    /// A missing identity or permission is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the pair has no grant.
    pub fn revoke(
        &self,
        user: UserId,
        application: ApplicationId,
        target: &RevokeTarget,
    ) -> EngineResult<GrantChanges> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        let ids = table.pair_ids(user, application);
        if ids.is_empty() {
            return Err(EngineError::not_found(format!(
                "grant of {user} for {application}"
            )));
        }

        let now = Utc::now();
        let mut changes = GrantChanges::default();
        for id in ids {
            let Some(grant) = table.grants.get_mut(&id) else {
                continue;
            };
            let changed = match target {
                RevokeTarget::Identity(identity) => grant.identities.remove(identity),
                RevokeTarget::Permission(permission) => grant.permissions.remove(permission),
            };
            if changed {
                grant.updated_at = now;
                changes.record(&mut table.grants, id);
            }
        }
        table.drop_dangling_current();
        Ok(changes)
    }

    /// Remove `identity` from every grant, deleting grants left empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn remove_identity(&self, identity: IdentityId) -> EngineResult<GrantChanges> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        let ids: Vec<GrantId> = table
            .grants
            .values()
            .filter(|g| g.identities.contains(&identity))
            .map(|g| g.id)
            .collect();

        let now = Utc::now();
        let mut changes = GrantChanges::default();
        for id in ids {
            if let Some(grant) = table.grants.get_mut(&id) {
                grant.identities.remove(&identity);
                grant.updated_at = now;
            }
            changes.record(&mut table.grants, id);
        }
        table.drop_dangling_current();
        Ok(changes)
    }

    /// Delete every grant of `user`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn remove_for_user(&self, user: UserId) -> EngineResult<Vec<GrantId>> {
        self.remove_where(|g| g.user == user)
    }

    /// Delete every grant for `application`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn remove_for_application(&self, application: ApplicationId) -> EngineResult<Vec<GrantId>> {
        self.remove_where(|g| g.application == application)
    }

    fn remove_where<P>(&self, predicate: P) -> EngineResult<Vec<GrantId>>
    where
        P: Fn(&Grant) -> bool,
    {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        let ids: Vec<GrantId> = table
            .grants
            .values()
            .filter(|g| predicate(g))
            .map(|g| g.id)
            .collect();
        for id in &ids {
            table.delete(*id);
        }
        Ok(ids)
    }

    /// Legacy records grouped by (user, application).
    #[must_use]
    pub fn legacy_groups(&self) -> BTreeMap<(UserId, ApplicationId), Vec<Grant>> {
        let mut groups: BTreeMap<(UserId, ApplicationId), Vec<Grant>> = BTreeMap::new();
        for grant in self.read_table().grants.values() {
            if grant.format == GrantFormat::Legacy {
                groups
                    .entry((grant.user, grant.application))
                    .or_default()
                    .push(grant.clone());
            }
        }
        for group in groups.values_mut() {
            group.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        }
        groups
    }

    /// Replace the legacy records `expected` of a pair with their merge into
    /// the current grant, in one critical section.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MigrationConsistency`] if the pair's legacy
    /// records are no longer exactly `expected`; nothing is written then.
    pub fn replace_legacy_group(
        &self,
        user: UserId,
        application: ApplicationId,
        expected: &BTreeSet<GrantId>,
    ) -> EngineResult<Grant> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        if table.legacy_ids(user, application) != *expected {
            return Err(EngineError::MigrationConsistency {
                user,
                application,
                reason: "legacy grants changed while migrating".to_owned(),
            });
        }

        let mut identities = BTreeSet::new();
        let mut permissions = BTreeSet::new();
        for id in expected {
            if let Some(legacy) = table.grants.remove(id) {
                identities.extend(legacy.identities);
                permissions.extend(legacy.permissions);
            }
        }
        Ok(table.merge_current(user, application, identities, permissions))
    }

    /// Last legacy migration version completed without failures.
    #[must_use]
    pub fn migration_version(&self) -> u32 {
        self.read_table().migration_version
    }

    /// Record a completed migration version. Never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn set_migration_version(&self, version: u32) -> EngineResult<()> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        table.migration_version = table.migration_version.max(version);
        Ok(())
    }

    /// Number of stored grants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_table().grants.len()
    }

    /// Whether no grants are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, GrantTable> {
        self.table.read().unwrap_or_else(|e| {
            tracing::warn!("GrantStore read lock poisoned, recovering");
            e.into_inner()
        })
    }
}

/// Authorizes applications and maintains grants.
///
/// Operations on the same (user, application) pair are serialized through a
/// per-pair lock; different pairs proceed in parallel.
pub struct GrantManager {
    store: Arc<GrantStore>,
    applications: Arc<ApplicationRegistry>,
    users: Arc<UserStore>,
    identities: Arc<IdentityStore>,
    credentials: Arc<CredentialStore>,
    policy: Arc<KeyPolicyValidator>,
    pair_locks: DashMap<(UserId, ApplicationId), Arc<Mutex<()>>>,
}

impl fmt::Debug for GrantManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantManager")
            .field("grants", &self.store.len())
            .field("pair_locks", &self.pair_locks.len())
            .finish_non_exhaustive()
    }
}

impl GrantManager {
    /// Create a manager over the given stores.
    #[must_use]
    pub fn new(
        store: Arc<GrantStore>,
        applications: Arc<ApplicationRegistry>,
        users: Arc<UserStore>,
        identities: Arc<IdentityStore>,
        credentials: Arc<CredentialStore>,
        policy: Arc<KeyPolicyValidator>,
    ) -> Self {
        Self {
            store,
            applications,
            users,
            identities,
            credentials,
            policy,
            pair_locks: DashMap::new(),
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<GrantStore> {
        &self.store
    }

    pub(crate) fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    pub(crate) fn pair_lock(&self, user: UserId, application: ApplicationId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.pair_locks
                .entry((user, application))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Authorize `application` to act for `identities` with `permissions`.
    ///
    /// Merges into the pair's existing grant.
    ///
    /// # Errors
    ///
    /// In the order checked:
    /// - [`EngineError::NotFound`] for an unknown user or application.
    /// - [`EngineError::ApplicationNotReady`] without a short name.
    /// - [`EngineError::InsufficientPermission`] if the user's own
    ///   permissions do not cover `permissions`.
    /// - [`EngineError::NoIdentities`] for an empty identity set.
    /// - [`EngineError::NotFound`] for an identity the user does not own.
    /// - [`EngineError::InvalidCredential`] if a backing key was revoked.
    /// - [`EngineError::KeyPolicy`] if a backing key fails the policy.
    pub fn authorize(
        &self,
        user: UserId,
        application: ApplicationId,
        identities: &[IdentityId],
        permissions: &[Permission],
    ) -> EngineResult<Grant> {
        let app = self
            .applications
            .get(application)
            .ok_or_else(|| EngineError::not_found(application))?;
        let account = self.users.get(user).ok_or_else(|| EngineError::not_found(user))?;

        if !app.is_ready() {
            return Err(EngineError::ApplicationNotReady(application));
        }
        let missing = matcher::missing(&account.permissions, permissions);
        if !missing.is_empty() {
            return Err(EngineError::InsufficientPermission {
                missing: missing.iter().map(ToString::to_string).collect(),
            });
        }

        if identities.is_empty() {
            return Err(EngineError::NoIdentities);
        }

        let lock = self.pair_lock(user, application);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        for &id in identities {
            let identity = self
                .identities
                .get(id)
                .filter(|i| i.owner == user)
                .ok_or_else(|| EngineError::not_found(id))?;
            let credential = self
                .credentials
                .get(identity.credential)
                .filter(|c| c.valid)
                .ok_or(EngineError::InvalidCredential(identity.credential))?;
            let outcome = self.policy.evaluate(&credential, &app);
            if !outcome.is_ok() {
                return Err(EngineError::KeyPolicy { identity: id, outcome });
            }
        }

        let grant = self.store.upsert_current(
            user,
            application,
            identities.iter().copied().collect(),
            permissions.iter().cloned().collect(),
        )?;
        tracing::info!(
            %user,
            %application,
            grant = %grant.id,
            identities = grant.identities.len(),
            permissions = grant.permissions.len(),
            "authorized application"
        );
        Ok(grant)
    }

    /// Take an identity or permission out of the pair's grants.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the pair has no grant.
    pub fn revoke(
        &self,
        user: UserId,
        application: ApplicationId,
        target: &RevokeTarget,
    ) -> EngineResult<GrantChanges> {
        let lock = self.pair_lock(user, application);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let changes = self.store.revoke(user, application, target)?;
        tracing::info!(
            %user,
            %application,
            %target,
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            "revoked from grant"
        );
        Ok(changes)
    }

    /// Whether `application` may use `permission` as `identity` for `user`.
    ///
    /// Legacy records count until they are migrated. Wildcards are matched
    /// now, so permissions registered after the grant are covered.
    #[must_use]
    pub fn check(
        &self,
        user: UserId,
        application: ApplicationId,
        identity: IdentityId,
        permission: &Permission,
    ) -> bool {
        self.store
            .for_pair(user, application)
            .iter()
            .any(|g| g.allows(identity, permission))
    }

    /// The current grant for a pair.
    #[must_use]
    pub fn grant_for(&self, user: UserId, application: ApplicationId) -> Option<Grant> {
        self.store.current_for(user, application)
    }

    /// Every grant of `user`.
    #[must_use]
    pub fn grants_for_user(&self, user: UserId) -> Vec<Grant> {
        self.store.for_user(user)
    }
}
