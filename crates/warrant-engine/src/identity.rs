//! Identities and their resolution from credentials.
//!
//! An identity exists only while a valid credential of its owner backs it.
//! [`IdentityDirectory::resolve`] asks the key authority which identities a
//! key proves and reconciles the store with the answer;
//! [`IdentityDirectory::remove_orphans`] cleans up after revoked or purged
//! keys. Several keys of one owner may prove the same identity; losing the
//! bound key moves the identity to one of the others instead of deleting it.
//!
//! Primary policy: when a user's primary identity disappears, the oldest
//! remaining identity (earliest `created_at`, then lowest id) becomes
//! primary. A user left with no identities gets no primary and is flagged
//! with `needs_attention`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warrant_core::{
    Backoff, CredentialId, GrantId, IdentityId, IdentityInfo, KeyId, KeyInfo, KeyInfoProvider,
    ProviderError, UserId, lookup_with_backoff,
};

use crate::credential::{Credential, CredentialStore};
use crate::error::{EngineError, EngineResult};
use crate::grant::GrantStore;
use crate::policy::KeyPolicyValidator;
use crate::users::UserStore;

/// An identity ("character") owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// External id issued by the key authority.
    pub id: IdentityId,
    /// Display name.
    pub name: String,
    /// Credential that proves ownership.
    pub credential: CredentialId,
    /// Other keys of the same owner that also prove it.
    #[serde(default)]
    pub alternates: BTreeSet<CredentialId>,
    /// Owning user.
    pub owner: UserId,
    /// Corporation, if reported.
    pub corporation: Option<String>,
    /// First time the identity was resolved for its current owner.
    pub created_at: DateTime<Utc>,
    /// Last refresh.
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    /// Whether `credential` is the bound key or one of the alternates.
    #[must_use]
    pub fn is_backed_by(&self, credential: CredentialId) -> bool {
        self.credential == credential || self.alternates.contains(&credential)
    }
}

/// How an identity reported by a key was reconciled with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// First seen; stored for the key's owner.
    Created,
    /// Already bound to this key, or to another healthy key of the same
    /// owner (this key is then kept as an alternate); name and corporation
    /// refreshed.
    Refreshed,
    /// Moved from another, unhealthy key of the same owner. A previous key
    /// that is still valid stays on as an alternate.
    Rebound {
        /// Credential it was bound to before.
        previous: CredentialId,
    },
    /// Moved from another user whose key no longer backs it.
    TakenOver {
        /// User that lost the identity.
        previous_owner: UserId,
    },
    /// Another user owns it through a valid key; left untouched.
    Conflict {
        /// The current owner.
        owner: UserId,
    },
}

/// Thread-safe identity store.
#[derive(Debug, Default)]
pub struct IdentityStore {
    identities: RwLock<HashMap<IdentityId, Identity>>,
}

impl IdentityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an identity.
    #[must_use]
    pub fn get(&self, id: IdentityId) -> Option<Identity> {
        self.read_identities().get(&id).cloned()
    }

    /// Identities of `owner`, oldest first.
    #[must_use]
    pub fn by_owner(&self, owner: UserId) -> Vec<Identity> {
        self.filtered(|i| i.owner == owner)
    }

    /// Identities bound to `credential` or holding it as an alternate,
    /// oldest first.
    #[must_use]
    pub fn by_credential(&self, credential: CredentialId) -> Vec<Identity> {
        self.filtered(|i| i.is_backed_by(credential))
    }

    /// Every identity, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<Identity> {
        self.filtered(|_| true)
    }

    fn filtered<P>(&self, predicate: P) -> Vec<Identity>
    where
        P: Fn(&Identity) -> bool,
    {
        let mut found: Vec<Identity> = self
            .read_identities()
            .values()
            .filter(|i| predicate(i))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found
    }

    /// Insert or replace an identity record as-is.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn upsert(&self, identity: Identity) -> EngineResult<Option<Identity>> {
        let mut identities = self.identities.write().map_err(|e| EngineError::poisoned(&e))?;
        Ok(identities.insert(identity.id, identity))
    }

    /// Reconcile one reported identity with the store for `credential`.
    ///
    /// The decision and the write happen under one write lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn bind(
        &self,
        info: &IdentityInfo,
        credential: &Credential,
        credentials: &CredentialStore,
        now: DateTime<Utc>,
    ) -> EngineResult<BindOutcome> {
        let mut identities = self.identities.write().map_err(|e| EngineError::poisoned(&e))?;

        let Some(existing) = identities.get_mut(&info.id) else {
            identities.insert(
                info.id,
                Identity {
                    id: info.id,
                    name: info.name.clone(),
                    credential: credential.id,
                    alternates: BTreeSet::new(),
                    owner: credential.owner,
                    corporation: info.corporation.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
            return Ok(BindOutcome::Created);
        };

        let bound = credentials.get(existing.credential);
        let outcome = if existing.credential == credential.id {
            BindOutcome::Refreshed
        } else if existing.owner == credential.owner {
            if bound.as_ref().is_some_and(|c| c.valid && c.verified) {
                existing.alternates.insert(credential.id);
                BindOutcome::Refreshed
            } else {
                let previous = existing.credential;
                existing.alternates.remove(&credential.id);
                if bound.as_ref().is_some_and(|c| c.valid && c.owner == credential.owner) {
                    existing.alternates.insert(previous);
                }
                existing.credential = credential.id;
                BindOutcome::Rebound { previous }
            }
        } else if bound.as_ref().is_some_and(|c| c.valid && c.owner == existing.owner) {
            return Ok(BindOutcome::Conflict {
                owner: existing.owner,
            });
        } else {
            let previous_owner = existing.owner;
            existing.owner = credential.owner;
            existing.credential = credential.id;
            existing.alternates.clear();
            existing.created_at = now;
            BindOutcome::TakenOver { previous_owner }
        };

        existing.name.clone_from(&info.name);
        existing.corporation.clone_from(&info.corporation);
        existing.updated_at = now;
        Ok(outcome)
    }

    /// Stop `credential` from backing identity `id`.
    ///
    /// An alternate is simply dropped. If `credential` is the bound key, the
    /// identity moves to the oldest-registered valid alternate of the same
    /// owner, or is removed when there is none. Decided under one write lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn detach(
        &self,
        id: IdentityId,
        credential: CredentialId,
        credentials: &CredentialStore,
    ) -> EngineResult<Detached> {
        let mut identities = self.identities.write().map_err(|e| EngineError::poisoned(&e))?;
        let Some(identity) = identities.get_mut(&id) else {
            return Ok(Detached::NotBacked);
        };
        if identity.credential != credential {
            identity.alternates.remove(&credential);
            return Ok(Detached::NotBacked);
        }

        let owner = identity.owner;
        let mut usable: Vec<Credential> = identity
            .alternates
            .iter()
            .filter_map(|alt| credentials.get(*alt))
            .filter(|c| c.valid && c.owner == owner)
            .collect();
        usable.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        match usable.first() {
            Some(next) => {
                identity.credential = next.id;
                identity.alternates = usable.iter().skip(1).map(|c| c.id).collect();
                Ok(Detached::Rebound { to: next.id })
            },
            None => Ok(identities
                .remove(&id)
                .map_or(Detached::NotBacked, Detached::Removed)),
        }
    }

    /// Remove an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn remove(&self, id: IdentityId) -> EngineResult<Option<Identity>> {
        let mut identities = self.identities.write().map_err(|e| EngineError::poisoned(&e))?;
        Ok(identities.remove(&id))
    }

    /// Number of identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_identities().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_identities(&self) -> std::sync::RwLockReadGuard<'_, HashMap<IdentityId, Identity>> {
        self.identities.read().unwrap_or_else(|e| {
            tracing::warn!("IdentityStore read lock poisoned, recovering");
            e.into_inner()
        })
    }
}

/// Result of [`IdentityStore::detach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detached {
    /// The key was not bound to the identity; at most an alternate was
    /// dropped.
    NotBacked,
    /// The identity now rests on another key of its owner.
    Rebound {
        /// The new bound credential.
        to: CredentialId,
    },
    /// No other key proves it; the identity was deleted.
    Removed(Identity),
}

/// Change made by [`IdentityDirectory::ensure_primary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", content = "identity", rename_all = "snake_case")]
pub enum PrimaryChange {
    /// The primary is still owned by the user, or there was none to lose.
    Unchanged,
    /// A new primary was chosen.
    Assigned(IdentityId),
    /// The primary was lost and nothing is left; the user is flagged.
    Flagged,
}

/// Outcome of [`IdentityDirectory::remove_orphans`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanReport {
    /// Identities deleted because no valid credential backs them.
    pub removed_identities: Vec<IdentityId>,
    /// Identities moved to another valid key of their owner.
    pub identities_rebound: Vec<IdentityId>,
    /// Invalid credentials deleted.
    pub removed_credentials: Vec<CredentialId>,
    /// Grants that lost an identity but still have others.
    pub grants_updated: usize,
    /// Grants deleted because they lost their last identity.
    pub grants_deleted: Vec<GrantId>,
    /// Users that got a new primary.
    pub primaries_reassigned: Vec<UserId>,
    /// Users left without identities.
    pub users_flagged: Vec<UserId>,
}

impl OrphanReport {
    /// Whether the run changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed_identities.is_empty()
            && self.identities_rebound.is_empty()
            && self.removed_credentials.is_empty()
            && self.grants_updated == 0
            && self.grants_deleted.is_empty()
            && self.primaries_reassigned.is_empty()
            && self.users_flagged.is_empty()
    }
}

/// Resolves identities from credentials and keeps identities, grants and
/// primaries consistent with the credential store.
pub struct IdentityDirectory {
    credentials: Arc<CredentialStore>,
    identities: Arc<IdentityStore>,
    users: Arc<UserStore>,
    grants: Arc<GrantStore>,
    policy: Arc<KeyPolicyValidator>,
    provider: Arc<dyn KeyInfoProvider>,
    backoff: Backoff,
}

impl fmt::Debug for IdentityDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityDirectory")
            .field("identities", &self.identities.len())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl IdentityDirectory {
    /// Create a directory over the given stores.
    #[must_use]
    pub fn new(
        credentials: Arc<CredentialStore>,
        identities: Arc<IdentityStore>,
        users: Arc<UserStore>,
        grants: Arc<GrantStore>,
        policy: Arc<KeyPolicyValidator>,
        provider: Arc<dyn KeyInfoProvider>,
    ) -> Self {
        Self {
            credentials,
            identities,
            users,
            grants,
            policy,
            provider,
            backoff: Backoff::default(),
        }
    }

    /// Use `backoff` for key authority lookups.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// The identity store.
    #[must_use]
    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.identities
    }

    /// Ask the key authority about a key, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last [`ProviderError`] once retries are exhausted, or the
    /// first non-retryable one.
    pub async fn fetch(&self, key_id: KeyId, verification_code: &str) -> Result<KeyInfo, ProviderError> {
        let info = lookup_with_backoff(&self.backoff, key_id, || {
            self.provider.key_info(key_id, verification_code)
        })
        .await?;

        if !info.kind.is_multi_identity() && info.identities.len() > 1 {
            return Err(ProviderError::Malformed(format!(
                "{} key {key_id} reported {} identities",
                info.kind,
                info.identities.len()
            )));
        }
        Ok(info)
    }

    /// Look up `credential` at the key authority and reconcile identities.
    ///
    /// Returns the identities the credential now backs. Store locks are
    /// never held across the lookup.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] for an unknown credential.
    /// - [`EngineError::InvalidCredential`] for a revoked credential.
    /// - [`EngineError::Provider`] when the lookup fails. A revoked key is
    ///   invalidated and its identities removed first; any other failure
    ///   leaves the stores untouched.
    pub async fn resolve(&self, credential_id: CredentialId) -> EngineResult<Vec<Identity>> {
        let credential = self
            .credentials
            .get(credential_id)
            .ok_or_else(|| EngineError::not_found(credential_id))?;
        if !credential.valid {
            return Err(EngineError::InvalidCredential(credential_id));
        }

        let key_id = credential.key_id;
        match self.fetch(key_id, &credential.verification_code).await {
            Ok(info) => self.reconcile(credential_id, &info),
            Err(error @ ProviderError::Revoked(_)) => {
                tracing::info!(credential = %credential_id, %key_id, "key revoked by key authority");
                self.credentials.invalidate(credential_id)?;
                self.remove_orphans()?;
                Err(error.into())
            },
            Err(error) => {
                tracing::warn!(credential = %credential_id, %key_id, %error, "key lookup failed");
                Err(error.into())
            },
        }
    }

    /// Apply a key authority answer to `credential_id` and its identities.
    ///
    /// Creates or refreshes reported identities, flags identities already
    /// owned through another user's valid key, detaches identities the key no
    /// longer covers and makes sure the owner has a primary.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidCredential`] if the credential is gone
    /// or invalid, or a storage error.
    pub fn reconcile(&self, credential_id: CredentialId, info: &KeyInfo) -> EngineResult<Vec<Identity>> {
        // Re-read: the record may have changed while the lookup was in flight.
        let credential = self
            .credentials
            .get(credential_id)
            .filter(|c| c.valid)
            .ok_or(EngineError::InvalidCredential(credential_id))?;

        let now = Utc::now();
        let mut conflict = false;
        let mut reported = BTreeSet::new();
        for identity in &info.identities {
            reported.insert(identity.id);
            match self
                .identities
                .bind(identity, &credential, &self.credentials, now)?
            {
                BindOutcome::Conflict { owner } => {
                    conflict = true;
                    tracing::warn!(
                        identity = %identity.id,
                        %owner,
                        claimant = %credential.owner,
                        "identity already owned by another user"
                    );
                    self.users.add_duplicate(credential.owner, owner)?;
                },
                BindOutcome::TakenOver { previous_owner } => {
                    self.grants.remove_identity(identity.id)?;
                    self.ensure_existing_primary(previous_owner)?;
                    tracing::info!(identity = %identity.id, from = %previous_owner, to = %credential.owner, "identity transferred");
                },
                BindOutcome::Created | BindOutcome::Refreshed | BindOutcome::Rebound { .. } => {},
            }
        }
        if info.identities.is_empty() {
            tracing::warn!(credential = %credential_id, key_id = %credential.key_id, "key proves no identities");
        }

        let updated = self
            .credentials
            .update_from_key_info(credential_id, info, conflict, now)?;

        for stale in self.identities.by_credential(credential_id) {
            if reported.contains(&stale.id) {
                continue;
            }
            match self.identities.detach(stale.id, credential_id, &self.credentials)? {
                Detached::Removed(_) => {
                    self.grants.remove_identity(stale.id)?;
                    tracing::info!(identity = %stale.id, credential = %credential_id, "detached identity no longer covered by key");
                },
                Detached::Rebound { to } => {
                    tracing::info!(identity = %stale.id, from = %credential_id, %to, "identity moved to another key of its owner");
                },
                Detached::NotBacked => {},
            }
        }

        let resolved = self.identities.by_credential(credential_id);
        if self.policy.policy().require_recommended_key && !updated.verified {
            for identity in resolved.iter().filter(|i| i.credential == credential_id) {
                let changes = self.grants.remove_identity(identity.id)?;
                if !changes.is_empty() {
                    tracing::info!(identity = %identity.id, "removed unverified identity from grants");
                }
            }
        }

        self.ensure_primary(credential.owner)?;
        Ok(resolved)
    }

    /// Delete identities no valid credential backs, and everything that
    /// depended on them. Safe to run at any time and any number of times.
    ///
    /// # Errors
    ///
    /// Returns an error if a store lock is poisoned.
    pub fn remove_orphans(&self) -> EngineResult<OrphanReport> {
        let mut report = OrphanReport::default();
        let mut affected: BTreeSet<UserId> = BTreeSet::new();

        for identity in self.identities.all() {
            let backed = self
                .credentials
                .get(identity.credential)
                .is_some_and(|c| c.valid && c.owner == identity.owner);
            if backed {
                continue;
            }
            match self
                .identities
                .detach(identity.id, identity.credential, &self.credentials)?
            {
                Detached::NotBacked => continue,
                Detached::Rebound { to } => {
                    report.identities_rebound.push(identity.id);
                    tracing::info!(identity = %identity.id, from = %identity.credential, %to, "identity moved to another key of its owner");
                    continue;
                },
                Detached::Removed(_) => {},
            }
            let changes = self.grants.remove_identity(identity.id)?;
            report.grants_updated = report.grants_updated.saturating_add(changes.updated.len());
            report.grants_deleted.extend(changes.deleted);
            report.removed_identities.push(identity.id);
            affected.insert(identity.owner);
            tracing::info!(identity = %identity.id, owner = %identity.owner, "removed orphaned identity");
        }

        report.removed_credentials = self.credentials.remove_invalid()?;

        for user in self.users.all() {
            let dangling = user
                .primary
                .is_some_and(|p| self.identities.get(p).is_none_or(|i| i.owner != user.id));
            if !dangling && !affected.contains(&user.id) {
                continue;
            }
            match self.ensure_primary(user.id)? {
                PrimaryChange::Assigned(_) => report.primaries_reassigned.push(user.id),
                PrimaryChange::Flagged => report.users_flagged.push(user.id),
                PrimaryChange::Unchanged => {},
            }
        }

        if !report.is_empty() {
            tracing::info!(
                identities = report.removed_identities.len(),
                credentials = report.removed_credentials.len(),
                grants_deleted = report.grants_deleted.len(),
                "orphan removal finished"
            );
        }
        Ok(report)
    }

    /// Make sure `user` has a primary identity if it has any identity.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown user.
    pub fn ensure_primary(&self, user: UserId) -> EngineResult<PrimaryChange> {
        let account = self.users.get(user).ok_or_else(|| EngineError::not_found(user))?;
        let owned = self.identities.by_owner(user);

        if let Some(primary) = account.primary
            && owned.iter().any(|i| i.id == primary)
        {
            return Ok(PrimaryChange::Unchanged);
        }

        match owned.first() {
            Some(oldest) => {
                self.users.set_primary(user, Some(oldest.id), false)?;
                tracing::info!(%user, identity = %oldest.id, "assigned primary identity");
                Ok(PrimaryChange::Assigned(oldest.id))
            },
            None if account.primary.is_some() => {
                self.users.set_primary(user, None, true)?;
                tracing::warn!(%user, "user lost its last identity, needs attention");
                Ok(PrimaryChange::Flagged)
            },
            None => Ok(PrimaryChange::Unchanged),
        }
    }

    fn ensure_existing_primary(&self, user: UserId) -> EngineResult<()> {
        match self.ensure_primary(user) {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Choose `identity` as the primary of `user`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if `user` does not own `identity`.
    pub fn set_primary(&self, user: UserId, identity: IdentityId) -> EngineResult<()> {
        self.identities
            .get(identity)
            .filter(|i| i.owner == user)
            .ok_or_else(|| EngineError::not_found(identity))?;
        self.users.set_primary(user, Some(identity), false)?;
        Ok(())
    }
}
