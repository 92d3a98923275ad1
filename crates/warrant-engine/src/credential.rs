//! API credential records and the credential store.
//!
//! The store owns the global `key_id` uniqueness invariant. Every
//! check-and-insert happens inside one write-lock critical section, so two
//! concurrent registrations of the same key cannot both succeed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warrant_core::{CredentialId, KeyId, KeyInfo, KeyKind, KeyMask, UserId};
use warrant_permissions::Permission;

use crate::error::{EngineError, EngineResult};
use crate::policy::KeyPolicyValidator;

/// Permission that lets a user see every stored credential.
pub const LIST_ALL_PERMISSION: &str = "core.key.list.all";

/// Why a credential falls short of the operator's recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Violation {
    /// The key proves an identity that another account already owns.
    Character,
    /// The key is not of the recommended kind.
    Kind,
    /// The key lacks recommended scopes.
    Mask,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Character => write!(f, "identity claimed by another account"),
            Self::Kind => write!(f, "key kind is not the recommended kind"),
            Self::Mask => write!(f, "key mask lacks recommended scopes"),
        }
    }
}

/// A stored API key.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Internal id.
    pub id: CredentialId,
    /// External key id. Unique across all users.
    pub key_id: KeyId,
    /// Secret verification code for the key.
    pub verification_code: String,
    /// Scopes the key grants.
    pub mask: KeyMask,
    /// Key kind.
    pub kind: KeyKind,
    /// Owning user.
    pub owner: UserId,
    /// False once the key authority revoked the key.
    pub valid: bool,
    /// Whether the key meets the recommended mask and kind.
    pub verified: bool,
    /// Current policy violation, if any.
    pub violation: Option<Violation>,
    /// External expiry reported by the key authority.
    pub expires: Option<DateTime<Utc>>,
    /// Last successful lookup against the key authority.
    pub validated_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub modified: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("key_id", &self.key_id)
            .field("verification_code", &"***")
            .field("mask", &self.mask)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("valid", &self.valid)
            .field("verified", &self.verified)
            .field("violation", &self.violation)
            .field("expires", &self.expires)
            .field("validated_at", &self.validated_at)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// Build a new, valid, not yet validated credential.
    #[must_use]
    pub fn new(
        owner: UserId,
        key_id: KeyId,
        verification_code: impl Into<String>,
        mask: KeyMask,
        kind: KeyKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CredentialId::new(),
            key_id,
            verification_code: verification_code.into(),
            mask,
            kind,
            owner,
            valid: true,
            verified: false,
            violation: None,
            expires: None,
            validated_at: None,
            modified: now,
            created_at: now,
        }
    }

    /// Permission that lets a user other than the owner see this key.
    ///
    /// # Errors
    ///
    /// Never fails for numeric key ids; the `Result` comes from parsing.
    pub fn view_permission(&self) -> EngineResult<Permission> {
        Ok(Permission::new(format!("core.key.view.{}", self.key_id.0))?)
    }

    /// Whether the external expiry has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    /// Ordering used to pick the record to keep among duplicates: valid
    /// first, then most recently validated, then most recently modified.
    fn retention_rank(&self) -> (bool, Option<DateTime<Utc>>, DateTime<Utc>) {
        (self.valid, self.validated_at, self.modified)
    }
}

/// A record removed by [`CredentialStore::purge_duplicates`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgedCredential {
    /// Removed record.
    pub id: CredentialId,
    /// Its key id.
    pub key_id: KeyId,
    /// Its owner.
    pub owner: UserId,
    /// Whether it was still valid.
    pub valid: bool,
    /// The record that was kept for the same key id.
    pub kept: CredentialId,
}

/// Outcome of a duplicate purge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    /// Key ids that had duplicates.
    pub duplicate_keys: usize,
    /// Every removed record, for operator audit.
    pub removed: Vec<PurgedCredential>,
    /// Whether this run switched key id uniqueness on.
    #[serde(default)]
    pub unique_keys_enabled: bool,
}

impl PurgeReport {
    /// Whether the purge changed anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct CredentialTable {
    records: HashMap<CredentialId, Credential>,
    /// Reject imports that repeat a stored key id.
    unique_keys: bool,
}

impl CredentialTable {
    fn key_in_use(&self, key_id: KeyId) -> bool {
        self.records.values().any(|c| c.key_id == key_id)
    }
}

/// Thread-safe credential store.
#[derive(Debug)]
pub struct CredentialStore {
    table: RwLock<CredentialTable>,
    policy: Arc<KeyPolicyValidator>,
}

impl CredentialStore {
    /// Create an empty store with uniqueness enforcement on.
    #[must_use]
    pub fn new(policy: Arc<KeyPolicyValidator>) -> Self {
        Self {
            table: RwLock::new(CredentialTable {
                records: HashMap::new(),
                unique_keys: true,
            }),
            policy,
        }
    }

    /// Create an empty store that accepts duplicate key ids from
    /// [`import_legacy`](Self::import_legacy) until
    /// [`enable_unique_keys`](Self::enable_unique_keys) is called.
    #[must_use]
    pub fn legacy(policy: Arc<KeyPolicyValidator>) -> Self {
        let store = Self::new(policy);
        if let Ok(mut table) = store.table.write() {
            table.unique_keys = false;
        }
        store
    }

    /// Register a new key for `owner`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidMask`] if the mask is below the minimum.
    /// - [`EngineError::DuplicateKey`] if any user already stores `key_id`.
    pub fn register(
        &self,
        owner: UserId,
        key_id: KeyId,
        verification_code: impl Into<String>,
        mask: KeyMask,
        kind: KeyKind,
    ) -> EngineResult<Credential> {
        self.policy.check_minimum(mask)?;

        let credential = Credential::new(owner, key_id, verification_code, mask, kind);
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        if table.key_in_use(key_id) {
            return Err(EngineError::DuplicateKey(key_id));
        }
        table.records.insert(credential.id, credential.clone());
        drop(table);

        tracing::info!(%owner, %key_id, credential = %credential.id, "registered credential");
        Ok(credential)
    }

    /// Insert a record carried over from a previous system as-is.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateKey`] if uniqueness is enforced and
    /// the key id is already stored.
    pub fn import_legacy(&self, credential: Credential) -> EngineResult<()> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        if table.unique_keys && table.key_in_use(credential.key_id) {
            return Err(EngineError::DuplicateKey(credential.key_id));
        }
        table.records.insert(credential.id, credential);
        Ok(())
    }

    /// Turn on key id uniqueness for imports.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateKey`] naming the first duplicated key
    /// while duplicates remain; run [`purge_duplicates`](Self::purge_duplicates)
    /// first.
    pub fn enable_unique_keys(&self) -> EngineResult<()> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        if let Some(key_id) = duplicate_keys(&table.records).into_iter().next() {
            return Err(EngineError::DuplicateKey(key_id));
        }
        table.unique_keys = true;
        Ok(())
    }

    /// Whether imports are checked for key id uniqueness.
    #[must_use]
    pub fn unique_keys_enforced(&self) -> bool {
        self.table.read().is_ok_and(|t| t.unique_keys)
    }

    /// Key ids stored more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn duplicate_key_ids(&self) -> EngineResult<Vec<KeyId>> {
        let table = self.table.read().map_err(|e| EngineError::poisoned(&e))?;
        Ok(duplicate_keys(&table.records))
    }

    /// Remove duplicate key ids, keeping one record per key, and enforce
    /// uniqueness from then on.
    ///
    /// Keeps the valid record first, then the most recently validated, then
    /// the most recently modified. Identities that pointed at a removed
    /// record become orphans and are cleaned up by orphan removal. Enforcement
    /// is switched on in the same critical section, so no import can slip a
    /// duplicate in between.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn purge_duplicates(&self) -> EngineResult<PurgeReport> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;

        let mut by_key: BTreeMap<KeyId, Vec<&Credential>> = BTreeMap::new();
        for credential in table.records.values() {
            by_key.entry(credential.key_id).or_default().push(credential);
        }

        let mut report = PurgeReport::default();
        for group in by_key.values().filter(|g| g.len() > 1) {
            let Some(keep) = group
                .iter()
                .max_by(|a, b| {
                    a.retention_rank()
                        .cmp(&b.retention_rank())
                        .then_with(|| b.id.cmp(&a.id))
                })
                .map(|c| c.id)
            else {
                continue;
            };
            report.duplicate_keys = report.duplicate_keys.saturating_add(1);
            report.removed.extend(group.iter().filter(|c| c.id != keep).map(|c| {
                PurgedCredential {
                    id: c.id,
                    key_id: c.key_id,
                    owner: c.owner,
                    valid: c.valid,
                    kept: keep,
                }
            }));
        }

        for purged in &report.removed {
            table.records.remove(&purged.id);
            tracing::info!(
                key_id = %purged.key_id,
                removed = %purged.id,
                kept = %purged.kept,
                owner = %purged.owner,
                "purged duplicate credential"
            );
        }

        if !table.unique_keys {
            table.unique_keys = true;
            report.unique_keys_enabled = true;
            tracing::info!("key id uniqueness enforced");
        }

        Ok(report)
    }

    /// Mark a credential invalid. Returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn invalidate(&self, id: CredentialId) -> EngineResult<Credential> {
        self.update(id, |c| {
            c.valid = false;
            c.verified = false;
        })
        .inspect(|c| tracing::info!(credential = %id, key_id = %c.key_id, "invalidated credential"))
    }

    /// Apply a key authority lookup to the stored record.
    ///
    /// Updates mask, kind and expiry, recomputes `verified` and the
    /// recommendation violation (an identity conflict takes precedence and
    /// is cleared only by `conflict = false`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn update_from_key_info(
        &self,
        id: CredentialId,
        info: &KeyInfo,
        conflict: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<Credential> {
        let recommendation = self.policy.recommendation(info.kind, info.mask);
        self.update(id, |c| {
            c.mask = info.mask;
            c.kind = info.kind;
            c.expires = info.expires;
            c.verified = recommendation.is_none();
            c.violation = if conflict {
                Some(Violation::Character)
            } else {
                recommendation
            };
            c.validated_at = Some(now);
        })
    }

    /// Overwrite the violation flag.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown id.
    pub fn set_violation(
        &self,
        id: CredentialId,
        violation: Option<Violation>,
    ) -> EngineResult<Credential> {
        self.update(id, |c| c.violation = violation)
    }

    fn update<F>(&self, id: CredentialId, apply: F) -> EngineResult<Credential>
    where
        F: FnOnce(&mut Credential),
    {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        let credential = table
            .records
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found(id))?;
        apply(credential);
        credential.modified = Utc::now();
        Ok(credential.clone())
    }

    /// Invalidate every valid credential whose expiry has passed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn expire(&self, now: DateTime<Utc>) -> EngineResult<Vec<CredentialId>> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        let mut expired = Vec::new();
        for credential in table.records.values_mut() {
            if credential.valid && credential.is_expired(now) {
                credential.valid = false;
                credential.verified = false;
                credential.modified = now;
                expired.push(credential.id);
            }
        }
        Ok(expired)
    }

    /// Look up a credential.
    #[must_use]
    pub fn get(&self, id: CredentialId) -> Option<Credential> {
        self.read_table().records.get(&id).cloned()
    }

    /// All records with `key_id` (more than one only before a purge).
    #[must_use]
    pub fn by_key(&self, key_id: KeyId) -> Vec<Credential> {
        self.filtered(|c| c.key_id == key_id)
    }

    /// All credentials owned by `owner`, oldest first.
    #[must_use]
    pub fn by_owner(&self, owner: UserId) -> Vec<Credential> {
        self.filtered(|c| c.owner == owner)
    }

    /// Every stored credential, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<Credential> {
        self.filtered(|_| true)
    }

    fn filtered<P>(&self, predicate: P) -> Vec<Credential>
    where
        P: Fn(&Credential) -> bool,
    {
        let mut found: Vec<Credential> = self
            .read_table()
            .records
            .values()
            .filter(|c| predicate(c))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found
    }

    /// Delete a record outright.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn remove(&self, id: CredentialId) -> EngineResult<Option<Credential>> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        Ok(table.records.remove(&id))
    }

    /// Delete every invalid record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn remove_invalid(&self) -> EngineResult<Vec<CredentialId>> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        let invalid: Vec<CredentialId> = table
            .records
            .values()
            .filter(|c| !c.valid)
            .map(|c| c.id)
            .collect();
        for id in &invalid {
            table.records.remove(id);
        }
        Ok(invalid)
    }

    /// Delete every record owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn remove_by_owner(&self, owner: UserId) -> EngineResult<Vec<CredentialId>> {
        let mut table = self.table.write().map_err(|e| EngineError::poisoned(&e))?;
        let owned: Vec<CredentialId> = table
            .records
            .values()
            .filter(|c| c.owner == owner)
            .map(|c| c.id)
            .collect();
        for id in &owned {
            table.records.remove(id);
        }
        Ok(owned)
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_table().records.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, CredentialTable> {
        self.table.read().unwrap_or_else(|e| {
            tracing::warn!("CredentialStore read lock poisoned, recovering");
            e.into_inner()
        })
    }
}

fn duplicate_keys(records: &HashMap<CredentialId, Credential>) -> Vec<KeyId> {
    let mut counts: BTreeMap<KeyId, usize> = BTreeMap::new();
    for credential in records.values() {
        let n = counts.entry(credential.key_id).or_default();
        *n = n.saturating_add(1);
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(key_id, _)| key_id)
        .collect()
}
