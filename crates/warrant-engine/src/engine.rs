//! The engine facade.
//!
//! Wires every store and component from a [`Config`] and a key authority,
//! and implements the operations that span several components (cascading
//! deletes, visibility rules, ownership checks).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use warrant_config::Config;
use warrant_core::{
    ApplicationId, Backoff, CredentialId, GrantId, IdentityId, KeyId, KeyInfoProvider, KeyKind,
    KeyMask, UserId,
};
use warrant_permissions::{CORE_PERMISSIONS, Permission, PermissionRegistry, matcher};

use crate::application::{Application, ApplicationRegistry};
use crate::credential::{Credential, CredentialStore, LIST_ALL_PERMISSION};
use crate::error::{EngineError, EngineResult};
use crate::grant::{Grant, GrantChanges, GrantManager, GrantStore, RevokeTarget};
use crate::identity::{Identity, IdentityDirectory, IdentityStore, OrphanReport};
use crate::maintenance::MaintenanceRunner;
use crate::policy::KeyPolicyValidator;
use crate::users::{User, UserStore};

/// Permission that lets a user manage applications it does not own.
pub const MANAGE_APPLICATIONS_PERMISSION: &str = "core.application.manage";

/// Everything removed by [`Engine::delete_user`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserDeletion {
    /// Grants of the user and grants for the user's applications.
    pub grants: Vec<GrantId>,
    /// Identities the user owned.
    pub identities: Vec<IdentityId>,
    /// Credentials the user owned.
    pub credentials: Vec<CredentialId>,
    /// Applications the user registered.
    pub applications: Vec<ApplicationId>,
}

/// Credential and permission consistency engine.
pub struct Engine {
    policy: Arc<KeyPolicyValidator>,
    permissions: Arc<PermissionRegistry>,
    users: Arc<UserStore>,
    credentials: Arc<CredentialStore>,
    identities: Arc<IdentityStore>,
    applications: Arc<ApplicationRegistry>,
    grants: Arc<GrantManager>,
    directory: Arc<IdentityDirectory>,
    maintenance: MaintenanceRunner,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("policy_revision", &self.policy.revision())
            .field("users", &self.users.len())
            .field("credentials", &self.credentials.len())
            .field("identities", &self.identities.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine that enforces key id uniqueness from the start.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for an unusable policy.
    pub fn new(config: &Config, provider: Arc<dyn KeyInfoProvider>) -> EngineResult<Self> {
        Self::build(config, provider, CredentialStore::new)
    }

    /// Build an engine whose credential store accepts duplicate key ids on
    /// import, for loading data from a previous system. The first
    /// `purge_duplicates` run after the import turns uniqueness on.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for an unusable policy.
    pub fn legacy(config: &Config, provider: Arc<dyn KeyInfoProvider>) -> EngineResult<Self> {
        Self::build(config, provider, CredentialStore::legacy)
    }

    fn build<F>(config: &Config, provider: Arc<dyn KeyInfoProvider>, credentials: F) -> EngineResult<Self>
    where
        F: FnOnce(Arc<KeyPolicyValidator>) -> CredentialStore,
    {
        let policy = Arc::new(KeyPolicyValidator::from_config(&config.policy)?);
        let permissions = Arc::new(PermissionRegistry::with_core()?);
        let users = Arc::new(UserStore::new());
        let credentials = Arc::new(credentials(Arc::clone(&policy)));
        let identities = Arc::new(IdentityStore::new());
        let applications = Arc::new(ApplicationRegistry::new());
        let grant_store = Arc::new(GrantStore::new());

        let backoff = Backoff::new(
            config.provider.max_retries,
            Duration::from_millis(config.provider.initial_backoff_ms),
            Duration::from_millis(config.provider.max_backoff_ms),
        );

        let directory = Arc::new(
            IdentityDirectory::new(
                Arc::clone(&credentials),
                Arc::clone(&identities),
                Arc::clone(&users),
                Arc::clone(&grant_store),
                Arc::clone(&policy),
                provider,
            )
            .with_backoff(backoff),
        );
        let grants = Arc::new(GrantManager::new(
            grant_store,
            Arc::clone(&applications),
            Arc::clone(&users),
            Arc::clone(&identities),
            Arc::clone(&credentials),
            Arc::clone(&policy),
        ));
        let maintenance = MaintenanceRunner::new(
            Arc::clone(&credentials),
            Arc::clone(&directory),
            Arc::clone(&grants),
            Arc::clone(&users),
            Arc::clone(&policy),
            config.maintenance.clone(),
        );

        tracing::info!(
            policy_revision = policy.revision(),
            permissions = permissions.len(),
            "engine ready"
        );
        Ok(Self {
            policy,
            permissions,
            users,
            credentials,
            identities,
            applications,
            grants,
            directory,
            maintenance,
        })
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Create a user account.
    ///
    /// # Errors
    ///
    /// [`EngineError::WeakPassword`] or [`EngineError::NameTaken`].
    pub fn create_user(&self, username: &str, password_score: u8) -> EngineResult<User> {
        self.users.create(username, password_score, &self.policy)
    }

    /// Delete a user with everything it owns.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown user, or a storage error.
    pub fn delete_user(&self, user: UserId) -> EngineResult<UserDeletion> {
        if self.users.get(user).is_none() {
            return Err(EngineError::not_found(user));
        }

        let mut deletion = UserDeletion {
            grants: self.grants.store().remove_for_user(user)?,
            ..UserDeletion::default()
        };
        for app in self.applications.by_owner(user) {
            deletion
                .grants
                .extend(self.grants.store().remove_for_application(app.id)?);
            self.applications.remove(app.id)?;
            deletion.applications.push(app.id);
        }
        for identity in self.identities.by_owner(user) {
            if self.identities.remove(identity.id)?.is_some() {
                let changes = self.grants.store().remove_identity(identity.id)?;
                deletion.grants.extend(changes.deleted);
                deletion.identities.push(identity.id);
            }
        }
        deletion.credentials = self.credentials.remove_by_owner(user)?;
        self.users.remove(user)?;

        tracing::info!(
            %user,
            grants = deletion.grants.len(),
            identities = deletion.identities.len(),
            credentials = deletion.credentials.len(),
            applications = deletion.applications.len(),
            "deleted user"
        );
        Ok(deletion)
    }

    /// Record a successful login now.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown user.
    pub fn record_login(&self, user: UserId, ip: Option<String>) -> EngineResult<()> {
        self.users.record_login(user, Utc::now(), ip)
    }

    /// Give a user a permission. Wildcards such as `core.*` are allowed.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown user.
    pub fn grant_user_permission(&self, user: UserId, permission: Permission) -> EngineResult<bool> {
        self.users.grant_permission(user, permission)
    }

    /// Take a permission from a user.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown user.
    pub fn revoke_user_permission(&self, user: UserId, permission: &Permission) -> EngineResult<bool> {
        self.users.revoke_permission(user, permission)
    }

    /// Registered permissions the user currently holds, wildcards expanded
    /// against the registry as it is now.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown user.
    pub fn user_permissions(&self, user: UserId) -> EngineResult<Vec<Permission>> {
        let account = self.users.get(user).ok_or_else(|| EngineError::not_found(user))?;
        Ok(self.permissions.covered_by(&account.permissions))
    }

    /// Register permission definitions, typically an application's own.
    ///
    /// # Errors
    ///
    /// [`EngineError::Permission`] for an invalid or wildcard name.
    pub fn register_permissions<'a, I>(&self, definitions: I) -> EngineResult<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Ok(self.permissions.init_perms(definitions)?)
    }

    /// Choose the primary identity of a user.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if the user does not own the identity.
    pub fn set_primary(&self, user: UserId, identity: IdentityId) -> EngineResult<()> {
        self.directory.set_primary(user, identity)
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    /// Store a key without contacting the key authority.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown owner,
    /// [`EngineError::InvalidMask`] or [`EngineError::DuplicateKey`].
    pub fn register_credential(
        &self,
        owner: UserId,
        key_id: KeyId,
        verification_code: &str,
        mask: KeyMask,
        kind: KeyKind,
    ) -> EngineResult<Credential> {
        if self.users.get(owner).is_none() {
            return Err(EngineError::not_found(owner));
        }
        self.credentials
            .register(owner, key_id, verification_code, mask, kind)
    }

    /// Resolve the identities of a stored key.
    ///
    /// # Errors
    ///
    /// See [`IdentityDirectory::resolve`].
    pub async fn resolve_credential(&self, credential: CredentialId) -> EngineResult<Vec<Identity>> {
        self.directory.resolve(credential).await
    }

    /// Look a key up, store it with the reported mask and kind, and resolve
    /// its identities. Nothing is stored if the lookup fails.
    ///
    /// # Errors
    ///
    /// [`EngineError::Provider`] when the lookup fails, otherwise as
    /// [`register_credential`](Self::register_credential).
    pub async fn add_key(
        &self,
        owner: UserId,
        key_id: KeyId,
        verification_code: &str,
    ) -> EngineResult<(Credential, Vec<Identity>)> {
        if self.users.get(owner).is_none() {
            return Err(EngineError::not_found(owner));
        }
        let info = self.directory.fetch(key_id, verification_code).await?;
        let credential = self
            .credentials
            .register(owner, key_id, verification_code, info.mask, info.kind)?;
        let identities = self.directory.reconcile(credential.id, &info)?;
        let credential = self
            .credentials
            .get(credential.id)
            .ok_or_else(|| EngineError::not_found(credential.id))?;
        Ok((credential, identities))
    }

    /// Mark a key invalid and remove everything that depended on it.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown credential.
    pub fn invalidate_credential(&self, credential: CredentialId) -> EngineResult<OrphanReport> {
        self.credentials.invalidate(credential)?;
        self.directory.remove_orphans()
    }

    /// Delete a key owned by `owner` and cascade.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if `owner` does not own the credential.
    pub fn delete_credential(&self, owner: UserId, credential: CredentialId) -> EngineResult<OrphanReport> {
        self.credentials
            .get(credential)
            .filter(|c| c.owner == owner)
            .ok_or_else(|| EngineError::not_found(credential))?;
        self.credentials.remove(credential)?;
        self.directory.remove_orphans()
    }

    /// Credentials `viewer` may see: its own, every key with
    /// `core.key.list.all`, and single keys through `core.key.view.<key_id>`.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown viewer.
    pub fn visible_credentials(&self, viewer: UserId) -> EngineResult<Vec<Credential>> {
        let account = self.users.get(viewer).ok_or_else(|| EngineError::not_found(viewer))?;
        let list_all = Permission::new(LIST_ALL_PERMISSION)?;
        if matcher::matches(&account.permissions, &list_all) {
            return Ok(self.credentials.all());
        }

        let mut visible = Vec::new();
        for credential in self.credentials.all() {
            if credential.owner == viewer
                || matcher::matches(&account.permissions, &credential.view_permission()?)
            {
                visible.push(credential);
            }
        }
        Ok(visible)
    }

    // -----------------------------------------------------------------------
    // Applications
    // -----------------------------------------------------------------------

    /// Register an application owned by `owner`.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown owner or
    /// [`EngineError::NameTaken`].
    pub fn create_application(
        &self,
        owner: UserId,
        name: &str,
        required_mask: KeyMask,
        required_kind: Option<KeyKind>,
    ) -> EngineResult<Application> {
        if self.users.get(owner).is_none() {
            return Err(EngineError::not_found(owner));
        }
        self.applications
            .create(owner, name, required_mask, required_kind)
    }

    /// Set an application's short name as `actor`.
    ///
    /// # Errors
    ///
    /// [`EngineError::InsufficientPermission`] unless `actor` owns the
    /// application or holds `core.application.manage`; otherwise see
    /// [`ApplicationRegistry::set_short_name`].
    pub fn set_short_name(
        &self,
        actor: UserId,
        application: ApplicationId,
        short_name: &str,
    ) -> EngineResult<Application> {
        self.check_manages(actor, application)?;
        self.applications.set_short_name(application, short_name)
    }

    /// Delete an application and its grants as `actor`.
    ///
    /// # Errors
    ///
    /// As [`set_short_name`](Self::set_short_name).
    pub fn delete_application(&self, actor: UserId, application: ApplicationId) -> EngineResult<Vec<GrantId>> {
        self.check_manages(actor, application)?;
        let removed = self.grants.store().remove_for_application(application)?;
        self.applications.remove(application)?;
        tracing::info!(%application, grants = removed.len(), "deleted application");
        Ok(removed)
    }

    fn check_manages(&self, actor: UserId, application: ApplicationId) -> EngineResult<()> {
        let app = self
            .applications
            .get(application)
            .ok_or_else(|| EngineError::not_found(application))?;
        if app.owner == actor {
            return Ok(());
        }
        let account = self.users.get(actor).ok_or_else(|| EngineError::not_found(actor))?;
        let manage = Permission::new(MANAGE_APPLICATIONS_PERMISSION)?;
        if matcher::matches(&account.permissions, &manage) {
            Ok(())
        } else {
            Err(EngineError::InsufficientPermission {
                missing: vec![MANAGE_APPLICATIONS_PERMISSION.to_owned()],
            })
        }
    }

    // -----------------------------------------------------------------------
    // Grants
    // -----------------------------------------------------------------------

    /// See [`GrantManager::authorize`].
    ///
    /// # Errors
    ///
    /// See [`GrantManager::authorize`].
    pub fn authorize(
        &self,
        user: UserId,
        application: ApplicationId,
        identities: &[IdentityId],
        permissions: &[Permission],
    ) -> EngineResult<Grant> {
        self.grants
            .authorize(user, application, identities, permissions)
    }

    /// See [`GrantManager::revoke`].
    ///
    /// # Errors
    ///
    /// See [`GrantManager::revoke`].
    pub fn revoke(
        &self,
        user: UserId,
        application: ApplicationId,
        target: &RevokeTarget,
    ) -> EngineResult<GrantChanges> {
        self.grants.revoke(user, application, target)
    }

    /// See [`GrantManager::check`].
    #[must_use]
    pub fn check(
        &self,
        user: UserId,
        application: ApplicationId,
        identity: IdentityId,
        permission: &Permission,
    ) -> bool {
        self.grants.check(user, application, identity, permission)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Enforced key policy.
    #[must_use]
    pub fn policy(&self) -> &KeyPolicyValidator {
        &self.policy
    }

    /// Permission definitions.
    #[must_use]
    pub fn permissions(&self) -> &PermissionRegistry {
        &self.permissions
    }

    /// User accounts.
    #[must_use]
    pub fn users(&self) -> &UserStore {
        &self.users
    }

    /// Stored keys.
    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Resolved identities.
    #[must_use]
    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    /// Identity resolution and orphan removal.
    #[must_use]
    pub fn directory(&self) -> &IdentityDirectory {
        &self.directory
    }

    /// Registered applications.
    #[must_use]
    pub fn applications(&self) -> &ApplicationRegistry {
        &self.applications
    }

    /// Grants.
    #[must_use]
    pub fn grants(&self) -> &GrantManager {
        &self.grants
    }

    /// Maintenance jobs.
    #[must_use]
    pub fn maintenance(&self) -> &MaintenanceRunner {
        &self.maintenance
    }

    /// The permissions the engine defines for itself.
    #[must_use]
    pub fn core_permissions() -> &'static [(&'static str, &'static str)] {
        CORE_PERMISSIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warrant_core::KeyKind;
    use warrant_test::{MockKeyInfoProvider, key_info, test_config};

    fn engine(provider: &MockKeyInfoProvider) -> Engine {
        Engine::new(&test_config(), Arc::new(provider.clone())).unwrap()
    }

    fn p(s: &str) -> Permission {
        Permission::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_add_key_registers_from_lookup() {
        let provider = MockKeyInfoProvider::new()
            .with_key(KeyId(100), key_info(8, KeyKind::Character, &[(1, "Alice")]));
        let engine = engine(&provider);
        let user = engine.create_user("alice", 3).unwrap();

        let (credential, identities) = engine.add_key(user.id, KeyId(100), "code").await.unwrap();
        assert_eq!(credential.mask, KeyMask(8));
        assert!(credential.validated_at.is_some());
        assert_eq!(identities[0].name, "Alice");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_add_key_stores_nothing_on_failure() {
        let provider = MockKeyInfoProvider::new();
        provider.revoke(KeyId(5));
        let engine = engine(&provider);
        let user = engine.create_user("bob", 3).unwrap();

        assert!(matches!(
            engine.add_key(user.id, KeyId(5), "code").await,
            Err(EngineError::Provider(_))
        ));
        assert!(engine.credentials().is_empty());
    }

    #[test]
    fn test_visible_credentials() {
        let engine = engine(&MockKeyInfoProvider::new());
        let owner = engine.create_user("owner", 3).unwrap().id;
        let viewer = engine.create_user("viewer", 3).unwrap().id;
        engine
            .register_credential(owner, KeyId(1), "c", KeyMask(1), KeyKind::Character)
            .unwrap();
        engine
            .register_credential(owner, KeyId(2), "c", KeyMask(1), KeyKind::Character)
            .unwrap();
        engine
            .register_credential(viewer, KeyId(3), "c", KeyMask(1), KeyKind::Character)
            .unwrap();

        let keys = |user: UserId| {
            let mut ids: Vec<u64> = engine
                .visible_credentials(user)
                .unwrap()
                .iter()
                .map(|c| c.key_id.0)
                .collect();
            ids.sort_unstable();
            ids
        };
        assert_eq!(keys(viewer), vec![3]);

        engine.grant_user_permission(viewer, p("core.key.view.2")).unwrap();
        assert_eq!(keys(viewer), vec![2, 3]);

        engine.grant_user_permission(viewer, p("core.key.list.*")).unwrap();
        assert_eq!(keys(viewer).len(), 3);
    }

    #[test]
    fn test_short_name_requires_owner_or_manager() {
        let engine = engine(&MockKeyInfoProvider::new());
        let owner = engine.create_user("dev", 3).unwrap().id;
        let other = engine.create_user("other", 3).unwrap().id;
        let app = engine
            .create_application(owner, "Jabber", KeyMask(4), None)
            .unwrap();

        assert!(matches!(
            engine.set_short_name(other, app.id, "jabber"),
            Err(EngineError::InsufficientPermission { .. })
        ));
        engine.grant_user_permission(other, p("core.*")).unwrap();
        engine.set_short_name(other, app.id, "jabber").unwrap();
        assert!(engine.set_short_name(owner, app.id, "jabber").is_ok());
    }

    #[test]
    fn test_user_permissions_follow_registry() {
        let engine = engine(&MockKeyInfoProvider::new());
        let admin = engine.create_user("admin", 3).unwrap().id;
        engine.grant_user_permission(admin, p("core.*")).unwrap();
        let before = engine.user_permissions(admin).unwrap().len();
        assert_eq!(before, CORE_PERMISSIONS.len());

        engine
            .register_permissions([("core.audit.read", "Read the audit log")])
            .unwrap();
        assert_eq!(engine.user_permissions(admin).unwrap().len(), before + 1);
    }

    #[tokio::test]
    async fn test_delete_user_cascades() {
        let provider = MockKeyInfoProvider::new()
            .with_key(KeyId(7), key_info(8, KeyKind::Character, &[(70, "Seven")]));
        let engine = engine(&provider);
        let user = engine.create_user("gone", 3).unwrap().id;
        engine.add_key(user, KeyId(7), "c").await.unwrap();
        let app = engine.create_application(user, "Tool", KeyMask(0), None).unwrap();
        engine.set_short_name(user, app.id, "tool").unwrap();
        engine.grant_user_permission(user, p("tool.*")).unwrap();
        engine
            .authorize(user, app.id, &[IdentityId(70)], &[p("tool.use")])
            .unwrap();

        let deletion = engine.delete_user(user).unwrap();
        assert_eq!(deletion.identities, vec![IdentityId(70)]);
        assert_eq!(deletion.credentials.len(), 1);
        assert_eq!(deletion.applications, vec![app.id]);
        assert!(!deletion.grants.is_empty());
        assert!(engine.users().is_empty());
        assert!(engine.identities().is_empty());
        assert!(engine.credentials().is_empty());
        assert!(engine.grants().store().is_empty());
    }
}
