//! Shared test harness for integration tests.

use std::sync::Arc;

use warrant_config::Config;
use warrant_core::{ApplicationId, KeyId, KeyKind, KeyMask, UserId};
use warrant_engine::{Credential, Engine, Identity};
use warrant_permissions::Permission;
use warrant_test::{MockKeyInfoProvider, key_info, test_config};

/// An engine wired to a scripted key authority.
#[allow(dead_code)]
pub struct Harness {
    /// The engine under test.
    pub engine: Engine,
    /// The scripted key authority the engine talks to.
    pub provider: MockKeyInfoProvider,
}

#[allow(dead_code)]
impl Harness {
    /// Build a harness from the permissive test configuration.
    pub fn new() -> Self {
        Self::with_config(&test_config())
    }

    /// Build a harness from `config`.
    pub fn with_config(config: &Config) -> Self {
        let provider = MockKeyInfoProvider::new();
        let engine = Engine::new(config, Arc::new(provider.clone())).unwrap();
        Self { engine, provider }
    }

    /// Build a harness whose credential store accepts imported duplicates.
    pub fn legacy() -> Self {
        let provider = MockKeyInfoProvider::new();
        let engine = Engine::legacy(&test_config(), Arc::new(provider.clone())).unwrap();
        Self { engine, provider }
    }

    /// Create a user.
    pub fn user(&self, name: &str) -> UserId {
        self.engine.create_user(name, 4).unwrap().id
    }

    /// Script a single-identity character key and add it for `owner`.
    pub async fn character_key(
        &self,
        owner: UserId,
        key_id: u64,
        mask: u64,
        identity: (u64, &str),
    ) -> (Credential, Identity) {
        self.provider.set_key(
            KeyId(key_id),
            key_info(mask, KeyKind::Character, &[identity]),
        );
        let (credential, mut identities) = self
            .engine
            .add_key(owner, KeyId(key_id), "vcode")
            .await
            .unwrap();
        assert_eq!(identities.len(), 1);
        (credential, identities.remove(0))
    }

    /// Register an application for `owner`, give it a short name and let
    /// the owner hold its whole namespace.
    pub fn app(&self, owner: UserId, name: &str, short_name: &str, required_mask: u64) -> ApplicationId {
        let app = self
            .engine
            .create_application(owner, name, KeyMask(required_mask), None)
            .unwrap();
        self.engine.set_short_name(owner, app.id, short_name).unwrap();
        self.entitle(owner, &format!("{short_name}.*"));
        app.id
    }

    /// Give `user` a personal permission.
    pub fn entitle(&self, user: UserId, permission: &str) {
        self.engine.grant_user_permission(user, p(permission)).unwrap();
    }
}

/// Parse a permission.
#[allow(dead_code)]
pub fn p(raw: &str) -> Permission {
    Permission::new(raw).unwrap()
}
