//! Integration tests for key revocation, orphan removal, duplicate purging
//! and primary identity upkeep.

#![allow(clippy::arithmetic_side_effects)]

mod common;

use chrono::{Duration, Utc};
use common::{Harness, p};
use warrant_core::{IdentityId, KeyId, KeyKind, KeyMask, ProviderError};
use warrant_engine::{Credential, EngineError};
use warrant_test::{expiring_key_info, key_info};

#[tokio::test]
async fn test_revoked_key_cascades_and_reassigns_primary() {
    let h = Harness::new();
    let user = h.user("erin");
    let (first_key, first) = h.character_key(user, 600, 0, (60, "First")).await;
    let (_, second) = h.character_key(user, 601, 0, (61, "Second")).await;
    assert_eq!(h.engine.users().get(user).unwrap().primary, Some(first.id));

    let app = h.app(user, "Board", "board", 0);
    let grant = h
        .engine
        .authorize(user, app, &[first.id], &[p("board.read")])
        .unwrap();

    h.provider.revoke(KeyId(600));
    let err = h.engine.resolve_credential(first_key.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Provider(ProviderError::Revoked(KeyId(600)))));

    assert!(h.engine.credentials().get(first_key.id).is_none());
    assert!(h.engine.identities().get(first.id).is_none());
    assert!(h.engine.grants().store().get(grant.id).is_none());

    let account = h.engine.users().get(user).unwrap();
    assert_eq!(account.primary, Some(second.id));
    assert!(!account.needs_attention);
}

#[tokio::test]
async fn test_losing_last_identity_flags_account() {
    let h = Harness::new();
    let user = h.user("frank");
    let (credential, identity) = h.character_key(user, 700, 0, (70, "Only")).await;

    let report = h.engine.invalidate_credential(credential.id).unwrap();
    assert_eq!(report.removed_identities, vec![identity.id]);
    assert_eq!(report.removed_credentials, vec![credential.id]);
    assert_eq!(report.users_flagged, vec![user]);

    let account = h.engine.users().get(user).unwrap();
    assert_eq!(account.primary, None);
    assert!(account.needs_attention);

    // Nothing left to clean up.
    assert!(h.engine.maintenance().remove_orphans().unwrap().is_empty());
}

#[tokio::test]
async fn test_identity_claimed_twice_marks_duplicate_accounts() {
    let h = Harness::new();
    let first = h.user("grace");
    let second = h.user("heidi");
    let (_, identity) = h.character_key(first, 800, 0, (80, "Shared")).await;

    // A second key proving the same identity, owned by another account.
    h.provider
        .set_key(KeyId(801), key_info(0, KeyKind::Character, &[(80, "Shared")]));
    let (credential, identities) = h.engine.add_key(second, KeyId(801), "vcode").await.unwrap();

    assert!(identities.is_empty());
    assert_eq!(h.engine.identities().get(identity.id).unwrap().owner, first);
    assert!(credential.violation.is_some());
    assert!(
        h.engine
            .users()
            .get(first)
            .unwrap()
            .duplicates
            .contains(&second)
    );
}

#[tokio::test]
async fn test_identity_proven_by_two_keys_survives_losing_one() {
    let h = Harness::new();
    let user = h.user("bob");
    let (first, identity) = h.character_key(user, 300, 0, (7, "Bob")).await;
    let (second, again) = h.character_key(user, 301, 0, (7, "Bob")).await;
    assert_eq!(again.id, identity.id);

    let app = h.app(user, "Jabber", "jabber", 0);
    let grant = h
        .engine
        .authorize(user, app, &[identity.id], &[p("jabber.send")])
        .unwrap();

    let report = h.engine.invalidate_credential(first.id).unwrap();
    assert!(report.removed_identities.is_empty());
    assert!(report.grants_deleted.is_empty());
    assert_eq!(report.identities_rebound, vec![identity.id]);

    let kept = h.engine.identities().get(identity.id).unwrap();
    assert_eq!(kept.credential, second.id);
    assert_eq!(h.engine.grants().store().get(grant.id).unwrap().identities.len(), 1);
    assert!(h.engine.check(user, app, identity.id, &p("jabber.send")));

    // Once its last key is revoked the identity and its grant go.
    h.provider.revoke(KeyId(301));
    h.engine.resolve_credential(second.id).await.unwrap_err();
    assert!(h.engine.identities().get(identity.id).is_none());
    assert!(h.engine.grants().store().get(grant.id).is_none());
}

#[test]
fn test_purge_keeps_most_recently_validated_duplicate() {
    let h = Harness::legacy();
    let stale_owner = h.user("ivan");
    let fresh_owner = h.user("judy");

    let stale = Credential::new(stale_owner, KeyId(900), "old", KeyMask(0), KeyKind::Character);
    let mut fresh = Credential::new(fresh_owner, KeyId(900), "new", KeyMask(0), KeyKind::Character);
    // Validated after the lookup below refreshes the stale record.
    fresh.validated_at = Some(Utc::now() + Duration::hours(1));
    h.engine.credentials().import_legacy(stale.clone()).unwrap();
    h.engine.credentials().import_legacy(fresh.clone()).unwrap();
    h.engine
        .directory()
        .reconcile(stale.id, &key_info(0, KeyKind::Character, &[(90, "Dup")]))
        .unwrap();

    assert!(matches!(
        h.engine.credentials().enable_unique_keys(),
        Err(EngineError::DuplicateKey(KeyId(900)))
    ));

    let report = h.engine.maintenance().purge_duplicates().unwrap();
    assert_eq!(report.purge.duplicate_keys, 1);
    assert_eq!(report.purge.removed.len(), 1);
    assert_eq!(report.purge.removed[0].id, stale.id);
    assert_eq!(report.purge.removed[0].kept, fresh.id);
    assert_eq!(report.orphans_after.removed_identities, vec![IdentityId(90)]);
    assert_eq!(report.orphans_after.users_flagged, vec![stale_owner]);

    // The purge leaves uniqueness enforced for later imports too.
    assert!(report.purge.unique_keys_enabled);
    assert!(h.engine.credentials().unique_keys_enforced());
    assert!(matches!(
        h.engine.credentials().import_legacy(Credential::new(
            stale_owner,
            KeyId(900),
            "again",
            KeyMask(0),
            KeyKind::Character
        )),
        Err(EngineError::DuplicateKey(KeyId(900)))
    ));
}

#[tokio::test]
async fn test_refresh_reports_revoked_and_failed_keys() {
    let h = Harness::new();
    let user = h.user("ken");
    h.character_key(user, 1000, 0, (100, "Kept")).await;
    let (revoked, _) = h.character_key(user, 1001, 0, (101, "Revoked")).await;
    let (flaky, _) = h.character_key(user, 1002, 0, (102, "Flaky")).await;

    h.provider.revoke(KeyId(1001));
    h.provider
        .fail_next(KeyId(1002), ProviderError::Transient("timeout".into()));

    let report = h.engine.maintenance().refresh_credentials().await.unwrap();
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.revoked, vec![revoked.id]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, flaky.id);

    // A transient failure leaves the key and its identity alone.
    assert!(h.engine.credentials().get(flaky.id).is_some());
    assert!(h.engine.identities().get(IdentityId(102)).is_some());
    assert!(h.engine.identities().get(IdentityId(101)).is_none());
}

#[tokio::test]
async fn test_expired_keys_are_dropped_by_maintenance() {
    let h = Harness::new();
    let user = h.user("leo");
    let now = Utc::now();
    h.provider.set_key(
        KeyId(1100),
        expiring_key_info(0, KeyKind::Character, &[(110, "Expiring")], now - Duration::days(1)),
    );
    let (credential, _) = h.engine.add_key(user, KeyId(1100), "vcode").await.unwrap();
    h.character_key(user, 1101, 0, (111, "Lasting")).await;

    let report = h.engine.maintenance().run_all(now).unwrap();
    let expiry = report.expiry.unwrap();
    assert_eq!(expiry.expired, vec![credential.id]);
    assert_eq!(expiry.orphans.removed_identities, vec![IdentityId(110)]);
    assert_eq!(
        h.engine.users().get(user).unwrap().primary,
        Some(IdentityId(111))
    );
}
