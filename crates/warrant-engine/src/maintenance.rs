//! Operator maintenance jobs.
//!
//! Jobs may run beside normal traffic but never beside each other: the
//! runner holds a single try-lock for the duration of a job and refuses a
//! second one with [`EngineError::MaintenanceBusy`]. Every job is idempotent,
//! so a run that failed halfway is finished by running it again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::Instrument;
use warrant_config::MaintenanceSection;
use warrant_core::CredentialId;
use warrant_telemetry::JobContext;

use crate::credential::{CredentialStore, PurgeReport};
use crate::error::{EngineError, EngineResult};
use crate::grant::GrantManager;
use crate::identity::{IdentityDirectory, OrphanReport};
use crate::migration::MigrationReport;
use crate::policy::KeyPolicyValidator;
use crate::users::UserStore;

/// Outcome of the duplicate purge job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DuplicatePurgeReport {
    /// Orphans removed before looking for duplicates.
    pub orphans_before: OrphanReport,
    /// Duplicate records removed.
    pub purge: PurgeReport,
    /// Identities and grants cleaned up after the purge.
    pub orphans_after: OrphanReport,
}

/// Outcome of the expiry job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    /// Credentials whose external expiry had passed.
    pub expired: Vec<CredentialId>,
    /// Cascade of the invalidation.
    pub orphans: OrphanReport,
}

/// Outcome of refreshing every credential at the key authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Credentials looked up successfully.
    pub refreshed: usize,
    /// Credentials the authority revoked.
    pub revoked: Vec<CredentialId>,
    /// Credentials whose lookup failed otherwise, with the error.
    pub failed: Vec<(CredentialId, String)>,
}

/// Outcome of [`MaintenanceRunner::run_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Duplicate purge.
    pub purge: DuplicatePurgeReport,
    /// Legacy grant migration.
    pub migration: MigrationReport,
    /// Expiry, if enabled.
    pub expiry: Option<ExpiryReport>,
    /// Login records dropped, if pruning is enabled.
    pub login_records_pruned: Option<usize>,
}

/// Runs maintenance jobs one at a time.
#[derive(Debug)]
pub struct MaintenanceRunner {
    credentials: Arc<CredentialStore>,
    directory: Arc<IdentityDirectory>,
    grants: Arc<GrantManager>,
    users: Arc<UserStore>,
    policy: Arc<KeyPolicyValidator>,
    settings: MaintenanceSection,
    running: Mutex<()>,
}

impl MaintenanceRunner {
    /// Create a runner.
    #[must_use]
    pub fn new(
        credentials: Arc<CredentialStore>,
        directory: Arc<IdentityDirectory>,
        grants: Arc<GrantManager>,
        users: Arc<UserStore>,
        policy: Arc<KeyPolicyValidator>,
        settings: MaintenanceSection,
    ) -> Self {
        Self {
            credentials,
            directory,
            grants,
            users,
            policy,
            settings,
            running: Mutex::new(()),
        }
    }

    /// The configured behaviour.
    #[must_use]
    pub fn settings(&self) -> &MaintenanceSection {
        &self.settings
    }

    /// Whether a job is running right now.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.running.try_lock().is_err()
    }

    fn acquire(&self, job: &str) -> EngineResult<MutexGuard<'_, ()>> {
        self.running.try_lock().map_err(|_| {
            tracing::warn!(job, "maintenance job refused, another job is running");
            EngineError::MaintenanceBusy(job.to_owned())
        })
    }

    /// Remove duplicate key ids, with orphan removal before and after.
    ///
    /// # Errors
    ///
    /// [`EngineError::MaintenanceBusy`] if another job runs, or a storage
    /// error.
    pub fn purge_duplicates(&self) -> EngineResult<DuplicatePurgeReport> {
        let _running = self.acquire("purge_duplicates")?;
        let _job = JobContext::new("purge_duplicates").enter();
        self.purge_duplicates_locked()
    }

    fn purge_duplicates_locked(&self) -> EngineResult<DuplicatePurgeReport> {
        let orphans_before = self.directory.remove_orphans()?;
        let purge = self.credentials.purge_duplicates()?;
        let orphans_after = self.directory.remove_orphans()?;
        tracing::info!(
            duplicate_keys = purge.duplicate_keys,
            removed = purge.removed.len(),
            unique_keys_enabled = purge.unique_keys_enabled,
            "duplicate purge finished"
        );
        Ok(DuplicatePurgeReport {
            orphans_before,
            purge,
            orphans_after,
        })
    }

    /// Remove identities without a valid credential.
    ///
    /// # Errors
    ///
    /// [`EngineError::MaintenanceBusy`] if another job runs, or a storage
    /// error.
    pub fn remove_orphans(&self) -> EngineResult<OrphanReport> {
        let _running = self.acquire("remove_orphans")?;
        let _job = JobContext::new("remove_orphans").enter();
        self.directory.remove_orphans()
    }

    /// Merge legacy grants.
    ///
    /// # Errors
    ///
    /// [`EngineError::MaintenanceBusy`] if another job runs, or a storage
    /// error.
    pub fn migrate_legacy_grants(&self, dry_run: bool) -> EngineResult<MigrationReport> {
        let _running = self.acquire("migrate_legacy_grants")?;
        let _job = JobContext::new("migrate_legacy_grants")
            .with_dry_run(dry_run)
            .enter();
        self.grants.migrate_legacy_grants(dry_run)
    }

    /// Invalidate credentials whose expiry passed at `now` and cascade.
    ///
    /// # Errors
    ///
    /// [`EngineError::MaintenanceBusy`] if another job runs, or a storage
    /// error.
    pub fn expire_credentials(&self, now: DateTime<Utc>) -> EngineResult<ExpiryReport> {
        let _running = self.acquire("expire_credentials")?;
        let _job = JobContext::new("expire_credentials").enter();
        self.expire_credentials_locked(now)
    }

    fn expire_credentials_locked(&self, now: DateTime<Utc>) -> EngineResult<ExpiryReport> {
        let expired = self.credentials.expire(now)?;
        let orphans = if expired.is_empty() {
            OrphanReport::default()
        } else {
            tracing::info!(count = expired.len(), "credentials expired");
            self.directory.remove_orphans()?
        };
        Ok(ExpiryReport { expired, orphans })
    }

    /// Drop login history older than the retention window.
    ///
    /// # Errors
    ///
    /// [`EngineError::MaintenanceBusy`] if another job runs, or a storage
    /// error.
    pub fn prune_login_history(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let _running = self.acquire("prune_login_history")?;
        let _job = JobContext::new("prune_login_history").enter();
        self.prune_login_history_locked(now)
    }

    fn prune_login_history_locked(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let cutoff = self.policy.login_history_cutoff(now);
        let pruned = self.users.prune_login_history(cutoff)?;
        tracing::info!(pruned, %cutoff, "login history pruned");
        Ok(pruned)
    }

    /// Look up every valid credential at the key authority again.
    ///
    /// Failures are collected per credential; one bad key never stops the
    /// run.
    ///
    /// # Errors
    ///
    /// [`EngineError::MaintenanceBusy`] if another job runs.
    pub async fn refresh_credentials(&self) -> EngineResult<RefreshReport> {
        let _running = self.acquire("refresh_credentials")?;
        let context = JobContext::new("refresh_credentials");
        let span = context.span();
        async {
            tracing::info!("job started");
            let mut report = RefreshReport::default();
            for credential in self.credentials.all().into_iter().filter(|c| c.valid) {
                match self.directory.resolve(credential.id).await {
                    Ok(_) => report.refreshed = report.refreshed.saturating_add(1),
                    Err(EngineError::Provider(warrant_core::ProviderError::Revoked(_))) => {
                        report.revoked.push(credential.id);
                    },
                    Err(e) => report.failed.push((credential.id, e.to_string())),
                }
            }
            tracing::info!(
                refreshed = report.refreshed,
                revoked = report.revoked.len(),
                failed = report.failed.len(),
                elapsed_ms = context.elapsed_ms(),
                "job finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Run the offline jobs in dependency order: purge (with orphan
    /// removal), migration, expiry, login history. Migration honours the
    /// configured `dry_run`; expiry and pruning run only when enabled.
    ///
    /// # Errors
    ///
    /// [`EngineError::MaintenanceBusy`] if another job runs, or the first
    /// storage error.
    pub fn run_all(&self, now: DateTime<Utc>) -> EngineResult<MaintenanceReport> {
        let _running = self.acquire("run_all")?;
        let job = JobContext::new("run_all")
            .with_dry_run(self.settings.dry_run)
            .enter();

        let purge = {
            let _step = job.context().child("purge_duplicates").enter();
            self.purge_duplicates_locked()?
        };
        let migration = {
            let _step = job.context().child("migrate_legacy_grants").enter();
            self.grants.migrate_legacy_grants(self.settings.dry_run)?
        };
        let expiry = if self.settings.purge_expired_credentials {
            let _step = job.context().child("expire_credentials").enter();
            Some(self.expire_credentials_locked(now)?)
        } else {
            None
        };
        let login_records_pruned = if self.settings.prune_login_history {
            let _step = job.context().child("prune_login_history").enter();
            Some(self.prune_login_history_locked(now)?)
        } else {
            None
        };

        Ok(MaintenanceReport {
            purge,
            migration,
            expiry,
            login_records_pruned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ApplicationRegistry;
    use crate::credential::Credential;
    use crate::grant::GrantStore;
    use crate::identity::IdentityStore;
    use crate::policy::KeyPolicy;
    use chrono::Duration;
    use warrant_core::{IdentityId, IdentityInfo, KeyId, KeyKind, KeyMask};
    use warrant_test::{MockKeyInfoProvider, expiring_key_info, key_info};

    struct Fixture {
        credentials: Arc<CredentialStore>,
        identities: Arc<IdentityStore>,
        users: Arc<UserStore>,
        provider: MockKeyInfoProvider,
        runner: MaintenanceRunner,
    }

    fn fixture(settings: MaintenanceSection) -> Fixture {
        let policy = Arc::new(KeyPolicyValidator::new(KeyPolicy::default()));
        let credentials = Arc::new(CredentialStore::legacy(Arc::clone(&policy)));
        let identities = Arc::new(IdentityStore::new());
        let users = Arc::new(UserStore::new());
        let grants = Arc::new(GrantStore::new());
        let provider = MockKeyInfoProvider::new();
        let directory = Arc::new(
            IdentityDirectory::new(
                Arc::clone(&credentials),
                Arc::clone(&identities),
                Arc::clone(&users),
                Arc::clone(&grants),
                Arc::clone(&policy),
                Arc::new(provider.clone()),
            )
            .with_backoff(warrant_core::Backoff::none()),
        );
        let manager = Arc::new(GrantManager::new(
            grants,
            Arc::new(ApplicationRegistry::new()),
            Arc::clone(&users),
            Arc::clone(&identities),
            Arc::clone(&credentials),
            Arc::clone(&policy),
        ));
        let runner = MaintenanceRunner::new(
            Arc::clone(&credentials),
            directory,
            manager,
            Arc::clone(&users),
            policy,
            settings,
        );
        Fixture {
            credentials,
            identities,
            users,
            provider,
            runner,
        }
    }

    #[test]
    fn test_second_job_is_refused_while_running() {
        let f = fixture(MaintenanceSection::default());
        let held = f.runner.acquire("held").unwrap();
        assert!(f.runner.is_busy());
        assert!(matches!(
            f.runner.remove_orphans(),
            Err(EngineError::MaintenanceBusy(job)) if job == "remove_orphans"
        ));
        drop(held);
        assert!(f.runner.remove_orphans().is_ok());
    }

    #[test]
    fn test_purge_cleans_identities_of_removed_duplicates() {
        let f = fixture(MaintenanceSection::default());
        let owner = f
            .users
            .create("owner", 4, &KeyPolicyValidator::default())
            .unwrap()
            .id;
        let mut kept = Credential::new(owner, KeyId(1), "a", KeyMask(1), KeyKind::Character);
        kept.validated_at = Some(Utc::now());
        let dropped = Credential::new(owner, KeyId(1), "b", KeyMask(1), KeyKind::Character);
        f.identities
            .bind(&IdentityInfo::new(10, "Ten"), &dropped, &f.credentials, Utc::now())
            .unwrap();
        f.credentials.import_legacy(kept).unwrap();
        f.credentials.import_legacy(dropped).unwrap();

        let report = f.runner.purge_duplicates().unwrap();
        assert_eq!(report.purge.removed.len(), 1);
        assert_eq!(report.orphans_after.removed_identities, vec![IdentityId(10)]);
        assert!(f.credentials.duplicate_key_ids().unwrap().is_empty());
        assert!(report.purge.unique_keys_enabled);
        assert!(matches!(
            f.credentials
                .import_legacy(Credential::new(owner, KeyId(1), "c", KeyMask(1), KeyKind::Character)),
            Err(EngineError::DuplicateKey(KeyId(1)))
        ));

        assert!(f.runner.purge_duplicates().unwrap().purge.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_collects_per_credential_outcomes() {
        let f = fixture(MaintenanceSection::default());
        let owner = f
            .users
            .create("owner", 4, &KeyPolicyValidator::default())
            .unwrap()
            .id;
        for key in [1, 2, 3] {
            f.credentials
                .register(owner, KeyId(key), "c", KeyMask(8), KeyKind::Character)
                .unwrap();
        }
        f.provider
            .set_key(KeyId(1), key_info(8, KeyKind::Character, &[(100, "One")]));
        f.provider.revoke(KeyId(2));

        let report = f.runner.refresh_credentials().await.unwrap();
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.revoked.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert!(!f.runner.is_busy());
    }

    #[tokio::test]
    async fn test_run_all_expires_and_prunes() {
        let f = fixture(MaintenanceSection::default());
        let owner = f
            .users
            .create("owner", 4, &KeyPolicyValidator::default())
            .unwrap()
            .id;
        let now = Utc::now();
        let cred = f
            .credentials
            .register(owner, KeyId(5), "c", KeyMask(8), KeyKind::Character)
            .unwrap();
        f.provider.set_key(
            KeyId(5),
            expiring_key_info(8, KeyKind::Character, &[(50, "Fifty")], now - Duration::hours(1)),
        );
        f.runner.refresh_credentials().await.unwrap();
        f.users
            .record_login(owner, now - Duration::days(90), None)
            .unwrap();

        let report = f.runner.run_all(now).unwrap();
        let expiry = report.expiry.unwrap();
        assert_eq!(expiry.expired, vec![cred.id]);
        assert_eq!(expiry.orphans.users_flagged, vec![owner]);
        assert_eq!(report.login_records_pruned, Some(1));
        assert!(report.migration.is_complete());
        assert!(f.identities.is_empty());
    }

    #[test]
    fn test_run_all_respects_disabled_jobs() {
        let f = fixture(MaintenanceSection {
            dry_run: true,
            purge_expired_credentials: false,
            prune_login_history: false,
        });
        let report = f.runner.run_all(Utc::now()).unwrap();
        assert!(report.expiry.is_none());
        assert!(report.login_records_pruned.is_none());
        assert!(report.migration.dry_run);
    }
}
