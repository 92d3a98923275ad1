//! Legacy grant migration.
//!
//! Folds per-identity legacy grants into one current grant per (user,
//! application). Each group is checked first and then committed in a single
//! critical section of the grant store, so a group is either fully merged
//! or left exactly as it was. A group that cannot be merged without dropping
//! data is reported and skipped; re-running the job retries it. Groups that
//! were already merged have no legacy records left, which makes the job a
//! no-op the second time.

use std::collections::BTreeSet;

use serde::Serialize;
use warrant_core::{ApplicationId, GrantId, IdentityId, UserId};

use crate::error::{EngineError, EngineResult};
use crate::grant::{Grant, GrantManager};

/// Version recorded once every legacy group has been merged.
pub const LEGACY_GRANT_MIGRATION_VERSION: u32 = 2;

/// A group merged (or, in a dry run, mergeable) into one grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedGroup {
    /// Grant owner.
    pub user: UserId,
    /// Grant target.
    pub application: ApplicationId,
    /// Legacy records folded in.
    pub legacy_grants: Vec<GrantId>,
    /// Resulting grant; `None` in a dry run.
    pub grant: Option<GrantId>,
    /// Identities of the resulting grant.
    pub identities: BTreeSet<IdentityId>,
    /// Number of permissions of the resulting grant.
    pub permissions: usize,
}

/// A group left unmerged for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFailure {
    /// Grant owner.
    pub user: UserId,
    /// Grant target.
    pub application: ApplicationId,
    /// What prevented the merge.
    pub reason: String,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Migration version the run applies.
    pub version: u32,
    /// Whether anything was written.
    pub dry_run: bool,
    /// Groups with at least one legacy record.
    pub groups_examined: usize,
    /// Groups merged.
    pub merged: Vec<MergedGroup>,
    /// Groups skipped.
    pub failures: Vec<MigrationFailure>,
}

impl MigrationReport {
    /// Whether every examined group merged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Pretty JSON for operator review.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Serialization`] if encoding fails.
    pub fn to_json_pretty(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Merge every legacy grant group into the current format.
///
/// With `dry_run` the report lists what would happen and nothing is written.
///
/// # Errors
///
/// Returns an error only for storage failures. Inconsistent groups end up in
/// [`MigrationReport::failures`].
pub fn migrate_legacy_grants(manager: &GrantManager, dry_run: bool) -> EngineResult<MigrationReport> {
    let store = manager.store();
    let groups = store.legacy_groups();
    let mut report = MigrationReport {
        version: LEGACY_GRANT_MIGRATION_VERSION,
        dry_run,
        groups_examined: groups.len(),
        merged: Vec::new(),
        failures: Vec::new(),
    };

    for ((user, application), legacy) in groups {
        let lock = manager.pair_lock(user, application);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        match merge_group(manager, user, application, &legacy, dry_run) {
            Ok(merged) => report.merged.push(merged),
            Err(EngineError::MigrationConsistency {
                user,
                application,
                reason,
            }) => {
                tracing::warn!(%user, %application, %reason, "legacy grant group needs manual review");
                report.failures.push(MigrationFailure {
                    user,
                    application,
                    reason,
                });
            },
            Err(e) => return Err(e),
        }
    }

    if !dry_run && report.is_complete() {
        store.set_migration_version(LEGACY_GRANT_MIGRATION_VERSION)?;
    }

    tracing::info!(
        version = report.version,
        dry_run,
        groups = report.groups_examined,
        merged = report.merged.len(),
        failed = report.failures.len(),
        "legacy grant migration finished"
    );
    Ok(report)
}

fn merge_group(
    manager: &GrantManager,
    user: UserId,
    application: ApplicationId,
    legacy: &[Grant],
    dry_run: bool,
) -> EngineResult<MergedGroup> {
    let inconsistent = |reason: String| EngineError::MigrationConsistency {
        user,
        application,
        reason,
    };

    let mut identities = BTreeSet::new();
    let mut permissions = BTreeSet::new();
    for grant in legacy {
        if grant.identities.len() != 1 {
            return Err(inconsistent(format!(
                "legacy grant {} carries {} identities",
                grant.id,
                grant.identities.len()
            )));
        }
        for &id in &grant.identities {
            match manager.identities().get(id) {
                None => return Err(inconsistent(format!("{id} no longer exists"))),
                Some(identity) if identity.owner != user => {
                    return Err(inconsistent(format!("{id} now belongs to {}", identity.owner)));
                },
                Some(_) => {
                    identities.insert(id);
                },
            }
        }
        permissions.extend(grant.permissions.iter().cloned());
    }

    if let Some(current) = manager.store().current_for(user, application) {
        identities.extend(current.identities);
        permissions.extend(current.permissions);
    }

    let legacy_grants: Vec<GrantId> = legacy.iter().map(|g| g.id).collect();
    if dry_run {
        return Ok(MergedGroup {
            user,
            application,
            legacy_grants,
            grant: None,
            identities,
            permissions: permissions.len(),
        });
    }

    let expected: BTreeSet<GrantId> = legacy_grants.iter().copied().collect();
    let merged = manager
        .store()
        .replace_legacy_group(user, application, &expected)?;
    tracing::debug!(%user, %application, grant = %merged.id, records = legacy_grants.len(), "merged legacy grants");
    Ok(MergedGroup {
        user,
        application,
        legacy_grants,
        grant: Some(merged.id),
        identities: merged.identities,
        permissions: merged.permissions.len(),
    })
}

impl GrantManager {
    /// Run the legacy grant migration. See [`migrate_legacy_grants`].
    ///
    /// # Errors
    ///
    /// Returns an error only for storage failures.
    pub fn migrate_legacy_grants(&self, dry_run: bool) -> EngineResult<MigrationReport> {
        migrate_legacy_grants(self, dry_run)
    }
}
