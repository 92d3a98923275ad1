//! Permission matching.
//!
//! Both functions are pure and evaluated at call time. Nothing is expanded
//! ahead of time, so a wildcard held today also covers permissions that are
//! registered tomorrow.

use crate::permission::Permission;

/// Check whether any permission in `held` satisfies `required`.
///
/// # Example
///
/// ```
/// use warrant_permissions::{Permission, matches};
///
/// let held = [Permission::new("core.*").unwrap()];
/// assert!(matches(&held, &Permission::new("core.user.permission.list").unwrap()));
/// ```
#[must_use]
pub fn matches<'a, H>(held: H, required: &Permission) -> bool
where
    H: IntoIterator<Item = &'a Permission>,
{
    held.into_iter().any(|p| p.covers(required))
}

/// Check whether `held` satisfies every permission in `required`.
///
/// AND semantics: a single uncovered requirement fails the whole check. An
/// empty requirement set is always satisfied.
///
/// # Example
///
/// ```
/// use warrant_permissions::{Permission, satisfies_any};
///
/// let held = [Permission::new("a.*").unwrap()];
/// let required = [Permission::new("a.b").unwrap(), Permission::new("c.d").unwrap()];
/// assert!(!satisfies_any(&held, &required));
/// ```
#[must_use]
pub fn satisfies_any<'h, 'r, H, R>(held: H, required: R) -> bool
where
    H: IntoIterator<Item = &'h Permission> + Clone,
    R: IntoIterator<Item = &'r Permission>,
{
    required
        .into_iter()
        .all(|r| matches(held.clone(), r))
}

/// Permissions in `required` that nothing in `held` covers.
#[must_use]
pub fn missing<'h, 'r, H, R>(held: H, required: R) -> Vec<&'r Permission>
where
    H: IntoIterator<Item = &'h Permission> + Clone,
    R: IntoIterator<Item = &'r Permission>,
{
    required
        .into_iter()
        .filter(|r| !matches(held.clone(), r))
        .collect()
}
