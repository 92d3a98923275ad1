//! Operator key policy.
//!
//! The policy is a plain value built from configuration and handed to the
//! components that enforce it. Nothing here is global; bumping
//! `revision` and rebuilding the engine is how thresholds change.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use warrant_config::{ConfigError, PolicyConfig};
use warrant_core::{KeyKind, KeyMask};

use crate::application::Application;
use crate::credential::{Credential, Violation};
use crate::error::{EngineError, EngineResult};

/// Operator thresholds for keys and accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPolicy {
    /// Bumped whenever thresholds change.
    pub revision: u32,
    /// Lowest mask value a registered key may have.
    pub minimum_mask: KeyMask,
    /// Scopes a key should grant.
    pub recommended_mask: KeyMask,
    /// Kind a key should be.
    pub recommended_kind: KeyKind,
    /// Treat the recommendation as a requirement when authorizing.
    pub require_recommended_key: bool,
    /// Minimum password strength score at registration.
    pub required_password_strength: u8,
    /// Days of login history to keep.
    pub login_history_days: u32,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            revision: 1,
            minimum_mask: KeyMask::EMPTY,
            recommended_mask: KeyMask::EMPTY,
            recommended_kind: KeyKind::Character,
            require_recommended_key: false,
            required_password_strength: 3,
            login_history_days: 30,
        }
    }
}

impl TryFrom<&PolicyConfig> for KeyPolicy {
    type Error = EngineError;

    fn try_from(config: &PolicyConfig) -> Result<Self, Self::Error> {
        let recommended_kind = config.recommended_kind.parse::<KeyKind>().map_err(|e| {
            ConfigError::ValidationError {
                field: "policy.recommended_kind".to_owned(),
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            revision: config.revision,
            minimum_mask: KeyMask(config.minimum_mask),
            recommended_mask: KeyMask(config.recommended_mask),
            recommended_kind,
            require_recommended_key: config.require_recommended_key,
            required_password_strength: config.required_password_strength,
            login_history_days: config.login_history_days,
        })
    }
}

/// Result of checking a credential against an application and the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PolicyOutcome {
    /// Acceptable.
    Ok,
    /// Mask is below the policy minimum or the application requirement.
    BelowMinimum {
        /// The threshold the mask failed to reach.
        required: KeyMask,
    },
    /// Misses the recommendation while the recommendation is mandatory.
    NotRecommended {
        /// Which part of the recommendation is missed.
        violation: Violation,
    },
    /// The application requires a different key kind.
    WrongKind {
        /// Kind the application requires.
        required: KeyKind,
        /// Kind of the offered key.
        actual: KeyKind,
    },
}

impl PolicyOutcome {
    /// Whether the credential is acceptable.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for PolicyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::BelowMinimum { required } => write!(f, "mask below required {required}"),
            Self::NotRecommended { violation } => write!(f, "not recommended: {violation}"),
            Self::WrongKind { required, actual } => {
                write!(f, "wrong key kind: {actual}, requires {required}")
            },
        }
    }
}

/// Evaluates credentials and accounts against a [`KeyPolicy`].
#[derive(Debug, Clone, Default)]
pub struct KeyPolicyValidator {
    policy: KeyPolicy,
}

impl KeyPolicyValidator {
    /// Create a validator for `policy`.
    #[must_use]
    pub fn new(policy: KeyPolicy) -> Self {
        Self { policy }
    }

    /// Build a validator from the `[policy]` config section.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the recommended kind is unknown.
    pub fn from_config(config: &PolicyConfig) -> EngineResult<Self> {
        KeyPolicy::try_from(config).map(Self::new)
    }

    /// The enforced policy.
    #[must_use]
    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// Policy revision.
    #[must_use]
    pub fn revision(&self) -> u32 {
        self.policy.revision
    }

    /// Reject a mask below the minimum.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidMask`].
    pub fn check_minimum(&self, mask: KeyMask) -> EngineResult<()> {
        if mask.meets(self.policy.minimum_mask) {
            Ok(())
        } else {
            Err(EngineError::InvalidMask {
                mask,
                minimum: self.policy.minimum_mask,
            })
        }
    }

    /// How a key falls short of the recommendation, if at all.
    ///
    /// Kind is checked before mask. Account keys stand in for Character keys.
    #[must_use]
    pub fn recommendation(&self, kind: KeyKind, mask: KeyMask) -> Option<Violation> {
        if !kind.satisfies(self.policy.recommended_kind) {
            Some(Violation::Kind)
        } else if !mask.has_access(self.policy.recommended_mask) {
            Some(Violation::Mask)
        } else {
            None
        }
    }

    /// Check `credential` for use with `application`.
    #[must_use]
    pub fn evaluate(&self, credential: &Credential, application: &Application) -> PolicyOutcome {
        let required = self.policy.minimum_mask.max(application.required_mask);
        if !credential.mask.meets(required) {
            return PolicyOutcome::BelowMinimum { required };
        }

        if let Some(required) = application.required_kind
            && !credential.kind.satisfies(required)
        {
            return PolicyOutcome::WrongKind {
                required,
                actual: credential.kind,
            };
        }

        if self.policy.require_recommended_key
            && let Some(violation) = self.recommendation(credential.kind, credential.mask)
        {
            return PolicyOutcome::NotRecommended { violation };
        }

        PolicyOutcome::Ok
    }

    /// Whether a password strength score meets the threshold.
    #[must_use]
    pub fn password_acceptable(&self, score: u8) -> bool {
        score >= self.policy.required_password_strength
    }

    /// Reject a password whose strength is below the threshold.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WeakPassword`].
    pub fn check_password(&self, score: u8) -> EngineResult<()> {
        if self.password_acceptable(score) {
            Ok(())
        } else {
            Err(EngineError::WeakPassword {
                score,
                required: self.policy.required_password_strength,
            })
        }
    }

    /// Oldest login time still retained at `now`.
    #[must_use]
    pub fn login_history_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(Duration::days(i64::from(self.policy.login_history_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warrant_core::{KeyId, UserId};

    fn validator(policy: KeyPolicy) -> KeyPolicyValidator {
        KeyPolicyValidator::new(policy)
    }

    fn credential(mask: u64, kind: KeyKind) -> Credential {
        Credential::new(UserId::new(), KeyId(1), "code", KeyMask(mask), kind)
    }

    fn app(required_mask: u64, required_kind: Option<KeyKind>) -> Application {
        let mut app = Application::new(UserId::new(), "Jabber", KeyMask(required_mask));
        app.required_kind = required_kind;
        app
    }

    #[test]
    fn test_from_config() {
        let config = PolicyConfig {
            revision: 4,
            minimum_mask: 8,
            recommended_kind: "account".to_owned(),
            ..PolicyConfig::default()
        };
        let policy = KeyPolicy::try_from(&config).unwrap();
        assert_eq!(policy.revision, 4);
        assert_eq!(policy.minimum_mask, KeyMask(8));
        assert_eq!(policy.recommended_kind, KeyKind::Account);
    }

    #[test]
    fn test_from_config_rejects_unknown_kind() {
        let config = PolicyConfig {
            recommended_kind: "Alliance".to_owned(),
            ..PolicyConfig::default()
        };
        assert!(matches!(
            KeyPolicyValidator::from_config(&config),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_evaluate_application_mask_is_a_threshold() {
        let v = validator(KeyPolicy::default());
        assert!(v.evaluate(&credential(8, KeyKind::Character), &app(4, None)).is_ok());
        assert!(v.evaluate(&credential(4, KeyKind::Character), &app(4, None)).is_ok());
        assert_eq!(
            v.evaluate(&credential(3, KeyKind::Character), &app(4, None)),
            PolicyOutcome::BelowMinimum { required: KeyMask(4) }
        );
    }

    #[test]
    fn test_evaluate_uses_higher_of_minimum_and_application() {
        let v = validator(KeyPolicy {
            minimum_mask: KeyMask(16),
            ..KeyPolicy::default()
        });
        assert_eq!(
            v.evaluate(&credential(8, KeyKind::Character), &app(4, None)),
            PolicyOutcome::BelowMinimum { required: KeyMask(16) }
        );
        assert!(v.evaluate(&credential(16, KeyKind::Character), &app(4, None)).is_ok());
    }

    #[test]
    fn test_evaluate_kind() {
        let v = validator(KeyPolicy::default());
        assert_eq!(
            v.evaluate(&credential(0, KeyKind::Corporation), &app(0, Some(KeyKind::Character))),
            PolicyOutcome::WrongKind {
                required: KeyKind::Character,
                actual: KeyKind::Corporation,
            }
        );
        assert!(v
            .evaluate(&credential(0, KeyKind::Account), &app(0, Some(KeyKind::Character)))
            .is_ok());
    }

    #[test]
    fn test_recommendation_only_enforced_when_required() {
        let lenient = validator(KeyPolicy {
            recommended_mask: KeyMask(0b110),
            ..KeyPolicy::default()
        });
        let strict = validator(KeyPolicy {
            recommended_mask: KeyMask(0b110),
            require_recommended_key: true,
            ..KeyPolicy::default()
        });
        let weak = credential(0b010, KeyKind::Character);

        assert!(lenient.evaluate(&weak, &app(0, None)).is_ok());
        assert_eq!(
            strict.evaluate(&weak, &app(0, None)),
            PolicyOutcome::NotRecommended {
                violation: Violation::Mask
            }
        );
    }

    #[test]
    fn test_recommendation_checks_kind_first() {
        let v = validator(KeyPolicy {
            recommended_mask: KeyMask(1),
            recommended_kind: KeyKind::Character,
            ..KeyPolicy::default()
        });
        assert_eq!(v.recommendation(KeyKind::Corporation, KeyMask(0)), Some(Violation::Kind));
        assert_eq!(v.recommendation(KeyKind::Account, KeyMask(0)), Some(Violation::Mask));
        assert_eq!(v.recommendation(KeyKind::Account, KeyMask(1)), None);
    }

    #[test]
    fn test_check_minimum() {
        let v = validator(KeyPolicy {
            minimum_mask: KeyMask(8),
            ..KeyPolicy::default()
        });
        assert!(v.check_minimum(KeyMask(8)).is_ok());
        assert!(v.check_minimum(KeyMask(16)).is_ok());
        assert!(matches!(
            v.check_minimum(KeyMask(7)),
            Err(EngineError::InvalidMask { minimum: KeyMask(8), .. })
        ));
    }

    #[test]
    fn test_password_strength() {
        let v = validator(KeyPolicy::default());
        assert!(v.password_acceptable(3));
        assert!(matches!(
            v.check_password(2),
            Err(EngineError::WeakPassword { score: 2, required: 3 })
        ));
    }

    #[test]
    fn test_login_history_cutoff() {
        let v = validator(KeyPolicy {
            login_history_days: 7,
            ..KeyPolicy::default()
        });
        let now = Utc::now();
        assert_eq!(now.signed_duration_since(v.login_history_cutoff(now)), Duration::days(7));
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(PolicyOutcome::BelowMinimum { required: KeyMask(4) }).unwrap();
        assert_eq!(json["outcome"], "below_minimum");
        assert_eq!(json["required"], 4);
    }
}
