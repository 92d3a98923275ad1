//! Mock implementations for testing.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use warrant_core::{KeyId, KeyInfo, KeyInfoProvider, ProviderError};

/// Scripted key authority.
///
/// Each key answers with its configured [`KeyInfo`]. Queued failures for a
/// key are returned first, one per lookup. A key with no script answers
/// with a transient failure, and a revoked key always answers
/// [`ProviderError::Revoked`].
///
/// Uses `std::sync::Mutex` internally so builder methods work without a
/// tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct MockKeyInfoProvider {
    keys: Arc<Mutex<HashMap<KeyId, KeyInfo>>>,
    failures: Arc<Mutex<HashMap<KeyId, VecDeque<ProviderError>>>>,
    revoked: Arc<Mutex<Vec<KeyId>>>,
    calls: Arc<AtomicUsize>,
}

impl MockKeyInfoProvider {
    /// Create a provider that knows no keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer lookups of `key_id` with `info`.
    #[must_use]
    pub fn with_key(self, key_id: KeyId, info: KeyInfo) -> Self {
        self.set_key(key_id, info);
        self
    }

    /// Queue a failure for the next lookup of `key_id`.
    #[must_use]
    pub fn with_failure(self, key_id: KeyId, error: ProviderError) -> Self {
        self.fail_next(key_id, error);
        self
    }

    /// Replace the answer for `key_id`.
    pub fn set_key(&self, key_id: KeyId, info: KeyInfo) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.insert(key_id, info);
        }
    }

    /// Queue a failure for the next lookup of `key_id`.
    pub fn fail_next(&self, key_id: KeyId, error: ProviderError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.entry(key_id).or_default().push_back(error);
        }
    }

    /// Make every further lookup of `key_id` answer revoked.
    pub fn revoke(&self, key_id: KeyId) {
        if let Ok(mut revoked) = self.revoked.lock() {
            revoked.push(key_id);
        }
    }

    /// Number of lookups made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyInfoProvider for MockKeyInfoProvider {
    async fn key_info(
        &self,
        key_id: KeyId,
        _verification_code: &str,
    ) -> Result<KeyInfo, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.revoked.lock().is_ok_and(|r| r.contains(&key_id)) {
            return Err(ProviderError::Revoked(key_id));
        }

        let queued = self
            .failures
            .lock()
            .ok()
            .and_then(|mut f| f.get_mut(&key_id).and_then(VecDeque::pop_front));
        if let Some(error) = queued {
            tracing::debug!(%key_id, %error, "mock key authority failing lookup");
            return Err(error);
        }

        self.keys
            .lock()
            .ok()
            .and_then(|k| k.get(&key_id).cloned())
            .ok_or_else(|| ProviderError::Transient(format!("no script for key {key_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::key_info;
    use warrant_core::KeyKind;

    #[tokio::test]
    async fn test_scripted_answers() {
        let provider = MockKeyInfoProvider::new()
            .with_key(KeyId(1), key_info(8, KeyKind::Character, &[(10, "Ten")]))
            .with_failure(KeyId(1), ProviderError::Transient("timeout".into()));

        assert!(matches!(
            provider.key_info(KeyId(1), "c").await,
            Err(ProviderError::Transient(_))
        ));
        let info = provider.key_info(KeyId(1), "c").await.unwrap();
        assert_eq!(info.identities[0].name, "Ten");

        provider.revoke(KeyId(1));
        assert_eq!(
            provider.key_info(KeyId(1), "c").await,
            Err(ProviderError::Revoked(KeyId(1)))
        );
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_key_is_transient() {
        let provider = MockKeyInfoProvider::new();
        let err = provider.key_info(KeyId(9), "c").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
