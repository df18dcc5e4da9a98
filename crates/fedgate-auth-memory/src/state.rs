//! In-memory authorization state storage.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use fedgate_auth::state::{AuthStateStorage, AuthorizationState};
use fedgate_auth::storage::StorageError;

/// In-memory correlation state store.
///
/// `consume` removes the record under the map lock, which makes it
/// atomic: concurrent callback replays for the same `state` see exactly
/// one success. Expired records count as absent and are dropped on
/// contact.
#[derive(Default)]
pub struct InMemoryAuthStateStorage {
    records: Mutex<HashMap<String, AuthorizationState>>,
}

impl InMemoryAuthStateStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (possibly expired, unswept) records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().expect("state lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuthStateStorage for InMemoryAuthStateStorage {
    async fn store(&self, record: &AuthorizationState) -> Result<(), StorageError> {
        let mut records = self.records.lock().expect("state lock poisoned");
        if records.contains_key(&record.state) {
            return Err(StorageError::conflict(format!(
                "state {} already stored",
                record.state
            )));
        }
        records.insert(record.state.clone(), record.clone());
        Ok(())
    }

    async fn consume(&self, state: &str) -> Result<Option<AuthorizationState>, StorageError> {
        let mut records = self.records.lock().expect("state lock poisoned");
        match records.remove(state) {
            Some(record) if !record.is_expired(OffsetDateTime::now_utc()) => Ok(Some(record)),
            // Expired records are already removed by the take above
            _ => Ok(None),
        }
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        let mut records = self.records.lock().expect("state lock poisoned");
        let now = OffsetDateTime::now_utc();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn record(state: &str, ttl: Duration) -> AuthorizationState {
        AuthorizationState::new(
            state,
            "nonce",
            "a".repeat(43),
            "p-1",
            "t-1",
            "https://app/",
            ttl,
        )
    }

    #[tokio::test]
    async fn test_consume_is_single_use() {
        let store = InMemoryAuthStateStorage::new();
        store
            .store(&record("st-1", Duration::from_secs(600)))
            .await
            .unwrap();

        let first = store.consume("st-1").await.unwrap();
        assert!(first.is_some());

        let second = store.consume("st-1").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_consume_has_exactly_one_winner() {
        let store = Arc::new(InMemoryAuthStateStorage::new());
        store
            .store(&record("st-race", Duration::from_secs(600)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.consume("st-race").await },
            ));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_state_is_not_found() {
        let store = InMemoryAuthStateStorage::new();
        store
            .store(&record("st-old", Duration::from_secs(0)))
            .await
            .unwrap();

        assert!(store.consume("st-old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_state_is_conflict() {
        let store = InMemoryAuthStateStorage::new();
        store
            .store(&record("st-dup", Duration::from_secs(600)))
            .await
            .unwrap();

        let err = store
            .store(&record("st-dup", Duration::from_secs(600)))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let store = InMemoryAuthStateStorage::new();
        store
            .store(&record("st-old", Duration::from_secs(0)))
            .await
            .unwrap();
        store
            .store(&record("st-live", Duration::from_secs(600)))
            .await
            .unwrap();

        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert!(store.consume("st-live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_state_is_not_found() {
        let store = InMemoryAuthStateStorage::new();
        assert!(store.consume("never-stored").await.unwrap().is_none());
    }
}
