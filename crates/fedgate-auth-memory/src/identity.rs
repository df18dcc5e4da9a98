//! In-memory linked identity storage.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use fedgate_auth::storage::identity::StoredTokens;
use fedgate_auth::storage::{LinkedIdentity, LinkedIdentityStorage, StorageError};

/// In-memory linked identity store.
///
/// Enforces the `(provider_id, provider_user_id)` uniqueness invariant.
#[derive(Default)]
pub struct InMemoryLinkedIdentityStorage {
    identities: Mutex<HashMap<String, LinkedIdentity>>,
}

impl InMemoryLinkedIdentityStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored links.
    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.lock().expect("identity lock poisoned").len()
    }

    /// Returns `true` if no links are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LinkedIdentityStorage for InMemoryLinkedIdentityStorage {
    async fn find_by_id(&self, id: &str) -> Result<Option<LinkedIdentity>, StorageError> {
        Ok(self
            .identities
            .lock()
            .expect("identity lock poisoned")
            .get(id)
            .cloned())
    }

    async fn find_by_provider_subject(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LinkedIdentity>, StorageError> {
        Ok(self
            .identities
            .lock()
            .expect("identity lock poisoned")
            .values()
            .find(|identity| identity.matches(provider_id, provider_user_id))
            .cloned())
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<LinkedIdentity>, StorageError> {
        Ok(self
            .identities
            .lock()
            .expect("identity lock poisoned")
            .values()
            .filter(|identity| identity.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create(&self, identity: &LinkedIdentity) -> Result<(), StorageError> {
        let mut identities = self.identities.lock().expect("identity lock poisoned");
        if identities
            .values()
            .any(|existing| existing.matches(&identity.provider_id, &identity.provider_user_id))
        {
            return Err(StorageError::conflict(format!(
                "identity ({}, {}) is already linked",
                identity.provider_id, identity.provider_user_id
            )));
        }
        identities.insert(identity.id.clone(), identity.clone());
        Ok(())
    }

    async fn update_tokens(&self, id: &str, tokens: &StoredTokens) -> Result<(), StorageError> {
        let mut identities = self.identities.lock().expect("identity lock poisoned");
        let identity = identities
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("linked identity {id}")))?;
        identity.access_token = tokens.access_token.clone();
        identity.refresh_token = tokens.refresh_token.clone();
        identity.id_token = tokens.id_token.clone();
        identity.token_expires_at = tokens.expires_at;
        identity.last_login_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.identities
            .lock()
            .expect("identity lock poisoned")
            .remove(id);
        Ok(())
    }

    async fn list_expiring(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<LinkedIdentity>, StorageError> {
        Ok(self
            .identities
            .lock()
            .expect("identity lock poisoned")
            .values()
            .filter(|identity| {
                identity.refresh_token.is_some()
                    && identity
                        .token_expires_at
                        .is_some_and(|expires| expires <= cutoff)
            })
            .cloned()
            .collect())
    }
}
