//! In-memory local user storage.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use fedgate_auth::storage::{LocalUser, StorageError, UserStorage};

/// In-memory user store.
#[derive(Default)]
pub struct InMemoryUserStorage {
    users: Mutex<HashMap<String, LocalUser>>,
    // Users with a password or passkey registered
    alternative_logins: Mutex<HashSet<String>>,
}

impl InMemoryUserStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a user as holding a password or passkey, so identity unlink
    /// checks treat them as retaining another login method.
    pub fn grant_alternative_login(&self, user_id: &str) {
        self.alternative_logins
            .lock()
            .expect("user lock poisoned")
            .insert(user_id.to_string());
    }

    /// Number of stored users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.lock().expect("user lock poisoned").len()
    }

    /// Returns `true` if no users are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UserStorage for InMemoryUserStorage {
    async fn find_by_id(&self, user_id: &str) -> Result<Option<LocalUser>, StorageError> {
        Ok(self
            .users
            .lock()
            .expect("user lock poisoned")
            .get(user_id)
            .cloned())
    }

    async fn find_by_email(
        &self,
        email: &str,
        tenant_id: &str,
    ) -> Result<Option<LocalUser>, StorageError> {
        Ok(self
            .users
            .lock()
            .expect("user lock poisoned")
            .values()
            .find(|user| {
                user.tenant_id == tenant_id
                    && user
                        .email
                        .as_deref()
                        .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned())
    }

    async fn create(&self, user: &LocalUser) -> Result<(), StorageError> {
        let mut users = self.users.lock().expect("user lock poisoned");
        if let Some(email) = &user.email
            && users.values().any(|existing| {
                existing.tenant_id == user.tenant_id
                    && existing
                        .email
                        .as_deref()
                        .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
        {
            return Err(StorageError::conflict(format!(
                "a user with email {email} already exists"
            )));
        }
        users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<(), StorageError> {
        self.users
            .lock()
            .expect("user lock poisoned")
            .remove(user_id);
        self.alternative_logins
            .lock()
            .expect("user lock poisoned")
            .remove(user_id);
        Ok(())
    }

    async fn set_attributes(
        &self,
        user_id: &str,
        attributes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StorageError> {
        let mut users = self.users.lock().expect("user lock poisoned");
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| StorageError::NotFound(format!("user {user_id}")))?;
        user.attributes.extend(attributes.clone());
        Ok(())
    }

    async fn has_alternative_login(
        &self,
        user_id: &str,
        _excluding_identity_id: &str,
    ) -> Result<bool, StorageError> {
        Ok(self
            .alternative_logins
            .lock()
            .expect("user lock poisoned")
            .contains(user_id))
    }
}
