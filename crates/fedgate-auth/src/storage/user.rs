//! Local user storage trait.
//!
//! Defines the slice of the platform's user store the federation engine
//! needs: lookups for stitching, creation and deletion for JIT
//! provisioning and its rollback, and the alternate-login check guarding
//! identity unlink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::StorageError;

fn default_datetime() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// A local user account, as seen by the federation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUser {
    /// Unique identifier.
    #[serde(default)]
    pub id: String,

    /// Owning tenant.
    pub tenant_id: String,

    /// Email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Whether the local email address has been verified.
    #[serde(default)]
    pub email_verified: bool,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Additional attributes set by provisioning policy.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,

    /// Whether the account is active.
    pub active: bool,

    /// When the user was created.
    #[serde(default = "default_datetime", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl LocalUser {
    /// Creates a new active user in the given tenant.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            email: None,
            email_verified: false,
            name: None,
            attributes: serde_json::Map::new(),
            active: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Sets the email address.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>, verified: bool) -> Self {
        self.email = Some(email.into());
        self.email_verified = verified;
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Storage operations for local users.
#[async_trait]
pub trait UserStorage: Send + Sync {
    /// Finds a user by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_id(&self, user_id: &str) -> Result<Option<LocalUser>, StorageError>;

    /// Finds a user by email within a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_email(
        &self,
        email: &str,
        tenant_id: &str,
    ) -> Result<Option<LocalUser>, StorageError>;

    /// Creates a user.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if a user with the same email already exists in
    /// the tenant, or an error if the storage operation fails.
    async fn create(&self, user: &LocalUser) -> Result<(), StorageError>;

    /// Deletes a user.
    ///
    /// Used by provisioning rollback; dependent rows (memberships, role
    /// grants) are removed with the user.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete(&self, user_id: &str) -> Result<(), StorageError>;

    /// Merges provisioning attributes into the user record.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn set_attributes(
        &self,
        user_id: &str,
        attributes: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StorageError>;

    /// Returns `true` if the user can still sign in without the given
    /// linked identity: a password, a registered passkey, or another
    /// linked identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn has_alternative_login(
        &self,
        user_id: &str,
        excluding_identity_id: &str,
    ) -> Result<bool, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_builder() {
        let user = LocalUser::new("t-1")
            .with_email("user@example.com", true)
            .with_name("Test User");

        assert!(!user.id.is_empty());
        assert_eq!(user.tenant_id, "t-1");
        assert_eq!(user.email.as_deref(), Some("user@example.com"));
        assert!(user.email_verified);
        assert!(user.active);
    }

    #[test]
    fn test_user_serde_round_trip() {
        let user = LocalUser::new("t-1").with_email("u@example.com", false);
        let json = serde_json::to_string(&user).unwrap();
        let back: LocalUser = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, user.id);
        assert_eq!(back.email, user.email);
        assert!(!back.email_verified);
    }
}
