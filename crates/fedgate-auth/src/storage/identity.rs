//! Linked identity storage.
//!
//! A [`LinkedIdentity`] is the durable association between a local user and
//! one upstream identity. `(provider_id, provider_user_id)` is unique: an
//! upstream identity links to exactly one local user, while a user may hold
//! many links.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::StorageError;
use crate::crypto::SealedSecret;

/// A durable link between a local user and an upstream identity.
///
/// Upstream tokens are stored encrypted; they are only decrypted for
/// refresh and revocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedIdentity {
    /// Unique identifier.
    pub id: String,

    /// The linked local user.
    pub user_id: String,

    /// The provider configuration this identity came from.
    pub provider_id: String,

    /// The upstream subject identifier.
    pub provider_user_id: String,

    /// Email reported by the provider at link time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_email: Option<String>,

    /// Whether the provider reported the email as verified.
    #[serde(default)]
    pub email_verified: bool,

    /// Encrypted upstream access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<SealedSecret>,

    /// Encrypted upstream refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<SealedSecret>,

    /// Encrypted upstream ID token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<SealedSecret>,

    /// When the stored access token expires.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub token_expires_at: Option<OffsetDateTime>,

    /// When the link was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// When this identity last completed a login.
    #[serde(with = "time::serde::rfc3339")]
    pub last_login_at: OffsetDateTime,
}

impl LinkedIdentity {
    /// Creates a new link.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        provider_id: impl Into<String>,
        provider_user_id: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            provider_id: provider_id.into(),
            provider_user_id: provider_user_id.into(),
            provider_email: None,
            email_verified: false,
            access_token: None,
            refresh_token: None,
            id_token: None,
            token_expires_at: None,
            created_at: now,
            last_login_at: now,
        }
    }

    /// Sets the provider email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>, verified: bool) -> Self {
        self.provider_email = Some(email.into());
        self.email_verified = verified;
        self
    }

    /// Returns `true` if this link matches the given upstream identity.
    #[must_use]
    pub fn matches(&self, provider_id: &str, provider_user_id: &str) -> bool {
        self.provider_id == provider_id && self.provider_user_id == provider_user_id
    }
}

/// Encrypted upstream token material updated on every login and refresh.
#[derive(Debug, Clone, Default)]
pub struct StoredTokens {
    /// Encrypted access token.
    pub access_token: Option<SealedSecret>,
    /// Encrypted refresh token.
    pub refresh_token: Option<SealedSecret>,
    /// Encrypted ID token.
    pub id_token: Option<SealedSecret>,
    /// Access token expiry.
    pub expires_at: Option<OffsetDateTime>,
}

/// Storage operations for linked identities.
#[async_trait]
pub trait LinkedIdentityStorage: Send + Sync {
    /// Finds a link by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_id(&self, id: &str) -> Result<Option<LinkedIdentity>, StorageError>;

    /// Finds the link for an upstream identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_provider_subject(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LinkedIdentity>, StorageError>;

    /// Lists all links held by a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_user(&self, user_id: &str) -> Result<Vec<LinkedIdentity>, StorageError>;

    /// Creates a link.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when `(provider_id, provider_user_id)` is
    /// already linked, or an error if the storage operation fails.
    async fn create(&self, identity: &LinkedIdentity) -> Result<(), StorageError>;

    /// Replaces stored tokens and bumps `last_login_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn update_tokens(&self, id: &str, tokens: &StoredTokens) -> Result<(), StorageError>;

    /// Deletes a link.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Lists links whose stored access token expires before `cutoff` and
    /// that hold a refresh token, for the periodic refresh pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn list_expiring(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<LinkedIdentity>, StorageError>;
}
