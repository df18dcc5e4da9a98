//! Authorization correlation state.
//!
//! One [`AuthorizationState`] record exists per in-flight login attempt,
//! created by the start flow and consumed by the callback. It carries the
//! CSRF `state`, the OIDC `nonce`, the PKCE verifier, and optional linking
//! context.
//!
//! # Lifecycle
//!
//! 1. Start flow stores the record keyed by `state`
//! 2. Provider redirects back with `state` + `code`
//! 3. Callback flow consumes the record (atomic get + delete)
//! 4. Expired, unconsumed records are removed by a periodic sweep
//!
//! # Security Considerations
//!
//! - `state` values must be cryptographically random
//! - Consume must be atomic: concurrent callback replays for the same
//!   `state` yield exactly one success, all others observe "not found"
//! - Records are single-use and short-lived (default 10 minutes)
//!
//! # Implementation Notes
//!
//! SQL backends should implement `consume` with `DELETE ... RETURNING`;
//! in-memory backends with a locked map removal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::storage::StorageError;

/// An in-flight authorization attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationState {
    /// CSRF state value; the record key.
    pub state: String,

    /// OIDC nonce sent in the authorization request.
    pub nonce: String,

    /// PKCE code verifier.
    pub code_verifier: String,

    /// Target provider configuration id.
    pub provider_id: String,

    /// Tenant the attempt belongs to.
    pub tenant_id: String,

    /// Post-login redirect target (already validated by the start flow).
    pub redirect_uri: String,

    /// Set when an authenticated user is linking a new provider rather
    /// than logging in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Session that initiated a linking flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// `max_age` requested from the provider, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,

    /// `acr_values` requested from the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acr_values: Option<String>,

    /// When the record was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// When the record expires.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl AuthorizationState {
    /// Creates a record for a login attempt.
    #[must_use]
    pub fn new(
        state: impl Into<String>,
        nonce: impl Into<String>,
        code_verifier: impl Into<String>,
        provider_id: impl Into<String>,
        tenant_id: impl Into<String>,
        redirect_uri: impl Into<String>,
        ttl: std::time::Duration,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            state: state.into(),
            nonce: nonce.into(),
            code_verifier: code_verifier.into(),
            provider_id: provider_id.into(),
            tenant_id: tenant_id.into(),
            redirect_uri: redirect_uri.into(),
            user_id: None,
            session_id: None,
            max_age: None,
            acr_values: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Marks this attempt as a linking flow for an authenticated user.
    #[must_use]
    pub fn for_linking(mut self, user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.session_id = Some(session_id.into());
        self
    }

    /// Returns `true` if this is a linking flow.
    #[must_use]
    pub fn is_linking(&self) -> bool {
        self.user_id.is_some()
    }

    /// Returns `true` if the record has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// Storage for authorization correlation state.
///
/// The store is intentionally dumb: it holds no business logic, only
/// correlation.
#[async_trait]
pub trait AuthStateStorage: Send + Sync {
    /// Inserts a record keyed by its `state` value.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` on a duplicate `state`, or an error if the
    /// storage operation fails.
    async fn store(&self, record: &AuthorizationState) -> Result<(), StorageError>;

    /// Atomically retrieves and deletes a record.
    ///
    /// Returns `None` when the state is unknown, expired, or already
    /// consumed. Under concurrent calls for the same `state`, exactly one
    /// caller receives the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn consume(&self, state: &str) -> Result<Option<AuthorizationState>, StorageError>;

    /// Deletes expired, unconsumed records.
    ///
    /// Returns the number of records removed. Idempotent and safe to run
    /// concurrently with request handling.
    ///
    /// # Errors
    ///
    /// Returns an error if the cleanup operation fails.
    async fn cleanup_expired(&self) -> Result<u64, StorageError>;
}
