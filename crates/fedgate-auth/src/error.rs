//! Federation error types.
//!
//! This module defines the top-level error type shared by the flow
//! orchestrators and the taxonomy it follows:
//!
//! 1. Upstream protocol errors - discovery, token exchange, and validation
//!    failures that always fail the current flow
//! 2. Resolution denials - typed, user-facing-safe business outcomes
//! 3. Infrastructure errors - storage or crypto failures, surfaced generically
//! 4. Best-effort failures - never represented here; they are logged as
//!    warnings at the call site and swallowed

use crate::resolve::Denial;
use crate::rp::apple::AppleSecretError;
use crate::rp::discovery::DiscoveryError;
use crate::rp::jwks::JwksError;
use crate::rp::RpError;

/// Errors that can occur during a federation flow.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    /// The requested provider does not exist or is not visible to the tenant.
    #[error("Identity provider not found: {0}")]
    ProviderNotFound(String),

    /// The provider exists but is disabled.
    #[error("Identity provider is disabled: {0}")]
    ProviderDisabled(String),

    /// The relying-party protocol client failed.
    #[error("Upstream protocol error: {0}")]
    Protocol(#[from] RpError),

    /// Apple client-secret synthesis failed.
    #[error("Apple client secret error: {0}")]
    AppleSecret(#[from] AppleSecretError),

    /// Identity resolution produced a typed denial.
    ///
    /// Denials are expected business outcomes, not bugs. Their codes are
    /// safe to surface to end users.
    #[error("Resolution denied: {0}")]
    Denied(Denial),

    /// The correlation state was missing, expired, or already consumed.
    #[error("Authorization state not found or already consumed")]
    StateNotFound,

    /// The inbound request is malformed.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// The request lacks a valid session (linking flows require one).
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Description of why the request is unauthorized.
        message: String,
    },

    /// An error occurred while storing or retrieving federation data.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error. Logged, never echoed to clients.
        message: String,
    },

    /// Secret encryption or decryption failed.
    #[error("Crypto error: {message}")]
    Crypto {
        /// Description of the crypto error. Logged, never echoed to clients.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl FederationError {
    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `Unauthorized` error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Crypto` error.
    #[must_use]
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is a typed resolution denial.
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    /// Returns `true` if this error originates from the upstream provider.
    #[must_use]
    pub fn is_upstream_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::AppleSecret(_))
    }

    /// Returns `true` if this error is an infrastructure failure whose
    /// detail must stay out of client-visible responses.
    #[must_use]
    pub fn is_infrastructure_error(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Crypto { .. } | Self::Internal { .. }
        )
    }

    /// The error code that is safe to place in a redirect URL.
    ///
    /// Infrastructure and protocol errors collapse to `server_error`;
    /// denials surface their typed code. No variant ever exposes internal
    /// exception text.
    #[must_use]
    pub fn safe_error_code(&self) -> &'static str {
        match self {
            Self::ProviderNotFound(_) => "unknown_provider",
            Self::ProviderDisabled(_) => "unknown_provider",
            Self::Denied(denial) => denial.code.as_str(),
            Self::StateNotFound | Self::InvalidRequest { .. } => "invalid_request",
            Self::Unauthorized { .. } => "invalid_token",
            Self::Protocol(_) | Self::AppleSecret(_) => "upstream_error",
            Self::Storage { .. } | Self::Crypto { .. } | Self::Internal { .. } => "server_error",
        }
    }
}

impl From<DiscoveryError> for FederationError {
    fn from(err: DiscoveryError) -> Self {
        Self::Protocol(RpError::from(err))
    }
}

impl From<JwksError> for FederationError {
    fn from(err: JwksError) -> Self {
        Self::Protocol(RpError::from(err))
    }
}

impl From<crate::storage::StorageError> for FederationError {
    fn from(err: crate::storage::StorageError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<crate::crypto::CryptoError> for FederationError {
    fn from(err: crate::crypto::CryptoError) -> Self {
        Self::Crypto {
            message: err.to_string(),
        }
    }
}
