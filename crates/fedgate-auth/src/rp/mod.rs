//! OIDC/OAuth2 relying-party protocol client.
//!
//! Everything that talks the wire protocol to upstream providers:
//!
//! - [`discovery`] - OIDC discovery documents and their cache
//! - [`jwks`] - provider JWKS fetching and caching
//! - [`pkce`] - PKCE verifier/challenge generation (RFC 7636, S256 only)
//! - [`client`] - the per-provider protocol client
//! - [`apple`] - Apple client-secret synthesis
//! - [`user_info`] - claim normalization into the engine's `UserInfo` shape

pub mod apple;
pub mod client;
pub mod discovery;
pub mod jwks;
pub mod pkce;
pub mod user_info;

pub use client::{
    AuthorizationRequest, ClientSecrets, IdTokenClaims, IdTokenExpectations, RpClient,
    RpClientConfig, TokenResponse,
};
pub use discovery::{DiscoveryCache, DiscoveryCacheConfig, DiscoveryError, OidcDiscoveryDocument};
pub use jwks::{JwksCache, JwksCacheConfig, JwksError};
pub use pkce::{PkceChallenge, PkceError, PkceVerifier};
pub use user_info::UserInfo;

use apple::AppleSecretError;

/// Errors produced by the relying-party protocol client.
#[derive(Debug, thiserror::Error)]
pub enum RpError {
    /// OIDC discovery failed.
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    /// JWKS fetching or key lookup failed.
    #[error("JWKS error: {0}")]
    Jwks(#[from] JwksError),

    /// The token endpoint rejected the request or returned garbage.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// The provider returned a structured OAuth error.
    #[error("OAuth error from provider: {error} - {description}")]
    OAuth {
        /// The OAuth error code.
        error: String,
        /// Optional error description.
        description: String,
    },

    /// A required endpoint could not be resolved from overrides, quirks,
    /// or discovery.
    #[error("No {0} available for this provider")]
    MissingEndpoint(&'static str),

    /// The provider requires a client secret that is not configured.
    #[error("Provider requires a client secret but none is configured")]
    MissingClientSecret,

    /// Apple client-secret synthesis failed.
    #[error("Apple client secret error: {0}")]
    AppleSecret(#[from] AppleSecretError),

    /// Signing the request object failed.
    #[error("Request object signing failed: {0}")]
    RequestSigning(String),

    /// The ID token issuer does not match the expected issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// The expected issuer.
        expected: String,
        /// The issuer claimed by the token.
        actual: String,
    },

    /// The ID token audience does not include our client id.
    #[error("Audience mismatch: ID token audience does not include our client id")]
    AudienceMismatch,

    /// The `azp` claim is present but names a different client.
    #[error("Authorized party mismatch: azp does not equal our client id")]
    AuthorizedPartyMismatch,

    /// The ID token has expired.
    #[error("ID token has expired")]
    TokenExpired,

    /// The ID token's `iat` lies further in the future than the allowed
    /// clock skew.
    #[error("ID token issued in the future")]
    IssuedInFuture,

    /// The nonce claim does not match the nonce sent.
    #[error("Nonce mismatch: ID token nonce does not match the one sent")]
    NonceMismatch,

    /// The authentication is older than the requested `max_age`.
    #[error("Authentication is older than the requested max_age")]
    AuthTimeTooOld,

    /// `at_hash`/`c_hash` does not match the exchanged artifact.
    #[error("Token hash mismatch for {claim}")]
    TokenHashMismatch {
        /// The failing claim (`at_hash` or `c_hash`).
        claim: &'static str,
    },

    /// The `acr` claim is not among the requested `acr_values`.
    #[error("ACR mismatch: got {actual:?}, requested {requested}")]
    AcrMismatch {
        /// The acr claimed by the token.
        actual: Option<String>,
        /// The requested acr values.
        requested: String,
    },

    /// A required claim is missing or empty.
    #[error("Missing required claim: {0}")]
    MissingClaim(&'static str),

    /// The userinfo response was unusable.
    #[error("Userinfo error: {0}")]
    UserInfo(String),

    /// JWT decoding or signature validation failed.
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// A network error occurred.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A URL could not be parsed.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl RpError {
    /// Creates an `OAuth` error from a provider error response.
    #[must_use]
    pub fn oauth(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::OAuth {
            error: error.into(),
            description: description.into(),
        }
    }

    /// Returns `true` if this is an ID-token validation failure.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::IssuerMismatch { .. }
                | Self::AudienceMismatch
                | Self::AuthorizedPartyMismatch
                | Self::TokenExpired
                | Self::IssuedInFuture
                | Self::NonceMismatch
                | Self::AuthTimeTooOld
                | Self::TokenHashMismatch { .. }
                | Self::AcrMismatch { .. }
                | Self::MissingClaim(_)
                | Self::Jwt(_)
        )
    }
}
