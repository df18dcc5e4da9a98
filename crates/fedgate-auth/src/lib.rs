//! # fedgate-auth
//!
//! External identity provider federation engine for Fedgate.
//!
//! This crate lets a first-party identity platform accept logins from
//! third-party OIDC/OAuth2 providers (Google, Microsoft, GitHub,
//! Facebook, Twitter/X, Apple, and generic issuers) and turns a
//! successful upstream authentication into a decision about which local
//! account the user becomes.
//!
//! This crate provides:
//! - A spec-compliant OIDC/OAuth2 relying-party client, including signed
//!   request objects (RFC 9101) and full ID-token validation
//! - A typed per-provider quirks registry normalizing non-conformant
//!   providers into one pipeline
//! - An identity-resolution engine (stitching / JIT provisioning) with
//!   policy-driven organization and role assignment
//! - A single-use correlation store contract for CSRF/PKCE/nonce state
//! - Best-effort upstream token revocation (RFC 7009)
//! - Axum flow handlers for the start/callback/link-management surfaces
//!
//! It acts only as a *client* to upstream providers; first-party sessions
//! are issued by an external session service.
//!
//! ## Modules
//!
//! - [`config`] - federation configuration
//! - [`provider`] - upstream provider configuration records
//! - [`quirks`] - per-provider deviation handling
//! - [`rp`] - the wire-protocol client (discovery, JWKS, PKCE, tokens)
//! - [`resolve`] - identity resolution (stitching / JIT)
//! - [`state`] - authorization correlation state
//! - [`revocation`] - best-effort RFC 7009 revocation
//! - [`storage`] - storage and external service contracts
//! - [`http`] - axum flow handlers
//! - [`audit`] - audit sink contract
//! - [`maintenance`] - periodic sweeps

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod maintenance;
pub mod provider;
pub mod quirks;
pub mod resolve;
pub mod revocation;
pub mod rp;
pub mod state;
pub mod storage;

pub use config::{FederationConfig, JitConfig, SessionCookieConfig};
pub use crypto::{CryptoError, SealedSecret, SecretCipher};
pub use error::FederationError;
pub use http::{FlowState, router};
pub use provider::{AttributeMapping, ProviderStorage, RequestObjectSigning, UpstreamProvider};
pub use quirks::{MicrosoftTenant, ProviderKind, TokenEndpointAuth};
pub use resolve::{Denial, DenyCode, IdentityResolver, Resolution, ResolutionAction, ResolveError};
pub use revocation::{RevocationService, RevocationWarning};
pub use rp::{
    AuthorizationRequest, ClientSecrets, DiscoveryCache, IdTokenExpectations, JwksCache, RpClient,
    RpClientConfig, RpError, TokenResponse, UserInfo,
};
pub use state::{AuthStateStorage, AuthorizationState};
pub use storage::{
    LinkedIdentity, LinkedIdentityStorage, LocalUser, PolicyContext, PolicyDecision,
    PolicyService, SessionInfo, SessionService, StorageError, UserStorage,
};

/// Type alias for federation results.
pub type FederationResult<T> = Result<T, FederationError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use fedgate_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::FederationResult;
    pub use crate::audit::{AuditEntry, AuditSink};
    pub use crate::config::{FederationConfig, JitConfig};
    pub use crate::crypto::{SealedSecret, SecretCipher};
    pub use crate::error::FederationError;
    pub use crate::http::{FlowState, router};
    pub use crate::provider::{ProviderStorage, UpstreamProvider};
    pub use crate::quirks::ProviderKind;
    pub use crate::resolve::{DenyCode, IdentityResolver, Resolution};
    pub use crate::revocation::RevocationService;
    pub use crate::rp::{DiscoveryCache, JwksCache, RpClient, UserInfo};
    pub use crate::state::{AuthStateStorage, AuthorizationState};
    pub use crate::storage::{
        LinkedIdentity, LinkedIdentityStorage, LocalUser, PolicyService, SessionService,
        UserStorage,
    };
}
