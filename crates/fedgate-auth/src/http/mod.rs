//! HTTP flow orchestrators.
//!
//! Axum handlers for the three federation surfaces:
//!
//! - `GET /external/{provider}/start` - begin a login or linking flow
//! - `GET|POST /external/{provider}/callback` - complete it
//! - `GET|POST /external/links`, `DELETE /external/links/{id}` - manage links
//!
//! # Usage
//!
//! ```ignore
//! use fedgate_auth::http::{FlowState, router};
//!
//! let app = router(flow_state);
//! axum::serve(listener, app).await?;
//! ```

pub mod callback;
pub mod links;
pub mod start;

pub use callback::{callback_get_handler, callback_post_handler};
pub use links::{create_link_handler, delete_link_handler, list_links_handler};
pub use start::start_handler;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum_extra::extract::CookieJar;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::config::FederationConfig;
use crate::crypto::SecretCipher;
use crate::error::FederationError;
use crate::provider::{ProviderStorage, UpstreamProvider};
use crate::resolve::IdentityResolver;
use crate::revocation::RevocationService;
use crate::rp::{ClientSecrets, DiscoveryCache, JwksCache, RpClient, RpClientConfig};
use crate::state::AuthStateStorage;
use crate::storage::{
    LinkedIdentityStorage, SessionInfo, SessionService, UserStorage,
};

/// Shared state for the federation flow handlers.
#[derive(Clone)]
pub struct FlowState {
    /// Provider configuration store.
    pub providers: Arc<dyn ProviderStorage>,

    /// Correlation state store.
    pub states: Arc<dyn AuthStateStorage>,

    /// The identity resolution engine.
    pub resolver: Arc<IdentityResolver>,

    /// First-party session service.
    pub sessions: Arc<dyn SessionService>,

    /// Linked identity store.
    pub identities: Arc<dyn LinkedIdentityStorage>,

    /// Local user store.
    pub users: Arc<dyn UserStorage>,

    /// Secret cipher.
    pub cipher: Arc<dyn SecretCipher>,

    /// Shared discovery cache.
    pub discovery: Arc<DiscoveryCache>,

    /// Shared JWKS cache.
    pub jwks: Arc<JwksCache>,

    /// Best-effort revocation client.
    pub revocation: Arc<RevocationService>,

    /// Audit sink.
    pub audit: Arc<dyn crate::audit::AuditSink>,

    /// Federation configuration.
    pub config: FederationConfig,
}

impl FlowState {
    /// Builds a protocol client for a provider.
    pub(crate) fn rp_client(
        &self,
        provider: UpstreamProvider,
    ) -> Result<RpClient, FederationError> {
        let secrets = ClientSecrets::decrypt(&provider, self.cipher.as_ref())?;
        let config = RpClientConfig::new(self.config.callback_url(&provider.slug))
            .with_request_timeout(self.config.request_timeout)
            .with_clock_skew(self.config.clock_skew);
        Ok(RpClient::new(
            provider,
            secrets,
            config,
            self.discovery.clone(),
            self.jwks.clone(),
        ))
    }

    /// Resolves the caller's session from a bearer header or the session
    /// cookie.
    pub(crate) async fn authenticate(
        &self,
        headers: &HeaderMap,
        jar: &CookieJar,
    ) -> Result<SessionInfo, FederationError> {
        let token = bearer_token(headers)
            .map(ToString::to_string)
            .or_else(|| {
                jar.get(&self.config.cookie.name)
                    .map(|cookie| cookie.value().to_string())
            })
            .ok_or_else(|| FederationError::unauthorized("missing session"))?;

        self.sessions
            .verify_session(&token)
            .await?
            .ok_or_else(|| FederationError::unauthorized("invalid or expired session"))
    }

    /// Loads an enabled provider by slug or id.
    pub(crate) async fn enabled_provider(
        &self,
        id_or_slug: &str,
        tenant_id: &str,
    ) -> Result<UpstreamProvider, FederationError> {
        let provider = self
            .providers
            .find_by_slug_or_id(id_or_slug, tenant_id)
            .await?
            .ok_or_else(|| FederationError::ProviderNotFound(id_or_slug.to_string()))?;
        if !provider.enabled {
            return Err(FederationError::ProviderDisabled(id_or_slug.to_string()));
        }
        Ok(provider)
    }
}

/// Builds the federation router.
#[must_use]
pub fn router(state: FlowState) -> Router {
    Router::new()
        .route("/external/{provider}/start", get(start_handler))
        .route(
            "/external/{provider}/callback",
            get(callback_get_handler).post(callback_post_handler),
        )
        .route(
            "/external/links",
            get(list_links_handler).post(create_link_handler),
        )
        .route("/external/links/{id}", axum::routing::delete(delete_link_handler))
        .with_state(state)
}

/// Extracts a bearer token from the Authorization header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// 256 bits of URL-safe randomness for `state` and nonce values.
#[must_use]
pub(crate) fn random_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A plain 302 with a Location header.
pub(crate) fn found(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

/// Appends query parameters to a URL, falling back to the URL unchanged
/// if it does not parse.
pub(crate) fn with_query(url: &str, params: &[(&str, &str)]) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            {
                let mut pairs = parsed.query_pairs_mut();
                for (key, value) in params {
                    pairs.append_pair(key, value);
                }
            }
            parsed.into()
        }
        Err(_) => url.to_string(),
    }
}

/// A JSON API error with the appropriate status code.
///
/// Only enumerated error codes are emitted; infrastructure detail stays in
/// the logs.
pub(crate) struct ApiError {
    status: StatusCode,
    code: &'static str,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, code: &'static str) -> Self {
        Self { status, code }
    }
}

impl From<FederationError> for ApiError {
    fn from(err: FederationError) -> Self {
        let status = match &err {
            FederationError::ProviderNotFound(_) | FederationError::ProviderDisabled(_) => {
                StatusCode::NOT_FOUND
            }
            FederationError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            FederationError::InvalidRequest { .. } | FederationError::StateNotFound => {
                StatusCode::BAD_REQUEST
            }
            FederationError::Denied(_) => StatusCode::FORBIDDEN,
            FederationError::Protocol(_) | FederationError::AppleSecret(_) => {
                StatusCode::BAD_GATEWAY
            }
            FederationError::Storage { .. }
            | FederationError::Crypto { .. }
            | FederationError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "Federation flow failed");
        } else {
            tracing::debug!(error = %err, "Federation flow rejected");
        }
        Self {
            status,
            code: err.safe_error_code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            axum::Json(serde_json::json!({ "error": self.code })),
        )
            .into_response()
    }
}
