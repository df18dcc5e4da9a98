//! Start-flow handler: `GET /external/{provider}/start`.
//!
//! Validates the request, hardens the post-login redirect against the
//! allow-list, mints the correlation state (CSRF state, nonce, PKCE
//! verifier), and 302-redirects to the upstream authorization endpoint.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use serde::Deserialize;

use super::{ApiError, FlowState, found, random_token};
use crate::error::FederationError;
use crate::rp::pkce::{PkceChallenge, PkceVerifier};
use crate::rp::AuthorizationRequest;
use crate::state::AuthorizationState;

/// Query parameters accepted by the start flow.
#[derive(Debug, Deserialize)]
pub struct StartParams {
    /// Where to send the user after a successful login.
    #[serde(default)]
    pub redirect_uri: Option<String>,

    /// Set to link the provider to the current session's user instead of
    /// logging in.
    #[serde(default)]
    pub link: Option<bool>,

    /// Upstream `prompt` parameter.
    #[serde(default)]
    pub prompt: Option<String>,

    /// Upstream `login_hint` parameter.
    #[serde(default)]
    pub login_hint: Option<String>,

    /// Upstream `max_age` parameter. Kept textual so malformed values can
    /// be rejected as `invalid_request` rather than a deserialization 422.
    #[serde(default)]
    pub max_age: Option<String>,

    /// Upstream `acr_values` parameter.
    #[serde(default)]
    pub acr_values: Option<String>,

    /// Tenant the login targets.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// `GET /external/{provider}/start`
pub async fn start_handler(
    State(state): State<FlowState>,
    Path(provider_slug): Path<String>,
    jar: CookieJar,
    headers: HeaderMap,
    Query(params): Query<StartParams>,
) -> Response {
    match start_flow(&state, &provider_slug, &headers, &jar, params).await {
        Ok(response) => response,
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn start_flow(
    state: &FlowState,
    provider_slug: &str,
    headers: &HeaderMap,
    jar: &CookieJar,
    params: StartParams,
) -> Result<Response, FederationError> {
    let tenant_id = params.tenant_id.as_deref().unwrap_or("default");
    let provider = state.enabled_provider(provider_slug, tenant_id).await?;

    // Linking requires an authenticated session up front.
    let linking_session = if params.link.unwrap_or(false) {
        Some(state.authenticate(headers, jar).await?)
    } else {
        None
    };

    let max_age = params
        .max_age
        .as_deref()
        .map(str::parse::<u64>)
        .transpose()
        .map_err(|_| FederationError::invalid_request("malformed max_age"))?;

    let redirect_uri = state.config.sanitize_redirect(params.redirect_uri.as_deref());

    let csrf_state = random_token();
    let nonce = random_token();
    let verifier = PkceVerifier::generate();
    let challenge = PkceChallenge::from_verifier(&verifier);

    let mut record = AuthorizationState::new(
        &csrf_state,
        &nonce,
        verifier.as_str(),
        &provider.id,
        tenant_id,
        &redirect_uri,
        state.config.state_ttl,
    );
    record.max_age = max_age;
    record.acr_values = params.acr_values.clone();
    if let Some(session) = &linking_session {
        record = record.for_linking(&session.user_id, &session.session_id);
    }

    let client = state.rp_client(provider)?;
    let authorization_url = client
        .authorization_url(&AuthorizationRequest {
            state: csrf_state,
            nonce,
            code_challenge: challenge.as_str().to_string(),
            prompt: params.prompt,
            login_hint: params.login_hint,
            max_age,
            acr_values: params.acr_values,
            response_mode: None,
        })
        .await?;

    // A start that fails to build a URL leaves no state row behind.
    state.states.store(&record).await?;

    tracing::debug!(
        provider = %client.provider().slug,
        linking = linking_session.is_some(),
        "Redirecting to upstream authorization endpoint"
    );

    Ok(found(authorization_url.as_str()))
}
