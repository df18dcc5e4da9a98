//! Callback handler: `GET|POST /external/{provider}/callback`.
//!
//! Consumes the correlation state (single use), exchanges the code,
//! validates the ID token, resolves the local identity, issues a session,
//! and redirects to the original (pre-validated) target.
//!
//! POST exists for `form_post` response mode; Apple additionally delivers
//! its one-time `user` payload there.
//!
//! Every failure path redirects to the configured login page with only
//! enumerated error fields; upstream bodies, exception text, and PII never
//! reach the redirect URL.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use axum::Form;
use cookie::{Cookie, SameSite};
use serde::Deserialize;

use super::{FlowState, found, with_query};
use crate::error::FederationError;
use crate::resolve::ResolveError;
use crate::rp::{IdTokenExpectations, RpClient, TokenResponse, UserInfo};
use crate::state::AuthorizationState;

/// Parameters a provider may send to the callback.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// The authorization code.
    #[serde(default)]
    pub code: Option<String>,

    /// The CSRF state echoed back.
    #[serde(default)]
    pub state: Option<String>,

    /// Upstream error code, when the provider refused.
    #[serde(default)]
    pub error: Option<String>,

    /// Upstream error description. Never forwarded.
    #[serde(default)]
    pub error_description: Option<String>,

    /// Apple's one-time user payload (JSON text in the form body).
    #[serde(default)]
    pub user: Option<String>,
}

/// `GET /external/{provider}/callback`
pub async fn callback_get_handler(
    State(state): State<FlowState>,
    Path(provider_slug): Path<String>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    handle_callback(state, provider_slug, jar, params).await
}

/// `POST /external/{provider}/callback` (form-post response mode)
pub async fn callback_post_handler(
    State(state): State<FlowState>,
    Path(provider_slug): Path<String>,
    jar: CookieJar,
    Form(params): Form<CallbackParams>,
) -> Response {
    handle_callback(state, provider_slug, jar, params).await
}

async fn handle_callback(
    state: FlowState,
    provider_slug: String,
    jar: CookieJar,
    params: CallbackParams,
) -> Response {
    // The state parameter is the only thing we trust before consumption.
    let Some(state_value) = params.state.as_deref() else {
        return error_redirect(&state, "invalid_request", "missing state parameter");
    };

    let record = match state.states.consume(state_value).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::debug!(provider = %provider_slug, "Unknown, expired, or replayed state");
            return error_redirect(&state, "invalid_request", "login attempt expired");
        }
        Err(err) => {
            tracing::error!(error = %err, "State store unavailable during callback");
            return error_redirect(&state, "server_error", "try again later");
        }
    };

    if let Some(upstream_error) = params.error.as_deref() {
        tracing::info!(
            provider = %provider_slug,
            error = upstream_error,
            "Provider returned an authorization error"
        );
        return error_redirect(&state, sanitize_error_code(upstream_error), "the provider rejected the login");
    }

    match complete_flow(&state, &record, &params, jar).await {
        Ok(response) => response,
        Err(err) => {
            let code = err.safe_error_code();
            if err.is_infrastructure_error() {
                tracing::error!(error = %err, provider = %provider_slug, "Callback flow failed");
            } else {
                tracing::info!(error = %err, provider = %provider_slug, "Callback flow rejected");
            }
            let description = match &err {
                FederationError::Denied(denial) => denial.description.clone(),
                _ => "the login could not be completed".to_string(),
            };
            error_redirect(&state, code, &description)
        }
    }
}

async fn complete_flow(
    state: &FlowState,
    record: &AuthorizationState,
    params: &CallbackParams,
    jar: CookieJar,
) -> Result<Response, FederationError> {
    let code = params
        .code
        .as_deref()
        .ok_or_else(|| FederationError::invalid_request("missing authorization code"))?;

    let provider = state
        .providers
        .find_by_id(&record.provider_id)
        .await?
        .ok_or_else(|| FederationError::ProviderNotFound(record.provider_id.clone()))?;
    let client = state.rp_client(provider)?;

    let tokens = client.exchange_code(code, &record.code_verifier).await?;
    let mut user_info = resolve_user_info(&client, record, &tokens, code).await?;

    if client.provider().kind.user_payload_in_callback()
        && let Some(payload) = params.user.as_deref()
        && let Ok(parsed) = serde_json::from_str::<serde_json::Value>(payload)
    {
        user_info.apply_apple_user_payload(&parsed);
    }

    let resolution = state
        .resolver
        .resolve(
            client.provider(),
            &user_info,
            &tokens,
            record.user_id.as_deref(),
            &record.tenant_id,
        )
        .await
        .map_err(|err| match err {
            ResolveError::Denied(denial) => FederationError::Denied(denial),
            ResolveError::Storage(err) => err.into(),
            ResolveError::Crypto(err) => err.into(),
        })?;

    let redirect = with_query(
        &record.redirect_uri,
        &[("external_auth", resolution.action.as_str())],
    );

    // Linking flows already carry a session; everything else gets one.
    if record.is_linking() {
        return Ok(found(&redirect));
    }

    let session_token = state
        .sessions
        .create_session(
            &resolution.user_id,
            serde_json::json!({
                "method": "external",
                "provider": client.provider().slug,
            }),
        )
        .await?;

    let cookie = Cookie::build((state.config.cookie.name.clone(), session_token))
        .path("/")
        .http_only(true)
        .secure(state.config.cookie.secure)
        .same_site(SameSite::Lax)
        .max_age(
            time::Duration::try_from(state.config.cookie.max_age)
                .unwrap_or(time::Duration::hours(24)),
        )
        .build();

    Ok((jar.add(cookie), found(&redirect)).into_response())
}

/// Builds the normalized user info for the callback's token set.
async fn resolve_user_info(
    client: &RpClient,
    record: &AuthorizationState,
    tokens: &TokenResponse,
    code: &str,
) -> Result<UserInfo, FederationError> {
    if client.provider().kind.is_oidc() {
        let id_token = tokens
            .id_token
            .as_deref()
            .ok_or_else(|| FederationError::invalid_request("provider returned no ID token"))?;

        let claims = client
            .validate_id_token(
                id_token,
                &IdTokenExpectations {
                    nonce: &record.nonce,
                    access_token: Some(&tokens.access_token),
                    code: Some(code),
                    max_age: record.max_age,
                    acr_values: record.acr_values.as_deref(),
                },
            )
            .await?;

        let mapping = client.provider().effective_attribute_mapping();
        let mut info = crate::rp::user_info::normalize(&claims.to_value(), &mapping)?;

        // Userinfo is enrichment here, never load-bearing: failures are
        // logged and the ID-token claims stand alone.
        if client.provider().always_fetch_userinfo || info.email.is_none() {
            match client.fetch_userinfo(&tokens.access_token).await {
                Ok(extra) => info.merge_missing(extra),
                Err(err) => {
                    tracing::warn!(
                        provider = %client.provider().slug,
                        error = %err,
                        "Optional userinfo enrichment failed"
                    );
                }
            }
        }

        Ok(info)
    } else {
        // Plain OAuth2: userinfo is the only claim source.
        Ok(client.fetch_userinfo(&tokens.access_token).await?)
    }
}

/// Redirects to the login page with safe, enumerated error fields only.
fn error_redirect(state: &FlowState, code: &str, description: &str) -> Response {
    let url = with_query(
        &state.config.login_url,
        &[("error", code), ("error_description", description)],
    );
    found(&url)
}

/// Upstream error codes pass through only when they look like OAuth error
/// tokens; anything else collapses to `access_denied`.
fn sanitize_error_code(code: &str) -> &str {
    let well_formed = !code.is_empty()
        && code.len() <= 40
        && code
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if well_formed { code } else { "access_denied" }
}
