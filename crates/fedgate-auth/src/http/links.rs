//! Link management handlers: `/external/links`.
//!
//! Session-authenticated management of a user's provider links. Deleting
//! a link first checks the user retains another way to sign in (another
//! linked identity, a password, or a passkey), then best-effort revokes
//! the stored upstream tokens before removing the link locally.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{ApiError, FlowState, random_token};
use crate::audit::{AuditEntry, record_best_effort};
use crate::error::FederationError;
use crate::rp::pkce::{PkceChallenge, PkceVerifier};
use crate::rp::AuthorizationRequest;
use crate::state::AuthorizationState;
use crate::storage::LinkedIdentity;

/// A provider link, as exposed to the link owner.
///
/// Stored tokens never appear here.
#[derive(Debug, Serialize)]
pub struct LinkView {
    /// Link identifier.
    pub id: String,
    /// Provider configuration id.
    pub provider_id: String,
    /// Email reported by the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_email: Option<String>,
    /// When the link was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the link last completed a login.
    #[serde(with = "time::serde::rfc3339")]
    pub last_login_at: OffsetDateTime,
}

impl From<LinkedIdentity> for LinkView {
    fn from(identity: LinkedIdentity) -> Self {
        Self {
            id: identity.id,
            provider_id: identity.provider_id,
            provider_email: identity.provider_email,
            created_at: identity.created_at,
            last_login_at: identity.last_login_at,
        }
    }
}

/// `GET /external/links`
pub async fn list_links_handler(
    State(state): State<FlowState>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Json<Vec<LinkView>>, ApiError> {
    let session = state.authenticate(&headers, &jar).await?;
    let links = state.identities.find_by_user(&session.user_id).await
        .map_err(FederationError::from)?;
    Ok(Json(links.into_iter().map(LinkView::from).collect()))
}

/// Body for creating a link.
#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    /// Provider slug or id to link.
    pub provider: String,

    /// Where to land after the linking flow completes.
    #[serde(default)]
    pub redirect_uri: Option<String>,

    /// Tenant the provider belongs to.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Response to a link creation request.
#[derive(Debug, Serialize)]
pub struct CreateLinkResponse {
    /// Authorization URL to send the user to.
    pub authorization_url: String,
}

/// `POST /external/links`
///
/// Starts a linking flow for the authenticated user and returns the
/// upstream authorization URL instead of redirecting, so UI code can
/// drive the navigation.
pub async fn create_link_handler(
    State(state): State<FlowState>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(request): Json<CreateLinkRequest>,
) -> Result<Json<CreateLinkResponse>, ApiError> {
    let session = state.authenticate(&headers, &jar).await?;
    let tenant_id = request.tenant_id.as_deref().unwrap_or("default");
    let provider = state.enabled_provider(&request.provider, tenant_id).await?;

    let redirect_uri = state.config.sanitize_redirect(request.redirect_uri.as_deref());

    let csrf_state = random_token();
    let nonce = random_token();
    let verifier = PkceVerifier::generate();
    let challenge = PkceChallenge::from_verifier(&verifier);

    let record = AuthorizationState::new(
        &csrf_state,
        &nonce,
        verifier.as_str(),
        &provider.id,
        tenant_id,
        &redirect_uri,
        state.config.state_ttl,
    )
    .for_linking(&session.user_id, &session.session_id);

    let client = state.rp_client(provider)?;
    let authorization_url = client
        .authorization_url(&AuthorizationRequest {
            state: csrf_state,
            nonce,
            code_challenge: challenge.as_str().to_string(),
            ..AuthorizationRequest::default()
        })
        .await
        .map_err(FederationError::from)?;

    state
        .states
        .store(&record)
        .await
        .map_err(FederationError::from)?;

    Ok(Json(CreateLinkResponse {
        authorization_url: authorization_url.into(),
    }))
}

/// `DELETE /external/links/{id}`
pub async fn delete_link_handler(
    State(state): State<FlowState>,
    Path(link_id): Path<String>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = state.authenticate(&headers, &jar).await?;

    let identity = state
        .identities
        .find_by_id(&link_id)
        .await
        .map_err(FederationError::from)?
        .filter(|identity| identity.user_id == session.user_id)
        .ok_or(ApiError::new(StatusCode::NOT_FOUND, "link_not_found"))?;

    // The user must keep at least one way back in.
    let other_links = state
        .identities
        .find_by_user(&session.user_id)
        .await
        .map_err(FederationError::from)?
        .iter()
        .filter(|other| other.id != identity.id)
        .count();
    let has_alternative = other_links > 0
        || state
            .users
            .has_alternative_login(&session.user_id, &identity.id)
            .await
            .map_err(FederationError::from)?;
    if !has_alternative {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "last_authentication_method",
        ));
    }

    // Best-effort upstream revocation; warnings never block the unlink.
    let mut tenant_id = "default".to_string();
    if let Ok(Some(provider)) = state.providers.find_by_id(&identity.provider_id).await {
        tenant_id = provider.tenant_id.clone();
        let warnings = state
            .revocation
            .revoke(&provider, &identity, state.cipher.as_ref())
            .await;
        if !warnings.is_empty() {
            tracing::warn!(
                link_id = %identity.id,
                warnings = warnings.len(),
                "Unlinking despite revocation warnings"
            );
        }
    }

    state
        .identities
        .delete(&identity.id)
        .await
        .map_err(FederationError::from)?;

    record_best_effort(
        state.audit.as_ref(),
        AuditEntry::new(
            tenant_id,
            "external.identity.unlinked",
            "linked_identity",
            &identity.id,
        )
        .with_user(&session.user_id)
        .with_metadata(serde_json::json!({ "provider_id": identity.provider_id })),
    )
    .await;

    Ok(StatusCode::NO_CONTENT.into_response())
}
