//! The per-provider relying-party protocol client.
//!
//! An [`RpClient`] is constructed per provider instance from its
//! configuration plus decrypted secret material, and drives the wire
//! protocol: authorization URL construction (PKCE always, optionally an
//! RFC 9101 signed request object), the code exchange, ID-token
//! validation, userinfo retrieval, and the refresh grant.
//!
//! # Overview
//!
//! 1. **Authorization URL** - built from overrides, quirks, or discovery
//! 2. **Code exchange** - body or HTTP Basic client authentication
//! 3. **ID token validation** - signature via cached JWKS with one forced
//!    refresh-and-retry on key failures, then the full claim checks
//! 4. **Userinfo** - fetched and normalized through the attribute mapping
//!
//! # Example
//!
//! ```ignore
//! use fedgate_auth::rp::{RpClient, RpClientConfig, ClientSecrets, AuthorizationRequest};
//!
//! let client = RpClient::new(provider, secrets, config, discovery, jwks);
//! let url = client.authorization_url(&request).await?;
//! // ... redirect, receive callback ...
//! let tokens = client.exchange_code(&code, &verifier).await?;
//! let claims = client.validate_id_token(&tokens.id_token.unwrap(), &expectations).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode_header};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use time::OffsetDateTime;
use url::Url;

use super::RpError;
use super::discovery::{DiscoveryCache, OidcDiscoveryDocument};
use super::jwks::JwksCache;
use super::user_info::{self, UserInfo};
use super::{apple, jwks::JwksError};
use crate::crypto::SecretCipher;
use crate::provider::UpstreamProvider;
use crate::quirks::{ProviderKind, ResolvedEndpoints, TokenEndpointAuth};

/// Lifetime of a signed request object.
const REQUEST_OBJECT_TTL_SECS: i64 = 300; // 5 minutes

/// JWS `typ` for signed authorization requests (RFC 9101).
const REQUEST_OBJECT_TYP: &str = "oauth-authz-req+jwt";

/// Configuration shared by all protocol clients.
#[derive(Debug, Clone)]
pub struct RpClientConfig {
    /// The exact redirect URI registered with the provider.
    pub redirect_uri: String,

    /// HTTP request timeout.
    pub request_timeout: std::time::Duration,

    /// Clock skew tolerance for token validation.
    pub clock_skew: std::time::Duration,
}

impl RpClientConfig {
    /// Creates a configuration with the given redirect URI.
    #[must_use]
    pub fn new(redirect_uri: impl Into<String>) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            request_timeout: std::time::Duration::from_secs(30),
            clock_skew: std::time::Duration::from_secs(60),
        }
    }

    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the clock skew tolerance.
    #[must_use]
    pub fn with_clock_skew(mut self, skew: std::time::Duration) -> Self {
        self.clock_skew = skew;
        self
    }
}

/// Decrypted secret material for one provider.
///
/// Key material is threaded in explicitly; the client never reaches into
/// global configuration for it.
#[derive(Default)]
pub struct ClientSecrets {
    /// Decrypted OAuth client secret.
    pub client_secret: Option<String>,

    /// Decrypted request-object signing key (PEM).
    pub request_signing_key: Option<String>,

    /// Decrypted Apple ES256 private key (PEM).
    pub apple_signing_key: Option<String>,
}

impl ClientSecrets {
    /// Decrypts all secret material a provider configuration carries.
    ///
    /// # Errors
    ///
    /// Returns an error if any ciphertext fails to decrypt.
    pub fn decrypt(
        provider: &UpstreamProvider,
        cipher: &dyn SecretCipher,
    ) -> Result<Self, crate::crypto::CryptoError> {
        let client_secret = provider
            .client_secret
            .as_ref()
            .map(|sealed| cipher.decrypt(sealed))
            .transpose()?;
        let request_signing_key = provider
            .request_signing
            .as_ref()
            .map(|signing| cipher.decrypt(&signing.private_key))
            .transpose()?;
        let apple_signing_key = match &provider.kind {
            ProviderKind::Apple(quirks) => Some(cipher.decrypt(&quirks.private_key)?),
            _ => None,
        };

        Ok(Self {
            client_secret,
            request_signing_key,
            apple_signing_key,
        })
    }
}

/// Parameters for one authorization request.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationRequest {
    /// CSRF state value.
    pub state: String,

    /// OIDC nonce.
    pub nonce: String,

    /// PKCE S256 code challenge.
    pub code_challenge: String,

    /// `prompt` parameter (e.g. `login`, `consent`).
    pub prompt: Option<String>,

    /// `login_hint` parameter.
    pub login_hint: Option<String>,

    /// `max_age` parameter, in seconds.
    pub max_age: Option<u64>,

    /// `acr_values` parameter.
    pub acr_values: Option<String>,

    /// `response_mode` parameter (e.g. `form_post`).
    pub response_mode: Option<String>,
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// The access token.
    pub access_token: String,

    /// Token type (usually `Bearer`).
    #[serde(default)]
    pub token_type: Option<String>,

    /// Access token lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,

    /// Refresh token, when granted.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// ID token; absent for plain OAuth2 providers.
    #[serde(default)]
    pub id_token: Option<String>,

    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

/// Structured OAuth error body.
#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Standard OIDC ID token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer identifier.
    pub iss: String,

    /// Subject identifier.
    pub sub: String,

    /// Audience (string or array on the wire).
    #[serde(deserialize_with = "deserialize_audience")]
    pub aud: Vec<String>,

    /// Expiration time (Unix timestamp).
    pub exp: i64,

    /// Issued-at time (Unix timestamp).
    pub iat: i64,

    /// Nonce echoed from the authorization request.
    #[serde(default)]
    pub nonce: Option<String>,

    /// Time of end-user authentication.
    #[serde(default)]
    pub auth_time: Option<i64>,

    /// Access token hash.
    #[serde(default)]
    pub at_hash: Option<String>,

    /// Authorization code hash.
    #[serde(default)]
    pub c_hash: Option<String>,

    /// Authentication context class reference.
    #[serde(default)]
    pub acr: Option<String>,

    /// Authentication method references.
    #[serde(default)]
    pub amr: Option<Vec<String>>,

    /// Authorized party.
    #[serde(default)]
    pub azp: Option<String>,

    /// Remaining claims (email, profile, provider extras).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl IdTokenClaims {
    /// The full claim set as raw JSON, for normalization.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Audience can be a single string or an array.
fn deserialize_audience<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => Ok(vec![s]),
        OneOrMany::Many(v) => Ok(v),
    }
}

/// What the callback flow expects the ID token to prove.
#[derive(Debug, Clone, Default)]
pub struct IdTokenExpectations<'a> {
    /// The nonce sent in the authorization request.
    pub nonce: &'a str,

    /// The access token, when `at_hash` should be checked.
    pub access_token: Option<&'a str>,

    /// The authorization code, when `c_hash` should be checked.
    pub code: Option<&'a str>,

    /// The `max_age` requested, in seconds.
    pub max_age: Option<u64>,

    /// The `acr_values` requested.
    pub acr_values: Option<&'a str>,
}

/// Per-provider OIDC/OAuth2 protocol client.
pub struct RpClient {
    provider: UpstreamProvider,
    secrets: ClientSecrets,
    endpoints: ResolvedEndpoints,
    http_client: reqwest::Client,
    discovery: Arc<DiscoveryCache>,
    jwks: Arc<JwksCache>,
    config: RpClientConfig,
}

impl RpClient {
    /// Creates a protocol client for one provider.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    #[must_use]
    pub fn new(
        provider: UpstreamProvider,
        secrets: ClientSecrets,
        config: RpClientConfig,
        discovery: Arc<DiscoveryCache>,
        jwks: Arc<JwksCache>,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        let endpoints = provider.resolved_endpoints();

        Self {
            provider,
            secrets,
            endpoints,
            http_client,
            discovery,
            jwks,
            config,
        }
    }

    /// The provider this client speaks for.
    #[must_use]
    pub fn provider(&self) -> &UpstreamProvider {
        &self.provider
    }

    /// Fetches (or returns cached) OIDC discovery metadata.
    ///
    /// # Errors
    ///
    /// Returns an error for providers without an issuer, or when discovery
    /// fails.
    pub async fn discover(&self) -> Result<OidcDiscoveryDocument, RpError> {
        let issuer = self
            .provider
            .effective_issuer()
            .ok_or(RpError::MissingEndpoint("issuer"))?;
        Ok(self.discovery.get(&issuer).await?)
    }

    /// Resolves the authorization endpoint: override/quirks, else discovery.
    pub async fn authorization_endpoint(&self) -> Result<String, RpError> {
        if let Some(endpoint) = &self.endpoints.authorization {
            return Ok(endpoint.clone());
        }
        Ok(self.discover().await?.authorization_endpoint)
    }

    /// Resolves the token endpoint: override/quirks, else discovery.
    pub async fn token_endpoint(&self) -> Result<String, RpError> {
        if let Some(endpoint) = &self.endpoints.token {
            return Ok(endpoint.clone());
        }
        Ok(self.discover().await?.token_endpoint)
    }

    /// Resolves the userinfo endpoint: override/quirks, else discovery.
    pub async fn userinfo_endpoint(&self) -> Result<String, RpError> {
        if let Some(endpoint) = &self.endpoints.userinfo {
            return Ok(endpoint.clone());
        }
        self.discover()
            .await?
            .userinfo_endpoint
            .ok_or(RpError::MissingEndpoint("userinfo_endpoint"))
    }

    /// Resolves the JWKS URI: override/quirks, else discovery.
    pub async fn jwks_uri(&self) -> Result<Url, RpError> {
        let uri = match &self.endpoints.jwks {
            Some(endpoint) => endpoint.clone(),
            None => self.discover().await?.jwks_uri,
        };
        Ok(Url::parse(&uri)?)
    }

    /// Builds the authorization URL for a login attempt.
    ///
    /// PKCE is always attached. When request-object signing is configured
    /// the parameter set is serialized as a signed JWT and passed via
    /// `request=` alongside `client_id` (RFC 9101); otherwise the
    /// parameters travel as plain query parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if endpoint resolution or request signing fails.
    pub async fn authorization_url(&self, request: &AuthorizationRequest) -> Result<Url, RpError> {
        let endpoint = self.authorization_endpoint().await?;
        let mut url = Url::parse(&endpoint)?;

        let scopes = self.provider.effective_scopes().join(" ");

        // Apple only posts the user payload (and honors name/email scopes)
        // with form_post responses.
        let response_mode = request.response_mode.clone().or_else(|| {
            if matches!(self.provider.kind, ProviderKind::Apple(_)) && !scopes.is_empty() {
                Some("form_post".to_string())
            } else {
                None
            }
        });

        let mut params: Vec<(&str, String)> = vec![
            ("response_type", "code".to_string()),
            ("client_id", self.provider.client_id.clone()),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("scope", scopes),
            ("state", request.state.clone()),
            ("nonce", request.nonce.clone()),
            ("code_challenge", request.code_challenge.clone()),
            ("code_challenge_method", "S256".to_string()),
        ];
        if let Some(prompt) = &request.prompt {
            params.push(("prompt", prompt.clone()));
        }
        if let Some(hint) = &request.login_hint {
            params.push(("login_hint", hint.clone()));
        }
        if let Some(max_age) = request.max_age {
            params.push(("max_age", max_age.to_string()));
        }
        if let Some(acr) = &request.acr_values {
            params.push(("acr_values", acr.clone()));
        }
        if let Some(mode) = &response_mode {
            params.push(("response_mode", mode.clone()));
        }

        if self.provider.request_signing.is_some() {
            let request_object = self.sign_request_object(&params)?;
            url.query_pairs_mut()
                .append_pair("client_id", &self.provider.client_id)
                .append_pair("request", &request_object);
        } else {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &params {
                pairs.append_pair(key, value);
            }
        }

        tracing::debug!(
            provider = %self.provider.slug,
            endpoint = %endpoint,
            signed = self.provider.request_signing.is_some(),
            "Built authorization URL"
        );

        Ok(url)
    }

    /// Serializes authorization parameters as a signed request object.
    fn sign_request_object(&self, params: &[(&str, String)]) -> Result<String, RpError> {
        let signing = self
            .provider
            .request_signing
            .as_ref()
            .ok_or_else(|| RpError::RequestSigning("no signing settings".to_string()))?;
        let key_pem = self
            .secrets
            .request_signing_key
            .as_ref()
            .ok_or_else(|| RpError::RequestSigning("signing key not decrypted".to_string()))?;
        let issuer = self
            .provider
            .effective_issuer()
            .ok_or(RpError::MissingEndpoint("issuer"))?;

        let algorithm: Algorithm = signing
            .algorithm
            .parse()
            .map_err(|_| RpError::RequestSigning(format!("unknown alg {}", signing.algorithm)))?;

        let encoding_key = match algorithm {
            Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(key_pem.as_bytes()),
            _ => EncodingKey::from_rsa_pem(key_pem.as_bytes()),
        }
        .map_err(|e| RpError::RequestSigning(e.to_string()))?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut claims = serde_json::Map::new();
        for (key, value) in params {
            claims.insert((*key).to_string(), serde_json::Value::String(value.clone()));
        }
        claims.insert("iss".to_string(), self.provider.client_id.clone().into());
        claims.insert("aud".to_string(), issuer.into());
        claims.insert("iat".to_string(), now.into());
        claims.insert("exp".to_string(), (now + REQUEST_OBJECT_TTL_SECS).into());
        claims.insert(
            "jti".to_string(),
            uuid::Uuid::new_v4().to_string().into(),
        );

        let mut header = Header::new(algorithm);
        header.typ = Some(REQUEST_OBJECT_TYP.to_string());
        header.kid = signing.key_id.clone();

        jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|e| RpError::RequestSigning(e.to_string()))
    }

    /// The client secret to authenticate with: the decrypted static one,
    /// or a freshly synthesized Apple secret.
    fn client_secret(&self) -> Result<Option<String>, RpError> {
        if let ProviderKind::Apple(quirks) = &self.provider.kind {
            let key_pem = self
                .secrets
                .apple_signing_key
                .as_ref()
                .ok_or(RpError::MissingClientSecret)?;
            let secret = apple::generate_client_secret(
                &quirks.team_id,
                &self.provider.client_id,
                &quirks.key_id,
                key_pem,
                apple::DEFAULT_TTL,
            )?;
            return Ok(Some(secret));
        }
        Ok(self.secrets.client_secret.clone())
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// Client authentication follows the provider's quirk: credentials in
    /// the body (default) or HTTP Basic with percent-encoded id/secret and
    /// a body excluding them. The two modes are never combined.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, RpError> {
        let form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("code_verifier", code_verifier.to_string()),
        ];
        self.token_request(form).await
    }

    /// Runs the refresh grant.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh fails.
    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenResponse, RpError> {
        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        self.token_request(form).await
    }

    /// Posts to the token endpoint with the provider's authentication mode.
    async fn token_request(
        &self,
        mut form: Vec<(&'static str, String)>,
    ) -> Result<TokenResponse, RpError> {
        let endpoint = self.token_endpoint().await?;

        let request = match self.provider.kind.token_endpoint_auth() {
            TokenEndpointAuth::Body => {
                form.push(("client_id", self.provider.client_id.clone()));
                if let Some(secret) = self.client_secret()? {
                    form.push(("client_secret", secret));
                }
                self.http_client.post(&endpoint)
            }
            TokenEndpointAuth::Basic => {
                let secret = self.client_secret()?.ok_or(RpError::MissingClientSecret)?;
                self.http_client.post(&endpoint).header(
                    reqwest::header::AUTHORIZATION,
                    basic_auth_header(&self.provider.client_id, &secret),
                )
            }
        };

        tracing::debug!(provider = %self.provider.slug, endpoint = %endpoint, "Token request");

        let response = request
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(oauth_error) = serde_json::from_str::<OAuthErrorResponse>(&body) {
                return Err(RpError::oauth(
                    oauth_error.error,
                    oauth_error.error_description.unwrap_or_default(),
                ));
            }
            tracing::debug!(provider = %self.provider.slug, status = %status, "Token endpoint failure body: {body}");
            return Err(RpError::TokenExchange(format!("HTTP {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| RpError::TokenExchange(format!("unparseable token response: {e}")))
    }

    /// Validates an ID token and returns its claims.
    ///
    /// Signature verification uses the cached JWKS; on any signature or
    /// key-related failure the set is force-refreshed and the validation
    /// retried exactly once. Claim checks run in a fixed order: issuer,
    /// audience, presence, expiry, issued-at skew, nonce, `azp`,
    /// `auth_time`, `at_hash`/`c_hash`, `acr`.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first failing check.
    pub async fn validate_id_token(
        &self,
        id_token: &str,
        expectations: &IdTokenExpectations<'_>,
    ) -> Result<IdTokenClaims, RpError> {
        let header = decode_header(id_token)?;
        let jwks_uri = self.jwks_uri().await?;

        let claims = match self
            .decode_with_current_keys(id_token, &header, &jwks_uri)
            .await
        {
            Ok(claims) => claims,
            Err(err) if is_key_failure(&err) => {
                // The provider may have rotated its keys: refresh once and
                // retry, then propagate whatever happens.
                tracing::debug!(
                    provider = %self.provider.slug,
                    error = %err,
                    "Signature validation failed, forcing JWKS refresh"
                );
                self.jwks.refresh(&jwks_uri).await?;
                self.decode_with_current_keys(id_token, &header, &jwks_uri)
                    .await?
            }
            Err(err) => return Err(err),
        };

        self.validate_claims(&claims, expectations, header.alg)?;
        Ok(claims)
    }

    /// Decodes and signature-checks the token against currently cached keys.
    async fn decode_with_current_keys(
        &self,
        id_token: &str,
        header: &Header,
        jwks_uri: &Url,
    ) -> Result<IdTokenClaims, RpError> {
        let (decoding_key, key_alg) = self.jwks.get_key(jwks_uri, header.kid.as_deref()).await?;
        let algorithm = key_alg.unwrap_or(header.alg);

        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[&self.provider.client_id]);
        validation.leeway = self.config.clock_skew.as_secs();

        decode_claims(id_token, &decoding_key, &validation)
    }

    /// Runs the ordered claim checks after the signature has verified.
    fn validate_claims(
        &self,
        claims: &IdTokenClaims,
        expectations: &IdTokenExpectations<'_>,
        token_alg: Algorithm,
    ) -> Result<(), RpError> {
        self.validate_issuer(&claims.iss)?;

        // Audience already checked by the decoder; azp catches tokens
        // issued to a different client via a shared audience.
        if let Some(azp) = &claims.azp
            && azp != &self.provider.client_id
        {
            return Err(RpError::AuthorizedPartyMismatch);
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let skew = self.config.clock_skew.as_secs() as i64;

        if claims.iat > now + skew {
            return Err(RpError::IssuedInFuture);
        }

        match &claims.nonce {
            Some(nonce) if nonce == expectations.nonce => {}
            _ => return Err(RpError::NonceMismatch),
        }

        if let Some(max_age) = expectations.max_age {
            let auth_time = claims.auth_time.ok_or(RpError::MissingClaim("auth_time"))?;
            if now - auth_time > max_age as i64 + skew {
                return Err(RpError::AuthTimeTooOld);
            }
        }

        if let (Some(at_hash), Some(access_token)) = (&claims.at_hash, expectations.access_token) {
            let expected = left_half_hash(token_alg, access_token)
                .ok_or(RpError::TokenHashMismatch { claim: "at_hash" })?;
            if *at_hash != expected {
                return Err(RpError::TokenHashMismatch { claim: "at_hash" });
            }
        }

        if let (Some(c_hash), Some(code)) = (&claims.c_hash, expectations.code) {
            let expected = left_half_hash(token_alg, code)
                .ok_or(RpError::TokenHashMismatch { claim: "c_hash" })?;
            if *c_hash != expected {
                return Err(RpError::TokenHashMismatch { claim: "c_hash" });
            }
        }

        if let Some(requested) = expectations.acr_values {
            let acceptable: Vec<&str> = requested.split_whitespace().collect();
            match &claims.acr {
                Some(acr) if acceptable.contains(&acr.as_str()) => {}
                other => {
                    return Err(RpError::AcrMismatch {
                        actual: other.clone(),
                        requested: requested.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Validates the token's issuer claim.
    ///
    /// Microsoft's shared multi-tenant authorities issue tokens whose
    /// `iss` carries the real tenant GUID, so equality against the
    /// configured issuer is replaced by an anchored pattern match that a
    /// lookalike domain cannot satisfy.
    fn validate_issuer(&self, token_issuer: &str) -> Result<(), RpError> {
        if let ProviderKind::Microsoft(quirks) = &self.provider.kind
            && quirks.tenant.is_multi_tenant()
        {
            if microsoft_issuer_pattern().is_match(token_issuer) {
                return Ok(());
            }
            return Err(RpError::IssuerMismatch {
                expected: "https://login.microsoftonline.com/{tenant}/v2.0".to_string(),
                actual: token_issuer.to_string(),
            });
        }

        let expected = self
            .provider
            .effective_issuer()
            .ok_or(RpError::MissingEndpoint("issuer"))?;
        if token_issuer.trim_end_matches('/') == expected {
            Ok(())
        } else {
            Err(RpError::IssuerMismatch {
                expected,
                actual: token_issuer.to_string(),
            })
        }
    }

    /// Fetches and normalizes userinfo.
    ///
    /// The normalized result always carries a non-empty `sub`. Providers
    /// with an email enrichment endpoint (GitHub) get a best-effort
    /// secondary lookup when the primary document lacks an email.
    ///
    /// # Errors
    ///
    /// Returns an error if the userinfo request fails or yields no subject.
    pub async fn fetch_userinfo(&self, access_token: &str) -> Result<UserInfo, RpError> {
        let endpoint = self.userinfo_endpoint().await?;

        let response = self
            .http_client
            .get(&endpoint)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RpError::UserInfo(format!(
                "userinfo request failed: HTTP {}",
                response.status()
            )));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RpError::UserInfo(format!("unparseable userinfo response: {e}")))?;

        let mapping = self.provider.effective_attribute_mapping();
        let mut info = user_info::normalize(&raw, &mapping)?;

        if info.email.is_none() {
            self.enrich_email(access_token, &mut info).await;
        }

        Ok(info)
    }

    /// Best-effort secondary email lookup for providers that hide email
    /// behind a dedicated endpoint. Failures are logged, never propagated.
    async fn enrich_email(&self, access_token: &str, info: &mut UserInfo) {
        let ProviderKind::GitHub(quirks) = &self.provider.kind else {
            return;
        };
        let (_, api_host) = quirks.hosts();
        let endpoint = format!("https://{api_host}/user/emails");

        let result = self
            .http_client
            .get(&endpoint)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await;

        #[derive(Deserialize)]
        struct GitHubEmail {
            email: String,
            #[serde(default)]
            primary: bool,
            #[serde(default)]
            verified: bool,
        }

        let emails: Vec<GitHubEmail> = match result {
            Ok(response) if response.status().is_success() => {
                match response.json().await {
                    Ok(emails) => emails,
                    Err(err) => {
                        tracing::warn!(error = %err, "Unparseable GitHub email response");
                        return;
                    }
                }
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "GitHub email lookup failed");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "GitHub email lookup failed");
                return;
            }
        };

        let best = emails
            .iter()
            .find(|e| e.primary && e.verified)
            .or_else(|| emails.iter().find(|e| e.verified));
        if let Some(found) = best {
            info.email = Some(found.email.clone());
            info.email_verified = Some(found.verified);
        }
    }
}

/// Decodes a token, mapping decoder errors onto the validation taxonomy.
fn decode_claims(
    id_token: &str,
    key: &DecodingKey,
    validation: &Validation,
) -> Result<IdTokenClaims, RpError> {
    match jsonwebtoken::decode::<IdTokenClaims>(id_token, key, validation) {
        Ok(data) => Ok(data.claims),
        Err(err) => Err(match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => RpError::TokenExpired,
            jsonwebtoken::errors::ErrorKind::InvalidAudience => RpError::AudienceMismatch,
            _ => RpError::Jwt(err),
        }),
    }
}

/// Returns `true` for failures a JWKS refresh could plausibly fix.
fn is_key_failure(err: &RpError) -> bool {
    match err {
        RpError::Jwks(JwksError::KeyNotFound(_) | JwksError::NoSigningKeys) => true,
        RpError::Jwt(e) => matches!(
            e.kind(),
            jsonwebtoken::errors::ErrorKind::InvalidSignature
                | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm
                | jsonwebtoken::errors::ErrorKind::InvalidKeyFormat
                | jsonwebtoken::errors::ErrorKind::InvalidEcdsaKey
                | jsonwebtoken::errors::ErrorKind::InvalidRsaKey(_)
        ),
        _ => false,
    }
}

/// `Basic base64(urlencode(id):urlencode(secret))` per RFC 6749 §2.3.1.
fn basic_auth_header(client_id: &str, client_secret: &str) -> String {
    let encoded_id: String = url::form_urlencoded::byte_serialize(client_id.as_bytes()).collect();
    let encoded_secret: String =
        url::form_urlencoded::byte_serialize(client_secret.as_bytes()).collect();
    let credentials = STANDARD.encode(format!("{encoded_id}:{encoded_secret}"));
    format!("Basic {credentials}")
}

/// Left half of the token's hash, base64url encoded, per OIDC Core
/// §3.1.3.6. Returns `None` for algorithms without a defined hash.
fn left_half_hash(alg: Algorithm, input: &str) -> Option<String> {
    let digest: Vec<u8> = match alg {
        Algorithm::HS256 | Algorithm::RS256 | Algorithm::ES256 | Algorithm::PS256 => {
            Sha256::digest(input.as_bytes()).to_vec()
        }
        Algorithm::HS384 | Algorithm::RS384 | Algorithm::ES384 | Algorithm::PS384 => {
            Sha384::digest(input.as_bytes()).to_vec()
        }
        Algorithm::HS512 | Algorithm::RS512 | Algorithm::PS512 => {
            Sha512::digest(input.as_bytes()).to_vec()
        }
        Algorithm::EdDSA => return None,
    };
    Some(URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2]))
}

/// Pattern for per-tenant Microsoft issuers. The host is anchored at the
/// start of the string so `https://evil.com/login.microsoftonline.com/...`
/// cannot match.
fn microsoft_issuer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^https://login\.microsoftonline\.com/[a-f0-9-]+/v2\.0$")
            .expect("static regex is valid")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quirks::{GenericQuirks, MicrosoftQuirks, MicrosoftTenant};
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::traits::PublicKeyParts;
    use wiremock::matchers::{method, path};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    struct TestKey {
        pem: String,
        jwks: serde_json::Value,
    }

    fn generate_rsa_key(kid: &str) -> TestKey {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
            .expect("RSA key generation should succeed");
        let pem = key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .unwrap()
            .to_string();
        let jwks = serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "kid": kid,
                "use": "sig",
                "alg": "RS256",
                "n": URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
                "e": URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
            }]
        });
        TestKey { pem, jwks }
    }

    fn mint_token(pem: &str, kid: &str, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(
            &header,
            claims,
            &EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap(),
        )
        .unwrap()
    }

    fn test_provider(kind: ProviderKind, issuer: Option<&str>) -> UpstreamProvider {
        let mut provider = UpstreamProvider::new("p-1", "test", "t-1", kind, "client-id");
        if let Some(issuer) = issuer {
            provider.issuer = Some(Url::parse(issuer).unwrap());
        }
        provider
    }

    fn test_client(provider: UpstreamProvider, secrets: ClientSecrets) -> RpClient {
        RpClient::new(
            provider,
            secrets,
            RpClientConfig::new("https://rp.example.com/callback"),
            Arc::new(DiscoveryCache::new(
                crate::rp::discovery::DiscoveryCacheConfig::default().with_allow_http(true),
            )),
            Arc::new(JwksCache::new(
                crate::rp::jwks::JwksCacheConfig::default().with_allow_http(true),
            )),
        )
    }

    fn oidc_client_for(server: &MockServer, kind: ProviderKind) -> RpClient {
        let mut provider = test_provider(kind, Some(&server.uri()));
        provider.jwks_uri = Some(format!("{}/jwks", server.uri()));
        provider.token_endpoint = Some(format!("{}/token", server.uri()));
        provider.userinfo_endpoint = Some(format!("{}/userinfo", server.uri()));
        test_client(provider, ClientSecrets::default())
    }

    fn base_claims(issuer: &str) -> serde_json::Value {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        serde_json::json!({
            "iss": issuer,
            "sub": "user-123",
            "aud": "client-id",
            "exp": now + 300,
            "iat": now,
            "nonce": "nonce-1",
            "email": "user@example.com",
            "email_verified": true
        })
    }

    async fn mount_jwks(server: &MockServer, jwks: &serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwks.clone()))
            .mount(server)
            .await;
    }

    fn expectations() -> IdTokenExpectations<'static> {
        IdTokenExpectations {
            nonce: "nonce-1",
            ..IdTokenExpectations::default()
        }
    }

    // ------------------------------------------------------------------
    // Authorization URL
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_authorization_url_plain_parameters() {
        let mut provider = test_provider(
            ProviderKind::Oidc(GenericQuirks::default()),
            Some("https://issuer.example.com"),
        );
        provider.authorization_endpoint = Some("https://issuer.example.com/authorize".to_string());
        let client = test_client(provider, ClientSecrets::default());

        let url = client
            .authorization_url(&AuthorizationRequest {
                state: "st-1".to_string(),
                nonce: "n-1".to_string(),
                code_challenge: "challenge".to_string(),
                prompt: Some("login".to_string()),
                max_age: Some(300),
                ..AuthorizationRequest::default()
            })
            .await
            .unwrap();

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "client-id");
        assert_eq!(params["state"], "st-1");
        assert_eq!(params["nonce"], "n-1");
        assert_eq!(params["code_challenge"], "challenge");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["prompt"], "login");
        assert_eq!(params["max_age"], "300");
        assert!(params["scope"].contains("openid"));
    }

    #[tokio::test]
    async fn test_authorization_url_signed_request_object() {
        let key = generate_rsa_key("sign-key");
        let mut provider = test_provider(
            ProviderKind::Oidc(GenericQuirks::default()),
            Some("https://issuer.example.com"),
        );
        provider.authorization_endpoint = Some("https://issuer.example.com/authorize".to_string());
        provider.request_signing = Some(crate::provider::RequestObjectSigning {
            algorithm: "RS256".to_string(),
            private_key: crate::crypto::SealedSecret::from_ciphertext("unused"),
            key_id: Some("sign-key".to_string()),
        });

        let secrets = ClientSecrets {
            request_signing_key: Some(key.pem.clone()),
            ..ClientSecrets::default()
        };
        let client = test_client(provider, secrets);

        let url = client
            .authorization_url(&AuthorizationRequest {
                state: "st-1".to_string(),
                nonce: "n-1".to_string(),
                code_challenge: "challenge".to_string(),
                ..AuthorizationRequest::default()
            })
            .await
            .unwrap();

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        // Only client_id travels next to the request object
        assert_eq!(params.len(), 2);
        assert_eq!(params["client_id"], "client-id");

        let request_jwt = &params["request"];
        let header = decode_header(request_jwt).unwrap();
        assert_eq!(header.typ.as_deref(), Some(REQUEST_OBJECT_TYP));
        assert_eq!(header.kid.as_deref(), Some("sign-key"));

        let payload = request_jwt.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        assert_eq!(claims["iss"], "client-id");
        assert_eq!(claims["aud"], "https://issuer.example.com");
        assert_eq!(claims["state"], "st-1");
        assert_eq!(claims["code_challenge_method"], "S256");
        assert!(claims["jti"].as_str().is_some_and(|j| !j.is_empty()));
        assert_eq!(
            claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(),
            REQUEST_OBJECT_TTL_SECS
        );
    }

    // ------------------------------------------------------------------
    // Token exchange authentication modes
    // ------------------------------------------------------------------

    struct BodyExcludesCredentials;

    impl Match for BodyExcludesCredentials {
        fn matches(&self, request: &Request) -> bool {
            let body = String::from_utf8_lossy(&request.body);
            !body.contains("client_id") && !body.contains("client_secret")
        }
    }

    #[tokio::test]
    async fn test_exchange_code_basic_auth_mode() {
        let server = MockServer::start().await;

        let expected_header = basic_auth_header("client-id", "s3cret/+value");
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(wiremock::matchers::header(
                "Authorization",
                expected_header.as_str(),
            ))
            .and(wiremock::matchers::body_string_contains("code=abc"))
            .and(wiremock::matchers::body_string_contains("code_verifier="))
            .and(BodyExcludesCredentials)
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1",
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut provider = test_provider(
            ProviderKind::OAuth2(GenericQuirks {
                use_basic_auth: true,
            }),
            None,
        );
        provider.authorization_endpoint = Some(format!("{}/authorize", server.uri()));
        provider.token_endpoint = Some(format!("{}/token", server.uri()));
        let secrets = ClientSecrets {
            client_secret: Some("s3cret/+value".to_string()),
            ..ClientSecrets::default()
        };
        let client = test_client(provider, secrets);

        let tokens = client.exchange_code("abc", "verifier-value").await.unwrap();
        assert_eq!(tokens.access_token, "at-1");
    }

    #[tokio::test]
    async fn test_exchange_code_body_auth_mode() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(wiremock::matchers::body_string_contains("client_id=client-id"))
            .and(wiremock::matchers::body_string_contains("client_secret=s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut provider = test_provider(ProviderKind::OAuth2(GenericQuirks::default()), None);
        provider.authorization_endpoint = Some(format!("{}/authorize", server.uri()));
        provider.token_endpoint = Some(format!("{}/token", server.uri()));
        let secrets = ClientSecrets {
            client_secret: Some("s3cret".to_string()),
            ..ClientSecrets::default()
        };
        let client = test_client(provider, secrets);

        let tokens = client.exchange_code("abc", "verifier-value").await.unwrap();
        assert_eq!(tokens.access_token, "at-2");
    }

    #[tokio::test]
    async fn test_exchange_code_surfaces_oauth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "code expired"
            })))
            .mount(&server)
            .await;

        let mut provider = test_provider(ProviderKind::OAuth2(GenericQuirks::default()), None);
        provider.authorization_endpoint = Some(format!("{}/authorize", server.uri()));
        provider.token_endpoint = Some(format!("{}/token", server.uri()));
        let client = test_client(provider, ClientSecrets::default());

        let err = client.exchange_code("abc", "verifier").await.unwrap_err();
        match err {
            RpError::OAuth { error, .. } => assert_eq!(error, "invalid_grant"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    // ------------------------------------------------------------------
    // ID token validation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_validate_id_token_accepts_valid_token() {
        let server = MockServer::start().await;
        let key = generate_rsa_key("k1");
        mount_jwks(&server, &key.jwks).await;

        let client = oidc_client_for(&server, ProviderKind::Oidc(GenericQuirks::default()));
        let token = mint_token(&key.pem, "k1", &base_claims(&server.uri()));

        let claims = client
            .validate_id_token(&token, &expectations())
            .await
            .unwrap();
        assert_eq!(claims.sub, "user-123");
        assert_eq!(claims.extra["email"], "user@example.com");
    }

    #[tokio::test]
    async fn test_validate_id_token_rejects_expired() {
        let server = MockServer::start().await;
        let key = generate_rsa_key("k1");
        mount_jwks(&server, &key.jwks).await;

        let client = oidc_client_for(&server, ProviderKind::Oidc(GenericQuirks::default()));

        let mut claims = base_claims(&server.uri());
        let now = OffsetDateTime::now_utc().unix_timestamp();
        claims["exp"] = serde_json::json!(now - 3600);
        claims["iat"] = serde_json::json!(now - 7200);
        let token = mint_token(&key.pem, "k1", &claims);

        let err = client
            .validate_id_token(&token, &expectations())
            .await
            .unwrap_err();
        assert!(matches!(err, RpError::TokenExpired));
    }

    #[tokio::test]
    async fn test_validate_id_token_rejects_nonce_mismatch() {
        let server = MockServer::start().await;
        let key = generate_rsa_key("k1");
        mount_jwks(&server, &key.jwks).await;

        let client = oidc_client_for(&server, ProviderKind::Oidc(GenericQuirks::default()));

        let mut claims = base_claims(&server.uri());
        claims["nonce"] = serde_json::json!("attacker-nonce");
        let token = mint_token(&key.pem, "k1", &claims);

        let err = client
            .validate_id_token(&token, &expectations())
            .await
            .unwrap_err();
        assert!(matches!(err, RpError::NonceMismatch));

        // A token missing the nonce entirely also fails
        let mut claims = base_claims(&server.uri());
        claims.as_object_mut().unwrap().remove("nonce");
        let token = mint_token(&key.pem, "k1", &claims);
        let err = client
            .validate_id_token(&token, &expectations())
            .await
            .unwrap_err();
        assert!(matches!(err, RpError::NonceMismatch));
    }

    #[tokio::test]
    async fn test_validate_id_token_rejects_wrong_audience() {
        let server = MockServer::start().await;
        let key = generate_rsa_key("k1");
        mount_jwks(&server, &key.jwks).await;

        let client = oidc_client_for(&server, ProviderKind::Oidc(GenericQuirks::default()));

        let mut claims = base_claims(&server.uri());
        claims["aud"] = serde_json::json!("someone-else");
        let token = mint_token(&key.pem, "k1", &claims);

        let err = client
            .validate_id_token(&token, &expectations())
            .await
            .unwrap_err();
        assert!(matches!(err, RpError::AudienceMismatch));
    }

    #[tokio::test]
    async fn test_validate_id_token_rejects_future_iat() {
        let server = MockServer::start().await;
        let key = generate_rsa_key("k1");
        mount_jwks(&server, &key.jwks).await;

        let client = oidc_client_for(&server, ProviderKind::Oidc(GenericQuirks::default()));

        let mut claims = base_claims(&server.uri());
        let now = OffsetDateTime::now_utc().unix_timestamp();
        claims["iat"] = serde_json::json!(now + 300); // beyond 60s skew
        let token = mint_token(&key.pem, "k1", &claims);

        let err = client
            .validate_id_token(&token, &expectations())
            .await
            .unwrap_err();
        assert!(matches!(err, RpError::IssuedInFuture));
    }

    #[tokio::test]
    async fn test_validate_id_token_checks_at_hash() {
        let server = MockServer::start().await;
        let key = generate_rsa_key("k1");
        mount_jwks(&server, &key.jwks).await;

        let client = oidc_client_for(&server, ProviderKind::Oidc(GenericQuirks::default()));

        let access_token = "the-access-token";
        let mut claims = base_claims(&server.uri());
        claims["at_hash"] =
            serde_json::json!(left_half_hash(Algorithm::RS256, access_token).unwrap());
        let token = mint_token(&key.pem, "k1", &claims);

        let ok = client
            .validate_id_token(
                &token,
                &IdTokenExpectations {
                    nonce: "nonce-1",
                    access_token: Some(access_token),
                    ..IdTokenExpectations::default()
                },
            )
            .await;
        assert!(ok.is_ok());

        let err = client
            .validate_id_token(
                &token,
                &IdTokenExpectations {
                    nonce: "nonce-1",
                    access_token: Some("a-different-token"),
                    ..IdTokenExpectations::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpError::TokenHashMismatch { claim: "at_hash" }
        ));
    }

    #[tokio::test]
    async fn test_validate_id_token_checks_acr() {
        let server = MockServer::start().await;
        let key = generate_rsa_key("k1");
        mount_jwks(&server, &key.jwks).await;

        let client = oidc_client_for(&server, ProviderKind::Oidc(GenericQuirks::default()));

        let mut claims = base_claims(&server.uri());
        claims["acr"] = serde_json::json!("urn:basic");
        let token = mint_token(&key.pem, "k1", &claims);

        let err = client
            .validate_id_token(
                &token,
                &IdTokenExpectations {
                    nonce: "nonce-1",
                    acr_values: Some("urn:mfa urn:hwk"),
                    ..IdTokenExpectations::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpError::AcrMismatch { .. }));
    }

    #[tokio::test]
    async fn test_validate_id_token_refreshes_jwks_once_on_rotation() {
        let server = MockServer::start().await;
        let old_key = generate_rsa_key("old-kid");
        mount_jwks(&server, &old_key.jwks).await;

        let client = oidc_client_for(&server, ProviderKind::Oidc(GenericQuirks::default()));

        // Warm the cache with the old key set
        let token = mint_token(&old_key.pem, "old-kid", &base_claims(&server.uri()));
        client
            .validate_id_token(&token, &expectations())
            .await
            .unwrap();

        // Provider rotates its keys
        let new_key = generate_rsa_key("new-kid");
        server.reset().await;
        mount_jwks(&server, &new_key.jwks).await;

        // Token signed with the new key validates via the forced refresh
        let token = mint_token(&new_key.pem, "new-kid", &base_claims(&server.uri()));
        let claims = client
            .validate_id_token(&token, &expectations())
            .await
            .unwrap();
        assert_eq!(claims.sub, "user-123");
    }

    #[tokio::test]
    async fn test_microsoft_multi_tenant_issuer_validation() {
        let client = test_client(
            test_provider(
                ProviderKind::Microsoft(MicrosoftQuirks {
                    tenant: MicrosoftTenant::Organizations,
                }),
                None,
            ),
            ClientSecrets::default(),
        );

        // Real per-tenant issuer passes
        assert!(
            client
                .validate_issuer(
                    "https://login.microsoftonline.com/11111111-2222-3333-4444-555555555555/v2.0"
                )
                .is_ok()
        );

        // Case-insensitive host
        assert!(
            client
                .validate_issuer(
                    "https://LOGIN.MICROSOFTONLINE.COM/11111111-2222-3333-4444-555555555555/v2.0"
                )
                .is_ok()
        );

        // Lookalike domain fails: host anchor defeats path spoofing
        assert!(
            client
                .validate_issuer("https://evil.com/login.microsoftonline.com/x/v2.0")
                .is_err()
        );

        // The shared segment itself is not a valid token issuer
        assert!(
            client
                .validate_issuer("https://login.microsoftonline.com/organizations/v2.0")
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_fixed_tenant_uses_exact_issuer_match() {
        let client = test_client(
            test_provider(
                ProviderKind::Microsoft(MicrosoftQuirks {
                    tenant: MicrosoftTenant::Directory(
                        "11111111-2222-3333-4444-555555555555".to_string(),
                    ),
                }),
                None,
            ),
            ClientSecrets::default(),
        );

        assert!(
            client
                .validate_issuer(
                    "https://login.microsoftonline.com/11111111-2222-3333-4444-555555555555/v2.0"
                )
                .is_ok()
        );
        // A different tenant's issuer fails under the fixed-tenant config
        assert!(
            client
                .validate_issuer(
                    "https://login.microsoftonline.com/99999999-8888-7777-6666-555555555555/v2.0"
                )
                .is_err()
        );
    }

    // ------------------------------------------------------------------
    // Userinfo
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_fetch_userinfo_normalizes_and_requires_sub() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sub": "user-9",
                "email": "u@example.com",
                "email_verified": true
            })))
            .mount(&server)
            .await;

        let client = oidc_client_for(&server, ProviderKind::Oidc(GenericQuirks::default()));
        let info = client.fetch_userinfo("at").await.unwrap();
        assert_eq!(info.sub, "user-9");
        assert!(info.has_verified_email());
    }

    #[tokio::test]
    async fn test_fetch_userinfo_rejects_missing_sub() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "email": "u@example.com" })),
            )
            .mount(&server)
            .await;

        let client = oidc_client_for(&server, ProviderKind::Oidc(GenericQuirks::default()));
        let err = client.fetch_userinfo("at").await.unwrap_err();
        assert!(matches!(err, RpError::MissingClaim("sub")));
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    #[test]
    fn test_basic_auth_header_percent_encodes() {
        // RFC 6749 §2.3.1: form-encode before base64
        let header = basic_auth_header("client:id", "secret value");
        let encoded = header.strip_prefix("Basic ").unwrap();
        let decoded = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded, "client%3Aid:secret+value");
    }

    #[test]
    fn test_left_half_hash_known_value() {
        // The at_hash example pair from OIDC Core: base64url of the left
        // half of SHA-256("jHkWEdUXMU1BwAsC4vtUsZwnNvTIxEl0z9K3vx5KF0Y")
        let hash = left_half_hash(Algorithm::RS256, "jHkWEdUXMU1BwAsC4vtUsZwnNvTIxEl0z9K3vx5KF0Y")
            .unwrap();
        assert_eq!(hash, "77QmUPtjPfzWtF2AnpK9RQ");
    }

    #[test]
    fn test_audience_deserializer() {
        let one: IdTokenClaims = serde_json::from_value(serde_json::json!({
            "iss": "i", "sub": "s", "aud": "a", "exp": 1, "iat": 1
        }))
        .unwrap();
        assert_eq!(one.aud, vec!["a"]);

        let many: IdTokenClaims = serde_json::from_value(serde_json::json!({
            "iss": "i", "sub": "s", "aud": ["a", "b"], "exp": 1, "iat": 1
        }))
        .unwrap();
        assert_eq!(many.aud, vec!["a", "b"]);
    }
}
