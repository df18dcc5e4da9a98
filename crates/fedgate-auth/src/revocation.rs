//! Best-effort upstream token revocation (RFC 7009).
//!
//! When a user unlinks a provider, their stored upstream tokens are
//! revoked at the provider so they cannot be replayed. This is
//! unconditionally best-effort: failures are collected as warnings and
//! never block the local unlink.
//!
//! The revocation endpoint is resolved in order from:
//!
//! 1. the provider configuration's explicit override,
//! 2. OIDC discovery (`revocation_endpoint`),
//! 3. the static table of endpoints known providers publish out-of-band.
//!
//! No endpoint found means there is nothing to do, which counts as
//! success.

use std::sync::Arc;

use crate::crypto::SecretCipher;
use crate::provider::UpstreamProvider;
use crate::rp::discovery::DiscoveryCache;
use crate::storage::LinkedIdentity;

/// A non-fatal revocation problem, reported for logging only.
#[derive(Debug, Clone)]
pub struct RevocationWarning {
    /// Which token failed (`access_token` or `refresh_token`).
    pub token_kind: &'static str,

    /// Safe description of the failure (status codes, no bodies).
    pub detail: String,
}

impl std::fmt::Display for RevocationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.token_kind, self.detail)
    }
}

/// Best-effort revocation client.
pub struct RevocationService {
    http_client: reqwest::Client,
    discovery: Arc<DiscoveryCache>,
}

impl RevocationService {
    /// Creates a revocation service.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    #[must_use]
    pub fn new(discovery: Arc<DiscoveryCache>, request_timeout: std::time::Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            discovery,
        }
    }

    /// Revokes an identity's stored upstream tokens.
    ///
    /// Returns the warnings encountered; an empty list means every token
    /// was revoked (or there was nothing to revoke). This method never
    /// fails.
    pub async fn revoke(
        &self,
        provider: &UpstreamProvider,
        identity: &LinkedIdentity,
        cipher: &dyn SecretCipher,
    ) -> Vec<RevocationWarning> {
        let mut warnings = Vec::new();

        let Some(endpoint) = self.resolve_endpoint(provider).await else {
            tracing::debug!(
                provider = %provider.slug,
                "No revocation endpoint known, nothing to do"
            );
            return warnings;
        };

        let client_secret = match provider
            .client_secret
            .as_ref()
            .map(|sealed| cipher.decrypt(sealed))
            .transpose()
        {
            Ok(secret) => secret,
            Err(err) => {
                warnings.push(RevocationWarning {
                    token_kind: "access_token",
                    detail: format!("client secret unavailable: {err}"),
                });
                return warnings;
            }
        };

        for (token_kind, sealed) in [
            ("access_token", identity.access_token.as_ref()),
            ("refresh_token", identity.refresh_token.as_ref()),
        ] {
            let Some(sealed) = sealed else { continue };

            let token = match cipher.decrypt(sealed) {
                Ok(token) if !token.is_empty() => token,
                Ok(_) => continue,
                Err(err) => {
                    warnings.push(RevocationWarning {
                        token_kind,
                        detail: format!("token unavailable: {err}"),
                    });
                    continue;
                }
            };

            if let Some(warning) = self
                .revoke_token(&endpoint, provider, client_secret.as_deref(), token_kind, &token)
                .await
            {
                warnings.push(warning);
            }
        }

        for warning in &warnings {
            tracing::warn!(provider = %provider.slug, %warning, "Upstream revocation warning");
        }

        warnings
    }

    /// Resolves the revocation endpoint: override, discovery, known table.
    async fn resolve_endpoint(&self, provider: &UpstreamProvider) -> Option<String> {
        if let Some(endpoint) = &provider.revocation_endpoint {
            return Some(endpoint.clone());
        }

        if provider.kind.is_oidc()
            && let Some(issuer) = provider.effective_issuer()
            && let Ok(document) = self.discovery.get(&issuer).await
            && let Some(endpoint) = document.revocation_endpoint
        {
            return Some(endpoint);
        }

        provider
            .kind
            .known_revocation_endpoint()
            .map(ToString::to_string)
    }

    /// Posts one RFC 7009 revocation request. Any 2xx is success
    /// regardless of body.
    async fn revoke_token(
        &self,
        endpoint: &str,
        provider: &UpstreamProvider,
        client_secret: Option<&str>,
        token_kind: &'static str,
        token: &str,
    ) -> Option<RevocationWarning> {
        let mut form = vec![
            ("token", token.to_string()),
            ("token_type_hint", token_kind.to_string()),
            ("client_id", provider.client_id.clone()),
        ];
        if let Some(secret) = client_secret {
            form.push(("client_secret", secret.to_string()));
        }

        match self.http_client.post(endpoint).form(&form).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(provider = %provider.slug, token_kind, "Revoked upstream token");
                None
            }
            Ok(response) => Some(RevocationWarning {
                token_kind,
                detail: format!("HTTP {}", response.status()),
            }),
            Err(err) => Some(RevocationWarning {
                token_kind,
                detail: format!("request failed: {err}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoError, SealedSecret};
    use crate::quirks::{GenericQuirks, ProviderKind};
    use crate::rp::discovery::DiscoveryCacheConfig;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct TagCipher;

    impl SecretCipher for TagCipher {
        fn encrypt(&self, plaintext: &str) -> Result<SealedSecret, CryptoError> {
            Ok(SealedSecret::from_ciphertext(format!("sealed:{plaintext}")))
        }

        fn decrypt(&self, sealed: &SealedSecret) -> Result<String, CryptoError> {
            sealed
                .ciphertext()
                .strip_prefix("sealed:")
                .map(ToString::to_string)
                .ok_or_else(|| CryptoError::DecryptionFailed("missing tag".to_string()))
        }
    }

    fn service() -> RevocationService {
        RevocationService::new(
            Arc::new(DiscoveryCache::new(
                DiscoveryCacheConfig::default().with_allow_http(true),
            )),
            std::time::Duration::from_secs(5),
        )
    }

    fn identity_with_tokens() -> LinkedIdentity {
        let mut identity = LinkedIdentity::new("u-1", "p-1", "s-1");
        identity.access_token = Some(SealedSecret::from_ciphertext("sealed:at-1"));
        identity.refresh_token = Some(SealedSecret::from_ciphertext("sealed:rt-1"));
        identity
    }

    fn provider_with_endpoint(endpoint: &str) -> UpstreamProvider {
        let mut provider = UpstreamProvider::new(
            "p-1",
            "generic",
            "t-1",
            ProviderKind::OAuth2(GenericQuirks::default()),
            "client-id",
        );
        provider.revocation_endpoint = Some(endpoint.to_string());
        provider.client_secret = Some(SealedSecret::from_ciphertext("sealed:cs-1"));
        provider
    }

    #[tokio::test]
    async fn test_revokes_both_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoke"))
            .and(body_string_contains("client_id=client-id"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider_with_endpoint(&format!("{}/revoke", server.uri()));
        let warnings = service()
            .revoke(&provider, &identity_with_tokens(), &TagCipher)
            .await;
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_no_endpoint_is_success() {
        let provider = UpstreamProvider::new(
            "p-1",
            "generic",
            "t-1",
            ProviderKind::OAuth2(GenericQuirks::default()),
            "client-id",
        );
        let warnings = service()
            .revoke(&provider, &identity_with_tokens(), &TagCipher)
            .await;
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_failures_become_warnings_not_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoke"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = provider_with_endpoint(&format!("{}/revoke", server.uri()));
        let warnings = service()
            .revoke(&provider, &identity_with_tokens(), &TagCipher)
            .await;

        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].detail.contains("503"));
    }

    #[tokio::test]
    async fn test_any_2xx_counts_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoke"))
            .respond_with(ResponseTemplate::new(204).set_body_string("unexpected body"))
            .mount(&server)
            .await;

        let provider = provider_with_endpoint(&format!("{}/revoke", server.uri()));
        let warnings = service()
            .revoke(&provider, &identity_with_tokens(), &TagCipher)
            .await;
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_known_endpoint_table() {
        assert_eq!(
            ProviderKind::Google.known_revocation_endpoint(),
            Some("https://oauth2.googleapis.com/revoke")
        );
        assert!(
            ProviderKind::OAuth2(GenericQuirks::default())
                .known_revocation_endpoint()
                .is_none()
        );
    }
}
