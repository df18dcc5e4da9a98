//! OIDC discovery documents and their cache.
//!
//! Fetches `{issuer}/.well-known/openid-configuration`, enforces the
//! issuer-equality rule from OIDC Discovery 1.0 §4.3, and caches documents
//! in memory.
//!
//! # Security Considerations
//!
//! - The returned `issuer` must exactly equal the configured issuer
//! - Only HTTPS endpoints are allowed (configurable for testing)
//! - Responses are size-limited and requests carry timeouts

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

/// OIDC provider metadata.
///
/// The four fields the engine depends on are mandatory; a document missing
/// any of them fails discovery. Everything else is carried opportunistically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcDiscoveryDocument {
    /// URL that the provider asserts as its issuer identifier.
    pub issuer: String,

    /// Authorization endpoint.
    pub authorization_endpoint: String,

    /// Token endpoint.
    pub token_endpoint: String,

    /// JSON Web Key Set document URL.
    pub jwks_uri: String,

    /// Supported `response_type` values.
    pub response_types_supported: Vec<String>,

    /// Userinfo endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    /// RFC 7009 revocation endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,

    /// RFC 7662 introspection endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,

    /// RP-initiated logout endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,

    /// Supported scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    /// Supported grant types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_types_supported: Option<Vec<String>>,

    /// Supported ID token signing algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token_signing_alg_values_supported: Option<Vec<String>>,

    /// Supported subject identifier types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_types_supported: Option<Vec<String>>,

    /// Supported PKCE code challenge methods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,

    /// Supported `response_mode` values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_modes_supported: Option<Vec<String>>,

    /// Whether the `request` parameter (RFC 9101) is supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_parameter_supported: Option<bool>,

    /// Supported request-object signing algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_object_signing_alg_values_supported: Option<Vec<String>>,
}

impl OidcDiscoveryDocument {
    /// Returns `true` if this provider supports the specified grant type.
    #[must_use]
    pub fn supports_grant_type(&self, grant_type: &str) -> bool {
        self.grant_types_supported
            .as_ref()
            .is_some_and(|grants| grants.iter().any(|g| g == grant_type))
    }

    /// Returns `true` if this provider supports the specified response mode.
    #[must_use]
    pub fn supports_response_mode(&self, mode: &str) -> bool {
        self.response_modes_supported
            .as_ref()
            .is_some_and(|modes| modes.iter().any(|m| m == mode))
    }
}

/// Errors that can occur during OIDC discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A network error occurred while fetching the document.
    #[error("Network error: {0}")]
    Network(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    Http(u16),

    /// The document could not be parsed, or a mandatory field is missing.
    #[error("Failed to parse discovery document: {0}")]
    Parse(String),

    /// The document's `issuer` does not equal the configured issuer.
    #[error("Issuer mismatch: configured {configured}, document says {document}")]
    IssuerMismatch {
        /// The issuer we asked about.
        configured: String,
        /// The issuer the document asserts.
        document: String,
    },

    /// The issuer URL scheme is not allowed (must be HTTPS in production).
    #[error("Invalid URL scheme: only HTTPS is allowed")]
    InvalidScheme,

    /// The response exceeded the maximum allowed size.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },
}

/// Configuration for the discovery cache.
#[derive(Debug, Clone)]
pub struct DiscoveryCacheConfig {
    /// How long documents stay cached (default: 1 hour).
    pub ttl: Duration,

    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) issuers. Testing only.
    pub allow_http: bool,
}

impl Default for DiscoveryCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),           // 1 hour
            request_timeout: Duration::from_secs(10), // 10 seconds
            max_response_size: 1024 * 1024,           // 1 MB
            allow_http: false,
        }
    }
}

impl DiscoveryCacheConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Allows HTTP (non-HTTPS) issuers. Testing only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// A cached discovery document.
struct CachedDocument {
    document: OidcDiscoveryDocument,
    fetched_at: Instant,
}

/// In-memory cache of OIDC discovery documents, keyed by issuer.
pub struct DiscoveryCache {
    http_client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedDocument>>>,
    config: DiscoveryCacheConfig,
}

impl DiscoveryCache {
    /// Creates a discovery cache.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    #[must_use]
    pub fn new(config: DiscoveryCacheConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http_client,
            cache: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Creates a cache with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DiscoveryCacheConfig::default())
    }

    /// Gets the discovery document for an issuer, fetching on cache miss
    /// or expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be fetched, parsed, or if
    /// its `issuer` does not equal the requested issuer.
    pub async fn get(&self, issuer: &str) -> Result<OidcDiscoveryDocument, DiscoveryError> {
        let key = normalize_issuer(issuer);

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key)
                && cached.fetched_at.elapsed() < self.config.ttl
            {
                tracing::trace!(issuer = %key, "Discovery cache hit");
                return Ok(cached.document.clone());
            }
        }

        self.refresh(issuer).await
    }

    /// Fetches a fresh document, bypassing and updating the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be fetched or validated.
    pub async fn refresh(&self, issuer: &str) -> Result<OidcDiscoveryDocument, DiscoveryError> {
        let key = normalize_issuer(issuer);
        let document = self.fetch(&key).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            key,
            CachedDocument {
                document: document.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(document)
    }

    /// Fetches and validates the document for a normalized issuer.
    async fn fetch(&self, issuer: &str) -> Result<OidcDiscoveryDocument, DiscoveryError> {
        let discovery_url = format!("{issuer}/.well-known/openid-configuration");
        let parsed =
            Url::parse(&discovery_url).map_err(|e| DiscoveryError::Network(e.to_string()))?;
        self.validate_scheme(&parsed)?;

        tracing::debug!(issuer, "Fetching OIDC discovery document");

        let response = self
            .http_client
            .get(parsed)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(issuer, error = %e, "Failed to fetch discovery document");
                DiscoveryError::Network(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Http(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(DiscoveryError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let document: OidcDiscoveryDocument = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Parse(e.to_string()))?;

        // OIDC Discovery 1.0 §4.3: the issuer in the document must exactly
        // match the issuer the document was retrieved from.
        if normalize_issuer(&document.issuer) != issuer {
            return Err(DiscoveryError::IssuerMismatch {
                configured: issuer.to_string(),
                document: document.issuer.clone(),
            });
        }

        Ok(document)
    }

    /// Validates that the URL uses an allowed scheme.
    fn validate_scheme(&self, url: &Url) -> Result<(), DiscoveryError> {
        match url.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            _ => Err(DiscoveryError::InvalidScheme),
        }
    }

    /// Invalidates the cached document for an issuer.
    pub async fn invalidate(&self, issuer: &str) {
        let key = normalize_issuer(issuer);
        let mut cache = self.cache.write().await;
        cache.remove(&key);
        tracing::debug!(issuer = %key, "Invalidated discovery cache entry");
    }

    /// Removes expired entries.
    pub async fn cleanup(&self) {
        let mut cache = self.cache.write().await;
        let ttl = self.config.ttl;
        let before = cache.len();
        cache.retain(|_, v| v.fetched_at.elapsed() < ttl);
        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up expired discovery cache entries");
        }
    }

    /// Removes all entries.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    /// Number of cached documents.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Returns `true` if the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

/// Normalizes an issuer for comparison and cache keys: trailing slashes
/// are insignificant.
fn normalize_issuer(issuer: &str) -> String {
    issuer.trim_end_matches('/').to_string()
}
