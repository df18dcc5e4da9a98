//! Provider JWKS fetching and caching.
//!
//! ID-token signatures are verified against the provider's published JSON
//! Web Key Set. Keys are cached per JWKS URI; the cache honors
//! `Cache-Control: max-age` within clamped bounds and can be
//! force-refreshed, which is how the client recovers from provider key
//! rotation: on a signature or key-lookup failure it refreshes the set and
//! retries exactly once.
//!
//! # Security Considerations
//!
//! - Only HTTPS JWKS URIs are allowed (configurable for testing)
//! - Responses are size-limited and requests carry timeouts
//! - TTL is clamped so a malicious `Cache-Control` cannot pin a poisoned
//!   set for days

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tokio::sync::RwLock;
use url::Url;

/// Configuration for the JWKS cache.
#[derive(Debug, Clone)]
pub struct JwksCacheConfig {
    /// TTL when the provider sends no usable Cache-Control (default: 1 hour).
    pub default_ttl: Duration,

    /// Upper TTL bound (default: 24 hours).
    pub max_ttl: Duration,

    /// Lower TTL bound (default: 5 minutes).
    pub min_ttl: Duration,

    /// HTTP request timeout (default: 10 seconds).
    pub request_timeout: Duration,

    /// Maximum response size in bytes (default: 1 MB).
    pub max_response_size: usize,

    /// Whether to allow HTTP (non-HTTPS) JWKS URIs. Testing only.
    pub allow_http: bool,
}

impl Default for JwksCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),   // 1 hour
            max_ttl: Duration::from_secs(86400),      // 24 hours
            min_ttl: Duration::from_secs(300),        // 5 minutes
            request_timeout: Duration::from_secs(10), // 10 seconds
            max_response_size: 1024 * 1024,           // 1 MB
            allow_http: false,
        }
    }
}

impl JwksCacheConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default TTL.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the HTTP request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Allows HTTP (non-HTTPS) JWKS URIs. Testing only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Errors that can occur during JWKS operations.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// A network error occurred while fetching the JWKS.
    #[error("Network error: {0}")]
    Network(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    Http(u16),

    /// The JWKS response could not be parsed.
    #[error("Failed to parse JWKS: {0}")]
    Parse(String),

    /// No key matched the requested key id.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The set contains no usable signing keys.
    #[error("No signing keys found in JWKS")]
    NoSigningKeys,

    /// The JWKS URI scheme is not allowed (must be HTTPS in production).
    #[error("Invalid URL scheme: only HTTPS is allowed")]
    InvalidScheme,

    /// The response exceeded the maximum allowed size.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },
}

/// A cached key set with its expiry.
struct CachedJwks {
    jwks: JwkSet,
    expires_at: Instant,
}

/// In-memory cache of provider JWKS, keyed by JWKS URI.
pub struct JwksCache {
    http_client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedJwks>>>,
    config: JwksCacheConfig,
}

impl JwksCache {
    /// Creates a JWKS cache.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should not happen in
    /// practice).
    #[must_use]
    pub fn new(config: JwksCacheConfig) -> Self {
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
        Self::new(JwksCacheConfig::default())
    }

    /// Gets a decoding key, fetching the set on cache miss or expiry.
    ///
    /// With `kid = None` the set must contain exactly one signing key
    /// (some providers omit `kid` from token headers).
    ///
    /// # Errors
    ///
    /// Returns `KeyNotFound` when the (possibly just-fetched) set has no
    /// matching key, or an error if fetching fails.
    pub async fn get_key(
        &self,
        jwks_uri: &Url,
        kid: Option<&str>,
    ) -> Result<(DecodingKey, Option<Algorithm>), JwksError> {
        if let Some(found) = self.cached_key(jwks_uri, kid).await {
            return Ok(found);
        }

        self.refresh(jwks_uri).await?;

        self.cached_key(jwks_uri, kid).await.ok_or_else(|| match kid {
            Some(kid) => JwksError::KeyNotFound(kid.to_string()),
            None => JwksError::NoSigningKeys,
        })
    }

    /// Looks a key up in the cache without fetching.
    async fn cached_key(
        &self,
        jwks_uri: &Url,
        kid: Option<&str>,
    ) -> Option<(DecodingKey, Option<Algorithm>)> {
        let cache = self.cache.read().await;
        let cached = cache.get(&cache_key(jwks_uri))?;
        if Instant::now() >= cached.expires_at {
            return None;
        }

        let jwk = match kid {
            Some(kid) => cached
                .jwks
                .keys
                .iter()
                .find(|k| k.common.key_id.as_deref() == Some(kid))?,
            None => {
                // Tokens without a kid are only unambiguous against a
                // single-signing-key set.
                let mut signing = cached.jwks.keys.iter().filter(|k| {
                    !matches!(&k.common.public_key_use, Some(PublicKeyUse::Encryption))
                });
                let first = signing.next()?;
                if signing.next().is_some() {
                    return None;
                }
                first
            }
        };

        DecodingKey::from_jwk(jwk)
            .ok()
            .map(|dk| (dk, jwk_algorithm(jwk)))
    }

    /// Fetches the set and replaces the cached entry, regardless of its
    /// current freshness. This is the force-refresh used after signature
    /// failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the set cannot be fetched or parsed.
    pub async fn refresh(&self, jwks_uri: &Url) -> Result<(), JwksError> {
        self.validate_scheme(jwks_uri)?;

        tracing::debug!(jwks_uri = %jwks_uri, "Fetching JWKS");

        let response = self
            .http_client
            .get(jwks_uri.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(jwks_uri = %jwks_uri, error = %e, "Failed to fetch JWKS");
                JwksError::Network(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(JwksError::Http(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_response_size
        {
            return Err(JwksError::ResponseTooLarge {
                max_size: self.config.max_response_size,
            });
        }

        let ttl = self.ttl_from_headers(response.headers());

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| JwksError::Parse(e.to_string()))?;

        tracing::debug!(
            jwks_uri = %jwks_uri,
            keys = jwks.keys.len(),
            ttl_secs = ttl.as_secs(),
            "Cached JWKS"
        );

        let mut cache = self.cache.write().await;
        cache.insert(
            cache_key(jwks_uri),
            CachedJwks {
                jwks,
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(())
    }

    /// Validates that the URI uses an allowed scheme.
    fn validate_scheme(&self, uri: &Url) -> Result<(), JwksError> {
        match uri.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            _ => Err(JwksError::InvalidScheme),
        }
    }

    /// Derives the cache TTL from `Cache-Control: max-age`, clamped to the
    /// configured bounds.
    fn ttl_from_headers(&self, headers: &reqwest::header::HeaderMap) -> Duration {
        let ttl = headers
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.split(',').find_map(|directive| {
                    directive
                        .trim()
                        .strip_prefix("max-age=")
                        .and_then(|s| s.parse::<u64>().ok())
                })
            })
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_ttl);

        ttl.clamp(self.config.min_ttl, self.config.max_ttl)
    }

    /// Drops the cached set for a JWKS URI.
    pub async fn invalidate(&self, jwks_uri: &Url) {
        let mut cache = self.cache.write().await;
        cache.remove(&cache_key(jwks_uri));
        tracing::debug!(jwks_uri = %jwks_uri, "Invalidated JWKS cache entry");
    }

    /// Removes all cached sets.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    /// Removes expired entries.
    pub async fn cleanup(&self) {
        let mut cache = self.cache.write().await;
        let now = Instant::now();
        let before = cache.len();
        cache.retain(|_, v| v.expires_at > now);
        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up expired JWKS cache entries");
        }
    }

    /// Number of cached sets.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Returns `true` if the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

/// Normalizes a JWKS URI for use as a cache key.
fn cache_key(uri: &Url) -> String {
    uri.as_str().trim_end_matches('/').to_string()
}

/// Extracts the algorithm advertised by a JWK.
fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    use jsonwebtoken::jwk::KeyAlgorithm;
    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}
