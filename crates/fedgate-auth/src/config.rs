//! Federation configuration.
//!
//! Configuration for the federation engine: redirect hardening, stitching
//! and JIT provisioning policy, correlation-state lifetime, and outbound
//! HTTP behavior.
//!
//! # Example (TOML)
//!
//! ```toml
//! [federation]
//! base_url = "https://id.example.com"
//! login_url = "https://id.example.com/login"
//! stitching_enabled = true
//!
//! [federation.jit]
//! enabled = true
//! require_verified_email = true
//! default_role = "member"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root federation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Enable/disable external identity federation entirely.
    pub enabled: bool,

    /// Public base URL of this service. Callback URLs are derived from it
    /// as `{base_url}/external/{slug}/callback`.
    pub base_url: String,

    /// Login page users are redirected to when a flow fails.
    pub login_url: String,

    /// Safe default redirect used when a requested `redirect_uri` is not
    /// allow-listed.
    pub default_redirect: String,

    /// Origins (scheme://host[:port]) that `redirect_uri` values may point
    /// to. Anything else silently falls back to `default_redirect`.
    pub allowed_redirect_origins: Vec<String>,

    /// Whether email-based account stitching is enabled globally.
    pub stitching_enabled: bool,

    /// Global verified-email requirement applied to every provider,
    /// regardless of the per-provider flag.
    pub require_email_verified: bool,

    /// Lifetime of an in-flight authorization state record.
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,

    /// Timeout applied to every outbound HTTP call.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Clock skew tolerance for ID token validation.
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,

    /// Allow plain-HTTP upstream endpoints. Testing only.
    pub allow_http: bool,

    /// JIT provisioning configuration.
    pub jit: JitConfig,

    /// Session cookie configuration.
    pub cookie: SessionCookieConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:8080".to_string(),
            login_url: "http://localhost:8080/login".to_string(),
            default_redirect: "http://localhost:8080/".to_string(),
            allowed_redirect_origins: vec!["http://localhost:8080".to_string()],
            stitching_enabled: false,
            require_email_verified: false,
            state_ttl: Duration::from_secs(600),      // 10 minutes
            request_timeout: Duration::from_secs(30), // 30 seconds
            clock_skew: Duration::from_secs(60),      // 60 seconds
            allow_http: false,
            jit: JitConfig::default(),
            cookie: SessionCookieConfig::default(),
        }
    }
}

impl FederationConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The exact callback URL registered with a provider.
    #[must_use]
    pub fn callback_url(&self, slug: &str) -> String {
        format!(
            "{}/external/{}/callback",
            self.base_url.trim_end_matches('/'),
            slug
        )
    }

    /// Validates a requested redirect target against the allow-list.
    ///
    /// Returns the requested URL when its origin is allow-listed, otherwise
    /// the safe default. Blocked redirects are logged; the caller never
    /// sees an error for them.
    #[must_use]
    pub fn sanitize_redirect(&self, requested: Option<&str>) -> String {
        let Some(requested) = requested else {
            return self.default_redirect.clone();
        };

        if let Ok(parsed) = url::Url::parse(requested) {
            let origin = parsed.origin().ascii_serialization();
            if self
                .allowed_redirect_origins
                .iter()
                .any(|allowed| allowed.trim_end_matches('/') == origin)
            {
                return requested.to_string();
            }
        }

        tracing::warn!(
            redirect_uri = requested,
            "Blocked redirect to non-allow-listed target, using default"
        );
        self.default_redirect.clone()
    }

    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the login URL.
    #[must_use]
    pub fn with_login_url(mut self, login_url: impl Into<String>) -> Self {
        self.login_url = login_url.into();
        self
    }

    /// Enables or disables email stitching globally.
    #[must_use]
    pub fn with_stitching_enabled(mut self, enabled: bool) -> Self {
        self.stitching_enabled = enabled;
        self
    }

    /// Sets the global verified-email requirement.
    #[must_use]
    pub fn with_require_email_verified(mut self, required: bool) -> Self {
        self.require_email_verified = required;
        self
    }

    /// Sets the JIT configuration.
    #[must_use]
    pub fn with_jit(mut self, jit: JitConfig) -> Self {
        self.jit = jit;
        self
    }

    /// Allows plain-HTTP upstream endpoints. Testing only.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }
}

/// Just-in-time provisioning configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JitConfig {
    /// Whether JIT provisioning is enabled globally.
    pub enabled: bool,

    /// JIT-level verified-email requirement, applied in addition to the
    /// global and per-provider requirements.
    pub require_verified_email: bool,

    /// Provider slugs allowed to JIT-provision. `None` allows every
    /// provider whose own flag is set.
    pub allowed_providers: Option<Vec<String>>,

    /// Whether users may exist without any organization membership.
    pub allow_standalone_users: bool,

    /// Role assigned when policy rules assign none.
    pub default_role: Option<String>,

    /// Join every organization the domain-hash mapping resolves, instead
    /// of only the first match.
    pub join_all_matching_orgs: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            require_verified_email: true,
            allowed_providers: None,
            allow_standalone_users: true,
            default_role: None,
            join_all_matching_orgs: false,
        }
    }
}

impl JitConfig {
    /// Creates a JIT configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables JIT provisioning.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the JIT-level verified-email requirement.
    #[must_use]
    pub fn with_require_verified_email(mut self, required: bool) -> Self {
        self.require_verified_email = required;
        self
    }

    /// Restricts JIT provisioning to the given provider slugs.
    #[must_use]
    pub fn with_allowed_providers(mut self, providers: Vec<String>) -> Self {
        self.allowed_providers = Some(providers);
        self
    }

    /// Sets whether standalone users are allowed.
    #[must_use]
    pub fn with_allow_standalone_users(mut self, allow: bool) -> Self {
        self.allow_standalone_users = allow;
        self
    }

    /// Sets the fallback default role.
    #[must_use]
    pub fn with_default_role(mut self, role: impl Into<String>) -> Self {
        self.default_role = Some(role.into());
        self
    }

    /// Returns `true` if the provider slug may JIT-provision.
    #[must_use]
    pub fn provider_allowed(&self, slug: &str) -> bool {
        match &self.allowed_providers {
            Some(allowed) => allowed.iter().any(|p| p == slug),
            None => true,
        }
    }
}

/// Session cookie configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionCookieConfig {
    /// Cookie name.
    pub name: String,

    /// Whether the cookie requires HTTPS.
    pub secure: bool,

    /// Cookie lifetime.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for SessionCookieConfig {
    fn default() -> Self {
        Self {
            name: "fedgate_session".to_string(),
            secure: true,
            max_age: Duration::from_secs(24 * 3600), // 24 hours
        }
    }
}
