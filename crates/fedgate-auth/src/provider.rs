//! Upstream identity provider configuration.
//!
//! An [`UpstreamProvider`] is one tenant-scoped provider registration:
//! endpoints, credentials, claim mapping, behavior flags, and the typed
//! quirks variant that drives provider-specific handling. Records are
//! created and maintained by the administrative API; this crate reads them
//! through [`ProviderStorage`].
//!
//! # Example
//!
//! ```ignore
//! use fedgate_auth::provider::UpstreamProvider;
//! use fedgate_auth::quirks::ProviderKind;
//!
//! let provider = UpstreamProvider::new("p-1", "google", "tenant-1", ProviderKind::Google, "client-id")
//!     .with_scopes(vec!["openid", "email", "profile"])
//!     .with_auto_link_email(true)
//!     .with_jit_provisioning(true);
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto::SealedSecret;
use crate::quirks::{ProviderKind, ResolvedEndpoints};
use crate::storage::StorageError;

/// A tenant-scoped upstream identity provider configuration.
///
/// The encrypted client secret is carried for the engine's own use; it is
/// never returned to API callers. Presence is surfaced only through
/// [`UpstreamProvider::has_client_secret`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamProvider {
    /// Unique identifier.
    pub id: String,

    /// URL-safe slug used in flow routes (e.g. `google`).
    pub slug: String,

    /// Owning tenant.
    pub tenant_id: String,

    /// Provider variant with its typed quirks.
    #[serde(flatten)]
    pub kind: ProviderKind,

    /// Display name shown on login buttons. Defaults to the kind's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// OIDC issuer URL. Required for generic OIDC providers; known
    /// providers resolve it from quirks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<Url>,

    /// Optional override for the authorization endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    /// Optional override for the token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// Optional override for the userinfo endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    /// Optional override for the JWKS endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Optional override for the RFC 7009 revocation endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,

    /// OAuth client id registered with the provider.
    pub client_id: String,

    /// Encrypted OAuth client secret (`None` for public clients and for
    /// Apple, whose secret is synthesized).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<SealedSecret>,

    /// Scopes to request. Empty means the kind's defaults.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Claim mapping overrides. Empty means the kind's defaults.
    #[serde(default)]
    pub attribute_mapping: AttributeMapping,

    /// Auto-link upstream identities to local accounts matched by email.
    #[serde(default)]
    pub auto_link_email: bool,

    /// Allow just-in-time provisioning of new users.
    #[serde(default)]
    pub jit_provisioning: bool,

    /// Require the upstream email to be verified.
    #[serde(default)]
    pub require_email_verified: bool,

    /// Always call the userinfo endpoint, even when the ID token already
    /// carries profile claims.
    #[serde(default)]
    pub always_fetch_userinfo: bool,

    /// Whether this provider is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Signed-request-object (RFC 9101) settings, when the provider
    /// requires JWT-secured authorization requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_signing: Option<RequestObjectSigning>,
}

fn default_true() -> bool {
    true
}

impl UpstreamProvider {
    /// Creates a provider configuration with required fields.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        slug: impl Into<String>,
        tenant_id: impl Into<String>,
        kind: ProviderKind,
        client_id: impl Into<String>,
    ) -> Self {
        let scopes = kind.default_scopes();
        Self {
            id: id.into(),
            slug: slug.into(),
            tenant_id: tenant_id.into(),
            kind,
            display_name: None,
            issuer: None,
            authorization_endpoint: None,
            token_endpoint: None,
            userinfo_endpoint: None,
            jwks_uri: None,
            revocation_endpoint: None,
            client_id: client_id.into(),
            client_secret: None,
            scopes,
            attribute_mapping: AttributeMapping::default(),
            auto_link_email: false,
            jit_provisioning: false,
            require_email_verified: false,
            always_fetch_userinfo: false,
            enabled: true,
            request_signing: None,
        }
    }

    /// Sets the encrypted client secret.
    #[must_use]
    pub fn with_client_secret(mut self, sealed: SealedSecret) -> Self {
        self.client_secret = Some(sealed);
        self
    }

    /// Sets the requested scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<impl Into<String>>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the issuer.
    #[must_use]
    pub fn with_issuer(mut self, issuer: Url) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Enables or disables email auto-linking.
    #[must_use]
    pub fn with_auto_link_email(mut self, enabled: bool) -> Self {
        self.auto_link_email = enabled;
        self
    }

    /// Enables or disables JIT provisioning.
    #[must_use]
    pub fn with_jit_provisioning(mut self, enabled: bool) -> Self {
        self.jit_provisioning = enabled;
        self
    }

    /// Sets the verified-email requirement.
    #[must_use]
    pub fn with_require_email_verified(mut self, required: bool) -> Self {
        self.require_email_verified = required;
        self
    }

    /// Sets whether userinfo is always fetched.
    #[must_use]
    pub fn with_always_fetch_userinfo(mut self, always: bool) -> Self {
        self.always_fetch_userinfo = always;
        self
    }

    /// Sets whether the provider is enabled.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the request-object signing settings.
    #[must_use]
    pub fn with_request_signing(mut self, signing: RequestObjectSigning) -> Self {
        self.request_signing = Some(signing);
        self
    }

    /// Returns `true` if a client secret is configured.
    ///
    /// This is the only view of the secret exposed to callers.
    #[must_use]
    pub fn has_client_secret(&self) -> bool {
        self.client_secret.is_some()
    }

    /// Display name for login buttons: the configured one, else the
    /// kind's default.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or_else(|| self.kind.display_name())
    }

    /// The issuer to validate against: the configured one, else the
    /// kind's resolved default.
    #[must_use]
    pub fn effective_issuer(&self) -> Option<String> {
        self.issuer
            .as_ref()
            .map(|u| u.as_str().trim_end_matches('/').to_string())
            .or_else(|| self.kind.resolve_endpoints().issuer)
    }

    /// Scopes to request: the configured ones, else the kind's defaults.
    #[must_use]
    pub fn effective_scopes(&self) -> Vec<String> {
        if self.scopes.is_empty() {
            self.kind.default_scopes()
        } else {
            self.scopes.clone()
        }
    }

    /// Claim mapping: configured entries override the kind's defaults.
    #[must_use]
    pub fn effective_attribute_mapping(&self) -> AttributeMapping {
        let mut mapping = self.kind.default_attribute_mapping();
        mapping.merge(&self.attribute_mapping);
        mapping
    }

    /// Endpoints after applying overrides on top of quirk resolution.
    /// Discovery fills whatever remains unset for OIDC kinds.
    #[must_use]
    pub fn resolved_endpoints(&self) -> ResolvedEndpoints {
        let mut endpoints = self.kind.resolve_endpoints();
        if let Some(issuer) = &self.issuer {
            endpoints.issuer = Some(issuer.as_str().trim_end_matches('/').to_string());
        }
        if self.authorization_endpoint.is_some() {
            endpoints.authorization = self.authorization_endpoint.clone();
        }
        if self.token_endpoint.is_some() {
            endpoints.token = self.token_endpoint.clone();
        }
        if self.userinfo_endpoint.is_some() {
            endpoints.userinfo = self.userinfo_endpoint.clone();
        }
        if self.jwks_uri.is_some() {
            endpoints.jwks = self.jwks_uri.clone();
        }
        endpoints
    }

    /// Validates the configuration, returning human-readable errors.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.kind.validate(self);
        if self.slug.is_empty()
            || !self
                .slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            errors.push(format!(
                "Provider slug must be lowercase alphanumeric with '-'/'_', got '{}'",
                self.slug
            ));
        }
        errors
    }
}

/// RFC 9101 signed-request-object settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestObjectSigning {
    /// JWS algorithm (e.g. `RS256`, `ES256`).
    pub algorithm: String,

    /// Encrypted signing key in PEM form.
    pub private_key: SealedSecret,

    /// Key id placed in the JWS header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Mapping of normalized claims to source paths in provider JSON.
///
/// Keys are target claim names (`sub`, `email`, ...); values are
/// dot-addressable paths into the raw claims (`data.id`,
/// `picture.data.url`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMapping(BTreeMap<String, String>);

impl AttributeMapping {
    /// The standard OIDC identity mapping.
    #[must_use]
    pub fn standard_oidc() -> Self {
        Self::from_pairs([
            ("sub", "sub"),
            ("email", "email"),
            ("email_verified", "email_verified"),
            ("name", "name"),
            ("given_name", "given_name"),
            ("family_name", "family_name"),
            ("picture", "picture"),
            ("locale", "locale"),
        ])
    }

    /// Builds a mapping from `(target, source-path)` pairs.
    #[must_use]
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    /// Returns `true` if no mappings are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Source path for a target claim.
    #[must_use]
    pub fn source(&self, target: &str) -> Option<&str> {
        self.0.get(target).map(String::as_str)
    }

    /// Overlays `other`'s entries onto this mapping.
    pub fn merge(&mut self, other: &AttributeMapping) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Looks up a target claim's value in raw claims JSON, following the
    /// dot-addressable source path.
    #[must_use]
    pub fn lookup<'a>(
        &self,
        claims: &'a serde_json::Value,
        target: &str,
    ) -> Option<&'a serde_json::Value> {
        let path = self.source(target)?;
        lookup_path(claims, path)
    }
}

/// Follows a dot-separated path through nested JSON objects.
#[must_use]
pub fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Read access to provider configuration records.
///
/// The administrative API owns writes; the federation engine only reads.
#[async_trait]
pub trait ProviderStorage: Send + Sync {
    /// Finds a provider by its unique id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_id(&self, id: &str) -> Result<Option<UpstreamProvider>, StorageError>;

    /// Finds a provider by slug or id within a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_slug_or_id(
        &self,
        id_or_slug: &str,
        tenant_id: &str,
    ) -> Result<Option<UpstreamProvider>, StorageError>;

    /// Lists enabled providers for a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn list_enabled(&self, tenant_id: &str) -> Result<Vec<UpstreamProvider>, StorageError>;
}
