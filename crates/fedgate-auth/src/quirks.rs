//! Per-provider quirks registry.
//!
//! Known providers deviate from strict OIDC/OAuth2 conformance in
//! well-understood ways: GitHub has no discovery document and delivers
//! numeric user ids, Facebook and Twitter version their userinfo APIs and
//! take field lists, Microsoft issues tokens from per-tenant issuers behind
//! one shared endpoint, Apple wants a synthesized client secret and returns
//! the user's name exactly once in the callback body.
//!
//! Each known provider is one variant of the closed [`ProviderKind`] enum,
//! carrying a strongly-typed quirks struct. All provider-specific behavior
//! is dispatched through the capability surface on `ProviderKind`:
//! endpoint resolution, configuration validation, token-endpoint
//! authentication style, and default scopes/claim mappings. Unknown
//! providers use the generic variants and only operator-supplied fields.

use serde::{Deserialize, Serialize};

use crate::crypto::SealedSecret;
use crate::provider::{AttributeMapping, UpstreamProvider};

/// Host of the shared Microsoft multi-tenant authority.
pub const MICROSOFT_LOGIN_HOST: &str = "login.microsoftonline.com";

/// Twitter `user.fields` values accepted by the users/me endpoint.
const TWITTER_USER_FIELDS: &[&str] = &[
    "id",
    "name",
    "username",
    "created_at",
    "description",
    "location",
    "profile_image_url",
    "url",
    "verified",
];

/// A known provider variant with its typed quirks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", content = "quirks", rename_all = "snake_case")]
pub enum ProviderKind {
    /// Google Sign-In (conformant OIDC).
    Google,
    /// Microsoft Entra ID / Azure AD v2.
    Microsoft(MicrosoftQuirks),
    /// GitHub OAuth2 (no OIDC layer).
    #[serde(rename = "github")]
    GitHub(GitHubQuirks),
    /// Facebook Login (OAuth2 against the Graph API).
    Facebook(FacebookQuirks),
    /// Twitter/X OAuth2.
    Twitter(TwitterQuirks),
    /// Sign in with Apple.
    Apple(AppleQuirks),
    /// Generic spec-conformant OIDC issuer.
    Oidc(GenericQuirks),
    /// Generic OAuth2 issuer without an ID token.
    #[serde(rename = "oauth2")]
    OAuth2(GenericQuirks),
}

/// How the client authenticates at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEndpointAuth {
    /// `client_id`/`client_secret` in the form body (the default).
    Body,
    /// HTTP Basic with percent-encoded credentials; the body carries
    /// neither `client_id` nor `client_secret`.
    Basic,
}

/// Endpoints resolved from quirks, before discovery.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEndpoints {
    /// Issuer URL, for providers with OIDC discovery.
    pub issuer: Option<String>,
    /// Authorization endpoint.
    pub authorization: Option<String>,
    /// Token endpoint.
    pub token: Option<String>,
    /// Userinfo endpoint.
    pub userinfo: Option<String>,
    /// JWKS endpoint.
    pub jwks: Option<String>,
}

impl ProviderKind {
    /// Human-readable provider name for login buttons and logs.
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Google => "Google",
            Self::Microsoft(_) => "Microsoft",
            Self::GitHub(_) => "GitHub",
            Self::Facebook(_) => "Facebook",
            Self::Twitter(_) => "Twitter",
            Self::Apple(_) => "Apple",
            Self::Oidc(_) => "OpenID Connect",
            Self::OAuth2(_) => "OAuth 2.0",
        }
    }

    /// Returns `true` if the provider issues ID tokens.
    #[must_use]
    pub fn is_oidc(&self) -> bool {
        !matches!(
            self,
            Self::GitHub(_) | Self::Facebook(_) | Self::Twitter(_) | Self::OAuth2(_)
        )
    }

    /// Default scopes requested when the operator configures none.
    #[must_use]
    pub fn default_scopes(&self) -> Vec<String> {
        let scopes: &[&str] = match self {
            Self::Google | Self::Microsoft(_) | Self::Oidc(_) => &["openid", "email", "profile"],
            Self::GitHub(_) => &["read:user", "user:email"],
            Self::Facebook(_) => &["email", "public_profile"],
            Self::Twitter(_) => &["tweet.read", "users.read", "offline.access"],
            Self::Apple(_) => &["name", "email"],
            Self::OAuth2(_) => &[],
        };
        scopes.iter().map(ToString::to_string).collect()
    }

    /// Default claim mapping applied when the operator configures none.
    ///
    /// Paths are dot-addressable into the raw userinfo/claims JSON, which
    /// is how Facebook's nested picture and Twitter's `data` envelope are
    /// reached.
    #[must_use]
    pub fn default_attribute_mapping(&self) -> AttributeMapping {
        match self {
            Self::GitHub(_) => AttributeMapping::from_pairs([
                ("sub", "id"),
                ("email", "email"),
                ("name", "name"),
                ("picture", "avatar_url"),
            ]),
            Self::Facebook(_) => AttributeMapping::from_pairs([
                ("sub", "id"),
                ("email", "email"),
                ("name", "name"),
                ("given_name", "first_name"),
                ("family_name", "last_name"),
                ("picture", "picture.data.url"),
            ]),
            Self::Twitter(_) => AttributeMapping::from_pairs([
                ("sub", "data.id"),
                ("name", "data.name"),
                ("picture", "data.profile_image_url"),
            ]),
            _ => AttributeMapping::standard_oidc(),
        }
    }

    /// Resolves provider endpoints from quirk fields.
    ///
    /// Per-provider configuration overrides take precedence over these;
    /// OIDC discovery fills whatever remains unset.
    #[must_use]
    pub fn resolve_endpoints(&self) -> ResolvedEndpoints {
        match self {
            Self::Google => ResolvedEndpoints {
                issuer: Some("https://accounts.google.com".to_string()),
                ..ResolvedEndpoints::default()
            },
            Self::Microsoft(quirks) => ResolvedEndpoints {
                issuer: Some(format!(
                    "https://{MICROSOFT_LOGIN_HOST}/{}/v2.0",
                    quirks.tenant.segment()
                )),
                ..ResolvedEndpoints::default()
            },
            Self::GitHub(quirks) => {
                let (web, api) = quirks.hosts();
                ResolvedEndpoints {
                    issuer: None,
                    authorization: Some(format!("https://{web}/login/oauth/authorize")),
                    token: Some(format!("https://{web}/login/oauth/access_token")),
                    userinfo: Some(format!("https://{api}/user")),
                    jwks: None,
                }
            }
            Self::Facebook(quirks) => {
                let v = &quirks.graph_version;
                ResolvedEndpoints {
                    issuer: None,
                    authorization: Some(format!("https://www.facebook.com/{v}/dialog/oauth")),
                    token: Some(format!("https://graph.facebook.com/{v}/oauth/access_token")),
                    userinfo: Some(format!(
                        "https://graph.facebook.com/{v}/me?fields={}",
                        quirks.fields.join(",")
                    )),
                    jwks: None,
                }
            }
            Self::Twitter(quirks) => ResolvedEndpoints {
                issuer: None,
                authorization: Some("https://twitter.com/i/oauth2/authorize".to_string()),
                token: Some("https://api.twitter.com/2/oauth2/token".to_string()),
                userinfo: Some(format!(
                    "https://api.twitter.com/2/users/me?user.fields={}",
                    quirks.user_fields.join(",")
                )),
                jwks: None,
            },
            Self::Apple(_) => ResolvedEndpoints {
                issuer: Some("https://appleid.apple.com".to_string()),
                authorization: Some("https://appleid.apple.com/auth/authorize".to_string()),
                token: Some("https://appleid.apple.com/auth/token".to_string()),
                userinfo: None,
                jwks: Some("https://appleid.apple.com/auth/keys".to_string()),
            },
            Self::Oidc(_) | Self::OAuth2(_) => ResolvedEndpoints::default(),
        }
    }

    /// Token endpoint authentication style for this provider.
    #[must_use]
    pub fn token_endpoint_auth(&self) -> TokenEndpointAuth {
        match self {
            Self::Twitter(_) => TokenEndpointAuth::Basic,
            Self::Oidc(quirks) | Self::OAuth2(quirks) if quirks.use_basic_auth => {
                TokenEndpointAuth::Basic
            }
            _ => TokenEndpointAuth::Body,
        }
    }

    /// Well-known RFC 7009 revocation endpoint, for providers that publish
    /// one outside of discovery.
    #[must_use]
    pub fn known_revocation_endpoint(&self) -> Option<&'static str> {
        match self {
            Self::Google => Some("https://oauth2.googleapis.com/revoke"),
            Self::Twitter(_) => Some("https://api.twitter.com/2/oauth2/revoke"),
            _ => None,
        }
    }

    /// Returns `true` if the provider delivers the user payload in the
    /// callback form body instead of the token response (Apple does, once,
    /// on first authorization).
    #[must_use]
    pub fn user_payload_in_callback(&self) -> bool {
        matches!(self, Self::Apple(_))
    }

    /// Validates a provider configuration against this kind's quirks.
    ///
    /// Returns human-readable errors; an empty list means the
    /// configuration is acceptable.
    #[must_use]
    pub fn validate(&self, provider: &UpstreamProvider) -> Vec<String> {
        let mut errors = Vec::new();

        match self {
            Self::Google | Self::Microsoft(_) | Self::Oidc(_) => {
                if !provider.scopes.iter().any(|s| s == "openid") {
                    errors.push("OIDC providers require the 'openid' scope".to_string());
                }
            }
            _ => {}
        }

        match self {
            Self::Microsoft(quirks) => {
                if let MicrosoftTenant::Directory(id) = &quirks.tenant
                    && id.is_empty()
                {
                    errors.push("Microsoft tenant id must not be empty".to_string());
                }
            }
            Self::GitHub(quirks) => {
                if let Some(host) = &quirks.enterprise_host
                    && (host.is_empty() || host.contains('/') || host.contains("://"))
                {
                    errors.push(format!(
                        "GitHub enterprise host must be a bare hostname, got '{host}'"
                    ));
                }
            }
            Self::Facebook(quirks) => {
                if !quirks.graph_version.starts_with('v')
                    || !quirks.graph_version[1..]
                        .chars()
                        .all(|c| c.is_ascii_digit() || c == '.')
                {
                    errors.push(format!(
                        "Facebook graph version must look like 'v19.0', got '{}'",
                        quirks.graph_version
                    ));
                }
                for field in &quirks.fields {
                    if !field
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
                    {
                        errors.push(format!("Invalid Facebook field name '{field}'"));
                    }
                }
            }
            Self::Twitter(quirks) => {
                for field in &quirks.user_fields {
                    if !TWITTER_USER_FIELDS.contains(&field.as_str()) {
                        errors.push(format!("Unknown Twitter user field '{field}'"));
                    }
                }
            }
            Self::Apple(quirks) => {
                if quirks.team_id.len() != 10
                    || !quirks.team_id.chars().all(|c| c.is_ascii_alphanumeric())
                {
                    errors.push("Apple team id must be exactly 10 alphanumeric characters".into());
                }
                if quirks.key_id.len() != 10
                    || !quirks.key_id.chars().all(|c| c.is_ascii_alphanumeric())
                {
                    errors.push("Apple key id must be exactly 10 alphanumeric characters".into());
                }
            }
            Self::Oidc(_) => {
                if provider.issuer.is_none() {
                    errors.push("Generic OIDC providers require an issuer".to_string());
                }
            }
            Self::OAuth2(_) => {
                if provider.authorization_endpoint.is_none() || provider.token_endpoint.is_none() {
                    errors.push(
                        "Generic OAuth2 providers require authorization and token endpoints"
                            .to_string(),
                    );
                }
            }
            Self::Google => {}
        }

        errors
    }
}

/// Microsoft Entra quirks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrosoftQuirks {
    /// Which tenant segment the authority URL addresses.
    #[serde(default)]
    pub tenant: MicrosoftTenant,
}

/// Microsoft tenant segment of the authority URL.
///
/// The shared segments (`common`, `consumers`, `organizations`) are
/// multi-tenant: tokens carry the real per-tenant issuer, so issuer
/// equality must be replaced by pattern validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MicrosoftTenant {
    /// Any account, personal or organizational.
    Common,
    /// Personal Microsoft accounts only.
    Consumers,
    /// Work/school accounts from any directory.
    Organizations,
    /// One fixed directory (tenant GUID or verified domain).
    Directory(String),
}

impl Default for MicrosoftTenant {
    fn default() -> Self {
        Self::Common
    }
}

impl MicrosoftTenant {
    /// The URL path segment for this tenant.
    #[must_use]
    pub fn segment(&self) -> &str {
        match self {
            Self::Common => "common",
            Self::Consumers => "consumers",
            Self::Organizations => "organizations",
            Self::Directory(id) => id,
        }
    }

    /// Returns `true` for the shared segments whose tokens carry
    /// per-tenant issuers.
    #[must_use]
    pub fn is_multi_tenant(&self) -> bool {
        !matches!(self, Self::Directory(_))
    }
}

impl From<String> for MicrosoftTenant {
    fn from(value: String) -> Self {
        match value.as_str() {
            "common" => Self::Common,
            "consumers" => Self::Consumers,
            "organizations" => Self::Organizations,
            _ => Self::Directory(value),
        }
    }
}

impl From<MicrosoftTenant> for String {
    fn from(value: MicrosoftTenant) -> Self {
        value.segment().to_string()
    }
}

/// GitHub quirks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitHubQuirks {
    /// GitHub Enterprise Server hostname; `None` targets github.com.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_host: Option<String>,
}

impl GitHubQuirks {
    /// Web and API hostnames for this installation.
    ///
    /// github.com splits the API onto api.github.com; GitHub Enterprise
    /// serves it under `/api/v3` on the same host.
    #[must_use]
    pub fn hosts(&self) -> (String, String) {
        match &self.enterprise_host {
            Some(host) => (host.clone(), format!("{host}/api/v3")),
            None => ("github.com".to_string(), "api.github.com".to_string()),
        }
    }
}

/// Facebook quirks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacebookQuirks {
    /// Graph API version segment (e.g. `v19.0`).
    #[serde(default = "FacebookQuirks::default_graph_version")]
    pub graph_version: String,

    /// Fields requested from `/me`.
    #[serde(default = "FacebookQuirks::default_fields")]
    pub fields: Vec<String>,
}

impl Default for FacebookQuirks {
    fn default() -> Self {
        Self {
            graph_version: Self::default_graph_version(),
            fields: Self::default_fields(),
        }
    }
}

impl FacebookQuirks {
    fn default_graph_version() -> String {
        "v19.0".to_string()
    }

    fn default_fields() -> Vec<String> {
        ["id", "name", "email", "first_name", "last_name", "picture"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

/// Twitter/X quirks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitterQuirks {
    /// `user.fields` requested from `/2/users/me`.
    #[serde(default = "TwitterQuirks::default_user_fields")]
    pub user_fields: Vec<String>,
}

impl Default for TwitterQuirks {
    fn default() -> Self {
        Self {
            user_fields: Self::default_user_fields(),
        }
    }
}

impl TwitterQuirks {
    fn default_user_fields() -> Vec<String> {
        ["id", "name", "username", "profile_image_url"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

/// Sign in with Apple quirks.
///
/// Apple has no static client secret; one is synthesized per token request
/// from this key material (see [`crate::rp::apple`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppleQuirks {
    /// Apple Developer team id (10 characters).
    pub team_id: String,

    /// Key id of the Sign in with Apple key (10 characters).
    pub key_id: String,

    /// Encrypted ES256 private key in PEM form.
    pub private_key: SealedSecret,
}

/// Quirks for generic OIDC/OAuth2 providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenericQuirks {
    /// Authenticate at the token endpoint with HTTP Basic instead of
    /// body credentials.
    #[serde(default)]
    pub use_basic_auth: bool,
}
