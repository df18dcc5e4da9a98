//! Normalized upstream identity claims.
//!
//! Providers disagree about where identity lives: ID-token claims, a
//! userinfo document, a `data` envelope, a one-time callback payload.
//! [`UserInfo`] is the single shape the rest of the engine consumes,
//! produced by [`normalize`] from raw claims JSON plus the provider's
//! attribute mapping.

use serde_json::Value;

use super::RpError;
use crate::provider::AttributeMapping;

/// Normalized claim set for an authenticated upstream identity.
///
/// `sub` is always a non-empty string after normalization, even when the
/// provider used a different identifier field or a numeric id. All raw
/// provider claims are retained in `claims`.
#[derive(Debug, Clone)]
pub struct UserInfo {
    /// Upstream subject identifier.
    pub sub: String,

    /// Email address.
    pub email: Option<String>,

    /// Whether the provider reported the email as verified.
    pub email_verified: Option<bool>,

    /// Full display name.
    pub name: Option<String>,

    /// Given name.
    pub given_name: Option<String>,

    /// Family name.
    pub family_name: Option<String>,

    /// Profile picture URL.
    pub picture: Option<String>,

    /// Locale.
    pub locale: Option<String>,

    /// When the end user authenticated at the provider (Unix timestamp).
    pub auth_time: Option<i64>,

    /// Authentication context class reference.
    pub acr: Option<String>,

    /// Authentication method references.
    pub amr: Option<Vec<String>>,

    /// All raw provider claims.
    pub claims: Value,
}

impl UserInfo {
    /// Returns `true` if the provider reported a verified email.
    #[must_use]
    pub fn has_verified_email(&self) -> bool {
        self.email.is_some() && self.email_verified == Some(true)
    }

    /// Fills fields this instance is missing from another claim source.
    ///
    /// Existing values win: ID-token claims take precedence over a later
    /// userinfo fetch. Raw claim objects are merged the same way.
    pub fn merge_missing(&mut self, other: UserInfo) {
        if self.email.is_none() {
            self.email = other.email;
            self.email_verified = other.email_verified;
        }
        self.name = self.name.take().or(other.name);
        self.given_name = self.given_name.take().or(other.given_name);
        self.family_name = self.family_name.take().or(other.family_name);
        self.picture = self.picture.take().or(other.picture);
        self.locale = self.locale.take().or(other.locale);
        self.auth_time = self.auth_time.take().or(other.auth_time);
        self.acr = self.acr.take().or(other.acr);
        self.amr = self.amr.take().or(other.amr);

        if let (Value::Object(ours), Value::Object(theirs)) = (&mut self.claims, other.claims) {
            for (k, v) in theirs {
                ours.entry(k).or_insert(v);
            }
        }
    }

    /// Applies Apple's one-time callback `user` payload.
    ///
    /// Apple delivers `{"name": {"firstName", "lastName"}, "email"}` in the
    /// callback form body on first authorization only; it never appears in
    /// the ID token afterwards.
    pub fn apply_apple_user_payload(&mut self, payload: &Value) {
        if let Some(email) = payload.get("email").and_then(Value::as_str)
            && self.email.is_none()
        {
            self.email = Some(email.to_string());
        }
        if let Some(name) = payload.get("name") {
            let first = name.get("firstName").and_then(Value::as_str);
            let last = name.get("lastName").and_then(Value::as_str);
            if self.given_name.is_none() {
                self.given_name = first.map(ToString::to_string);
            }
            if self.family_name.is_none() {
                self.family_name = last.map(ToString::to_string);
            }
            if self.name.is_none() {
                let full: Vec<&str> = [first, last].into_iter().flatten().collect();
                if !full.is_empty() {
                    self.name = Some(full.join(" "));
                }
            }
        }
    }
}

/// Normalizes raw provider claims through an attribute mapping.
///
/// # Errors
///
/// Returns `MissingClaim("sub")` when no non-empty subject can be
/// resolved.
pub fn normalize(raw: &Value, mapping: &AttributeMapping) -> Result<UserInfo, RpError> {
    let sub = mapped_string(raw, mapping, "sub")
        .filter(|s| !s.is_empty())
        .ok_or(RpError::MissingClaim("sub"))?;

    Ok(UserInfo {
        sub,
        email: mapped_string(raw, mapping, "email"),
        email_verified: mapped_bool(raw, mapping, "email_verified"),
        name: mapped_string(raw, mapping, "name"),
        given_name: mapped_string(raw, mapping, "given_name"),
        family_name: mapped_string(raw, mapping, "family_name"),
        picture: mapped_string(raw, mapping, "picture"),
        locale: mapped_string(raw, mapping, "locale"),
        auth_time: raw.get("auth_time").and_then(Value::as_i64),
        acr: raw.get("acr").and_then(Value::as_str).map(ToString::to_string),
        amr: raw.get("amr").and_then(Value::as_array).map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        }),
        claims: raw.clone(),
    })
}

/// Looks a mapped claim up and coerces it to a string.
///
/// Numeric values stringify (GitHub and Twitter ids are numbers).
fn mapped_string(raw: &Value, mapping: &AttributeMapping, target: &str) -> Option<String> {
    let value = mapping
        .lookup(raw, target)
        .or_else(|| raw.get(target))?;
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Looks a mapped claim up and coerces it to a bool.
///
/// Some providers deliver `email_verified` as the string `"true"`.
fn mapped_bool(raw: &Value, mapping: &AttributeMapping, target: &str) -> Option<bool> {
    let value = mapping
        .lookup(raw, target)
        .or_else(|| raw.get(target))?;
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
