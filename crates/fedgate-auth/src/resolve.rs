//! Identity resolution: stitching and JIT provisioning.
//!
//! Given a validated upstream identity, [`IdentityResolver::resolve`]
//! decides which local account the user becomes. Branches evaluate in
//! order and short-circuit:
//!
//! 1. **Explicit linking** - an authenticated user is adding a provider
//! 2. **Already linked** - the upstream identity has a local user
//! 3. **Email stitching** - auto-link to a local account matched by email
//! 4. **JIT provisioning** - create a user under policy control
//! 5. Otherwise a typed denial
//!
//! JIT provisioning performs multiple non-transactional writes
//! (create user → evaluate policy → join orgs → assign roles). Progress is
//! tracked as an explicit stage; a failure at any stage triggers
//! compensating rollback that deletes what was created. Rollback itself
//! tolerates failure: it logs and never propagates.

use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::audit::{AuditEntry, AuditSink, record_best_effort};
use crate::config::FederationConfig;
use crate::crypto::{CryptoError, SecretCipher};
use crate::provider::UpstreamProvider;
use crate::rp::{TokenResponse, UserInfo};
use crate::storage::identity::StoredTokens;
use crate::storage::{
    LinkedIdentity, LinkedIdentityStorage, LocalUser, PolicyContext, PolicyService, StorageError,
    UserStorage,
};

/// Typed, user-facing-safe denial codes.
///
/// These are expected business outcomes, not bugs; their string forms are
/// the only resolution detail that may appear in redirect URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyCode {
    /// The upstream email is not verified but the provider requires it.
    EmailNotVerified,
    /// A local account with this email exists but its email is unverified.
    LocalEmailNotVerified,
    /// A local account exists; the user must log in and link manually.
    AccountExistsLinkRequired,
    /// JIT provisioning is not available for this provider or tenant.
    JitProvisioningDisabled,
    /// Policy requires additional interaction before provisioning.
    PolicyInteractionRequired,
    /// Policy requires an existing login before provisioning.
    PolicyLoginRequired,
    /// Policy denied provisioning.
    PolicyAccessDenied,
    /// No organization resolved and standalone users are disallowed.
    AccessDenied,
}

impl DenyCode {
    /// The wire form of this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            Self::LocalEmailNotVerified => "LOCAL_EMAIL_NOT_VERIFIED",
            Self::AccountExistsLinkRequired => "ACCOUNT_EXISTS_LINK_REQUIRED",
            Self::JitProvisioningDisabled => "JIT_PROVISIONING_DISABLED",
            Self::PolicyInteractionRequired => "POLICY_INTERACTION_REQUIRED",
            Self::PolicyLoginRequired => "POLICY_LOGIN_REQUIRED",
            Self::PolicyAccessDenied => "POLICY_ACCESS_DENIED",
            Self::AccessDenied => "access_denied",
        }
    }

    /// Maps a policy engine deny code onto the resolution taxonomy.
    #[must_use]
    pub fn from_policy_code(code: Option<&str>) -> Self {
        match code {
            Some("interaction_required") => Self::PolicyInteractionRequired,
            Some("login_required") => Self::PolicyLoginRequired,
            _ => Self::PolicyAccessDenied,
        }
    }
}

impl std::fmt::Display for DenyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed resolution denial.
#[derive(Debug, Clone)]
pub struct Denial {
    /// The deny code.
    pub code: DenyCode,
    /// Safe, human-readable description.
    pub description: String,
}

impl Denial {
    /// Creates a denial.
    #[must_use]
    pub fn new(code: DenyCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

/// Errors produced by identity resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Resolution produced a typed denial.
    #[error("{0}")]
    Denied(Denial),

    /// A storage or external service operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Sealing or unsealing tokens failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ResolveError {
    fn deny(code: DenyCode, description: impl Into<String>) -> Self {
        Self::Denied(Denial::new(code, description))
    }
}

/// How the resolved login presents to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionAction {
    /// Normal login into an existing account.
    SignedIn,
    /// A provider was linked (explicitly or by stitching).
    Linked,
    /// A new account was provisioned.
    Registered,
}

impl ResolutionAction {
    /// The `external_auth` redirect parameter value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignedIn => "success",
            Self::Linked => "linked",
            Self::Registered => "registered",
        }
    }
}

/// A successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The local user the login resolves to.
    pub user_id: String,

    /// Whether the user was created by this resolution.
    pub is_new_user: bool,

    /// The linked identity backing the login.
    pub linked_identity_id: String,

    /// Whether an existing account was auto-linked by email.
    pub stitched_from_existing: bool,

    /// How the login presents to the caller.
    pub action: ResolutionAction,

    /// Roles assigned during provisioning.
    pub roles_assigned: Vec<String>,

    /// Organizations joined during provisioning.
    pub orgs_joined: Vec<String>,

    /// Attributes set during provisioning.
    pub attributes_set: serde_json::Map<String, Value>,

    /// Policy rules that matched during provisioning.
    pub matched_rules: Vec<String>,
}

impl Resolution {
    fn existing(user_id: impl Into<String>, identity_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_new_user: false,
            linked_identity_id: identity_id.into(),
            stitched_from_existing: false,
            action: ResolutionAction::SignedIn,
            roles_assigned: Vec::new(),
            orgs_joined: Vec::new(),
            attributes_set: serde_json::Map::new(),
            matched_rules: Vec::new(),
        }
    }
}

/// Progress through the JIT provisioning write sequence.
///
/// A failure at any stage rolls everything back; dependent rows
/// (memberships, role grants) are removed with the user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JitStage {
    UserCreated,
    PolicyChecked,
    OrgsJoined,
    RolesAssigned,
}

/// The identity resolution engine.
pub struct IdentityResolver {
    users: Arc<dyn UserStorage>,
    identities: Arc<dyn LinkedIdentityStorage>,
    policy: Arc<dyn PolicyService>,
    audit: Arc<dyn AuditSink>,
    cipher: Arc<dyn SecretCipher>,
    config: FederationConfig,
}

impl IdentityResolver {
    /// Creates a resolver over the given backends.
    #[must_use]
    pub fn new(
        users: Arc<dyn UserStorage>,
        identities: Arc<dyn LinkedIdentityStorage>,
        policy: Arc<dyn PolicyService>,
        audit: Arc<dyn AuditSink>,
        cipher: Arc<dyn SecretCipher>,
        config: FederationConfig,
    ) -> Self {
        Self {
            users,
            identities,
            policy,
            audit,
            cipher,
            config,
        }
    }

    /// Resolves a validated upstream identity to a local account.
    ///
    /// # Errors
    ///
    /// Returns `Denied` for typed business denials, or an error when a
    /// backend fails.
    pub async fn resolve(
        &self,
        provider: &UpstreamProvider,
        user_info: &UserInfo,
        tokens: &TokenResponse,
        linking_user_id: Option<&str>,
        tenant_id: &str,
    ) -> Result<Resolution, ResolveError> {
        // 1. Explicit linking
        if let Some(linking_user) = linking_user_id {
            return self.link(provider, user_info, tokens, linking_user, tenant_id).await;
        }

        // 2. Already linked: refresh tokens, never re-run provisioning
        if let Some(existing) = self
            .identities
            .find_by_provider_subject(&provider.id, &user_info.sub)
            .await?
        {
            let sealed = self.seal_tokens(tokens)?;
            self.identities.update_tokens(&existing.id, &sealed).await?;
            record_best_effort(
                self.audit.as_ref(),
                AuditEntry::new(tenant_id, "external.login", "linked_identity", &existing.id)
                    .with_user(&existing.user_id)
                    .with_metadata(serde_json::json!({ "provider": provider.slug })),
            )
            .await;
            return Ok(Resolution::existing(existing.user_id, existing.id));
        }

        // 3. Email stitching
        if let Some(email) = &user_info.email
            && let Some(local) = self.users.find_by_email(email, tenant_id).await?
        {
            return self.stitch(provider, user_info, tokens, &local, tenant_id).await;
        }

        // 4. JIT provisioning / 5. disabled
        if provider.jit_provisioning {
            return self.provision(provider, user_info, tokens, tenant_id).await;
        }

        Err(ResolveError::deny(
            DenyCode::JitProvisioningDisabled,
            "no local account exists and this provider does not provision users",
        ))
    }

    /// Branch 1: explicit linking for an authenticated user.
    async fn link(
        &self,
        provider: &UpstreamProvider,
        user_info: &UserInfo,
        tokens: &TokenResponse,
        linking_user: &str,
        tenant_id: &str,
    ) -> Result<Resolution, ResolveError> {
        if self.requires_verified_email(provider) && !user_info.has_verified_email() {
            return Err(ResolveError::deny(
                DenyCode::EmailNotVerified,
                "the provider account's email is not verified",
            ));
        }

        // An upstream identity already linked elsewhere is never silently
        // re-homed.
        if let Some(existing) = self
            .identities
            .find_by_provider_subject(&provider.id, &user_info.sub)
            .await?
        {
            if existing.user_id != linking_user {
                return Err(ResolveError::deny(
                    DenyCode::AccountExistsLinkRequired,
                    "this provider account is already linked to another user",
                ));
            }
            let sealed = self.seal_tokens(tokens)?;
            self.identities.update_tokens(&existing.id, &sealed).await?;
            let mut resolution = Resolution::existing(existing.user_id, existing.id);
            resolution.action = ResolutionAction::Linked;
            return Ok(resolution);
        }

        let identity = self
            .new_identity(provider, user_info, tokens, linking_user)?;
        self.identities.create(&identity).await?;

        record_best_effort(
            self.audit.as_ref(),
            AuditEntry::new(tenant_id, "external.identity.linked", "linked_identity", &identity.id)
                .with_user(linking_user)
                .with_metadata(serde_json::json!({ "provider": provider.slug })),
        )
        .await;

        let mut resolution = Resolution::existing(linking_user, identity.id);
        resolution.action = ResolutionAction::Linked;
        Ok(resolution)
    }

    /// Branch 3: auto-link to a local account matched by email.
    async fn stitch(
        &self,
        provider: &UpstreamProvider,
        user_info: &UserInfo,
        tokens: &TokenResponse,
        local: &LocalUser,
        tenant_id: &str,
    ) -> Result<Resolution, ResolveError> {
        if !local.email_verified {
            return Err(ResolveError::deny(
                DenyCode::LocalEmailNotVerified,
                "a local account with this email exists but its email is not verified",
            ));
        }

        let can_stitch = self.config.stitching_enabled
            && provider.auto_link_email
            && user_info.email_verified == Some(true);
        if !can_stitch {
            return Err(ResolveError::deny(
                DenyCode::AccountExistsLinkRequired,
                "an account with this email exists; log in and link the provider manually",
            ));
        }

        let identity = self.new_identity(provider, user_info, tokens, &local.id)?;
        self.identities.create(&identity).await?;

        record_best_effort(
            self.audit.as_ref(),
            AuditEntry::new(
                tenant_id,
                "external.identity.stitched",
                "linked_identity",
                &identity.id,
            )
            .with_user(&local.id)
            .with_metadata(serde_json::json!({ "provider": provider.slug })),
        )
        .await;

        let mut resolution = Resolution::existing(&local.id, identity.id);
        resolution.stitched_from_existing = true;
        Ok(resolution)
    }

    /// Branch 4: JIT provisioning under policy control.
    async fn provision(
        &self,
        provider: &UpstreamProvider,
        user_info: &UserInfo,
        tokens: &TokenResponse,
        tenant_id: &str,
    ) -> Result<Resolution, ResolveError> {
        let verified = user_info.has_verified_email();
        if self.requires_verified_email(provider) && !verified {
            return Err(ResolveError::deny(
                DenyCode::EmailNotVerified,
                "the provider account's email is not verified",
            ));
        }
        if !self.config.jit.enabled {
            return Err(ResolveError::deny(
                DenyCode::JitProvisioningDisabled,
                "just-in-time provisioning is disabled",
            ));
        }
        if !self.config.jit.provider_allowed(&provider.slug) {
            return Err(ResolveError::deny(
                DenyCode::JitProvisioningDisabled,
                "this provider is not allowed to provision users",
            ));
        }
        if self.config.jit.require_verified_email && !verified {
            return Err(ResolveError::deny(
                DenyCode::EmailNotVerified,
                "provisioning requires a verified email",
            ));
        }

        let mut user = LocalUser::new(tenant_id);
        if let Some(email) = &user_info.email {
            user = user.with_email(email, verified);
        }
        if let Some(name) = &user_info.name {
            user = user.with_name(name);
        }
        self.users.create(&user).await?;
        let mut stage = JitStage::UserCreated;

        let domain_hash = user_info.email.as_deref().and_then(email_domain_hash);
        let context = PolicyContext {
            email_domain_hash: domain_hash.clone(),
            email_verified: verified,
            claims: user_info.claims.clone(),
            provider_id: provider.id.clone(),
            tenant_id: tenant_id.to_string(),
        };

        let decision = match self.policy.evaluate(&context).await {
            Ok(decision) => decision,
            Err(err) => {
                self.rollback(&user.id, stage, tenant_id, "policy evaluation failed").await;
                return Err(err.into());
            }
        };

        if decision.denied {
            self.rollback(&user.id, stage, tenant_id, "policy denied").await;
            return Err(ResolveError::deny(
                DenyCode::from_policy_code(decision.deny_code.as_deref()),
                "provisioning policy denied this login",
            ));
        }
        stage = JitStage::PolicyChecked;

        // Organization resolution: explicit rule output first, then the
        // domain-hash mapping. With join_all off, the first organization in
        // rule order wins; the mapping is only consulted when rules
        // produced none.
        let mapped_orgs = match &domain_hash {
            Some(hash) => match self.policy.resolve_orgs_by_domain_hash(hash, tenant_id).await {
                Ok(orgs) => orgs,
                Err(err) => {
                    self.rollback(&user.id, stage, tenant_id, "org resolution failed").await;
                    return Err(err.into());
                }
            },
            None => Vec::new(),
        };

        let orgs_to_join: Vec<String> = if self.config.jit.join_all_matching_orgs {
            let mut orgs = decision.orgs_to_join.clone();
            for org in mapped_orgs {
                if !orgs.contains(&org) {
                    orgs.push(org);
                }
            }
            orgs
        } else {
            decision
                .orgs_to_join
                .first()
                .or_else(|| mapped_orgs.first())
                .cloned()
                .into_iter()
                .collect()
        };

        if orgs_to_join.is_empty() && !self.config.jit.allow_standalone_users {
            self.rollback(&user.id, stage, tenant_id, "no organization resolved").await;
            return Err(ResolveError::deny(
                DenyCode::AccessDenied,
                "no organization could be resolved for this account",
            ));
        }

        for org in &orgs_to_join {
            if let Err(err) = self
                .policy
                .join_organization(&user.id, org, tenant_id, "member")
                .await
            {
                self.rollback(&user.id, stage, tenant_id, "organization join failed").await;
                return Err(err.into());
            }
        }
        stage = JitStage::OrgsJoined;

        let mut roles_assigned = Vec::new();
        for role in &decision.roles_to_assign {
            let (scope_type, scope_target) = if role.scope_target == "auto" {
                match orgs_to_join.first() {
                    Some(org) => ("organization".to_string(), org.clone()),
                    None => ("tenant".to_string(), tenant_id.to_string()),
                }
            } else {
                (role.scope_type.clone(), role.scope_target.clone())
            };
            if let Err(err) = self
                .policy
                .assign_role(&user.id, &role.role_id, &scope_type, &scope_target, tenant_id)
                .await
            {
                self.rollback(&user.id, stage, tenant_id, "role assignment failed").await;
                return Err(err.into());
            }
            roles_assigned.push(role.role_id.clone());
        }

        if roles_assigned.is_empty()
            && let Some(default_role) = &self.config.jit.default_role
        {
            if let Err(err) = self
                .policy
                .assign_role(&user.id, default_role, "tenant", tenant_id, tenant_id)
                .await
            {
                self.rollback(&user.id, stage, tenant_id, "default role assignment failed").await;
                return Err(err.into());
            }
            roles_assigned.push(default_role.clone());
        }
        stage = JitStage::RolesAssigned;

        if !decision.attributes_to_set.is_empty()
            && let Err(err) = self
                .users
                .set_attributes(&user.id, &decision.attributes_to_set)
                .await
        {
            self.rollback(&user.id, stage, tenant_id, "attribute update failed").await;
            return Err(err.into());
        }

        let identity = self.new_identity(provider, user_info, tokens, &user.id)?;
        if let Err(err) = self.identities.create(&identity).await {
            self.rollback(&user.id, stage, tenant_id, "identity creation failed").await;
            return Err(err.into());
        }

        record_best_effort(
            self.audit.as_ref(),
            AuditEntry::new(tenant_id, "external.user.jit_provisioned", "user", &user.id)
                .with_user(&user.id)
                .with_metadata(serde_json::json!({
                    "provider": provider.slug,
                    "orgs_joined": orgs_to_join,
                    "roles_assigned": roles_assigned,
                    "matched_rules": decision.matched_rules,
                })),
        )
        .await;

        Ok(Resolution {
            user_id: user.id,
            is_new_user: true,
            linked_identity_id: identity.id,
            stitched_from_existing: false,
            action: ResolutionAction::Registered,
            roles_assigned,
            orgs_joined: orgs_to_join,
            attributes_set: decision.attributes_to_set,
            matched_rules: decision.matched_rules,
        })
    }

    /// Compensating rollback for a failed provisioning attempt.
    ///
    /// Deletes the just-created user; membership and role rows are removed
    /// with it. Rollback failures are logged and never propagated.
    async fn rollback(&self, user_id: &str, stage: JitStage, tenant_id: &str, reason: &str) {
        tracing::warn!(user_id, ?stage, reason, "Rolling back JIT provisioning");

        if let Err(err) = self.users.delete(user_id).await {
            tracing::warn!(user_id, error = %err, "Provisioning rollback failed to delete user");
        }

        record_best_effort(
            self.audit.as_ref(),
            AuditEntry::new(tenant_id, "external.user.jit_rolled_back", "user", user_id)
                .with_metadata(serde_json::json!({ "reason": reason })),
        )
        .await;
    }

    /// Whether this provider's logins require a verified upstream email.
    fn requires_verified_email(&self, provider: &UpstreamProvider) -> bool {
        self.config.require_email_verified || provider.require_email_verified
    }

    /// Builds a linked identity carrying sealed tokens.
    fn new_identity(
        &self,
        provider: &UpstreamProvider,
        user_info: &UserInfo,
        tokens: &TokenResponse,
        user_id: &str,
    ) -> Result<LinkedIdentity, CryptoError> {
        let sealed = self.seal_tokens(tokens)?;
        let mut identity = LinkedIdentity::new(user_id, &provider.id, &user_info.sub);
        if let Some(email) = &user_info.email {
            identity = identity.with_email(email, user_info.email_verified == Some(true));
        }
        identity.access_token = sealed.access_token;
        identity.refresh_token = sealed.refresh_token;
        identity.id_token = sealed.id_token;
        identity.token_expires_at = sealed.expires_at;
        Ok(identity)
    }

    /// Encrypts upstream tokens for storage.
    fn seal_tokens(&self, tokens: &TokenResponse) -> Result<StoredTokens, CryptoError> {
        Ok(StoredTokens {
            access_token: Some(self.cipher.encrypt(&tokens.access_token)?),
            refresh_token: tokens
                .refresh_token
                .as_deref()
                .map(|t| self.cipher.encrypt(t))
                .transpose()?,
            id_token: tokens
                .id_token
                .as_deref()
                .map(|t| self.cipher.encrypt(t))
                .transpose()?,
            expires_at: tokens
                .expires_in
                .map(|secs| OffsetDateTime::now_utc() + std::time::Duration::from_secs(secs)),
        })
    }
}

/// Hex SHA-256 of the lowercased email domain, the only email derivative
/// the policy engine sees.
#[must_use]
pub fn email_domain_hash(email: &str) -> Option<String> {
    let domain = email.rsplit_once('@')?.1;
    if domain.is_empty() {
        return None;
    }
    let digest = Sha256::digest(domain.to_ascii_lowercase().as_bytes());
    Some(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditError;
    use crate::config::JitConfig;
    use crate::crypto::SealedSecret;
    use crate::quirks::ProviderKind;
    use crate::storage::services::{PolicyDecision, RoleAssignment};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MemUsers {
        rows: Mutex<HashMap<String, LocalUser>>,
    }

    #[async_trait]
    impl UserStorage for MemUsers {
        async fn find_by_id(&self, user_id: &str) -> Result<Option<LocalUser>, StorageError> {
            Ok(self.rows.lock().unwrap().get(user_id).cloned())
        }

        async fn find_by_email(
            &self,
            email: &str,
            tenant_id: &str,
        ) -> Result<Option<LocalUser>, StorageError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .find(|u| u.tenant_id == tenant_id && u.email.as_deref() == Some(email))
                .cloned())
        }

        async fn create(&self, user: &LocalUser) -> Result<(), StorageError> {
            self.rows
                .lock()
                .unwrap()
                .insert(user.id.clone(), user.clone());
            Ok(())
        }

        async fn delete(&self, user_id: &str) -> Result<(), StorageError> {
            self.rows.lock().unwrap().remove(user_id);
            Ok(())
        }

        async fn set_attributes(
            &self,
            user_id: &str,
            attributes: &serde_json::Map<String, Value>,
        ) -> Result<(), StorageError> {
            if let Some(user) = self.rows.lock().unwrap().get_mut(user_id) {
                user.attributes.extend(attributes.clone());
            }
            Ok(())
        }

        async fn has_alternative_login(
            &self,
            _user_id: &str,
            _excluding_identity_id: &str,
        ) -> Result<bool, StorageError> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct MemIdentities {
        rows: Mutex<HashMap<String, LinkedIdentity>>,
    }

    #[async_trait]
    impl LinkedIdentityStorage for MemIdentities {
        async fn find_by_id(&self, id: &str) -> Result<Option<LinkedIdentity>, StorageError> {
            Ok(self.rows.lock().unwrap().get(id).cloned())
        }

        async fn find_by_provider_subject(
            &self,
            provider_id: &str,
            provider_user_id: &str,
        ) -> Result<Option<LinkedIdentity>, StorageError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .find(|i| i.matches(provider_id, provider_user_id))
                .cloned())
        }

        async fn find_by_user(&self, user_id: &str) -> Result<Vec<LinkedIdentity>, StorageError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|i| i.user_id == user_id)
                .cloned()
                .collect())
        }

        async fn create(&self, identity: &LinkedIdentity) -> Result<(), StorageError> {
            self.rows
                .lock()
                .unwrap()
                .insert(identity.id.clone(), identity.clone());
            Ok(())
        }

        async fn update_tokens(
            &self,
            id: &str,
            tokens: &StoredTokens,
        ) -> Result<(), StorageError> {
            if let Some(identity) = self.rows.lock().unwrap().get_mut(id) {
                identity.access_token = tokens.access_token.clone();
                identity.refresh_token = tokens.refresh_token.clone();
                identity.last_login_at = OffsetDateTime::now_utc();
            }
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<(), StorageError> {
            self.rows.lock().unwrap().remove(id);
            Ok(())
        }

        async fn list_expiring(
            &self,
            _cutoff: OffsetDateTime,
        ) -> Result<Vec<LinkedIdentity>, StorageError> {
            Ok(Vec::new())
        }
    }

    /// Policy double returning a scripted decision and recording writes.
    struct ScriptedPolicy {
        decision: PolicyDecision,
        domain_orgs: Vec<String>,
        joins: Mutex<Vec<String>>,
        grants: Mutex<Vec<String>>,
    }

    impl ScriptedPolicy {
        fn allowing() -> Self {
            Self {
                decision: PolicyDecision::default(),
                domain_orgs: Vec::new(),
                joins: Mutex::new(Vec::new()),
                grants: Mutex::new(Vec::new()),
            }
        }

        fn denying(code: &str) -> Self {
            let mut policy = Self::allowing();
            policy.decision.denied = true;
            policy.decision.deny_code = Some(code.to_string());
            policy
        }
    }

    #[async_trait]
    impl PolicyService for ScriptedPolicy {
        async fn evaluate(&self, _context: &PolicyContext) -> Result<PolicyDecision, StorageError> {
            Ok(self.decision.clone())
        }

        async fn join_organization(
            &self,
            _user_id: &str,
            org_id: &str,
            _tenant_id: &str,
            _membership_type: &str,
        ) -> Result<(), StorageError> {
            self.joins.lock().unwrap().push(org_id.to_string());
            Ok(())
        }

        async fn assign_role(
            &self,
            _user_id: &str,
            role_id: &str,
            scope_type: &str,
            scope_target: &str,
            _tenant_id: &str,
        ) -> Result<(), StorageError> {
            self.grants
                .lock()
                .unwrap()
                .push(format!("{role_id}@{scope_type}:{scope_target}"));
            Ok(())
        }

        async fn resolve_orgs_by_domain_hash(
            &self,
            _domain_hash: &str,
            _tenant_id: &str,
        ) -> Result<Vec<String>, StorageError> {
            Ok(self.domain_orgs.clone())
        }
    }

    struct NullAudit;

    #[async_trait]
    impl AuditSink for NullAudit {
        async fn record(&self, _entry: AuditEntry) -> Result<(), AuditError> {
            Ok(())
        }
    }

    /// Reversible test cipher: tags plaintext instead of encrypting.
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

    // ------------------------------------------------------------------
    // Fixture
    // ------------------------------------------------------------------

    struct Fixture {
        users: Arc<MemUsers>,
        identities: Arc<MemIdentities>,
        policy: Arc<ScriptedPolicy>,
        resolver: IdentityResolver,
    }

    fn fixture(config: FederationConfig, policy: ScriptedPolicy) -> Fixture {
        let users = Arc::new(MemUsers::default());
        let identities = Arc::new(MemIdentities::default());
        let policy = Arc::new(policy);
        let resolver = IdentityResolver::new(
            users.clone(),
            identities.clone(),
            policy.clone(),
            Arc::new(NullAudit),
            Arc::new(TagCipher),
            config,
        );
        Fixture {
            users,
            identities,
            policy,
            resolver,
        }
    }

    fn provider() -> UpstreamProvider {
        UpstreamProvider::new("p-1", "google", "t-1", ProviderKind::Google, "client-id")
    }

    fn user_info(email: Option<&str>, verified: bool) -> UserInfo {
        let raw = serde_json::json!({
            "sub": "upstream-1",
            "email": email,
            "email_verified": verified,
            "name": "Upstream User"
        });
        crate::rp::user_info::normalize(&raw, &crate::provider::AttributeMapping::standard_oidc())
            .unwrap()
    }

    fn tokens() -> TokenResponse {
        serde_json::from_value(serde_json::json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "expires_in": 3600
        }))
        .unwrap()
    }

    fn deny_code(err: ResolveError) -> DenyCode {
        match err {
            ResolveError::Denied(denial) => denial.code,
            other => panic!("expected denial, got {other:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Branch 2: already linked
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_already_linked_returns_same_user() {
        let f = fixture(FederationConfig::default(), ScriptedPolicy::allowing());

        let identity = LinkedIdentity::new("u-1", "p-1", "upstream-1");
        f.identities.create(&identity).await.unwrap();

        let resolution = f
            .resolver
            .resolve(&provider(), &user_info(None, false), &tokens(), None, "t-1")
            .await
            .unwrap();

        assert_eq!(resolution.user_id, "u-1");
        assert!(!resolution.is_new_user);
        assert!(!resolution.stitched_from_existing);
        assert_eq!(resolution.action, ResolutionAction::SignedIn);

        // Tokens were refreshed in place
        let stored = f.identities.find_by_id(&identity.id).await.unwrap().unwrap();
        assert_eq!(
            stored.access_token.unwrap().ciphertext(),
            "sealed:at-1"
        );
    }

    // ------------------------------------------------------------------
    // Branch 1: explicit linking
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_explicit_link_creates_identity() {
        let f = fixture(FederationConfig::default(), ScriptedPolicy::allowing());

        let resolution = f
            .resolver
            .resolve(
                &provider(),
                &user_info(Some("u@example.com"), true),
                &tokens(),
                Some("u-9"),
                "t-1",
            )
            .await
            .unwrap();

        assert_eq!(resolution.user_id, "u-9");
        assert_eq!(resolution.action, ResolutionAction::Linked);
        let links = f.identities.find_by_user("u-9").await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].provider_user_id, "upstream-1");
    }

    #[tokio::test]
    async fn test_explicit_link_requires_verified_email_when_provider_demands() {
        let f = fixture(FederationConfig::default(), ScriptedPolicy::allowing());
        let provider = provider().with_require_email_verified(true);

        let err = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("u@example.com"), false),
                &tokens(),
                Some("u-9"),
                "t-1",
            )
            .await
            .unwrap_err();
        assert_eq!(deny_code(err), DenyCode::EmailNotVerified);
    }

    #[tokio::test]
    async fn test_explicit_link_rejects_identity_owned_by_other_user() {
        let f = fixture(FederationConfig::default(), ScriptedPolicy::allowing());
        f.identities
            .create(&LinkedIdentity::new("someone-else", "p-1", "upstream-1"))
            .await
            .unwrap();

        let err = f
            .resolver
            .resolve(
                &provider(),
                &user_info(Some("u@example.com"), true),
                &tokens(),
                Some("u-9"),
                "t-1",
            )
            .await
            .unwrap_err();
        assert_eq!(deny_code(err), DenyCode::AccountExistsLinkRequired);
    }

    // ------------------------------------------------------------------
    // Branch 3: email stitching
    // ------------------------------------------------------------------

    fn stitching_config() -> FederationConfig {
        FederationConfig::default().with_stitching_enabled(true)
    }

    #[tokio::test]
    async fn test_stitching_links_verified_emails() {
        let f = fixture(stitching_config(), ScriptedPolicy::allowing());
        let local = LocalUser::new("t-1").with_email("u@example.com", true);
        f.users.create(&local).await.unwrap();

        let provider = provider().with_auto_link_email(true);
        let resolution = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("u@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap();

        assert!(resolution.stitched_from_existing);
        assert_eq!(resolution.user_id, local.id);
        assert!(!resolution.is_new_user);
    }

    #[tokio::test]
    async fn test_stitching_denies_unverified_local_email() {
        let f = fixture(stitching_config(), ScriptedPolicy::allowing());
        let local = LocalUser::new("t-1").with_email("u@example.com", false);
        f.users.create(&local).await.unwrap();

        let provider = provider().with_auto_link_email(true);
        let err = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("u@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap_err();
        assert_eq!(deny_code(err), DenyCode::LocalEmailNotVerified);
    }

    #[tokio::test]
    async fn test_stitching_requires_provider_auto_link_flag() {
        let f = fixture(stitching_config(), ScriptedPolicy::allowing());
        let local = LocalUser::new("t-1").with_email("u@example.com", true);
        f.users.create(&local).await.unwrap();

        // auto_link_email stays false
        let err = f
            .resolver
            .resolve(
                &provider(),
                &user_info(Some("u@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap_err();
        assert_eq!(deny_code(err), DenyCode::AccountExistsLinkRequired);
    }

    #[tokio::test]
    async fn test_stitching_requires_verified_upstream_email() {
        let f = fixture(stitching_config(), ScriptedPolicy::allowing());
        let local = LocalUser::new("t-1").with_email("u@example.com", true);
        f.users.create(&local).await.unwrap();

        let provider = provider().with_auto_link_email(true);
        let err = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("u@example.com"), false),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap_err();
        assert_eq!(deny_code(err), DenyCode::AccountExistsLinkRequired);
    }

    // ------------------------------------------------------------------
    // Branch 4/5: JIT provisioning
    // ------------------------------------------------------------------

    fn jit_config() -> FederationConfig {
        FederationConfig::default().with_jit(
            JitConfig::new()
                .with_enabled(true)
                .with_require_verified_email(true),
        )
    }

    #[tokio::test]
    async fn test_jit_disabled_when_provider_disallows() {
        let f = fixture(jit_config(), ScriptedPolicy::allowing());

        let err = f
            .resolver
            .resolve(
                &provider(),
                &user_info(Some("new@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap_err();
        assert_eq!(deny_code(err), DenyCode::JitProvisioningDisabled);
    }

    #[tokio::test]
    async fn test_jit_creates_user_and_identity() {
        let f = fixture(jit_config(), ScriptedPolicy::allowing());
        let provider = provider().with_jit_provisioning(true);

        let resolution = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("new@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap();

        assert!(resolution.is_new_user);
        assert_eq!(resolution.action, ResolutionAction::Registered);
        let user = f.users.find_by_id(&resolution.user_id).await.unwrap();
        assert!(user.is_some());
        assert_eq!(
            f.identities
                .find_by_user(&resolution.user_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_jit_requires_verified_email() {
        let f = fixture(jit_config(), ScriptedPolicy::allowing());
        let provider = provider().with_jit_provisioning(true);

        let err = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("new@example.com"), false),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap_err();
        assert_eq!(deny_code(err), DenyCode::EmailNotVerified);
    }

    #[tokio::test]
    async fn test_jit_respects_provider_allow_list() {
        let mut config = jit_config();
        config.jit.allowed_providers = Some(vec!["github".to_string()]);
        let f = fixture(config, ScriptedPolicy::allowing());
        let provider = provider().with_jit_provisioning(true); // slug "google"

        let err = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("new@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap_err();
        assert_eq!(deny_code(err), DenyCode::JitProvisioningDisabled);
    }

    #[tokio::test]
    async fn test_jit_policy_denial_rolls_back_completely() {
        let f = fixture(jit_config(), ScriptedPolicy::denying("access_denied"));
        let provider = provider().with_jit_provisioning(true);

        let err = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("new@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap_err();
        assert_eq!(deny_code(err), DenyCode::PolicyAccessDenied);

        // No user, identity, membership, or role rows survive
        assert!(f.users.rows.lock().unwrap().is_empty());
        assert!(f.identities.rows.lock().unwrap().is_empty());
        assert!(f.policy.joins.lock().unwrap().is_empty());
        assert!(f.policy.grants.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jit_policy_deny_code_mapping() {
        for (policy_code, expected) in [
            ("interaction_required", DenyCode::PolicyInteractionRequired),
            ("login_required", DenyCode::PolicyLoginRequired),
            ("access_denied", DenyCode::PolicyAccessDenied),
        ] {
            let f = fixture(jit_config(), ScriptedPolicy::denying(policy_code));
            let provider = provider().with_jit_provisioning(true);
            let err = f
                .resolver
                .resolve(
                    &provider,
                    &user_info(Some("new@example.com"), true),
                    &tokens(),
                    None,
                    "t-1",
                )
                .await
                .unwrap_err();
            assert_eq!(deny_code(err), expected);
        }
    }

    #[tokio::test]
    async fn test_jit_standalone_disallowed_without_orgs() {
        let mut config = jit_config();
        config.jit.allow_standalone_users = false;
        let f = fixture(config, ScriptedPolicy::allowing());
        let provider = provider().with_jit_provisioning(true);

        let err = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("new@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap_err();
        assert_eq!(deny_code(err), DenyCode::AccessDenied);
        assert!(f.users.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jit_first_match_prefers_rule_orgs() {
        let mut policy = ScriptedPolicy::allowing();
        policy.decision.orgs_to_join = vec!["org-rule".to_string(), "org-rule-2".to_string()];
        policy.domain_orgs = vec!["org-domain".to_string()];

        let f = fixture(jit_config(), policy);
        let provider = provider().with_jit_provisioning(true);

        let resolution = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("new@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap();

        // first-match-by-rule-order: only the first rule org is joined
        assert_eq!(resolution.orgs_joined, vec!["org-rule"]);
        assert_eq!(*f.policy.joins.lock().unwrap(), vec!["org-rule"]);
    }

    #[tokio::test]
    async fn test_jit_join_all_unions_rule_and_domain_orgs() {
        let mut policy = ScriptedPolicy::allowing();
        policy.decision.orgs_to_join = vec!["org-rule".to_string()];
        policy.domain_orgs = vec!["org-domain".to_string(), "org-rule".to_string()];

        let mut config = jit_config();
        config.jit.join_all_matching_orgs = true;
        let f = fixture(config, policy);
        let provider = provider().with_jit_provisioning(true);

        let resolution = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("new@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap();

        assert_eq!(resolution.orgs_joined, vec!["org-rule", "org-domain"]);
    }

    #[tokio::test]
    async fn test_jit_auto_role_scope_binds_first_org() {
        let mut policy = ScriptedPolicy::allowing();
        policy.decision.orgs_to_join = vec!["org-1".to_string()];
        policy.decision.roles_to_assign = vec![RoleAssignment {
            role_id: "admin".to_string(),
            scope_type: "organization".to_string(),
            scope_target: "auto".to_string(),
        }];

        let f = fixture(jit_config(), policy);
        let provider = provider().with_jit_provisioning(true);

        let resolution = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("new@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap();

        assert_eq!(resolution.roles_assigned, vec!["admin"]);
        assert_eq!(
            *f.policy.grants.lock().unwrap(),
            vec!["admin@organization:org-1"]
        );
    }

    #[tokio::test]
    async fn test_jit_default_role_fallback() {
        let mut config = jit_config();
        config.jit.default_role = Some("member".to_string());
        let f = fixture(config, ScriptedPolicy::allowing());
        let provider = provider().with_jit_provisioning(true);

        let resolution = f
            .resolver
            .resolve(
                &provider,
                &user_info(Some("new@example.com"), true),
                &tokens(),
                None,
                "t-1",
            )
            .await
            .unwrap();

        assert_eq!(resolution.roles_assigned, vec!["member"]);
        assert_eq!(*f.policy.grants.lock().unwrap(), vec!["member@tenant:t-1"]);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    #[test]
    fn test_email_domain_hash() {
        let hash = email_domain_hash("User@Example.COM").unwrap();
        // Case-insensitive on the domain
        assert_eq!(hash, email_domain_hash("other@example.com").unwrap());
        assert_eq!(hash.len(), 64);

        assert!(email_domain_hash("not-an-email").is_none());
        assert!(email_domain_hash("trailing@").is_none());
    }

    #[test]
    fn test_deny_code_wire_forms() {
        assert_eq!(DenyCode::EmailNotVerified.as_str(), "EMAIL_NOT_VERIFIED");
        assert_eq!(
            DenyCode::LocalEmailNotVerified.as_str(),
            "LOCAL_EMAIL_NOT_VERIFIED"
        );
        assert_eq!(
            DenyCode::AccountExistsLinkRequired.as_str(),
            "ACCOUNT_EXISTS_LINK_REQUIRED"
        );
        assert_eq!(
            DenyCode::JitProvisioningDisabled.as_str(),
            "JIT_PROVISIONING_DISABLED"
        );
        assert_eq!(DenyCode::AccessDenied.as_str(), "access_denied");
    }
}
