//! External service contracts: sessions and provisioning policy.
//!
//! Sessions and the policy/organization/role machinery live elsewhere in
//! the platform; the federation engine drives them through these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StorageError;

/// Issues and verifies first-party sessions.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Creates a session for a user, returning the session token.
    ///
    /// # Errors
    ///
    /// Returns an error if the session backend fails.
    async fn create_session(&self, user_id: &str, metadata: Value) -> Result<String, StorageError>;

    /// Verifies a session token.
    ///
    /// Returns `None` for unknown, expired, or revoked tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if the session backend fails.
    async fn verify_session(&self, token: &str) -> Result<Option<SessionInfo>, StorageError>;
}

/// A verified session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session identifier.
    pub session_id: String,
    /// The authenticated user.
    pub user_id: String,
}

/// Context handed to the provisioning policy engine.
///
/// Carries only what rules match on. The raw email never crosses this
/// boundary; rules see the domain hash.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyContext {
    /// Hex SHA-256 of the lowercased email domain.
    pub email_domain_hash: Option<String>,
    /// Whether the upstream email is verified.
    pub email_verified: bool,
    /// Raw upstream claims.
    pub claims: Value,
    /// Provider configuration id.
    pub provider_id: String,
    /// Tenant the user is being provisioned into.
    pub tenant_id: String,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyDecision {
    /// Whether provisioning is denied.
    pub denied: bool,
    /// OAuth-style deny code (`interaction_required`, `login_required`,
    /// `access_denied`).
    #[serde(default)]
    pub deny_code: Option<String>,
    /// Identifiers of the rules that matched.
    #[serde(default)]
    pub matched_rules: Vec<String>,
    /// Roles to assign on approval.
    #[serde(default)]
    pub roles_to_assign: Vec<RoleAssignment>,
    /// Organizations to join on approval.
    #[serde(default)]
    pub orgs_to_join: Vec<String>,
    /// User attributes to set on approval.
    #[serde(default)]
    pub attributes_to_set: serde_json::Map<String, Value>,
}

/// A role grant requested by policy output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Role identifier.
    pub role_id: String,
    /// Scope type (`organization` or `tenant`).
    pub scope_type: String,
    /// Scope target: an organization id, a tenant id, or `auto` to bind to
    /// the first joined organization.
    pub scope_target: String,
}

/// Provisioning policy, organization, and role operations.
#[async_trait]
pub trait PolicyService: Send + Sync {
    /// Evaluates provisioning policy for a new federated user.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy engine fails.
    async fn evaluate(&self, context: &PolicyContext) -> Result<PolicyDecision, StorageError>;

    /// Adds a user to an organization.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation fails.
    async fn join_organization(
        &self,
        user_id: &str,
        org_id: &str,
        tenant_id: &str,
        membership_type: &str,
    ) -> Result<(), StorageError>;

    /// Grants a role to a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation fails.
    async fn assign_role(
        &self,
        user_id: &str,
        role_id: &str,
        scope_type: &str,
        scope_target: &str,
        tenant_id: &str,
    ) -> Result<(), StorageError>;

    /// Organizations mapped to an email-domain hash, in mapping order.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation fails.
    async fn resolve_orgs_by_domain_hash(
        &self,
        domain_hash: &str,
        tenant_id: &str,
    ) -> Result<Vec<String>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_decision_deserialize_defaults() {
        let decision: PolicyDecision = serde_json::from_str(r#"{"denied": false}"#).unwrap();
        assert!(!decision.denied);
        assert!(decision.deny_code.is_none());
        assert!(decision.roles_to_assign.is_empty());
        assert!(decision.orgs_to_join.is_empty());
    }

    #[test]
    fn test_policy_decision_deserialize_full() {
        let decision: PolicyDecision = serde_json::from_str(
            r#"{
                "denied": true,
                "deny_code": "access_denied",
                "matched_rules": ["rule-1"],
                "roles_to_assign": [
                    {"role_id": "admin", "scope_type": "organization", "scope_target": "auto"}
                ],
                "orgs_to_join": ["org-1"]
            }"#,
        )
        .unwrap();

        assert!(decision.denied);
        assert_eq!(decision.deny_code.as_deref(), Some("access_denied"));
        assert_eq!(decision.roles_to_assign[0].scope_target, "auto");
    }
}
