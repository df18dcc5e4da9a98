//! Permissive policy service for embedded deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use fedgate_auth::storage::{PolicyContext, PolicyDecision, PolicyService, StorageError};

/// Policy service that approves every provisioning attempt.
///
/// Records memberships and role grants in memory so embedded deployments
/// and tests can observe what provisioning did. Domain-hash organization
/// mappings can be seeded with [`AllowAllPolicyService::map_domain_hash`].
#[derive(Default)]
pub struct AllowAllPolicyService {
    domain_orgs: Mutex<HashMap<String, Vec<String>>>,
    memberships: Mutex<Vec<(String, String)>>,
    role_grants: Mutex<Vec<(String, String)>>,
}

impl AllowAllPolicyService {
    /// Creates the service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps an email-domain hash to organizations.
    pub fn map_domain_hash(&self, domain_hash: &str, orgs: Vec<String>) {
        self.domain_orgs
            .lock()
            .expect("policy lock poisoned")
            .insert(domain_hash.to_string(), orgs);
    }

    /// `(user_id, org_id)` membership rows created so far.
    #[must_use]
    pub fn memberships(&self) -> Vec<(String, String)> {
        self.memberships.lock().expect("policy lock poisoned").clone()
    }

    /// `(user_id, role_id)` grants created so far.
    #[must_use]
    pub fn role_grants(&self) -> Vec<(String, String)> {
        self.role_grants.lock().expect("policy lock poisoned").clone()
    }
}

#[async_trait]
impl PolicyService for AllowAllPolicyService {
    async fn evaluate(&self, _context: &PolicyContext) -> Result<PolicyDecision, StorageError> {
        Ok(PolicyDecision::default())
    }

    async fn join_organization(
        &self,
        user_id: &str,
        org_id: &str,
        _tenant_id: &str,
        _membership_type: &str,
    ) -> Result<(), StorageError> {
        self.memberships
            .lock()
            .expect("policy lock poisoned")
            .push((user_id.to_string(), org_id.to_string()));
        Ok(())
    }

    async fn assign_role(
        &self,
        user_id: &str,
        role_id: &str,
        _scope_type: &str,
        _scope_target: &str,
        _tenant_id: &str,
    ) -> Result<(), StorageError> {
        self.role_grants
            .lock()
            .expect("policy lock poisoned")
            .push((user_id.to_string(), role_id.to_string()));
        Ok(())
    }

    async fn resolve_orgs_by_domain_hash(
        &self,
        domain_hash: &str,
        _tenant_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self
            .domain_orgs
            .lock()
            .expect("policy lock poisoned")
            .get(domain_hash)
            .cloned()
            .unwrap_or_default())
    }
}
