//! Security event audit logging.
//!
//! Every resolution branch that persists state records an audit entry:
//! identity linked/unlinked, user JIT-provisioned, provisioning rolled
//! back, redirect blocked. The sink itself is external; failures to record
//! are logged as warnings and never fail the caller.

use async_trait::async_trait;
use serde_json::Value;

/// An audit trail entry.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// The acting or affected user, when known.
    pub user_id: Option<String>,

    /// Tenant the event occurred in.
    pub tenant_id: String,

    /// Event action, dot-separated (e.g. `external.identity.linked`).
    pub action: String,

    /// Type of the affected resource (e.g. `linked_identity`, `user`).
    pub resource_type: String,

    /// Identifier of the affected resource.
    pub resource_id: String,

    /// Additional structured context. Must contain only safe, enumerated
    /// fields; never raw upstream response bodies or secrets.
    pub metadata: Value,
}

impl AuditEntry {
    /// Creates an entry for the given action and resource.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: None,
            tenant_id: tenant_id.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            metadata: Value::Null,
        }
    }

    /// Sets the acting user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the metadata payload.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Records an audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink is unavailable. Callers must treat the
    /// failure as best-effort; use [`record_best_effort`] for that.
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

/// Errors produced by an audit sink.
#[derive(Debug, thiserror::Error)]
#[error("Audit sink error: {0}")]
pub struct AuditError(pub String);

/// Records an entry, downgrading sink failures to warnings.
///
/// Audit failures must never fail the primary flow.
pub async fn record_best_effort(sink: &dyn AuditSink, entry: AuditEntry) {
    let action = entry.action.clone();
    if let Err(err) = sink.record(entry).await {
        tracing::warn!(action, error = %err, "Failed to record audit entry");
    }
}
