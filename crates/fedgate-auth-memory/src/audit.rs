//! Audit sinks for embedded deployments and tests.

use std::sync::Mutex;

use async_trait::async_trait;

use fedgate_auth::audit::{AuditEntry, AuditError, AuditSink};

/// Audit sink that drops entries after logging them.
#[derive(Default)]
pub struct NoopAuditSink;

impl NoopAuditSink {
    /// Creates the sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        tracing::debug!(
            action = %entry.action,
            resource = %entry.resource_id,
            "Audit event"
        );
        Ok(())
    }
}

/// Audit sink that retains entries in memory for inspection.
#[derive(Default)]
pub struct RecordingAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAuditSink {
    /// Creates the sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded entries.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().expect("audit lock poisoned").clone()
    }

    /// Actions of all recorded entries, in order.
    #[must_use]
    pub fn actions(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|entry| entry.action)
            .collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.entries
            .lock()
            .expect("audit lock poisoned")
            .push(entry);
        Ok(())
    }
}
