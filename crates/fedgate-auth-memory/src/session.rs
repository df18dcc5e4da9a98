//! In-memory session service.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use fedgate_auth::storage::{SessionInfo, SessionService, StorageError};

/// In-memory session service issuing opaque random tokens.
#[derive(Default)]
pub struct InMemorySessionService {
    sessions: Mutex<HashMap<String, SessionInfo>>,
}

impl InMemorySessionService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(
        &self,
        user_id: &str,
        _metadata: serde_json::Value,
    ) -> Result<String, StorageError> {
        let token = uuid::Uuid::new_v4().to_string();
        let info = SessionInfo {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
        };
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .insert(token.clone(), info);
        Ok(token)
    }

    async fn verify_session(&self, token: &str) -> Result<Option<SessionInfo>, StorageError> {
        Ok(self
            .sessions
            .lock()
            .expect("session lock poisoned")
            .get(token)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_verify() {
        let service = InMemorySessionService::new();
        let token = service
            .create_session("u-1", serde_json::json!({}))
            .await
            .unwrap();

        let info = service.verify_session(&token).await.unwrap().unwrap();
        assert_eq!(info.user_id, "u-1");

        assert!(service.verify_session("bogus").await.unwrap().is_none());
    }
}
