//! In-memory provider configuration storage.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use fedgate_auth::provider::{ProviderStorage, UpstreamProvider};
use fedgate_auth::storage::StorageError;

/// In-memory provider store.
///
/// The administrative API normally owns provider records; embedded
/// deployments register them directly with [`InMemoryProviderStorage::insert`].
#[derive(Default)]
pub struct InMemoryProviderStorage {
    providers: Mutex<HashMap<String, UpstreamProvider>>,
}

impl InMemoryProviderStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a provider.
    pub fn insert(&self, provider: UpstreamProvider) {
        tracing::info!(
            provider = %provider.slug,
            tenant = %provider.tenant_id,
            "Registered identity provider"
        );
        self.providers
            .lock()
            .expect("provider lock poisoned")
            .insert(provider.id.clone(), provider);
    }
}

#[async_trait]
impl ProviderStorage for InMemoryProviderStorage {
    async fn find_by_id(&self, id: &str) -> Result<Option<UpstreamProvider>, StorageError> {
        Ok(self
            .providers
            .lock()
            .expect("provider lock poisoned")
            .get(id)
            .cloned())
    }

    async fn find_by_slug_or_id(
        &self,
        id_or_slug: &str,
        tenant_id: &str,
    ) -> Result<Option<UpstreamProvider>, StorageError> {
        Ok(self
            .providers
            .lock()
            .expect("provider lock poisoned")
            .values()
            .find(|provider| {
                provider.tenant_id == tenant_id
                    && (provider.id == id_or_slug || provider.slug == id_or_slug)
            })
            .cloned())
    }

    async fn list_enabled(&self, tenant_id: &str) -> Result<Vec<UpstreamProvider>, StorageError> {
        Ok(self
            .providers
            .lock()
            .expect("provider lock poisoned")
            .values()
            .filter(|provider| provider.tenant_id == tenant_id && provider.enabled)
            .cloned()
            .collect())
    }
}
