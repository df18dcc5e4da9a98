//! Periodic maintenance tasks.
//!
//! Two idempotent passes, safe to run concurrently with request handling:
//! sweeping expired correlation state and refreshing upstream tokens that
//! expire soon. Both are plain library functions; [`spawn_maintenance`]
//! drives them on a caller-owned interval.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::config::FederationConfig;
use crate::crypto::SecretCipher;
use crate::provider::ProviderStorage;
use crate::rp::{ClientSecrets, DiscoveryCache, JwksCache, RpClient, RpClientConfig};
use crate::state::AuthStateStorage;
use crate::storage::identity::StoredTokens;
use crate::storage::LinkedIdentityStorage;

/// Deletes expired, unconsumed authorization state records.
///
/// Returns the number removed. Errors are logged and swallowed; the sweep
/// runs again on the next tick.
pub async fn sweep_expired_states(states: &dyn AuthStateStorage) -> u64 {
    match states.cleanup_expired().await {
        Ok(removed) => {
            if removed > 0 {
                tracing::debug!(removed, "Swept expired authorization states");
            }
            removed
        }
        Err(err) => {
            tracing::warn!(error = %err, "Authorization state sweep failed");
            0
        }
    }
}

/// Refreshes stored upstream tokens that expire within `window`.
///
/// Each eligible identity (held refresh token, expiring access token) gets
/// one refresh-grant attempt; results are re-encrypted and stored.
/// Per-identity failures are logged and do not stop the pass. Returns the
/// number of identities refreshed.
#[allow(clippy::too_many_arguments)]
pub async fn refresh_expiring_tokens(
    identities: &dyn LinkedIdentityStorage,
    providers: &dyn ProviderStorage,
    cipher: &dyn SecretCipher,
    discovery: &Arc<DiscoveryCache>,
    jwks: &Arc<JwksCache>,
    config: &FederationConfig,
    window: std::time::Duration,
) -> u64 {
    let cutoff = OffsetDateTime::now_utc() + window;
    let expiring = match identities.list_expiring(cutoff).await {
        Ok(expiring) => expiring,
        Err(err) => {
            tracing::warn!(error = %err, "Could not list expiring identities");
            return 0;
        }
    };

    let mut refreshed = 0;
    for identity in expiring {
        let Some(sealed_refresh) = identity.refresh_token.as_ref() else {
            continue;
        };

        let result = async {
            let provider = providers
                .find_by_id(&identity.provider_id)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("provider {} gone", identity.provider_id))?;

            let refresh_token = cipher.decrypt(sealed_refresh).map_err(|e| e.to_string())?;

            let secrets =
                ClientSecrets::decrypt(&provider, cipher).map_err(|e| e.to_string())?;
            let client_config = RpClientConfig::new(config.callback_url(&provider.slug))
                .with_request_timeout(config.request_timeout)
                .with_clock_skew(config.clock_skew);
            let client = RpClient::new(
                provider,
                secrets,
                client_config,
                discovery.clone(),
                jwks.clone(),
            );

            let tokens = client
                .refresh_tokens(&refresh_token)
                .await
                .map_err(|e| e.to_string())?;

            let stored = StoredTokens {
                access_token: Some(cipher.encrypt(&tokens.access_token).map_err(|e| e.to_string())?),
                refresh_token: match tokens.refresh_token.as_deref() {
                    // Providers rotating refresh tokens hand out a new one
                    Some(rotated) => Some(cipher.encrypt(rotated).map_err(|e| e.to_string())?),
                    None => Some(sealed_refresh.clone()),
                },
                id_token: tokens
                    .id_token
                    .as_deref()
                    .map(|t| cipher.encrypt(t))
                    .transpose()
                    .map_err(|e| e.to_string())?,
                expires_at: tokens
                    .expires_in
                    .map(|secs| OffsetDateTime::now_utc() + std::time::Duration::from_secs(secs)),
            };

            identities
                .update_tokens(&identity.id, &stored)
                .await
                .map_err(|e| e.to_string())
        }
        .await;

        match result {
            Ok(()) => refreshed += 1,
            Err(detail) => {
                tracing::warn!(
                    identity = %identity.id,
                    detail,
                    "Upstream token refresh failed"
                );
            }
        }
    }

    if refreshed > 0 {
        tracing::debug!(refreshed, "Refreshed expiring upstream tokens");
    }
    refreshed
}

/// Handles for the maintenance tasks.
pub struct MaintenanceHandles {
    /// The state sweep task.
    pub sweep: tokio::task::JoinHandle<()>,
    /// The token refresh task.
    pub refresh: tokio::task::JoinHandle<()>,
}

/// Spawns both maintenance loops on the given intervals.
///
/// The tasks run until aborted via the returned handles.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn spawn_maintenance(
    states: Arc<dyn AuthStateStorage>,
    identities: Arc<dyn LinkedIdentityStorage>,
    providers: Arc<dyn ProviderStorage>,
    cipher: Arc<dyn SecretCipher>,
    discovery: Arc<DiscoveryCache>,
    jwks: Arc<JwksCache>,
    config: FederationConfig,
    sweep_interval: std::time::Duration,
    refresh_window: std::time::Duration,
) -> MaintenanceHandles {
    let sweep = tokio::spawn({
        let states = states.clone();
        async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sweep_expired_states(states.as_ref()).await;
            }
        }
    });

    let refresh = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh_window / 2);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            refresh_expiring_tokens(
                identities.as_ref(),
                providers.as_ref(),
                cipher.as_ref(),
                &discovery,
                &jwks,
                &config,
                refresh_window,
            )
            .await;
        }
    });

    MaintenanceHandles { sweep, refresh }
}
