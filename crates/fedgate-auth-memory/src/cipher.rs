//! Passthrough cipher for tests and development.

use fedgate_auth::crypto::{CryptoError, SealedSecret, SecretCipher};

/// A cipher that stores secrets with a visible marker instead of
/// encrypting them.
///
/// Exists so tests and development setups can run without key material.
/// Never use it where secrets matter: "sealed" values are plaintext.
#[derive(Default)]
pub struct PlainCipher;

impl PlainCipher {
    /// Creates the cipher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SecretCipher for PlainCipher {
    fn encrypt(&self, plaintext: &str) -> Result<SealedSecret, CryptoError> {
        Ok(SealedSecret::from_ciphertext(format!("plain:{plaintext}")))
    }

    fn decrypt(&self, sealed: &SealedSecret) -> Result<String, CryptoError> {
        sealed
            .ciphertext()
            .strip_prefix("plain:")
            .map(ToString::to_string)
            .ok_or_else(|| {
                CryptoError::DecryptionFailed("value was not sealed by PlainCipher".to_string())
            })
    }
}
