//! Secret encryption contract.
//!
//! Provider client secrets, request-object signing keys, and stored upstream
//! tokens are kept encrypted at rest. The cipher itself lives outside this
//! crate; the engine consumes it through the [`SecretCipher`] trait and
//! receives the handle as an explicit constructor parameter wherever key
//! material is needed.
//!
//! The key is 256 bits and held by the implementation. Ciphertext format is
//! opaque to this crate.

use serde::{Deserialize, Serialize};

/// Errors that can occur during secret encryption or decryption.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The configured encryption key is missing or malformed.
    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    /// The ciphertext could not be decrypted.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// The plaintext could not be encrypted.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
}

/// Symmetric encryption primitives over an implementation-held 256-bit key.
///
/// Implementations are provided outside this crate. All methods are
/// synchronous; implementations are expected to be pure CPU work.
pub trait SecretCipher: Send + Sync {
    /// Encrypts a plaintext secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unavailable or encryption fails.
    fn encrypt(&self, plaintext: &str) -> Result<SealedSecret, CryptoError>;

    /// Decrypts a sealed secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unavailable or the ciphertext is
    /// invalid.
    fn decrypt(&self, sealed: &SealedSecret) -> Result<String, CryptoError>;
}

/// An encrypted secret value.
///
/// The inner ciphertext is opaque. `Debug` output is redacted so sealed
/// values never land in logs verbatim.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedSecret(String);

impl SealedSecret {
    /// Wraps an existing ciphertext (e.g. loaded from storage).
    #[must_use]
    pub fn from_ciphertext(ciphertext: impl Into<String>) -> Self {
        Self(ciphertext.into())
    }

    /// The opaque ciphertext, for persistence.
    #[must_use]
    pub fn ciphertext(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealedSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sealed_secret_debug_is_redacted() {
        let sealed = SealedSecret::from_ciphertext("c1ph3rt3xt");
        assert_eq!(format!("{sealed:?}"), "SealedSecret(..)");
    }

    #[test]
    fn test_sealed_secret_serde_is_transparent() {
        let sealed = SealedSecret::from_ciphertext("abc");
        let json = serde_json::to_string(&sealed).unwrap();
        assert_eq!(json, "\"abc\"");

        let back: SealedSecret = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sealed);
    }
}
