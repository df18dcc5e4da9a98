//! Storage and external service contracts.
//!
//! The federation engine persists nothing itself; it talks to backends
//! through these traits. Implementations live in sibling crates
//! (`fedgate-auth-memory` ships an in-memory backend).

pub mod identity;
pub mod services;
pub mod user;

pub use identity::{LinkedIdentity, LinkedIdentityStorage};
pub use services::{
    PolicyContext, PolicyDecision, PolicyService, RoleAssignment, SessionInfo, SessionService,
};
pub use user::{LocalUser, UserStorage};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A uniqueness constraint was violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend failed.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Creates a `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Creates a `Conflict` error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}
