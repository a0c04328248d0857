/// Backend implementations
pub mod backend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a [`Store`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested record does not exist
    #[error("record not found")]
    NotFound,

    /// A unique constraint rejected the write
    #[error("unique violation: {0}")]
    UniqueViolation(String),

    /// The store could not be reached or failed mid-operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The secret does not belong to the verification record
    #[error("verification secret does not match")]
    SecretMismatch,

    /// The verification link is past its expiry
    #[error("verification link expired")]
    LinkExpired,

    /// The verification link was already consumed
    #[error("verification link already used")]
    LinkUsed,
}

/// Registered account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Login name, unique
    pub username: String,
    /// Display name
    pub full_name: String,
    /// Contact address, unique
    pub email: String,
    /// Whether the address was confirmed
    pub is_email_verified: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Input for [`Store::create_user`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserParams {
    /// Login name
    pub username: String,
    /// Display name
    pub full_name: String,
    /// Contact address
    pub email: String,
}

/// Pending address confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmail {
    /// Record id, used in the verification link
    pub id: i64,
    /// Owner of the address
    pub username: String,
    /// Address being confirmed
    pub email: String,
    /// Secret included in the verification link
    pub secret_code: String,
    /// Whether the link was already used
    pub is_used: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Link expiry
    pub expired_at: DateTime<Utc>,
}

/// Input for [`Store::create_verify_email`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVerifyEmailParams {
    /// Owner of the address
    pub username: String,
    /// Address being confirmed
    pub email: String,
    /// Secret included in the verification link
    pub secret_code: String,
}

/// Persistence operations the task handlers depend on
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a user by username
    async fn get_user(&self, username: &str) -> Result<User, StoreError>;

    /// Insert a new user
    async fn create_user(&self, params: CreateUserParams) -> Result<User, StoreError>;

    /// Insert a verification record
    async fn create_verify_email(
        &self,
        params: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError>;

    /// Consume a verification link and mark its owner's address verified.
    ///
    /// Fails with `NotFound` for an unknown record, `SecretMismatch`,
    /// `LinkUsed` or `LinkExpired` otherwise; a failed attempt changes nothing.
    async fn verify_email(&self, email_id: i64, secret_code: &str) -> Result<User, StoreError>;
}
