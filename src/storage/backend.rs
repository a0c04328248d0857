//! Backend

use crate::storage::{
    CreateUserParams, CreateVerifyEmailParams, Store, StoreError, User, VerifyEmail,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifetime of a verification link
const VERIFY_EMAIL_TTL_MINUTES: i64 = 15;

/// In-memory store
#[derive(Clone)]
pub struct MemoryStore {
    users: Arc<RwLock<HashMap<String, User>>>,
    verify_emails: Arc<RwLock<Vec<VerifyEmail>>>,
    verify_email_ttl: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            users: Arc::default(),
            verify_emails: Arc::default(),
            verify_email_ttl: Duration::minutes(VERIFY_EMAIL_TTL_MINUTES),
        }
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how long new verification links stay valid
    pub fn with_verify_email_ttl(mut self, ttl: Duration) -> Self {
        self.verify_email_ttl = ttl;
        self
    }

    /// Verification records created for `username`, oldest first
    pub async fn verify_emails_for(&self, username: &str) -> Vec<VerifyEmail> {
        let records = self.verify_emails.read().await;
        records
            .iter()
            .filter(|r| r.username == username)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        let users = self.users.read().await;
        users.get(username).cloned().ok_or(StoreError::NotFound)
    }

    async fn create_user(&self, params: CreateUserParams) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        if users.contains_key(&params.username) {
            return Err(StoreError::UniqueViolation("users_pkey".to_string()));
        }
        if users.values().any(|u| u.email == params.email) {
            return Err(StoreError::UniqueViolation("users_email_key".to_string()));
        }

        let user = User {
            username: params.username,
            full_name: params.full_name,
            email: params.email,
            is_email_verified: false,
            created_at: Utc::now(),
        };
        users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn create_verify_email(
        &self,
        params: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        let users = self.users.read().await;
        if !users.contains_key(&params.username) {
            // Foreign key on username
            return Err(StoreError::NotFound);
        }
        drop(users);

        let mut records = self.verify_emails.write().await;
        let now = Utc::now();
        let record = VerifyEmail {
            id: i64::try_from(records.len()).unwrap_or(i64::MAX - 1) + 1,
            username: params.username,
            email: params.email,
            secret_code: params.secret_code,
            is_used: false,
            created_at: now,
            expired_at: now + self.verify_email_ttl,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn verify_email(&self, email_id: i64, secret_code: &str) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        let mut records = self.verify_emails.write().await;

        let record = records
            .iter_mut()
            .find(|r| r.id == email_id)
            .ok_or(StoreError::NotFound)?;
        if record.secret_code != secret_code {
            return Err(StoreError::SecretMismatch);
        }
        if record.is_used {
            return Err(StoreError::LinkUsed);
        }
        if record.expired_at <= Utc::now() {
            return Err(StoreError::LinkExpired);
        }

        let user = users
            .get_mut(&record.username)
            .ok_or(StoreError::NotFound)?;
        record.is_used = true;
        user.is_email_verified = true;
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> CreateUserParams {
        CreateUserParams {
            username: "alice".into(),
            full_name: "Alice Liddell".into(),
            email: "alice@example.com".into(),
        }
    }

    #[tokio::test]
    async fn user_round_trip() {
        let store = MemoryStore::new();
        let created = store.create_user(alice()).await.unwrap();
        assert_eq!(store.get_user("alice").await.unwrap(), created);
        assert_eq!(store.get_user("bob").await, Err(StoreError::NotFound));
    }

    #[tokio::test]
    async fn duplicate_users_are_rejected() {
        let store = MemoryStore::new();
        store.create_user(alice()).await.unwrap();
        assert!(matches!(
            store.create_user(alice()).await,
            Err(StoreError::UniqueViolation(_))
        ));
    }

    #[tokio::test]
    async fn verify_email_ids_increase() {
        let store = MemoryStore::new();
        store.create_user(alice()).await.unwrap();
        let params = CreateVerifyEmailParams {
            username: "alice".into(),
            email: "alice@example.com".into(),
            secret_code: "s".repeat(32),
        };

        let first = store.create_verify_email(params.clone()).await.unwrap();
        let second = store.create_verify_email(params).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(second.expired_at > second.created_at);
        assert_eq!(store.verify_emails_for("alice").await.len(), 2);
    }

    async fn store_with_link(ttl: Duration) -> (MemoryStore, VerifyEmail) {
        let store = MemoryStore::new().with_verify_email_ttl(ttl);
        store.create_user(alice()).await.unwrap();
        let record = store
            .create_verify_email(CreateVerifyEmailParams {
                username: "alice".into(),
                email: "alice@example.com".into(),
                secret_code: "s".repeat(32),
            })
            .await
            .unwrap();
        (store, record)
    }

    #[tokio::test]
    async fn link_verifies_user_once() {
        let (store, record) = store_with_link(Duration::minutes(15)).await;

        let user = store
            .verify_email(record.id, &record.secret_code)
            .await
            .unwrap();
        assert!(user.is_email_verified);
        assert!(store.get_user("alice").await.unwrap().is_email_verified);
        assert!(store.verify_emails_for("alice").await[0].is_used);

        assert_eq!(
            store.verify_email(record.id, &record.secret_code).await,
            Err(StoreError::LinkUsed)
        );
    }

    #[tokio::test]
    async fn wrong_secret_changes_nothing() {
        let (store, record) = store_with_link(Duration::minutes(15)).await;

        assert_eq!(
            store.verify_email(record.id, &"x".repeat(32)).await,
            Err(StoreError::SecretMismatch)
        );
        assert_eq!(
            store.verify_email(record.id + 1, &record.secret_code).await,
            Err(StoreError::NotFound)
        );
        assert!(!store.get_user("alice").await.unwrap().is_email_verified);
        assert!(!store.verify_emails_for("alice").await[0].is_used);
    }

    #[tokio::test]
    async fn expired_link_is_rejected() {
        let (store, record) = store_with_link(Duration::zero()).await;

        assert_eq!(
            store.verify_email(record.id, &record.secret_code).await,
            Err(StoreError::LinkExpired)
        );
        assert!(!store.get_user("alice").await.unwrap().is_email_verified);
    }

    #[tokio::test]
    async fn verify_email_requires_user() {
        let store = MemoryStore::new();
        let params = CreateVerifyEmailParams {
            username: "ghost".into(),
            email: "ghost@example.com".into(),
            secret_code: "s".repeat(32),
        };
        assert_eq!(
            store.create_verify_email(params).await,
            Err(StoreError::NotFound)
        );
    }
}
