//! Account signup and email verification
//!
//! Creating a user queues the verification mail on the critical queue with a
//! short delay, so the write that created the user is visible to the worker
//! by the time the task runs. Following the mailed link consumes the record
//! and marks the address verified.

use crate::distributor::TaskDistributor;
use crate::handlers::verify_email::{PayloadSendVerifyEmail, SECRET_CODE_LEN};
use crate::queue::CRITICAL_QUEUE;
use crate::storage::{CreateUserParams, Store, StoreError, User};
use crate::task::TaskOptions;
use crate::TaskQueueError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Retry budget of the verification mail
pub const VERIFY_EMAIL_MAX_RETRY: u32 = 10;

/// Delay before the verification mail becomes eligible
pub const VERIFY_EMAIL_DELAY: Duration = Duration::from_secs(10);

/// Longest secret accepted from a verification link
const SECRET_CODE_MAX_LEN: usize = 128;

/// Errors raised while signing a user up
#[derive(Error, Debug)]
pub enum AccountError {
    /// The store rejected the operation
    #[error("account store error: {0}")]
    Store(#[from] StoreError),

    /// The request failed validation before reaching the store
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The user exists but the verification mail was not queued
    #[error("failed to distribute verify email task: {0}")]
    Distribute(#[from] TaskQueueError),
}

/// Submission options used for verification mails
pub fn verify_email_options() -> TaskOptions {
    TaskOptions::new()
        .queue(CRITICAL_QUEUE)
        .max_retry(VERIFY_EMAIL_MAX_RETRY)
        .process_in(VERIFY_EMAIL_DELAY)
}

/// Signup entry point
pub struct AccountService {
    store: Arc<dyn Store>,
    distributor: Arc<dyn TaskDistributor>,
}

impl AccountService {
    /// Create the service
    pub fn new(store: Arc<dyn Store>, distributor: Arc<dyn TaskDistributor>) -> Self {
        Self { store, distributor }
    }

    /// Insert the user, then queue their verification mail.
    ///
    /// A failed submission is reported but the user is kept.
    pub async fn create_user(&self, params: CreateUserParams) -> Result<User, AccountError> {
        let user = self.store.create_user(params).await?;

        let payload = PayloadSendVerifyEmail {
            username: user.username.clone(),
        };
        match self
            .distributor
            .distribute_send_verify_email(&payload, verify_email_options())
            .await
        {
            Ok(info) => {
                info!(username = %user.username, task_id = %info.id, "created user");
                Ok(user)
            }
            Err(e) => {
                error!(username = %user.username, "created user but could not queue verify email: {}", e);
                Err(AccountError::Distribute(e))
            }
        }
    }

    /// Consume the link from a verification mail
    pub async fn verify_email(
        &self,
        email_id: i64,
        secret_code: &str,
    ) -> Result<User, AccountError> {
        if email_id <= 0 {
            return Err(AccountError::InvalidArgument(
                "id must be a positive integer".to_string(),
            ));
        }
        if !(SECRET_CODE_LEN..=SECRET_CODE_MAX_LEN).contains(&secret_code.len()) {
            return Err(AccountError::InvalidArgument(format!(
                "secret_code must contain from {} to {} characters",
                SECRET_CODE_LEN, SECRET_CODE_MAX_LEN
            )));
        }

        match self.store.verify_email(email_id, secret_code).await {
            Ok(user) => {
                info!(username = %user.username, email_id, "verified email");
                Ok(user)
            }
            Err(e) => {
                warn!(email_id, "failed to verify email: {}", e);
                Err(AccountError::Store(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::{EnqueueInfo, MockTaskDistributor};
    use crate::storage::backend::MemoryStore;
    use chrono::Utc;

    fn alice() -> CreateUserParams {
        CreateUserParams {
            username: "alice".into(),
            full_name: "Alice Liddell".into(),
            email: "alice@example.com".into(),
        }
    }

    #[tokio::test]
    async fn signup_queues_verification_on_critical_queue() {
        let mut distributor = MockTaskDistributor::new();
        distributor
            .expect_distribute_send_verify_email()
            .withf(|payload, options| {
                payload.username == "alice"
                    && options.queue.as_deref() == Some(CRITICAL_QUEUE)
                    && options.max_retry == Some(VERIFY_EMAIL_MAX_RETRY)
                    && options.process_at.is_some_and(|at| at > Utc::now())
            })
            .times(1)
            .returning(|_, options| {
                Ok(EnqueueInfo {
                    id: "task-1".into(),
                    queue: CRITICAL_QUEUE.into(),
                    max_retry: VERIFY_EMAIL_MAX_RETRY,
                    process_at: options.process_at,
                })
            });

        let service = AccountService::new(Arc::new(MemoryStore::new()), Arc::new(distributor));
        let user = service.create_user(alice()).await.unwrap();
        assert_eq!(user.username, "alice");
        assert!(!user.is_email_verified);
    }

    #[tokio::test]
    async fn duplicate_user_queues_nothing() {
        let store = MemoryStore::new();
        store.create_user(alice()).await.unwrap();

        let mut distributor = MockTaskDistributor::new();
        distributor.expect_distribute_send_verify_email().never();

        let service = AccountService::new(Arc::new(store), Arc::new(distributor));
        let err = service.create_user(alice()).await.unwrap_err();
        assert!(matches!(
            err,
            AccountError::Store(StoreError::UniqueViolation(_))
        ));
    }

    #[tokio::test]
    async fn verify_email_checks_arguments_first() {
        let mut distributor = MockTaskDistributor::new();
        distributor.expect_distribute_send_verify_email().never();
        let service = AccountService::new(Arc::new(MemoryStore::new()), Arc::new(distributor));

        assert!(matches!(
            service.verify_email(0, &"s".repeat(32)).await,
            Err(AccountError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.verify_email(1, "short").await,
            Err(AccountError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.verify_email(1, &"s".repeat(32)).await,
            Err(AccountError::Store(StoreError::NotFound))
        ));
    }

    #[tokio::test]
    async fn failed_submission_keeps_user() {
        let store = MemoryStore::new();
        let mut distributor = MockTaskDistributor::new();
        distributor
            .expect_distribute_send_verify_email()
            .times(1)
            .returning(|_, _| Err(TaskQueueError::Enqueue("broker down".into())));

        let service = AccountService::new(Arc::new(store.clone()), Arc::new(distributor));
        let err = service.create_user(alice()).await.unwrap_err();
        assert!(matches!(err, AccountError::Distribute(_)));
        assert!(store.get_user("alice").await.is_ok());
    }
}
