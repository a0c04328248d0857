//! Verification email task

use crate::mail::{EmailSender, MailError, OutgoingEmail};
use crate::storage::{CreateVerifyEmailParams, Store, StoreError};
use crate::task::handler::{decode_or_skip, HandlerError, TaskContext, TaskHandler};
use crate::task::{Task, TaskKind};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Length of the secret embedded in verification links
pub const SECRET_CODE_LEN: usize = 32;

/// Subject line of the verification message
pub const VERIFY_EMAIL_SUBJECT: &str = "Please verify your email address";

/// Payload of the verification email task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    /// Account whose address should be confirmed
    pub username: String,
}

impl TaskKind for PayloadSendVerifyEmail {
    const TYPE: &'static str = "task:send_verification_email";
}

/// Looks the user up, records a verification secret and mails the link
pub struct SendVerifyEmailHandler {
    store: Arc<dyn Store>,
    mailer: Arc<dyn EmailSender>,
    base_url: String,
}

impl SendVerifyEmailHandler {
    /// Create the handler; links point at `base_url`
    pub fn new(
        store: Arc<dyn Store>,
        mailer: Arc<dyn EmailSender>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailer,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn verification_url(&self, email_id: i64, secret_code: &str) -> String {
        format!(
            "{}/verify_email?id={}&secret_code={}",
            self.base_url, email_id, secret_code
        )
    }
}

/// Random alphanumeric secret
pub fn random_secret_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_CODE_LEN)
        .map(char::from)
        .collect()
}

#[async_trait]
impl TaskHandler for SendVerifyEmailHandler {
    async fn handle(&self, ctx: &TaskContext, task: &Task) -> Result<(), HandlerError> {
        let payload: PayloadSendVerifyEmail = decode_or_skip(task)?;

        let user = match self.store.get_user(&payload.username).await {
            Ok(user) => user,
            Err(StoreError::NotFound) => {
                return Err(HandlerError::skip_retry(format!(
                    "user {} doesn't exist",
                    payload.username
                )))
            }
            Err(e) => return Err(HandlerError::retry(format!("failed to get user: {e}"))),
        };

        let verify_email = self
            .store
            .create_verify_email(CreateVerifyEmailParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: random_secret_code(),
            })
            .await
            .map_err(|e| HandlerError::retry(format!("failed to create verify email: {e}")))?;

        if ctx.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }

        let url = self.verification_url(verify_email.id, &verify_email.secret_code);
        let content = format!(
            "Hello {},<br/>\
             Thank you for registering with us!<br/>\
             Please <a href=\"{}\">click here</a> to verify your email address.<br/>",
            user.full_name, url
        );
        let email = OutgoingEmail::html(VERIFY_EMAIL_SUBJECT, content, vec![user.email.clone()]);

        self.mailer.send_email(&email).await.map_err(|e| match e {
            MailError::Transient(_) => {
                HandlerError::retry(format!("failed to send verify email: {e}"))
            }
            MailError::Rejected(_) => {
                HandlerError::skip_retry(format!("verify email rejected: {e}"))
            }
        })?;

        info!(
            task_type = %task.task_type,
            payload = %task.payload_str(),
            email = %user.email,
            "processed task"
        );
        Ok(())
    }
}
