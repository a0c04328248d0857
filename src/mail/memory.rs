use crate::mail::{EmailSender, MailError, OutgoingEmail};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Transport that keeps every accepted message in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryMailer {
    sender_name: String,
    sender_address: String,
    outbox: Arc<RwLock<Vec<OutgoingEmail>>>,
}

impl MemoryMailer {
    /// Create a mailer sending as `name <address>`
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            sender_name: name.into(),
            sender_address: address.into(),
            outbox: Arc::default(),
        }
    }

    /// Messages accepted so far
    pub async fn sent(&self) -> Vec<OutgoingEmail> {
        self.outbox.read().await.clone()
    }

    /// Formatted `From` header
    pub fn from_header(&self) -> String {
        format!("{} <{}>", self.sender_name, self.sender_address)
    }
}

#[async_trait]
impl EmailSender for MemoryMailer {
    async fn send_email(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        if email.to.is_empty() && email.cc.is_empty() && email.bcc.is_empty() {
            return Err(MailError::Rejected("message has no recipients".to_string()));
        }
        if let Some(missing) = email.attach_files.iter().find(|f| !Path::new(f).exists()) {
            return Err(MailError::Rejected(format!(
                "failed to attach file {}",
                missing
            )));
        }

        info!(
            from = %self.from_header(),
            to = ?email.to,
            subject = %email.subject,
            "sent email"
        );
        self.outbox.write().await.push(email.clone());
        Ok(())
    }
}
