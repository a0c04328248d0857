//! Mail transport

/// Recording in-memory transport
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by an [`EmailSender`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailError {
    /// Temporary failure, sending again may succeed
    #[error("transient mail failure: {0}")]
    Transient(String),

    /// The transport refused the message for good
    #[error("mail rejected: {0}")]
    Rejected(String),
}

/// A message handed to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    /// Subject line
    pub subject: String,
    /// HTML body
    pub content: String,
    /// Primary recipients
    pub to: Vec<String>,
    /// Carbon-copy recipients
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients
    pub bcc: Vec<String>,
    /// Paths of files to attach
    pub attach_files: Vec<String>,
}

impl OutgoingEmail {
    /// HTML message to `to` with no copies or attachments
    pub fn html(subject: impl Into<String>, content: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            content: content.into(),
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            attach_files: Vec::new(),
        }
    }
}

/// Sends messages to recipients
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Deliver `email`
    async fn send_email(&self, email: &OutgoingEmail) -> Result<(), MailError>;
}
