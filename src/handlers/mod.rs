//! Business task handlers

/// Verification email task
pub mod verify_email;

use crate::mail::EmailSender;
use crate::storage::Store;
use crate::task::registry::HandlerRegistry;
use crate::task::TaskKind;
use std::sync::Arc;
use verify_email::{PayloadSendVerifyEmail, SendVerifyEmailHandler};

/// Task kinds this deployment knows how to run.
///
/// Dispatch stays keyed by type name so foreign envelopes can still be
/// dead-lettered; an envelope whose type is not listed here is corrupt or
/// was produced by a newer deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownTask {
    /// Mail an address-confirmation link to a new user
    SendVerifyEmail,
}

impl KnownTask {
    /// Every known kind
    pub const ALL: [KnownTask; 1] = [KnownTask::SendVerifyEmail];

    /// Wire name of the kind
    pub fn type_name(self) -> &'static str {
        match self {
            KnownTask::SendVerifyEmail => PayloadSendVerifyEmail::TYPE,
        }
    }

    /// Kind for a wire name
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_name() == name)
    }
}

/// Collaborators shared by the handlers
#[derive(Clone)]
pub struct HandlerDeps {
    /// Persistence store
    pub store: Arc<dyn Store>,
    /// Mail transport
    pub mailer: Arc<dyn EmailSender>,
    /// Base URL for verification links
    pub verify_email_base_url: String,
}

/// Build the registry with a handler for every [`KnownTask`]
pub fn build_registry(deps: HandlerDeps) -> crate::Result<HandlerRegistry> {
    let mut builder = HandlerRegistry::builder();
    for kind in KnownTask::ALL {
        builder = match kind {
            KnownTask::SendVerifyEmail => builder.register(
                kind.type_name(),
                SendVerifyEmailHandler::new(
                    Arc::clone(&deps.store),
                    Arc::clone(&deps.mailer),
                    deps.verify_email_base_url.clone(),
                ),
            )?,
        };
    }
    Ok(builder.build())
}
