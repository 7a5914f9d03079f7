//! Message Validator - envelope checks run before a message is accepted

use outpost_common::config::SendingConfig;
use outpost_common::types::{Destination, EmailAddress};
use outpost_common::{Error, Result};
use outpost_storage::Identity;

/// A send request as seen by the validator
#[derive(Debug, Clone)]
pub struct MessageDraft {
    /// Sender as given, possibly `Name <addr>`
    pub sender: String,
    pub destination: Destination,
    /// Serialized size in bytes
    pub size: usize,
}

/// A draft that passed every check
#[derive(Debug, Clone)]
pub struct ValidatedMessage {
    pub sender: EmailAddress,
    /// Sender as given, used for the `From` header
    pub sender_display: String,
    pub destination: Destination,
    /// Parsed To, Cc and Bcc recipients, in that order
    pub recipients: Vec<EmailAddress>,
    pub size: usize,
}

impl ValidatedMessage {
    pub fn recipient_count(&self) -> u64 {
        self.recipients.len() as u64
    }
}

/// Validator limits
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    max_recipients: usize,
    max_message_size: usize,
}

impl Validator {
    pub fn new(max_recipients: usize, max_message_size: usize) -> Self {
        Self {
            max_recipients,
            max_message_size,
        }
    }

    pub fn from_config(config: &SendingConfig) -> Self {
        Self::new(config.max_recipients, config.max_message_size)
    }

    /// Check a draft against the identities that could authorize its sender.
    ///
    /// Order: recipient shape, recipient count, size, sender verification.
    /// One malformed recipient rejects the whole message.
    pub fn validate(&self, draft: &MessageDraft, identities: &[Identity]) -> Result<ValidatedMessage> {
        let recipients = draft
            .destination
            .all()
            .map(|r| r.parse::<EmailAddress>())
            .collect::<Result<Vec<_>>>()?;

        if recipients.is_empty() {
            return Err(Error::InvalidParameter(
                "message must have at least one recipient".into(),
            ));
        }
        if recipients.len() > self.max_recipients {
            return Err(Error::TooManyRecipients {
                count: recipients.len(),
                max: self.max_recipients,
            });
        }

        if draft.size > self.max_message_size {
            return Err(Error::PayloadTooLarge {
                size: draft.size,
                max: self.max_message_size,
            });
        }

        let sender = EmailAddress::parse(&draft.sender)
            .ok_or_else(|| Error::InvalidParameter(format!("malformed sender: {}", draft.sender)))?;
        let address = sender.normalized();
        let authorized = identities
            .iter()
            .any(|identity| identity.is_verified() && identity.covers(&address));
        if !authorized {
            return Err(Error::SenderNotVerified(address));
        }

        Ok(ValidatedMessage {
            sender,
            sender_display: draft.sender.trim().to_string(),
            destination: draft.destination.clone(),
            recipients,
            size: draft.size,
        })
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::from_config(&SendingConfig::default())
    }
}
