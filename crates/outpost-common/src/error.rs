//! Error types for Outpost

use serde::Serialize;
use thiserror::Error;

/// Entities addressable by name through the management API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityKind {
    Identity,
    Template,
    ConfigurationSet,
    EventDestination,
    Message,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Identity => write!(f, "Identity"),
            EntityKind::Template => write!(f, "Template"),
            EntityKind::ConfigurationSet => write!(f, "ConfigurationSet"),
            EntityKind::EventDestination => write!(f, "EventDestination"),
            EntityKind::Message => write!(f, "Message"),
        }
    }
}

/// Which component family an error belongs to.
///
/// Callers switch on this rather than on individual variants when all they
/// need to know is whether to fix input, retry later, or wait for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Capacity,
    Existence,
    Delivery,
    Render,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Capacity => write!(f, "capacity"),
            ErrorKind::Existence => write!(f, "existence"),
            ErrorKind::Delivery => write!(f, "delivery"),
            ErrorKind::Render => write!(f, "render"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Main error type for Outpost
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed recipient address: {0}")]
    MalformedRecipient(String),

    #[error("Too many recipients: {count} (maximum {max})")]
    TooManyRecipients { count: usize, max: usize },

    #[error("Message too large: {size} bytes (maximum {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Email address is not verified: {0}")]
    SenderNotVerified(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Sending is paused for this account")]
    AccountSendingPaused,

    #[error("Sending is paused for configuration set {0}")]
    ConfigurationSetSendingPaused(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Rate exceeded for {0}")]
    Throttling(String),

    #[error("{entity} {name} does not exist")]
    DoesNotExist { entity: EntityKind, name: String },

    #[error("{entity} {name} already exists")]
    AlreadyExists { entity: EntityKind, name: String },

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Event out of order: {0}")]
    EventOutOfOrder(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Template {0} does not exist")]
    TemplateDoesNotExist(String),

    #[error("Attribute '{0}' is not present in the rendering data")]
    MissingRenderingAttribute(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Outpost
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a missing entity
    pub fn does_not_exist(entity: EntityKind, name: impl Into<String>) -> Self {
        Error::DoesNotExist {
            entity,
            name: name.into(),
        }
    }

    /// Shorthand for a duplicated entity
    pub fn already_exists(entity: EntityKind, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            entity,
            name: name.into(),
        }
    }

    /// Returns the component family of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedRecipient(_)
            | Error::TooManyRecipients { .. }
            | Error::PayloadTooLarge { .. }
            | Error::SenderNotVerified(_)
            | Error::InvalidParameter(_) => ErrorKind::Validation,
            Error::AccountSendingPaused
            | Error::ConfigurationSetSendingPaused(_)
            | Error::LimitExceeded(_)
            | Error::Throttling(_) => ErrorKind::Capacity,
            Error::DoesNotExist { .. } | Error::AlreadyExists { .. } => ErrorKind::Existence,
            Error::Delivery(_) | Error::EventOutOfOrder(_) | Error::InvalidState(_) => {
                ErrorKind::Delivery
            }
            Error::TemplateDoesNotExist(_)
            | Error::MissingRenderingAttribute(_)
            | Error::Render(_) => ErrorKind::Render,
            Error::Config(_) | Error::Database(_) | Error::Internal(_) | Error::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the caller may retry the same request once the condition clears
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Capacity
    }

    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::MalformedRecipient(_)
            | Error::TooManyRecipients { .. }
            | Error::SenderNotVerified(_)
            | Error::InvalidParameter(_)
            | Error::MissingRenderingAttribute(_)
            | Error::Render(_) => 400,
            Error::PayloadTooLarge { .. } => 413,
            Error::AccountSendingPaused | Error::ConfigurationSetSendingPaused(_) => 403,
            Error::LimitExceeded(_) | Error::Throttling(_) => 429,
            Error::DoesNotExist { .. } | Error::TemplateDoesNotExist(_) => 404,
            Error::AlreadyExists { .. } | Error::InvalidState(_) | Error::EventOutOfOrder(_) => {
                409
            }
            Error::Delivery(_) => 502,
            Error::Config(_) | Error::Database(_) | Error::Internal(_) | Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> String {
        match self {
            Error::MalformedRecipient(_) => "MalformedRecipient".to_string(),
            Error::TooManyRecipients { .. } => "TooManyRecipients".to_string(),
            Error::PayloadTooLarge { .. } => "PayloadTooLarge".to_string(),
            Error::SenderNotVerified(_) => "SenderNotVerified".to_string(),
            Error::InvalidParameter(_) => "InvalidParameterValue".to_string(),
            Error::AccountSendingPaused => "AccountSendingPaused".to_string(),
            Error::ConfigurationSetSendingPaused(_) => "ConfigurationSetSendingPaused".to_string(),
            Error::LimitExceeded(_) => "LimitExceeded".to_string(),
            Error::Throttling(_) => "Throttling".to_string(),
            Error::DoesNotExist { entity, .. } => format!("{}DoesNotExist", entity),
            Error::AlreadyExists { entity, .. } => format!("{}AlreadyExists", entity),
            Error::Delivery(_) => "DeliveryError".to_string(),
            Error::EventOutOfOrder(_) => "EventOutOfOrder".to_string(),
            Error::InvalidState(_) => "InvalidState".to_string(),
            Error::TemplateDoesNotExist(_) => "TemplateDoesNotExist".to_string(),
            Error::MissingRenderingAttribute(_) => "MissingRenderingAttribute".to_string(),
            Error::Render(_) => "InvalidRenderingParameter".to_string(),
            Error::Config(_) | Error::Database(_) | Error::Internal(_) | Error::Other(_) => {
                "InternalFailure".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::MalformedRecipient("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(Error::AccountSendingPaused.kind(), ErrorKind::Capacity);
        assert_eq!(
            Error::does_not_exist(EntityKind::Template, "t").kind(),
            ErrorKind::Existence
        );
        assert_eq!(
            Error::MissingRenderingAttribute("name".into()).kind(),
            ErrorKind::Render
        );
        assert_eq!(Error::Delivery("timeout".into()).kind(), ErrorKind::Delivery);
    }

    #[test]
    fn test_validation_codes() {
        let err = Error::MalformedRecipient("broken@".into());
        assert_eq!(err.code(), "MalformedRecipient");
        assert_eq!(err.status_code(), 400);
        assert_eq!(
            Error::TooManyRecipients { count: 51, max: 50 }.code(),
            "TooManyRecipients"
        );
    }

    #[test]
    fn test_existence_codes() {
        let err = Error::does_not_exist(EntityKind::ConfigurationSet, "marketing");
        assert_eq!(err.code(), "ConfigurationSetDoesNotExist");
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.to_string(), "ConfigurationSet marketing does not exist");

        let err = Error::already_exists(EntityKind::Template, "welcome");
        assert_eq!(err.code(), "TemplateAlreadyExists");
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_only_capacity_errors_are_retryable() {
        assert!(Error::LimitExceeded("quota".into()).is_retryable());
        assert!(Error::Throttling("CreateTemplate".into()).is_retryable());
        assert!(!Error::SenderNotVerified("a@b.com".into()).is_retryable());
        assert!(!Error::TemplateDoesNotExist("t".into()).is_retryable());
    }
}
