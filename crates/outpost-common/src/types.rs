//! Common types for Outpost

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for accepted messages
pub type MessageId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an address of the shape `local@domain.tld`.
    ///
    /// Accepts `Display Name <local@domain.tld>` and checks only the
    /// bracketed part. The domain must contain at least one dot with
    /// non-empty labels on both sides of it.
    pub fn parse(s: &str) -> Option<Self> {
        let addr = extract_angle_addr(s.trim())?;
        if addr.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return None;
        }

        let (local, domain) = addr.rsplit_once('@')?;
        if local.is_empty() || local.contains('@') || domain.is_empty() {
            return None;
        }

        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
            return None;
        }
        if !domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return None;
        }

        Some(Self::new(local, domain.to_lowercase()))
    }

    /// The address in lower case, as used for identity lookups
    pub fn normalized(&self) -> String {
        format!("{}@{}", self.local.to_lowercase(), self.domain)
    }
}

/// Pull `addr` out of `Name <addr>`; a bare address is returned unchanged
fn extract_angle_addr(s: &str) -> Option<&str> {
    match (s.rfind('<'), s.rfind('>')) {
        (Some(open), Some(close)) if open < close && close == s.len() - 1 => {
            Some(s[open + 1..close].trim())
        }
        (None, None) => Some(s),
        _ => None,
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::MalformedRecipient(s.to_string()))
    }
}

/// Recipients of a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
}

impl Destination {
    /// Destination with only `To` recipients
    pub fn to<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            to: addresses.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// All recipients across To, Cc and Bcc
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Total recipient count
    pub fn len(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kind of verified identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum IdentityKind {
    EmailAddress,
    Domain,
}

impl std::fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityKind::EmailAddress => write!(f, "EmailAddress"),
            IdentityKind::Domain => write!(f, "Domain"),
        }
    }
}

impl std::str::FromStr for IdentityKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EmailAddress" => Ok(IdentityKind::EmailAddress),
            "Domain" => Ok(IdentityKind::Domain),
            other => Err(crate::Error::InvalidParameter(format!(
                "unknown identity kind {}",
                other
            ))),
        }
    }
}

/// Verification status of an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum VerificationStatus {
    Pending,
    Success,
    Failed,
    TemporaryFailure,
}

impl std::fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationStatus::Pending => write!(f, "Pending"),
            VerificationStatus::Success => write!(f, "Success"),
            VerificationStatus::Failed => write!(f, "Failed"),
            VerificationStatus::TemporaryFailure => write!(f, "TemporaryFailure"),
        }
    }
}

impl std::str::FromStr for VerificationStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(VerificationStatus::Pending),
            "Success" => Ok(VerificationStatus::Success),
            "Failed" => Ok(VerificationStatus::Failed),
            "TemporaryFailure" => Ok(VerificationStatus::TemporaryFailure),
            other => Err(crate::Error::InvalidParameter(format!(
                "unknown verification status {}",
                other
            ))),
        }
    }
}

/// Lifecycle state of an accepted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum MessageState {
    Accepted,
    Rendering,
    Queued,
    Sent,
    Bounced,
    Rejected,
    Failed,
    Cancelled,
}

impl MessageState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageState::Sent
                | MessageState::Bounced
                | MessageState::Rejected
                | MessageState::Failed
                | MessageState::Cancelled
        )
    }

    /// Whether `next` is a legal forward transition from `self`
    pub fn can_transition_to(&self, next: MessageState) -> bool {
        use MessageState::*;
        matches!(
            (self, next),
            (Accepted, Rendering)
                | (Accepted, Queued)
                | (Accepted, Rejected)
                | (Accepted, Cancelled)
                | (Rendering, Queued)
                | (Rendering, Failed)
                | (Rendering, Rejected)
                | (Queued, Sent)
                | (Queued, Bounced)
                | (Queued, Failed)
                | (Queued, Rejected)
                | (Queued, Cancelled)
        )
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageState::Accepted => "Accepted",
            MessageState::Rendering => "Rendering",
            MessageState::Queued => "Queued",
            MessageState::Sent => "Sent",
            MessageState::Bounced => "Bounced",
            MessageState::Rejected => "Rejected",
            MessageState::Failed => "Failed",
            MessageState::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle event kinds published for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum EventKind {
    Send,
    Reject,
    Delivery,
    Bounce,
    Complaint,
    RenderingFailure,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Send,
        EventKind::Reject,
        EventKind::Delivery,
        EventKind::Bounce,
        EventKind::Complaint,
        EventKind::RenderingFailure,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Send => "Send",
            EventKind::Reject => "Reject",
            EventKind::Delivery => "Delivery",
            EventKind::Bounce => "Bounce",
            EventKind::Complaint => "Complaint",
            EventKind::RenderingFailure => "RenderingFailure",
        };
        write!(f, "{}", s)
    }
}

/// Classification of a bounce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum BounceType {
    /// Recipient system refused the message for good
    Permanent,
    /// Retries were exhausted without a definitive answer
    Undetermined,
}

/// Account-wide send quota snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendQuota {
    pub max_24_hour_send: u64,
    pub sent_last_24_hours: u64,
    pub max_send_rate: f64,
}
