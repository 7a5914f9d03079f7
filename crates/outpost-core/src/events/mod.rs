//! Event Publisher - lifecycle events for accepted messages

mod publisher;
mod sinks;
mod stats;

pub use publisher::EventPublisher;
pub use sinks::{EventSink, LogSink, WebhookSink};
pub use stats::{SendStatistics, SendStatisticsSnapshot};

use chrono::{DateTime, Utc};
use outpost_common::types::{BounceType, EventKind, MessageId};
use serde::{Deserialize, Serialize};

/// Kind-specific event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "PascalCase")]
pub enum EventDetail {
    #[serde(rename_all = "camelCase")]
    Send {
        sender: String,
        recipients: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Reject { reason: String },
    #[serde(rename_all = "camelCase")]
    Delivery {
        recipients: Vec<String>,
        smtp_response: String,
        processing_time_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Bounce {
        bounce_type: BounceType,
        recipients: Vec<String>,
        diagnostic: String,
    },
    #[serde(rename_all = "camelCase")]
    Complaint {
        recipients: Vec<String>,
        feedback_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RenderingFailure {
        template_name: String,
        error_code: String,
        error_message: String,
    },
}

impl EventDetail {
    pub fn kind(&self) -> EventKind {
        match self {
            EventDetail::Send { .. } => EventKind::Send,
            EventDetail::Reject { .. } => EventKind::Reject,
            EventDetail::Delivery { .. } => EventKind::Delivery,
            EventDetail::Bounce { .. } => EventKind::Bounce,
            EventDetail::Complaint { .. } => EventKind::Complaint,
            EventDetail::RenderingFailure { .. } => EventKind::RenderingFailure,
        }
    }
}

/// A lifecycle event for one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailEvent {
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub configuration_set: Option<String>,
    #[serde(flatten)]
    pub detail: EventDetail,
}

impl MailEvent {
    pub fn new(
        message_id: MessageId,
        configuration_set: Option<String>,
        detail: EventDetail,
    ) -> Self {
        Self {
            message_id,
            timestamp: Utc::now(),
            configuration_set,
            detail,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.detail.kind()
    }
}

/// Result of a publish call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// An event of this kind was already published for the message
    Duplicate,
}
