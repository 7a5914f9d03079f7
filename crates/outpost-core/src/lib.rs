//! Outpost Core
//!
//! The send pipeline: validation, admission control, rendering, delivery
//! and lifecycle events, plus the identity store and the facade that ties
//! them together.

pub mod delivery;
pub mod dispatch;
pub mod events;
pub mod identity;
pub mod mailer;
pub mod messages;
pub mod raw;
pub mod render;
pub mod throttle;
pub mod validation;

pub use delivery::{DeliveryOutcome, Envelope, MailTransport, RetryPolicy, SmtpRelayTransport};
pub use dispatch::{DeliveryJob, Dispatcher, JobBody, SendQuotaTracker, TokenBucket};
pub use events::{
    EventDetail, EventPublisher, EventSink, LogSink, MailEvent, PublishOutcome,
    SendStatisticsSnapshot, WebhookSink,
};
pub use identity::{
    DnsVerificationChecker, IdentityStore, VerificationAttributes, VerificationCheck,
    VerificationChecker,
};
pub use mailer::{
    BulkEntry, BulkOutcome, Mailer, RawEmailRequest, SendBulkTemplatedEmailRequest,
    SendEmailRequest, SendTemplatedEmailRequest, Stores,
};
pub use messages::{MessageRecord, MessageTracker};
pub use render::{RenderEngine, RenderedContent};
pub use throttle::ManagementThrottle;
pub use validation::{MessageDraft, ValidatedMessage, Validator};
