//! Delivery Worker Pool - hands queued messages to the downstream MTA

mod retry;
mod transport;
mod worker;

pub use retry::RetryPolicy;
pub use transport::{DeliveryOutcome, Envelope, MailTransport, SmtpRelayTransport};
pub use worker::DeliveryPool;
