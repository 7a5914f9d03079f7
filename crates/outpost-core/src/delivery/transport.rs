//! Mail transports - the network handoff to the downstream MTA

use async_trait::async_trait;
use lettre::address::Envelope as SmtpEnvelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use outpost_common::config::SmtpRelayConfig;
use outpost_common::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// SMTP envelope of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
}

/// Result of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted by the downstream MTA
    Delivered { response: String },
    /// Worth retrying later (network error, 4xx, timeout)
    TransientFailure { reason: String },
    /// Hard bounce; never retried
    PermanentFailure { reason: String },
}

/// Something that can hand a finished MIME document to the next hop
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, envelope: &Envelope, message: &[u8]) -> DeliveryOutcome;
}

/// Relays every message through one configured SMTP server
pub struct SmtpRelayTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpRelayTransport {
    pub fn new(config: &SmtpRelayConfig, timeout: Duration) -> Result<Self> {
        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| Error::Config(format!("invalid SMTP relay: {}", e)))?
        } else if config.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| Error::Config(format!("invalid SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        builder = builder.port(config.port).timeout(Some(timeout));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
        })
    }

    fn smtp_envelope(envelope: &Envelope) -> std::result::Result<SmtpEnvelope, String> {
        let from = envelope
            .from
            .parse::<Address>()
            .map_err(|e| format!("invalid envelope sender {}: {}", envelope.from, e))?;
        let to = envelope
            .to
            .iter()
            .map(|r| {
                r.parse::<Address>()
                    .map_err(|e| format!("invalid envelope recipient {}: {}", r, e))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        SmtpEnvelope::new(Some(from), to).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl MailTransport for SmtpRelayTransport {
    async fn send(&self, envelope: &Envelope, message: &[u8]) -> DeliveryOutcome {
        let smtp_envelope = match Self::smtp_envelope(envelope) {
            Ok(e) => e,
            Err(reason) => return DeliveryOutcome::PermanentFailure { reason },
        };

        match self.mailer.send_raw(&smtp_envelope, message).await {
            Ok(response) => {
                debug!("Relay accepted message: {:?}", response);
                DeliveryOutcome::Delivered {
                    response: response.message().collect::<Vec<_>>().join(" "),
                }
            }
            Err(e) => classify_smtp_error(&e),
        }
    }
}

/// Hard bounces are permanent 5xx replies; everything else is retried
fn classify_smtp_error(e: &lettre::transport::smtp::Error) -> DeliveryOutcome {
    let reason = e.to_string();
    if e.is_permanent() || reason.contains("5.1.1") || reason.contains("User unknown") {
        DeliveryOutcome::PermanentFailure { reason }
    } else {
        DeliveryOutcome::TransientFailure { reason }
    }
}
