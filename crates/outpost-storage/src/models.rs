//! Reference data models

use chrono::{DateTime, Utc};
use outpost_common::types::{EventKind, IdentityKind, VerificationStatus};
use outpost_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A verified (or pending) sender identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Lower-cased email address or domain
    pub value: String,
    pub kind: IdentityKind,
    pub status: VerificationStatus,
    pub dkim_enabled: bool,
    #[serde(default)]
    pub dkim_tokens: Vec<String>,
    pub verification_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    /// New pending identity
    pub fn pending(value: &str, kind: IdentityKind, verification_token: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            value: value.to_lowercase(),
            kind,
            status: VerificationStatus::Pending,
            dkim_enabled: false,
            dkim_tokens: Vec::new(),
            verification_token,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Success
    }

    /// Whether this identity authorizes sending as `address`
    pub fn covers(&self, address: &str) -> bool {
        let address = address.to_lowercase();
        match self.kind {
            IdentityKind::EmailAddress => self.value == address,
            IdentityKind::Domain => address
                .rsplit_once('@')
                .map(|(_, domain)| domain == self.value)
                .unwrap_or(false),
        }
    }
}

/// CloudWatch destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudWatchDestination {
    pub namespace: String,
    #[serde(default)]
    pub dimension_names: Vec<String>,
}

/// Kinesis Firehose destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseDestination {
    pub delivery_stream: String,
}

/// SNS destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnsDestination {
    pub topic: String,
}

/// Where a configuration set sends lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDestination {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub matching_event_types: Vec<EventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_watch: Option<CloudWatchDestination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinesis_firehose: Option<FirehoseDestination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sns: Option<SnsDestination>,
}

fn default_enabled() -> bool {
    true
}

impl EventDestination {
    /// Destination matching the given kinds, with no external target
    pub fn new(name: impl Into<String>, matching_event_types: Vec<EventKind>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            matching_event_types,
            cloud_watch: None,
            kinesis_firehose: None,
            sns: None,
        }
    }

    pub fn with_sns(mut self, topic: impl Into<String>) -> Self {
        self.sns = Some(SnsDestination {
            topic: topic.into(),
        });
        self
    }

    pub fn with_firehose(mut self, delivery_stream: impl Into<String>) -> Self {
        self.kinesis_firehose = Some(FirehoseDestination {
            delivery_stream: delivery_stream.into(),
        });
        self
    }

    pub fn with_cloud_watch(mut self, namespace: impl Into<String>) -> Self {
        self.cloud_watch = Some(CloudWatchDestination {
            namespace: namespace.into(),
            dimension_names: Vec::new(),
        });
        self
    }

    /// Name of the external target, if any
    pub fn target(&self) -> Option<&str> {
        if let Some(cw) = &self.cloud_watch {
            return Some(&cw.namespace);
        }
        if let Some(fh) = &self.kinesis_firehose {
            return Some(&fh.delivery_stream);
        }
        self.sns.as_ref().map(|s| s.topic.as_str())
    }

    pub fn matches(&self, kind: EventKind) -> bool {
        self.enabled && self.matching_event_types.contains(&kind)
    }

    /// At most one of CloudWatch, Firehose and SNS may be set
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidParameter(
                "event destination name must not be empty".into(),
            ));
        }
        if self.matching_event_types.is_empty() {
            return Err(Error::InvalidParameter(format!(
                "event destination {} matches no event types",
                self.name
            )));
        }
        let targets = [
            self.cloud_watch.is_some(),
            self.kinesis_firehose.is_some(),
            self.sns.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if targets > 1 {
            return Err(Error::InvalidParameter(format!(
                "event destination {} may have at most one of CloudWatch, Firehose and SNS",
                self.name
            )));
        }
        Ok(())
    }
}

/// Named bundle of sending policy and event destinations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSet {
    pub name: String,
    pub sending_enabled: bool,
    #[serde(default)]
    pub event_destinations: Vec<EventDestination>,
    pub tracking_domain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConfigurationSet {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            sending_enabled: true,
            event_destinations: Vec::new(),
            tracking_domain: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Email template; every update replaces all parts at once
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    pub subject_part: String,
    pub html_part: Option<String>,
    pub text_part: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Template create/update input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateContent {
    pub name: String,
    pub subject_part: String,
    pub html_part: Option<String>,
    pub text_part: Option<String>,
}

impl TemplateContent {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidParameter("template name must not be empty".into()));
        }
        if self.html_part.is_none() && self.text_part.is_none() {
            return Err(Error::InvalidParameter(format!(
                "template {} needs an HTML or text part",
                self.name
            )));
        }
        Ok(())
    }

    pub fn into_template(self) -> Template {
        let now = Utc::now();
        Template {
            name: self.name,
            subject_part: self.subject_part,
            html_part: self.html_part,
            text_part: self.text_part,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Validate a configuration set or template name
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "invalid name '{}': use 1-64 ASCII letters, digits, '_' or '-'",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_identity_covers_addresses() {
        let identity = Identity::pending("Example.com", IdentityKind::Domain, None);
        assert!(identity.covers("alice@example.com"));
        assert!(identity.covers("BOB@EXAMPLE.COM"));
        assert!(!identity.covers("alice@other.com"));
        assert!(!identity.covers("alice@sub.example.com"));
    }

    #[test]
    fn test_event_destination_single_target() {
        let dest = EventDestination::new("d", vec![EventKind::Bounce]).with_sns("topic");
        assert!(dest.validate().is_ok());

        let dest = EventDestination::new("d", vec![EventKind::Bounce])
            .with_sns("topic")
            .with_firehose("stream");
        assert!(dest.validate().is_err());

        let dest = EventDestination::new("d", vec![]);
        assert!(dest.validate().is_err());
    }

    #[test]
    fn test_template_needs_a_body_part() {
        let content = TemplateContent {
            name: "welcome".into(),
            subject_part: "Hi".into(),
            html_part: None,
            text_part: None,
        };
        assert!(content.validate().is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("marketing-2024_q1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
    }
}
