//! Mailer - the send and management operations over one engine instance
//!
//! Send calls return as soon as a message is admitted to the queue. What
//! happens afterwards is reported only through lifecycle events, available
//! from `subscribe()` and the configuration set's event destinations.

use crate::delivery::{DeliveryPool, MailTransport, RetryPolicy};
use crate::dispatch::{Admission, DeliveryJob, Dispatcher, JobBody, TemplatedBody};
use crate::events::{
    EventDetail, EventPublisher, EventSink, MailEvent, PublishOutcome, SendStatisticsSnapshot,
};
use crate::identity::{validate_domain, IdentityStore, VerificationAttributes, VerificationChecker};
use crate::messages::{BodyKind, MessageRecord, MessageTracker};
use crate::raw::RawMessage;
use crate::render::{MimeHeaders, RenderEngine, RenderedContent};
use crate::throttle::ManagementThrottle;
use crate::validation::{MessageDraft, ValidatedMessage, Validator};
use chrono::Utc;
use outpost_common::config::Config;
use outpost_common::types::{
    Destination, EmailAddress, IdentityKind, MessageId, MessageState, SendQuota,
};
use outpost_common::{EntityKind, Error, Result};
use outpost_storage::memory::{
    MemoryConfigurationSetRepository, MemoryIdentityRepository, MemoryTemplateRepository,
};
use outpost_storage::{
    validate_name, ConfigurationSet, ConfigurationSetRepository, DatabasePool,
    DbConfigurationSetRepository, DbIdentityRepository, DbTemplateRepository, EventDestination,
    Template, TemplateContent, TemplateRepository,
};
use outpost_storage::IdentityRepository;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often quota reservations are aged out and finished messages pruned
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Reference data backends
#[derive(Clone)]
pub struct Stores {
    pub identities: Arc<dyn IdentityRepository>,
    pub configuration_sets: Arc<dyn ConfigurationSetRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    /// Pinged by readiness checks when the stores are Postgres-backed
    pub database: Option<DatabasePool>,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            identities: Arc::new(MemoryIdentityRepository::new()),
            configuration_sets: Arc::new(MemoryConfigurationSetRepository::new()),
            templates: Arc::new(MemoryTemplateRepository::new()),
            database: None,
        }
    }

    pub fn database(pool: DatabasePool) -> Self {
        Self {
            identities: Arc::new(DbIdentityRepository::new(pool.clone())),
            configuration_sets: Arc::new(DbConfigurationSetRepository::new(pool.clone())),
            templates: Arc::new(DbTemplateRepository::new(pool.clone())),
            database: Some(pool),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailRequest {
    pub source: String,
    pub destination: Destination,
    pub subject: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub reply_to: Vec<String>,
    #[serde(default)]
    pub configuration_set: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTemplatedEmailRequest {
    pub source: String,
    pub destination: Destination,
    pub template: String,
    #[serde(default)]
    pub template_data: Value,
    #[serde(default)]
    pub reply_to: Vec<String>,
    #[serde(default)]
    pub configuration_set: Option<String>,
}

/// One destination of a bulk send
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEntry {
    pub destination: Destination,
    /// Overrides the request's default data, token by token
    #[serde(default)]
    pub replacement_template_data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBulkTemplatedEmailRequest {
    pub source: String,
    pub template: String,
    #[serde(default)]
    pub default_template_data: Value,
    pub destinations: Vec<BulkEntry>,
    #[serde(default)]
    pub reply_to: Vec<String>,
    #[serde(default)]
    pub configuration_set: Option<String>,
}

/// Per-entry result of a bulk send, in request order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "PascalCase")]
pub enum BulkOutcome {
    #[serde(rename_all = "camelCase")]
    Success { message_id: MessageId },
    Failed { error: String, message: String },
}

#[derive(Debug, Clone, Default)]
pub struct RawEmailRequest {
    pub raw_message: Vec<u8>,
    /// Envelope recipients; empty means To, Cc and Bcc of the message
    pub destinations: Vec<String>,
    /// Envelope sender; defaults to the From header
    pub source: Option<String>,
    pub source_arn: Option<String>,
    pub from_arn: Option<String>,
    pub return_path_arn: Option<String>,
    pub configuration_set: Option<String>,
}

type PendingPool = (DeliveryPool, mpsc::Receiver<DeliveryJob>);

/// The engine: accept path, management stores and background tasks
pub struct Mailer {
    identities: Arc<IdentityStore>,
    configuration_sets: Arc<dyn ConfigurationSetRepository>,
    templates: Arc<dyn TemplateRepository>,
    validator: Validator,
    renderer: Arc<RenderEngine>,
    dispatcher: Dispatcher,
    tracker: Arc<MessageTracker>,
    events: Arc<EventPublisher>,
    throttle: ManagementThrottle,
    retention: chrono::Duration,
    max_message_size: usize,
    database: Option<DatabasePool>,
    /// Taken by `start`
    pending: Mutex<Option<PendingPool>>,
}

impl Mailer {
    pub fn new(
        config: &Config,
        stores: Stores,
        transport: Arc<dyn MailTransport>,
        checker: Arc<dyn VerificationChecker>,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Result<Self> {
        let tracker = Arc::new(MessageTracker::new());
        let renderer = Arc::new(RenderEngine::new(
            stores.templates.clone(),
            config.server.hostname.clone(),
        )?);
        let events = Arc::new(EventPublisher::new(
            stores.configuration_sets.clone(),
            sinks,
            config.events.subscription_capacity,
        ));
        let (dispatcher, jobs) = Dispatcher::new(
            &config.sending,
            stores.configuration_sets.clone(),
            tracker.clone(),
        );

        let identities = Arc::new(IdentityStore::new(
            stores.identities,
            checker,
            config.verification.clone(),
        ));

        let pool = DeliveryPool::new(
            tracker.clone(),
            renderer.clone(),
            transport,
            events.clone(),
            dispatcher.queue(),
        )
        .with_workers(config.sending.workers)
        .with_attempt_timeout(Duration::from_millis(config.sending.attempt_timeout_ms))
        .with_retry_policy(RetryPolicy::from_config(&config.retry))
        .with_max_message_size(config.sending.max_message_size)
        .with_sender_check(identities.clone());

        Ok(Self {
            identities,
            max_message_size: config.sending.max_message_size,
            configuration_sets: stores.configuration_sets,
            templates: stores.templates,
            database: stores.database,
            validator: Validator::from_config(&config.sending),
            renderer,
            dispatcher,
            tracker,
            events,
            throttle: ManagementThrottle::from_config(&config.management),
            retention: chrono::Duration::hours(config.sending.message_retention_hours as i64),
            pending: Mutex::new(Some((pool, jobs))),
        })
    }

    /// Largest message accepted for sending, in bytes
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Whether the reference-data backend answers
    pub async fn storage_ready(&self) -> bool {
        let Some(database) = &self.database else {
            return true;
        };
        match database.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Storage not ready: {}", e);
                false
            }
        }
    }

    /// Spawn the delivery pool, the verification poller and maintenance
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let (pool, jobs) = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("mailer already started".into()))?;

        let mailer = self.clone();
        let maintenance_shutdown = shutdown.clone();
        let handles = vec![
            tokio::spawn(Arc::new(pool).run(jobs, shutdown.clone())),
            tokio::spawn(self.identities.clone().run_poller(shutdown)),
            tokio::spawn(async move { mailer.run_maintenance(maintenance_shutdown).await }),
        ];

        info!("Mailer started");
        Ok(handles)
    }

    /// Age out quota reservations and prune finished messages past retention
    pub fn maintain(&self) -> usize {
        self.dispatcher.refresh_quota();
        let pruned = self.tracker.prune(self.retention);
        self.events.forget(&pruned);
        pruned.len()
    }

    async fn run_maintenance(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = self.maintain();
                    if pruned > 0 {
                        debug!(pruned, "Pruned finished messages");
                    }
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MailEvent> {
        self.events.subscribe()
    }

    /// Jobs waiting for a worker
    pub fn queue_depth(&self) -> usize {
        self.dispatcher.queue().depth()
    }

    // ---- Sending ----

    pub async fn send_email(&self, request: SendEmailRequest) -> Result<MessageId> {
        let content = RenderedContent {
            subject: request.subject,
            html: request.html,
            text: request.text,
        };
        let size = content.subject.len()
            + content.html.as_ref().map_or(0, String::len)
            + content.text.as_ref().map_or(0, String::len);

        let message = self
            .validate(&request.source, &request.destination, size)
            .await?;
        if content.html.is_none() && content.text.is_none() {
            return Err(Error::InvalidParameter(
                "message needs a text or HTML body".into(),
            ));
        }

        let from = message.sender_display.clone();
        let destination = request.destination;
        let reply_to = request.reply_to;
        let renderer = &self.renderer;
        let admission = Admission {
            message,
            configuration_set: request.configuration_set,
            body_kind: BodyKind::Formatted,
            template: None,
        };

        self.dispatcher
            .enqueue(admission, |id| {
                let message_id = renderer.message_id(id);
                let mime = renderer.build_mime(
                    &MimeHeaders {
                        from: &from,
                        destination: &destination,
                        reply_to: &reply_to,
                        message_id: &message_id,
                    },
                    &content,
                )?;
                Ok(JobBody::Mime(Arc::new(mime)))
            })
            .await
    }

    pub async fn send_templated_email(&self, request: SendTemplatedEmailRequest) -> Result<MessageId> {
        let template = self.template_for_send(&request.template).await?;
        self.accept_templated(
            &request.source,
            &request.destination,
            &template,
            request.template_data,
            Value::Null,
            &request.reply_to,
            request.configuration_set,
        )
        .await
    }

    /// One outcome per entry, in order; a failing entry does not stop the rest
    pub async fn send_bulk_templated_email(
        &self,
        request: SendBulkTemplatedEmailRequest,
    ) -> Result<Vec<BulkOutcome>> {
        if request.destinations.is_empty() {
            return Err(Error::InvalidParameter(
                "bulk request needs at least one destination".into(),
            ));
        }
        let template = self.template_for_send(&request.template).await?;

        let mut outcomes = Vec::with_capacity(request.destinations.len());
        for entry in request.destinations {
            let result = self
                .accept_templated(
                    &request.source,
                    &entry.destination,
                    &template,
                    entry.replacement_template_data.unwrap_or(Value::Null),
                    request.default_template_data.clone(),
                    &request.reply_to,
                    request.configuration_set.clone(),
                )
                .await;
            outcomes.push(match result {
                Ok(message_id) => BulkOutcome::Success { message_id },
                Err(e) => BulkOutcome::Failed {
                    error: e.code(),
                    message: e.to_string(),
                },
            });
        }

        let accepted = outcomes
            .iter()
            .filter(|o| matches!(o, BulkOutcome::Success { .. }))
            .count();
        info!(
            template = %template.name,
            accepted,
            failed = outcomes.len() - accepted,
            "Bulk send processed"
        );
        Ok(outcomes)
    }

    pub async fn send_raw_email(&self, request: RawEmailRequest) -> Result<MessageId> {
        let raw = RawMessage::parse(&request.raw_message)?;
        let sender = request.source.clone().or_else(|| raw.from()).ok_or_else(|| {
            Error::InvalidParameter("raw message has no sender: set source or a From header".into())
        })?;
        let recipients = if request.destinations.is_empty() {
            raw.recipients()
        } else {
            request.destinations.clone()
        };
        for arn in [&request.source_arn, &request.from_arn, &request.return_path_arn]
            .into_iter()
            .flatten()
        {
            debug!(arn = %arn, "Sending authorization ARN not evaluated");
        }

        let message = self
            .validate(&sender, &Destination::to(recipients), request.raw_message.len())
            .await?;
        let renderer = &self.renderer;
        let admission = Admission {
            message,
            configuration_set: request.configuration_set,
            body_kind: BodyKind::Raw,
            template: None,
        };

        self.dispatcher
            .enqueue(admission, |id| {
                let bytes = raw.rewrite(&renderer.message_id(id), Utc::now())?;
                Ok(JobBody::Mime(Arc::new(bytes)))
            })
            .await
    }

    async fn validate(
        &self,
        sender: &str,
        destination: &Destination,
        size: usize,
    ) -> Result<ValidatedMessage> {
        let identities = match EmailAddress::parse(sender) {
            Some(address) => self.identities.sender_identities(&address).await?,
            None => Vec::new(),
        };
        self.validator.validate(
            &MessageDraft {
                sender: sender.to_string(),
                destination: destination.clone(),
                size,
            },
            &identities,
        )
    }

    async fn template_for_send(&self, name: &str) -> Result<Template> {
        self.templates
            .get(name)
            .await?
            .ok_or_else(|| Error::TemplateDoesNotExist(name.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn accept_templated(
        &self,
        source: &str,
        destination: &Destination,
        template: &Template,
        substitutions: Value,
        defaults: Value,
        reply_to: &[String],
        configuration_set: Option<String>,
    ) -> Result<MessageId> {
        let size = template.subject_part.len()
            + template.html_part.as_ref().map_or(0, String::len)
            + template.text_part.as_ref().map_or(0, String::len)
            + substitutions.to_string().len()
            + defaults.to_string().len();

        let message = self.validate(source, destination, size).await?;
        let body = TemplatedBody {
            template: template.name.clone(),
            substitutions,
            defaults,
            from: message.sender_display.clone(),
            destination: destination.clone(),
            reply_to: reply_to.to_vec(),
        };
        let admission = Admission {
            message,
            configuration_set,
            body_kind: BodyKind::Templated,
            template: Some(template.name.clone()),
        };

        self.dispatcher
            .enqueue(admission, move |_| Ok(JobBody::Templated(Box::new(body))))
            .await
    }

    // ---- Templates ----

    pub async fn create_template(&self, content: TemplateContent) -> Result<Template> {
        self.throttle.check("CreateTemplate")?;
        validate_name(&content.name)?;
        content.validate()?;
        let template = self.templates.create(content).await?;
        info!(template = %template.name, "Template created");
        Ok(template)
    }

    pub async fn get_template(&self, name: &str) -> Result<Template> {
        self.throttle.check("GetTemplate")?;
        self.templates
            .get(name)
            .await?
            .ok_or_else(|| Error::does_not_exist(EntityKind::Template, name))
    }

    pub async fn update_template(&self, content: TemplateContent) -> Result<Template> {
        self.throttle.check("UpdateTemplate")?;
        content.validate()?;
        self.templates.update(content).await
    }

    pub async fn delete_template(&self, name: &str) -> Result<()> {
        self.throttle.check("DeleteTemplate")?;
        self.templates.delete(name).await
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        self.throttle.check("ListTemplates")?;
        self.templates.list().await
    }

    /// Render a template with the given data, failing synchronously
    pub async fn test_render_template(&self, name: &str, data: &Value) -> Result<String> {
        self.throttle.check("TestRenderTemplate")?;
        self.renderer.preview(name, data).await
    }

    // ---- Identities ----

    /// Returns the token the mailbox owner must confirm
    pub async fn verify_email_identity(&self, address: &str) -> Result<String> {
        self.throttle.check("VerifyEmailIdentity")?;
        let identity = self.identities.verify_email(address).await?;
        Ok(identity.verification_token.unwrap_or_default())
    }

    pub async fn confirm_email_identity(&self, address: &str, token: &str) -> Result<()> {
        self.throttle.check("ConfirmEmailIdentity")?;
        self.identities.confirm_email(address, token).await.map(|_| ())
    }

    /// Returns the TXT record value proving control of the domain
    pub async fn verify_domain_identity(&self, domain: &str) -> Result<String> {
        self.throttle.check("VerifyDomainIdentity")?;
        self.identities.verify_domain(domain).await
    }

    pub async fn verify_domain_dkim(&self, domain: &str) -> Result<Vec<String>> {
        self.throttle.check("VerifyDomainDkim")?;
        self.identities.verify_domain_dkim(domain).await
    }

    pub async fn set_identity_dkim_enabled(&self, identity: &str, enabled: bool) -> Result<()> {
        self.throttle.check("SetIdentityDkimEnabled")?;
        self.identities
            .set_dkim_enabled(identity, enabled)
            .await
            .map(|_| ())
    }

    pub async fn get_identity_verification_attributes(
        &self,
        identities: &[String],
    ) -> Result<BTreeMap<String, VerificationAttributes>> {
        self.throttle.check("GetIdentityVerificationAttributes")?;
        self.identities.verification_attributes(identities).await
    }

    pub async fn list_identities(&self, kind: Option<IdentityKind>) -> Result<Vec<String>> {
        self.throttle.check("ListIdentities")?;
        self.identities.list(kind).await
    }

    /// Delete an identity and reject every unclaimed message it authorized.
    ///
    /// Messages whose sender is still covered by another verified identity
    /// are left alone.
    pub async fn delete_identity(&self, value: &str) -> Result<()> {
        self.throttle.check("DeleteIdentity")?;
        let removed = self.identities.delete(value).await?;
        let remaining = self.identities.verified().await?;

        let reason = format!("sender identity {} was deleted", removed.value);
        let rejected = self.tracker.reject_unclaimed(
            |sender| removed.covers(sender) && !remaining.iter().any(|i| i.covers(sender)),
            &reason,
        );

        if !rejected.is_empty() {
            warn!(
                identity = %removed.value,
                count = rejected.len(),
                "Unclaimed messages rejected"
            );
        }
        for record in rejected {
            self.publish(MailEvent::new(
                record.id,
                record.configuration_set,
                EventDetail::Reject {
                    reason: reason.clone(),
                },
            ))
            .await;
        }
        Ok(())
    }

    // ---- Configuration sets ----

    pub async fn create_configuration_set(&self, name: &str) -> Result<ConfigurationSet> {
        self.throttle.check("CreateConfigurationSet")?;
        validate_name(name)?;
        let set = self
            .configuration_sets
            .create(ConfigurationSet::new(name))
            .await?;
        info!(configuration_set = %set.name, "Configuration set created");
        Ok(set)
    }

    pub async fn describe_configuration_set(&self, name: &str) -> Result<ConfigurationSet> {
        self.throttle.check("DescribeConfigurationSet")?;
        self.configuration_sets
            .get(name)
            .await?
            .ok_or_else(|| Error::does_not_exist(EntityKind::ConfigurationSet, name))
    }

    pub async fn list_configuration_sets(&self) -> Result<Vec<String>> {
        self.throttle.check("ListConfigurationSets")?;
        Ok(self
            .configuration_sets
            .list()
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect())
    }

    pub async fn delete_configuration_set(&self, name: &str) -> Result<()> {
        self.throttle.check("DeleteConfigurationSet")?;
        self.configuration_sets.delete(name).await
    }

    pub async fn update_configuration_set_sending_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<()> {
        self.throttle.check("UpdateConfigurationSetSendingEnabled")?;
        self.configuration_sets
            .set_sending_enabled(name, enabled)
            .await?;
        info!(configuration_set = name, enabled, "Configuration set sending toggled");
        Ok(())
    }

    pub async fn set_configuration_set_tracking_domain(
        &self,
        name: &str,
        domain: Option<&str>,
    ) -> Result<ConfigurationSet> {
        self.throttle.check("SetConfigurationSetTrackingDomain")?;
        let domain = domain.map(validate_domain).transpose()?;
        self.configuration_sets
            .set_tracking_domain(name, domain)
            .await
    }

    pub async fn create_configuration_set_event_destination(
        &self,
        name: &str,
        destination: EventDestination,
    ) -> Result<ConfigurationSet> {
        self.throttle.check("CreateConfigurationSetEventDestination")?;
        destination.validate()?;
        self.configuration_sets
            .add_event_destination(name, destination)
            .await
    }

    pub async fn delete_configuration_set_event_destination(
        &self,
        name: &str,
        destination: &str,
    ) -> Result<ConfigurationSet> {
        self.throttle.check("DeleteConfigurationSetEventDestination")?;
        self.configuration_sets
            .remove_event_destination(name, destination)
            .await
    }

    // ---- Account ----

    pub fn get_send_quota(&self) -> Result<SendQuota> {
        self.throttle.check("GetSendQuota")?;
        Ok(self.dispatcher.send_quota())
    }

    pub fn get_send_statistics(&self) -> Result<SendStatisticsSnapshot> {
        self.throttle.check("GetSendStatistics")?;
        Ok(self.events.statistics())
    }

    pub fn update_account_sending_enabled(&self, enabled: bool) -> Result<()> {
        self.throttle.check("UpdateAccountSendingEnabled")?;
        self.dispatcher.set_sending_enabled(enabled);
        Ok(())
    }

    pub fn account_sending_enabled(&self) -> bool {
        self.dispatcher.sending_enabled()
    }

    // ---- Messages ----

    pub fn get_message(&self, id: MessageId) -> Result<MessageRecord> {
        self.throttle.check("GetMessage")?;
        self.tracker.require(id)
    }

    /// Cancel a message no worker has claimed yet
    pub fn cancel_message(&self, id: MessageId) -> Result<MessageRecord> {
        self.throttle.check("CancelMessage")?;
        let record = self.tracker.cancel(id)?;
        info!(message_id = %id, "Message cancelled");
        Ok(record)
    }

    /// Feedback-loop complaint for a delivered message
    pub async fn record_complaint(
        &self,
        id: MessageId,
        feedback_type: Option<String>,
    ) -> Result<PublishOutcome> {
        let record = self.tracker.require(id)?;
        if record.state != MessageState::Sent {
            return Err(Error::InvalidState(format!(
                "message {} is {}; complaints apply to sent messages only",
                id, record.state
            )));
        }
        self.events
            .publish(MailEvent::new(
                id,
                record.configuration_set,
                EventDetail::Complaint {
                    recipients: record.recipients,
                    feedback_type,
                },
            ))
            .await
    }

    async fn publish(&self, event: MailEvent) {
        let id = event.message_id;
        if let Err(e) = self.events.publish(event).await {
            error!(message_id = %id, "Failed to publish event: {}", e);
        }
    }
}
