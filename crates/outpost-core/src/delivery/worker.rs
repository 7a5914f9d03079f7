//! Delivery workers - claim, render, attempt, retry

use super::{DeliveryOutcome, MailTransport, RetryPolicy};
use crate::dispatch::{DeliveryJob, DispatchQueue, JobBody, TemplatedBody};
use crate::events::{EventDetail, EventPublisher, MailEvent};
use crate::identity::IdentityStore;
use crate::messages::MessageTracker;
use crate::render::{MimeHeaders, RenderEngine};
use outpost_common::config::SendingConfig;
use outpost_common::types::{BounceType, MessageState};
use outpost_common::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fixed-size pool consuming the dispatch queue
pub struct DeliveryPool {
    tracker: Arc<MessageTracker>,
    renderer: Arc<RenderEngine>,
    transport: Arc<dyn MailTransport>,
    events: Arc<EventPublisher>,
    /// Retries are put back here by timer tasks
    queue: DispatchQueue,
    policy: RetryPolicy,
    /// Maximum concurrent deliveries
    workers: usize,
    attempt_timeout: Duration,
    max_message_size: usize,
    /// Senders are re-checked against these before a message is claimed
    identities: Option<Arc<IdentityStore>>,
}

/// Sender authorization at claim time
enum SenderCheck {
    Authorized,
    Revoked(String),
    Unknown(String),
}

impl DeliveryPool {
    pub fn new(
        tracker: Arc<MessageTracker>,
        renderer: Arc<RenderEngine>,
        transport: Arc<dyn MailTransport>,
        events: Arc<EventPublisher>,
        queue: DispatchQueue,
    ) -> Self {
        let defaults = SendingConfig::default();
        Self {
            tracker,
            renderer,
            transport,
            events,
            queue,
            policy: RetryPolicy::default(),
            workers: defaults.workers,
            attempt_timeout: Duration::from_millis(defaults.attempt_timeout_ms),
            max_message_size: defaults.max_message_size,
            identities: None,
        }
    }

    /// Set worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set per-attempt timeout
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Largest rendered message handed to the transport
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Re-check sender authorization when a message is claimed
    pub fn with_sender_check(mut self, identities: Arc<IdentityStore>) -> Self {
        self.identities = Some(identities);
        self
    }

    /// Consume jobs until the queue closes or shutdown is requested
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::Receiver<DeliveryJob>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.workers));

        info!(
            "Delivery pool started (workers: {}, attempt timeout: {:?}, max attempts: {})",
            self.workers,
            self.attempt_timeout,
            self.policy.max_attempts()
        );

        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Worker semaphore closed: {}", e);
                    break;
                }
            };

            let pool = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                pool.process(job, &shutdown).await;
                drop(permit);
            });
        }

        info!("Delivery pool stopped");
    }

    async fn process(&self, mut job: DeliveryJob, shutdown: &CancellationToken) {
        if let JobBody::Templated(body) = &job.body {
            match self.render(&job, body).await {
                Some(mime) => job.body = JobBody::Mime(Arc::new(mime)),
                None => return,
            }
        }
        let JobBody::Mime(message) = job.body.clone() else {
            return;
        };

        if job.attempt == 0 {
            match self.check_sender(&job).await {
                SenderCheck::Authorized => {}
                SenderCheck::Revoked(reason) => {
                    warn!(message_id = %job.id, "Message rejected before delivery: {}", reason);
                    if self
                        .tracker
                        .transition(job.id, MessageState::Rejected, Some(reason.clone()))
                        .is_ok()
                    {
                        self.publish(MailEvent::new(
                            job.id,
                            job.configuration_set.clone(),
                            EventDetail::Reject { reason },
                        ))
                        .await;
                    }
                    return;
                }
                SenderCheck::Unknown(reason) => {
                    self.schedule_retry(job, &reason, shutdown);
                    return;
                }
            }
            if !self.tracker.claim(job.id) {
                debug!(message_id = %job.id, "Message no longer deliverable, job dropped");
                return;
            }
            self.publish(MailEvent::new(
                job.id,
                job.configuration_set.clone(),
                EventDetail::Send {
                    sender: job.envelope.from.clone(),
                    recipients: job.envelope.to.clone(),
                },
            ))
            .await;
        }

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.attempt_timeout,
            self.transport.send(&job.envelope, &message),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::TransientFailure {
                reason: format!("delivery attempt timed out after {:?}", self.attempt_timeout),
            },
        };

        match outcome {
            DeliveryOutcome::Delivered { response } => {
                self.tracker.record_attempt(job.id, None);
                info!(message_id = %job.id, attempt = job.attempt + 1, "Message delivered");
                if self.finish(&job, MessageState::Sent, None) {
                    self.publish(MailEvent::new(
                        job.id,
                        job.configuration_set.clone(),
                        EventDetail::Delivery {
                            recipients: job.envelope.to.clone(),
                            smtp_response: response,
                            processing_time_ms: started.elapsed().as_millis() as u64,
                        },
                    ))
                    .await;
                }
            }

            DeliveryOutcome::PermanentFailure { reason } => {
                self.tracker.record_attempt(job.id, Some(reason.clone()));
                warn!(message_id = %job.id, "Message bounced: {}", reason);
                if self.finish(&job, MessageState::Bounced, Some(reason.clone())) {
                    self.publish_bounce(&job, BounceType::Permanent, reason).await;
                }
            }

            DeliveryOutcome::TransientFailure { reason } => {
                job.attempt = self.tracker.record_attempt(job.id, Some(reason.clone()));
                if self.policy.should_retry(job.attempt) {
                    self.schedule_retry(job, &reason, shutdown);
                } else {
                    error!(
                        message_id = %job.id,
                        attempts = job.attempt,
                        "Delivery failed permanently after retries: {}",
                        reason
                    );
                    if self.finish(&job, MessageState::Failed, Some(reason.clone())) {
                        self.publish_bounce(&job, BounceType::Undetermined, reason).await;
                    }
                }
            }
        }
    }

    async fn check_sender(&self, job: &DeliveryJob) -> SenderCheck {
        let Some(identities) = &self.identities else {
            return SenderCheck::Authorized;
        };
        match identities.authorizes(&job.envelope.from).await {
            Ok(true) => SenderCheck::Authorized,
            Ok(false) => SenderCheck::Revoked(format!(
                "sender {} is no longer verified",
                job.envelope.from
            )),
            Err(e) => SenderCheck::Unknown(format!("sender lookup failed: {}", e)),
        }
    }

    /// Render a templated job; `None` means the job is finished
    async fn render(&self, job: &DeliveryJob, body: &TemplatedBody) -> Option<Vec<u8>> {
        if let Err(e) = self.tracker.transition(job.id, MessageState::Rendering, None) {
            debug!(message_id = %job.id, "Skipping render: {}", e);
            return None;
        }

        let message_id = self.renderer.message_id(job.id);
        let rendered = match self
            .renderer
            .render(&body.template, &body.substitutions, &body.defaults)
            .await
        {
            Ok(content) => self.renderer.build_mime(
                &MimeHeaders {
                    from: &body.from,
                    destination: &body.destination,
                    reply_to: &body.reply_to,
                    message_id: &message_id,
                },
                &content,
            ),
            Err(e) => Err(e),
        }
        .and_then(|mime| {
            if mime.len() > self.max_message_size {
                Err(Error::PayloadTooLarge {
                    size: mime.len(),
                    max: self.max_message_size,
                })
            } else {
                Ok(mime)
            }
        });

        match rendered {
            Ok(mime) => match self.tracker.transition(job.id, MessageState::Queued, None) {
                Ok(_) => Some(mime),
                Err(e) => {
                    debug!(message_id = %job.id, "Rendered message no longer deliverable: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!(
                    message_id = %job.id,
                    template = %body.template,
                    "Rendering failed: {}",
                    e
                );
                if self
                    .tracker
                    .transition(job.id, MessageState::Failed, Some(e.to_string()))
                    .is_ok()
                {
                    self.publish(MailEvent::new(
                        job.id,
                        job.configuration_set.clone(),
                        EventDetail::RenderingFailure {
                            template_name: body.template.clone(),
                            error_code: e.code(),
                            error_message: e.to_string(),
                        },
                    ))
                    .await;
                }
                None
            }
        }
    }

    /// Re-submit the job after its backoff, from a timer task.
    ///
    /// A retry still waiting at shutdown ends the message as `Failed`.
    fn schedule_retry(&self, job: DeliveryJob, reason: &str, shutdown: &CancellationToken) {
        let delay = self.policy.delay_for(job.attempt.max(1));
        warn!(
            message_id = %job.id,
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            "Delivery attempt failed, will retry: {}",
            reason
        );

        let queue = self.queue.clone();
        let tracker = self.tracker.clone();
        let events = self.events.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    abandon_retry(&tracker, &events, &job).await;
                }
                _ = tokio::time::sleep(delay) => {
                    let id = job.id;
                    if let Err(e) = queue.resubmit(job).await {
                        error!(message_id = %id, "Failed to re-queue retry: {}", e);
                    }
                }
            }
        });
    }

    fn finish(&self, job: &DeliveryJob, state: MessageState, error: Option<String>) -> bool {
        match self.tracker.transition(job.id, state, error) {
            Ok(_) => true,
            Err(e) => {
                error!(message_id = %job.id, "Failed to record delivery result: {}", e);
                false
            }
        }
    }

    async fn publish_bounce(&self, job: &DeliveryJob, bounce_type: BounceType, diagnostic: String) {
        self.publish(MailEvent::new(
            job.id,
            job.configuration_set.clone(),
            EventDetail::Bounce {
                bounce_type,
                recipients: job.envelope.to.clone(),
                diagnostic,
            },
        ))
        .await;
    }

    async fn publish(&self, event: MailEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish event: {}", e);
        }
    }
}

/// Close out a message whose retry was cut short by shutdown
async fn abandon_retry(tracker: &MessageTracker, events: &EventPublisher, job: &DeliveryJob) {
    let reason = "delivery abandoned at shutdown".to_string();
    if let Err(e) = tracker.transition(job.id, MessageState::Failed, Some(reason.clone())) {
        debug!(message_id = %job.id, "Retry dropped at shutdown: {}", e);
        return;
    }
    warn!(message_id = %job.id, attempts = job.attempt, "Retry abandoned at shutdown");

    // Only claimed messages have a Send event to close
    if job.attempt > 0 {
        let event = MailEvent::new(
            job.id,
            job.configuration_set.clone(),
            EventDetail::Bounce {
                bounce_type: BounceType::Undetermined,
                recipients: job.envelope.to.clone(),
                diagnostic: reason,
            },
        );
        if let Err(e) = events.publish(event).await {
            warn!("Failed to publish event: {}", e);
        }
    }
}
