//! Dispatch Queue & Rate Limiter
//!
//! Admission control for validated messages: account and configuration set
//! pauses, the send-rate bucket and the rolling quota, then the hand-off to
//! the bounded delivery queue.

mod queue;
mod quota;
mod rate_limiter;

pub use queue::{DeliveryJob, DispatchQueue, JobBody, TemplatedBody};
pub use quota::{QuotaReservation, SendQuotaTracker};
pub use rate_limiter::TokenBucket;

use crate::delivery::Envelope;
use crate::messages::{BodyKind, MessageRecord, MessageTracker};
use crate::validation::ValidatedMessage;
use outpost_common::config::SendingConfig;
use outpost_common::types::{MessageId, MessageState, SendQuota};
use outpost_common::{EntityKind, Error, Result};
use outpost_storage::ConfigurationSetRepository;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// What the caller wants sent, minus the message id
pub struct Admission {
    pub message: ValidatedMessage,
    pub configuration_set: Option<String>,
    pub body_kind: BodyKind,
    pub template: Option<String>,
}

/// Accept-path gatekeeper in front of the delivery queue
pub struct Dispatcher {
    sending_enabled: AtomicBool,
    configuration_sets: Arc<dyn ConfigurationSetRepository>,
    send_rate: TokenBucket,
    quota: SendQuotaTracker,
    queue: DispatchQueue,
    tracker: Arc<MessageTracker>,
    max_message_size: usize,
}

impl Dispatcher {
    /// Build a dispatcher and the receiving end of its queue
    pub fn new(
        config: &SendingConfig,
        configuration_sets: Arc<dyn ConfigurationSetRepository>,
        tracker: Arc<MessageTracker>,
    ) -> (Self, mpsc::Receiver<DeliveryJob>) {
        let (queue, rx) = DispatchQueue::bounded(
            config.queue_capacity,
            Duration::from_millis(config.enqueue_timeout_ms),
        );
        let dispatcher = Self {
            sending_enabled: AtomicBool::new(config.enabled),
            configuration_sets,
            send_rate: TokenBucket::new(config.max_send_rate),
            quota: SendQuotaTracker::new(config.max_24_hour_send, config.max_send_rate),
            queue,
            tracker,
            max_message_size: config.max_message_size,
        };
        (dispatcher, rx)
    }

    /// Admit a message and put it on the queue.
    ///
    /// `build` produces the job body once the id is known. Nothing is
    /// recorded, and neither quota nor send rate is consumed, unless the
    /// job reaches the queue.
    pub async fn enqueue<F>(&self, admission: Admission, build: F) -> Result<MessageId>
    where
        F: FnOnce(MessageId) -> Result<JobBody>,
    {
        if !self.sending_enabled.load(Ordering::Acquire) {
            return Err(Error::AccountSendingPaused);
        }

        if let Some(name) = &admission.configuration_set {
            let set = self
                .configuration_sets
                .get(name)
                .await?
                .ok_or_else(|| Error::does_not_exist(EntityKind::ConfigurationSet, name))?;
            if !set.sending_enabled {
                return Err(Error::ConfigurationSetSendingPaused(name.clone()));
            }
        }

        let reservation = self.quota.reserve(admission.message.recipient_count())?;
        if !self.send_rate.try_acquire() {
            return Err(Error::LimitExceeded(format!(
                "maximum sending rate of {} messages per second exceeded",
                self.send_rate.rate()
            )));
        }

        let result = self.admit(admission, build).await;
        match result {
            Ok(id) => {
                reservation.commit();
                Ok(id)
            }
            Err(e) => {
                self.send_rate.refund();
                Err(e)
            }
        }
    }

    /// Build, record and queue an admitted message
    async fn admit<F>(&self, admission: Admission, build: F) -> Result<MessageId>
    where
        F: FnOnce(MessageId) -> Result<JobBody>,
    {
        let message = admission.message;
        let id = Uuid::now_v7();
        let body = build(id)?;
        if let JobBody::Mime(bytes) = &body {
            if bytes.len() > self.max_message_size {
                return Err(Error::PayloadTooLarge {
                    size: bytes.len(),
                    max: self.max_message_size,
                });
            }
        }

        let recipients: Vec<String> = message.recipients.iter().map(|r| r.to_string()).collect();
        let sender = message.sender.normalized();
        self.tracker.insert(MessageRecord::new(
            id,
            sender.clone(),
            recipients.clone(),
            admission.configuration_set.clone(),
            admission.body_kind,
            admission.template,
        ));
        if matches!(body, JobBody::Mime(_)) {
            self.tracker.transition(id, MessageState::Queued, None)?;
        }

        let job = DeliveryJob {
            id,
            envelope: Envelope {
                from: sender,
                to: recipients,
            },
            configuration_set: admission.configuration_set,
            body,
            attempt: 0,
        };

        if let Err(e) = self.queue.enqueue(job).await {
            self.tracker.remove(id);
            debug!(message_id = %id, "Enqueue failed: {}", e);
            return Err(e);
        }

        info!(
            message_id = %id,
            recipients = message.recipients.len(),
            "Message accepted"
        );
        Ok(id)
    }

    pub fn queue(&self) -> DispatchQueue {
        self.queue.clone()
    }

    pub fn set_sending_enabled(&self, enabled: bool) {
        self.sending_enabled.store(enabled, Ordering::Release);
        info!(enabled, "Account sending toggled");
    }

    pub fn sending_enabled(&self) -> bool {
        self.sending_enabled.load(Ordering::Acquire)
    }

    pub fn send_quota(&self) -> SendQuota {
        self.quota.snapshot()
    }

    /// Age old reservations out of the quota window
    pub fn refresh_quota(&self) {
        self.quota.refresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_common::types::{Destination, EmailAddress};
    use outpost_storage::memory::MemoryConfigurationSetRepository;
    use outpost_storage::ConfigurationSet;
    use pretty_assertions::assert_eq;

    fn admission(recipients: usize, configuration_set: Option<&str>) -> Admission {
        let to: Vec<String> = (0..recipients)
            .map(|i| format!("user{}@example.org", i))
            .collect();
        Admission {
            message: ValidatedMessage {
                sender: EmailAddress::parse("sender@example.com").unwrap(),
                sender_display: "sender@example.com".into(),
                recipients: to.iter().map(|r| EmailAddress::parse(r).unwrap()).collect(),
                destination: Destination::to(to),
                size: 100,
            },
            configuration_set: configuration_set.map(String::from),
            body_kind: BodyKind::Formatted,
            template: None,
        }
    }

    fn mime(_: MessageId) -> Result<JobBody> {
        Ok(JobBody::Mime(Arc::new(b"Subject: x\r\n\r\ny".to_vec())))
    }

    fn sending_config() -> SendingConfig {
        SendingConfig {
            max_send_rate: 0.0,
            max_24_hour_send: 10,
            queue_capacity: 100,
            ..Default::default()
        }
    }

    fn dispatcher(
        config: &SendingConfig,
    ) -> (
        Dispatcher,
        mpsc::Receiver<DeliveryJob>,
        Arc<MemoryConfigurationSetRepository>,
        Arc<MessageTracker>,
    ) {
        let sets = Arc::new(MemoryConfigurationSetRepository::new());
        let tracker = Arc::new(MessageTracker::new());
        let (dispatcher, rx) = Dispatcher::new(config, sets.clone(), tracker.clone());
        (dispatcher, rx, sets, tracker)
    }

    #[tokio::test]
    async fn test_accepted_message_is_queued() {
        let (dispatcher, mut rx, _, tracker) = dispatcher(&sending_config());
        let id = dispatcher.enqueue(admission(2, None), mime).await.unwrap();

        let job = rx.recv().await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.envelope.to.len(), 2);
        assert_eq!(tracker.get(id).unwrap().state, MessageState::Queued);
        assert_eq!(dispatcher.send_quota().sent_last_24_hours, 2);
    }

    #[tokio::test]
    async fn test_account_paused() {
        let (dispatcher, _rx, _, _) = dispatcher(&sending_config());
        dispatcher.set_sending_enabled(false);
        let err = dispatcher.enqueue(admission(1, None), mime).await.unwrap_err();
        assert_eq!(err.code(), "AccountSendingPaused");
    }

    #[tokio::test]
    async fn test_configuration_set_checks() {
        let (dispatcher, _rx, sets, _) = dispatcher(&sending_config());

        let err = dispatcher
            .enqueue(admission(1, Some("missing")), mime)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ConfigurationSetDoesNotExist");

        sets.create(ConfigurationSet::new("paused")).await.unwrap();
        sets.set_sending_enabled("paused", false).await.unwrap();
        let err = dispatcher
            .enqueue(admission(1, Some("paused")), mime)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ConfigurationSetSendingPaused");
        assert_eq!(dispatcher.send_quota().sent_last_24_hours, 0);
    }

    #[tokio::test]
    async fn test_quota_counts_recipients() {
        let (dispatcher, _rx, _, _) = dispatcher(&sending_config());
        dispatcher.enqueue(admission(6, None), mime).await.unwrap();

        let err = dispatcher.enqueue(admission(5, None), mime).await.unwrap_err();
        assert_eq!(err.code(), "LimitExceeded");
        assert!(dispatcher.enqueue(admission(4, None), mime).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_enqueue_releases_quota() {
        let config = SendingConfig {
            queue_capacity: 1,
            enqueue_timeout_ms: 10,
            ..sending_config()
        };
        let (dispatcher, _rx, _, tracker) = dispatcher(&config);
        dispatcher.enqueue(admission(1, None), mime).await.unwrap();

        let err = dispatcher.enqueue(admission(1, None), mime).await.unwrap_err();
        assert_eq!(err.code(), "LimitExceeded");
        assert_eq!(dispatcher.send_quota().sent_last_24_hours, 1);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rate_limit() {
        let config = SendingConfig {
            max_send_rate: 2.0,
            ..sending_config()
        };
        let (dispatcher, _rx, _, _) = dispatcher(&config);
        dispatcher.enqueue(admission(1, None), mime).await.unwrap();
        dispatcher.enqueue(admission(1, None), mime).await.unwrap();

        let err = dispatcher.enqueue(admission(1, None), mime).await.unwrap_err();
        assert_eq!(err.code(), "LimitExceeded");

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(dispatcher.enqueue(admission(1, None), mime).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_admission_keeps_send_rate_token() {
        let config = SendingConfig {
            max_send_rate: 1.0,
            max_24_hour_send: 3,
            queue_capacity: 1,
            enqueue_timeout_ms: 10,
            ..sending_config()
        };
        let (dispatcher, mut rx, _, _) = dispatcher(&config);

        // Over quota: refused before the rate bucket is touched
        let err = dispatcher.enqueue(admission(4, None), mime).await.unwrap_err();
        assert_eq!(err.code(), "LimitExceeded");
        assert!(dispatcher.enqueue(admission(1, None), mime).await.is_ok());

        tokio::time::advance(Duration::from_secs(1)).await;
        // Queue full: the token is handed back
        let err = dispatcher.enqueue(admission(1, None), mime).await.unwrap_err();
        assert_eq!(err.code(), "LimitExceeded");
        rx.recv().await.unwrap();
        assert!(dispatcher.enqueue(admission(1, None), mime).await.is_ok());
        assert_eq!(dispatcher.send_quota().sent_last_24_hours, 2);
    }

    #[tokio::test]
    async fn test_oversized_mime_is_refused() {
        let config = SendingConfig {
            max_message_size: 64,
            ..sending_config()
        };
        let (dispatcher, _rx, _, tracker) = dispatcher(&config);

        let err = dispatcher
            .enqueue(admission(1, None), |_| {
                Ok(JobBody::Mime(Arc::new(vec![b'x'; 65])))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PayloadTooLarge");
        assert!(tracker.is_empty());
        assert_eq!(dispatcher.send_quota().sent_last_24_hours, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_enqueue_respects_quota() {
        let config = SendingConfig {
            max_24_hour_send: 500,
            queue_capacity: 1000,
            ..sending_config()
        };
        let (dispatcher, _rx, _, _) = dispatcher(&config);
        let dispatcher = Arc::new(dispatcher);

        let mut handles = Vec::new();
        for _ in 0..1000 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.enqueue(admission(1, None), mime).await
            }));
        }

        let mut accepted = 0;
        let mut limited = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => {
                    assert_eq!(e.code(), "LimitExceeded");
                    limited += 1;
                }
            }
        }

        assert_eq!(accepted, 500);
        assert_eq!(limited, 500);
        assert_eq!(dispatcher.send_quota().sent_last_24_hours, 500);
    }
}
