//! Bounded dispatch queue between the accept path and the delivery workers

use crate::delivery::Envelope;
use outpost_common::types::{Destination, MessageId};
use outpost_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

/// Template reference rendered by the worker before the first attempt
#[derive(Debug, Clone)]
pub struct TemplatedBody {
    pub template: String,
    pub substitutions: serde_json::Value,
    pub defaults: serde_json::Value,
    /// `From` header value
    pub from: String,
    pub destination: Destination,
    pub reply_to: Vec<String>,
}

/// Message payload carried by a job
#[derive(Debug, Clone)]
pub enum JobBody {
    /// Finished MIME document
    Mime(Arc<Vec<u8>>),
    Templated(Box<TemplatedBody>),
}

/// One unit of work for the delivery pool
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub id: MessageId,
    pub envelope: Envelope,
    pub configuration_set: Option<String>,
    pub body: JobBody,
    /// Failed attempts so far; non-zero jobs are retries of a claimed message
    pub attempt: u32,
}

/// Producer side of the queue
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<DeliveryJob>,
    enqueue_timeout: Duration,
}

impl DispatchQueue {
    /// Create a queue holding at most `capacity` jobs
    pub fn bounded(
        capacity: usize,
        enqueue_timeout: Duration,
    ) -> (Self, mpsc::Receiver<DeliveryJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                enqueue_timeout,
            },
            rx,
        )
    }

    /// Admit a new job, waiting at most the enqueue timeout for space
    pub async fn enqueue(&self, job: DeliveryJob) -> Result<()> {
        match self.tx.send_timeout(job, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(Error::LimitExceeded(
                "dispatch queue is full".to_string(),
            )),
            Err(SendTimeoutError::Closed(_)) => {
                Err(Error::Internal("dispatch queue is closed".to_string()))
            }
        }
    }

    /// Put a retry back on the queue; waits for space instead of failing
    pub async fn resubmit(&self, job: DeliveryJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| Error::Internal("dispatch queue is closed".to_string()))
    }

    /// Jobs currently waiting
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn job() -> DeliveryJob {
        DeliveryJob {
            id: Uuid::now_v7(),
            envelope: Envelope {
                from: "a@example.com".into(),
                to: vec!["b@example.org".into()],
            },
            configuration_set: None,
            body: JobBody::Mime(Arc::new(b"Subject: hi\r\n\r\nbody".to_vec())),
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_full_queue_fails_after_timeout() {
        let (queue, mut rx) = DispatchQueue::bounded(2, Duration::from_millis(20));
        queue.enqueue(job()).await.unwrap();
        queue.enqueue(job()).await.unwrap();
        assert_eq!(queue.depth(), 2);

        let err = queue.enqueue(job()).await.unwrap_err();
        assert_eq!(err.code(), "LimitExceeded");

        rx.recv().await.unwrap();
        assert!(queue.enqueue(job()).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (queue, rx) = DispatchQueue::bounded(2, Duration::from_millis(20));
        drop(rx);
        let err = queue.enqueue(job()).await.unwrap_err();
        assert_eq!(err.code(), "InternalFailure");
    }
}
