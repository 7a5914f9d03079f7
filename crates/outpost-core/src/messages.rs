//! Message tracker - lifecycle state of every accepted message

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use outpost_common::types::{MessageId, MessageState};
use outpost_common::{EntityKind, Error, Result};
use serde::Serialize;
use tracing::debug;

/// How the message body was supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum BodyKind {
    Formatted,
    Templated,
    Raw,
}

/// Tracked state of one message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender: String,
    pub recipients: Vec<String>,
    pub configuration_set: Option<String>,
    pub body_kind: BodyKind,
    pub template: Option<String>,
    pub state: MessageState,
    /// Every state the message has been in, oldest first
    pub history: Vec<MessageState>,
    /// Delivery attempts started
    pub attempts: u32,
    /// Set once a worker owns the message; never cleared
    pub claimed: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(
        id: MessageId,
        sender: impl Into<String>,
        recipients: Vec<String>,
        configuration_set: Option<String>,
        body_kind: BodyKind,
        template: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            sender: sender.into(),
            recipients,
            configuration_set,
            body_kind,
            template,
            state: MessageState::Accepted,
            history: vec![MessageState::Accepted],
            attempts: 0,
            claimed: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Concurrent map of message records.
///
/// Every mutation runs under the map's per-entry lock, so state checks and
/// the writes that depend on them are atomic per message.
#[derive(Debug, Default)]
pub struct MessageTracker {
    records: DashMap<MessageId, MessageRecord>,
}

impl MessageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: MessageRecord) {
        self.records.insert(record.id, record);
    }

    /// Forget a message that never made it onto the queue
    pub fn remove(&self, id: MessageId) -> Option<MessageRecord> {
        self.records.remove(&id).map(|(_, record)| record)
    }

    pub fn get(&self, id: MessageId) -> Option<MessageRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    pub fn require(&self, id: MessageId) -> Result<MessageRecord> {
        self.get(id)
            .ok_or_else(|| Error::does_not_exist(EntityKind::Message, id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Move a message forward; illegal transitions fail with `InvalidState`
    pub fn transition(
        &self,
        id: MessageId,
        next: MessageState,
        error: Option<String>,
    ) -> Result<MessageRecord> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::does_not_exist(EntityKind::Message, id.to_string()))?;

        if !record.state.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "message {} cannot move from {} to {}",
                id, record.state, next
            )));
        }

        record.state = next;
        record.history.push(next);
        if error.is_some() {
            record.last_error = error;
        }
        record.updated_at = Utc::now();
        debug!(message_id = %id, state = %next, "Message state changed");
        Ok(record.value().clone())
    }

    /// Take ownership of a queued message for delivery.
    ///
    /// Returns false when the message is already claimed or has left
    /// `Queued`, in which case the caller must drop its job.
    pub fn claim(&self, id: MessageId) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) if record.state == MessageState::Queued && !record.claimed => {
                record.claimed = true;
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Count a delivery attempt, returning the new total
    pub fn record_attempt(&self, id: MessageId, error: Option<String>) -> u32 {
        match self.records.get_mut(&id) {
            Some(mut record) => {
                record.attempts += 1;
                if error.is_some() {
                    record.last_error = error;
                }
                record.updated_at = Utc::now();
                record.attempts
            }
            None => 0,
        }
    }

    /// Cancel a message that no worker has claimed yet
    pub fn cancel(&self, id: MessageId) -> Result<MessageRecord> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::does_not_exist(EntityKind::Message, id.to_string()))?;

        if record.claimed || !record.state.can_transition_to(MessageState::Cancelled) {
            return Err(Error::InvalidState(format!(
                "message {} is {} and can no longer be cancelled",
                id, record.state
            )));
        }

        record.state = MessageState::Cancelled;
        record.history.push(MessageState::Cancelled);
        record.updated_at = Utc::now();
        Ok(record.value().clone())
    }

    /// Reject every unclaimed message whose sender matches `predicate`
    pub fn reject_unclaimed<F>(&self, predicate: F, reason: &str) -> Vec<MessageRecord>
    where
        F: Fn(&str) -> bool,
    {
        let mut rejected = Vec::new();
        for mut record in self.records.iter_mut() {
            if record.claimed
                || !record.state.can_transition_to(MessageState::Rejected)
                || !predicate(&record.sender)
            {
                continue;
            }
            record.state = MessageState::Rejected;
            record.history.push(MessageState::Rejected);
            record.last_error = Some(reason.to_string());
            record.updated_at = Utc::now();
            rejected.push(record.value().clone());
        }
        rejected
    }

    /// Drop terminal records last touched before `retention` ago
    pub fn prune(&self, retention: Duration) -> Vec<MessageId> {
        let cutoff = Utc::now() - retention;
        let expired: Vec<MessageId> = self
            .records
            .iter()
            .filter(|r| r.state.is_terminal() && r.updated_at < cutoff)
            .map(|r| r.id)
            .collect();

        for id in &expired {
            self.records.remove(id);
        }
        expired
    }
}
