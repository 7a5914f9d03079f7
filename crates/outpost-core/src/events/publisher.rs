//! Publisher - exactly-once, ordered, fanned-out lifecycle events

use super::{EventSink, MailEvent, PublishOutcome, SendStatistics, SendStatisticsSnapshot};
use dashmap::DashMap;
use outpost_common::types::{EventKind, MessageId};
use outpost_common::{Error, Result};
use outpost_storage::{ConfigurationSetRepository, EventDestination};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

type LaneItem = (Arc<EventDestination>, Arc<MailEvent>);

/// Publishes message events once per `(message, kind)`.
///
/// Accepted events are counted, broadcast to in-process subscribers and
/// delivered to every matching destination of the message's configuration
/// set. Each `(sink, destination)` pair has one delivery lane, so a
/// destination sees events in publish order.
pub struct EventPublisher {
    published: DashMap<MessageId, BTreeSet<EventKind>>,
    configuration_sets: Arc<dyn ConfigurationSetRepository>,
    sinks: Vec<Arc<dyn EventSink>>,
    /// Keyed by sink index, configuration set and destination name
    lanes: DashMap<(usize, String, String), mpsc::UnboundedSender<LaneItem>>,
    subscribers: broadcast::Sender<MailEvent>,
    stats: SendStatistics,
}

impl EventPublisher {
    pub fn new(
        configuration_sets: Arc<dyn ConfigurationSetRepository>,
        sinks: Vec<Arc<dyn EventSink>>,
        subscription_capacity: usize,
    ) -> Self {
        let (subscribers, _) = broadcast::channel(subscription_capacity.max(1));
        Self {
            published: DashMap::new(),
            configuration_sets,
            sinks,
            lanes: DashMap::new(),
            subscribers,
            stats: SendStatistics::new(),
        }
    }

    /// Stream of every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MailEvent> {
        self.subscribers.subscribe()
    }

    pub fn statistics(&self) -> SendStatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Kinds already published for a message
    pub fn published_kinds(&self, id: MessageId) -> Vec<EventKind> {
        self.published
            .get(&id)
            .map(|kinds| kinds.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop dedup state for messages that are no longer tracked
    pub fn forget(&self, ids: &[MessageId]) {
        for id in ids {
            self.published.remove(id);
        }
    }

    pub async fn publish(&self, event: MailEvent) -> Result<PublishOutcome> {
        let kind = event.kind();
        {
            let mut kinds = self.published.entry(event.message_id).or_default();
            if kinds.contains(&kind) {
                debug!(message_id = %event.message_id, %kind, "Duplicate event ignored");
                return Ok(PublishOutcome::Duplicate);
            }
            check_order(kind, &kinds).map_err(|reason| {
                Error::EventOutOfOrder(format!(
                    "{} for message {}: {}",
                    kind, event.message_id, reason
                ))
            })?;
            kinds.insert(kind);
        }

        self.stats.record(kind);
        debug!(message_id = %event.message_id, %kind, "Event published");

        let event = Arc::new(event);
        // No subscribers is not an error
        let _ = self.subscribers.send(MailEvent::clone(&event));
        self.fan_out(event).await;

        Ok(PublishOutcome::Published)
    }

    async fn fan_out(&self, event: Arc<MailEvent>) {
        let Some(set_name) = event.configuration_set.as_deref() else {
            return;
        };

        let set = match self.configuration_sets.get(set_name).await {
            Ok(Some(set)) => set,
            Ok(None) => {
                debug!(configuration_set = set_name, "Configuration set gone, event not fanned out");
                return;
            }
            Err(e) => {
                warn!(configuration_set = set_name, "Failed to load configuration set: {}", e);
                return;
            }
        };

        for destination in set.event_destinations {
            if !destination.matches(event.kind()) || destination.target().is_none() {
                continue;
            }
            let destination = Arc::new(destination);
            for index in 0..self.sinks.len() {
                let key = (index, set_name.to_string(), destination.name.clone());
                self.enqueue(key, destination.clone(), event.clone());
            }
        }
    }

    fn enqueue(
        &self,
        key: (usize, String, String),
        destination: Arc<EventDestination>,
        event: Arc<MailEvent>,
    ) {
        let Some(sink) = self.sinks.get(key.0) else {
            return;
        };
        let lane = self
            .lanes
            .entry(key.clone())
            .or_insert_with(|| spawn_lane(sink.clone()))
            .clone();

        if let Err(mpsc::error::SendError((destination, event))) = lane.send((destination, event)) {
            warn!(
                destination = %destination.name,
                message_id = %event.message_id,
                "Event lane closed, event dropped"
            );
            self.lanes.remove(&key);
        }
    }
}

/// Deliver one lane's events in order until the publisher goes away
fn spawn_lane(sink: Arc<dyn EventSink>) -> mpsc::UnboundedSender<LaneItem> {
    let (tx, mut rx) = mpsc::unbounded_channel::<LaneItem>();
    tokio::spawn(async move {
        while let Some((destination, event)) = rx.recv().await {
            if let Err(e) = sink.deliver(&destination, &event).await {
                warn!(
                    sink = sink.name(),
                    destination = %destination.name,
                    message_id = %event.message_id,
                    "Event delivery failed: {}",
                    e
                );
            }
        }
    });
    tx
}

/// Per-message ordering rules, given the kinds already published
fn check_order(kind: EventKind, published: &BTreeSet<EventKind>) -> std::result::Result<(), &'static str> {
    let has = |k: EventKind| published.contains(&k);
    match kind {
        EventKind::Send if has(EventKind::RenderingFailure) => Err("message failed to render"),
        EventKind::Send if has(EventKind::Reject) => Err("message was rejected"),
        EventKind::Delivery | EventKind::Bounce if !has(EventKind::Send) => {
            Err("no Send event yet")
        }
        EventKind::Delivery if has(EventKind::Bounce) => Err("message already bounced"),
        EventKind::Bounce if has(EventKind::Delivery) => Err("message already delivered"),
        EventKind::Complaint if !has(EventKind::Delivery) => Err("message was not delivered"),
        EventKind::RenderingFailure if has(EventKind::Send) => Err("message already sent"),
        EventKind::Reject if has(EventKind::Send) => Err("message already sent"),
        _ => Ok(()),
    }
}
