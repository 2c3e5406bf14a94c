// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Change-notification bus.
//!
//! Every status mutation publishes a [`ChangeEvent`] on a [`Topic`]. API
//! layers subscribe to a topic and push the IDs to streaming clients, which
//! then re-read the records. Events carry IDs only.

use std::pin::Pin;

use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// Default buffered events per subscriber.
const DEFAULT_CAPACITY: usize = 1000;

/// Entity family an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Topic {
    /// Workflow definitions (their latest execution summary changed).
    Workflow,
    /// Workflow executions and their stage/step executions.
    WorkflowExecution,
}

/// What happened to the entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Created.
    Create,
    /// Updated.
    Update,
    /// Deleted.
    Delete,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    /// Topic the event was published on
    pub topic: Topic,
    /// Change kind
    pub kind: EventKind,
    /// IDs of the changed entities
    pub ids: Vec<i64>,
}

impl ChangeEvent {
    /// An update event for one entity.
    pub fn updated(topic: Topic, id: i64) -> Self {
        Self {
            topic,
            kind: EventKind::Update,
            ids: vec![id],
        }
    }
}

/// Boxed stream of events returned by [`ChangeBus::subscribe`].
pub type EventStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// In-process pub/sub over a broadcast channel.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Publishing with no subscribers is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.sender.send(event);
    }

    /// Publish an update of one entity.
    pub fn publish_update(&self, topic: Topic, id: i64) {
        self.publish(ChangeEvent::updated(topic, id));
    }

    /// Subscribe to the events of one topic.
    ///
    /// A subscriber that falls behind skips the overflowed events and keeps
    /// going; the stream ends when the bus is dropped.
    pub fn subscribe(&self, topic: Topic) -> EventStream {
        let mut receiver = self.sender.subscribe();

        Box::pin(async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.topic == topic => yield event,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(?topic, skipped, "Change subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
