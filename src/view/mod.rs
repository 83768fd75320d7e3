//! Cumulative view over snapshots from any number of monitored contexts.
//!
//! Builds the connection graph relating each publisher session to the
//! subscriber endpoints that have joined it, locally or in another
//! monitored process. The graph is monotonically additive: once an edge
//! is recorded it persists even if a later snapshot no longer reports
//! the subscriber. Index growth is unbounded by design; see the
//! operational notes in DESIGN.md.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::aggregator::SnapshotConsumer;
use crate::model::{
    ChannelSessionKey, PublisherCounters, Snapshot, StreamKey, SubscriberCounters, SystemCounters,
};

/// Connection graph: stream -> publisher -> joined subscriber endpoints.
pub type ConnectionsByStream =
    HashMap<StreamKey, HashMap<ChannelSessionKey, HashSet<ChannelSessionKey>>>;

/// Aggregate view across monitored contexts.
#[derive(Default)]
pub struct SystemView {
    connections_by_stream: ConnectionsByStream,
    publishers: HashMap<ChannelSessionKey, PublisherCounters>,
    subscribers: HashMap<ChannelSessionKey, SubscriberCounters>,
    system_by_context: HashMap<String, SystemCounters>,
}

impl SystemView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest system counters, keyed by context label.
    pub fn system_counters(&self) -> &HashMap<String, SystemCounters> {
        &self.system_by_context
    }

    /// The stream-keyed connection graph.
    pub fn connections_by_stream(&self) -> &ConnectionsByStream {
        &self.connections_by_stream
    }

    /// Latest counters for a publisher participant.
    pub fn publisher(&self, key: &ChannelSessionKey) -> Option<&PublisherCounters> {
        self.publishers.get(key)
    }

    /// Latest counters for a subscriber participant.
    pub fn subscriber(&self, key: &ChannelSessionKey) -> Option<&SubscriberCounters> {
        self.subscribers.get(key)
    }

    /// Fold one snapshot into the cumulative indices.
    pub fn apply(&mut self, snapshot: &Snapshot) {
        self.system_by_context
            .insert(snapshot.context.clone(), snapshot.system);

        for subscriber in &snapshot.subscribers {
            let key = ChannelSessionKey::new(
                snapshot.context.clone(),
                subscriber.channel.clone(),
                subscriber.stream_id,
                subscriber.session_id,
            );
            self.subscribers.insert(key, subscriber.clone());
        }

        for publisher in &snapshot.publishers {
            let publisher_key = ChannelSessionKey::new(
                snapshot.context.clone(),
                publisher.channel.clone(),
                publisher.stream_id,
                publisher.session_id,
            );
            self.publishers
                .insert(publisher_key.clone(), publisher.clone());

            let joined = self
                .connections_by_stream
                .entry(StreamKey::new(
                    publisher.channel.clone(),
                    publisher.stream_id,
                ))
                .or_default()
                .entry(publisher_key.clone())
                .or_default();

            // A subscriber endpoint from any context joins this
            // publisher's session when it shares the same channel,
            // stream, and session.
            for subscriber_key in self.subscribers.keys() {
                if subscriber_key.channel == publisher_key.channel
                    && subscriber_key.stream_id == publisher_key.stream_id
                    && subscriber_key.session_id == publisher_key.session_id
                {
                    joined.insert(subscriber_key.clone());
                }
            }
        }
    }
}

impl SnapshotConsumer for SystemView {
    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.apply(snapshot);
        Ok(())
    }
}
