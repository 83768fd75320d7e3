//! Folds counter events into session-keyed records and emits snapshots.
//!
//! The engine keeps one repository per participant role plus the
//! process-wide system counters. At the end of every scan batch it hands
//! a fully detached [`Snapshot`] to the configured consumer, exactly
//! once; consumers never observe a record that is still being mutated,
//! nor a record mixing values from two scan passes.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::clock::EpochClock;
use crate::counters::{CounterEvent, CounterKind, CounterListener, SystemCounterKind};
use crate::model::{
    normalize_channel, PublisherCounters, SessionKey, Snapshot, SubscriberCounters, SystemCounters,
};

/// Receives one snapshot per completed scan batch.
///
/// This is the pipeline's primary extension point: the console renderer,
/// the cross-context view, the rate monitor, and the network publisher
/// all sit behind it. Errors returned here are treated as fatal by the
/// driving agent.
pub trait SnapshotConsumer: Send {
    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;
}

/// Adapter sharing one consumer between several pipelines.
///
/// Pipelines for different monitored contexts are normally driven from
/// one scheduling loop, but when they are driven from parallel threads
/// the shared consumer's indices need mutual exclusion; this wrapper
/// provides it.
pub struct SharedConsumer<C> {
    inner: Arc<Mutex<C>>,
}

impl<C> SharedConsumer<C> {
    pub fn new(consumer: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(consumer)),
        }
    }

    /// Run `f` against the wrapped consumer.
    pub fn with<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<C> Clone for SharedConsumer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: SnapshotConsumer> SnapshotConsumer for SharedConsumer<C> {
    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.inner.lock().on_snapshot(snapshot)
    }
}

/// A record that can be created for a session identity.
pub trait SessionKeyed {
    fn for_session(channel: &str, session_id: i32, stream_id: i32) -> Self;
}

impl SessionKeyed for PublisherCounters {
    fn for_session(channel: &str, session_id: i32, stream_id: i32) -> Self {
        Self::new(channel, session_id, stream_id)
    }
}

impl SessionKeyed for SubscriberCounters {
    fn for_session(channel: &str, session_id: i32, stream_id: i32) -> Self {
        Self::new(channel, session_id, stream_id)
    }
}

/// Session-keyed store with get-or-create semantics.
///
/// Records are created lazily on first matching event and live for the
/// life of the reader; snapshotting clones them rather than draining.
pub struct CounterRepository<T> {
    records: BTreeMap<SessionKey, T>,
}

impl<T: SessionKeyed> CounterRepository<T> {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    pub fn get_or_create(&mut self, channel: &str, session_id: i32, stream_id: i32) -> &mut T {
        self.records
            .entry(SessionKey::new(channel, session_id, stream_id))
            .or_insert_with(|| T::for_session(channel, session_id, stream_id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.records.values()
    }
}

impl<T: SessionKeyed> Default for CounterRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes counter events into the repositories and emits snapshots.
pub struct CounterEventHandler {
    publishers: CounterRepository<PublisherCounters>,
    subscribers: CounterRepository<SubscriberCounters>,
    system: SystemCounters,
    consumer: Box<dyn SnapshotConsumer>,
    clock: Arc<dyn EpochClock>,
    // Scratch for channel normalization, reused across events. Never
    // escapes the current call.
    stripped: String,
}

impl CounterEventHandler {
    pub fn new(consumer: Box<dyn SnapshotConsumer>, clock: Arc<dyn EpochClock>) -> Self {
        Self {
            publishers: CounterRepository::new(),
            subscribers: CounterRepository::new(),
            system: SystemCounters::default(),
            consumer,
            clock,
            stripped: String::new(),
        }
    }
}

impl CounterListener for CounterEventHandler {
    fn on_counter_event(&mut self, event: &CounterEvent<'_>) {
        if let CounterKind::System(kind) = event.kind {
            let field = match kind {
                SystemCounterKind::BytesSent => &mut self.system.bytes_sent,
                SystemCounterKind::BytesReceived => &mut self.system.bytes_received,
                SystemCounterKind::NaksSent => &mut self.system.naks_sent,
                SystemCounterKind::NaksReceived => &mut self.system.naks_received,
                SystemCounterKind::Errors => &mut self.system.errors,
                SystemCounterKind::ClientTimeouts => &mut self.system.client_timeouts,
            };
            *field = event.value;
            return;
        }

        normalize_channel(event.channel, &mut self.stripped);
        let channel = self.stripped.as_str();
        match event.kind {
            CounterKind::SenderLimit => {
                self.publishers
                    .get_or_create(channel, event.session_id, event.stream_id)
                    .sender_limit = event.value;
            }
            CounterKind::SenderPosition => {
                self.publishers
                    .get_or_create(channel, event.session_id, event.stream_id)
                    .sender_position = event.value;
            }
            CounterKind::PublisherPosition => {
                self.publishers
                    .get_or_create(channel, event.session_id, event.stream_id)
                    .publisher_position = event.value;
            }
            CounterKind::PublisherLimit => {
                self.publishers
                    .get_or_create(channel, event.session_id, event.stream_id)
                    .publisher_limit = event.value;
            }
            CounterKind::SenderBackPressure => {
                self.publishers
                    .get_or_create(channel, event.session_id, event.stream_id)
                    .back_pressure_events = event.value;
            }
            CounterKind::ReceiverHighWaterMark => {
                self.subscribers
                    .get_or_create(channel, event.session_id, event.stream_id)
                    .receiver_high_water_mark = event.value;
            }
            CounterKind::ReceiverPosition => {
                self.subscribers
                    .get_or_create(channel, event.session_id, event.stream_id)
                    .receiver_position = event.value;
            }
            CounterKind::SubscriberPosition => {
                self.subscribers
                    .get_or_create(channel, event.session_id, event.stream_id)
                    .set_subscriber_position(event.registration_id, event.value);
            }
            CounterKind::System(_) => unreachable!("handled above"),
        }
    }

    fn on_end_of_batch(&mut self, context: &str) -> Result<()> {
        let snapshot = Snapshot {
            context: context.to_owned(),
            timestamp_ms: self.clock.time_millis(),
            publishers: self.publishers.values().cloned().collect(),
            subscribers: self.subscribers.values().cloned().collect(),
            system: self.system,
        };
        self.consumer.on_snapshot(&snapshot)
    }
}
