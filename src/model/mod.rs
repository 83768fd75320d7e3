//! Shared data model for the counters pipeline.
//!
//! Counter sets are mutable, session-keyed records owned by the
//! aggregation engine; everything handed to downstream consumers is a
//! detached clone bundled into a [`Snapshot`].

use std::collections::BTreeMap;

/// Channel prefix used by in-process streams. Channels starting with this
/// prefix are normalized down to the bare prefix before keying, since the
/// transport appends allocation parameters that vary per endpoint.
pub const IPC_CHANNEL_PREFIX: &str = "ipc://local";

/// Normalize a raw channel string for use as an identity component.
///
/// Strips any trailing `|`-delimited tag and collapses in-process
/// channels down to [`IPC_CHANNEL_PREFIX`]. The normalized text is
/// appended to `out`, which is cleared first.
pub fn normalize_channel(raw: &str, out: &mut String) {
    out.clear();
    let stripped = match raw.find('|') {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    if stripped.starts_with(IPC_CHANNEL_PREFIX) {
        out.push_str(IPC_CHANNEL_PREFIX);
    } else {
        out.push_str(stripped);
    }
}

/// Identity of one participant (publisher or subscriber endpoint) within
/// a single monitored process. Ordered so that repositories iterate
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub channel: String,
    pub session_id: i32,
    pub stream_id: i32,
}

impl SessionKey {
    pub fn new(channel: impl Into<String>, session_id: i32, stream_id: i32) -> Self {
        Self {
            channel: channel.into(),
            session_id,
            stream_id,
        }
    }
}

/// Identity of one participant across monitored contexts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSessionKey {
    pub context: String,
    pub channel: String,
    pub stream_id: i32,
    pub session_id: i32,
}

impl ChannelSessionKey {
    pub fn new(
        context: impl Into<String>,
        channel: impl Into<String>,
        stream_id: i32,
        session_id: i32,
    ) -> Self {
        Self {
            context: context.into(),
            channel: channel.into(),
            stream_id,
            session_id,
        }
    }
}

/// Identity of one logical stream, regardless of session or context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub channel: String,
    pub stream_id: i32,
}

impl StreamKey {
    pub fn new(channel: impl Into<String>, stream_id: i32) -> Self {
        Self {
            channel: channel.into(),
            stream_id,
        }
    }
}

/// Counters associated with one publisher session.
///
/// Fields default to zero until the first matching counter is observed;
/// the record is mutated field-by-field as slots are scanned.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublisherCounters {
    pub channel: String,
    pub session_id: i32,
    pub stream_id: i32,
    pub publisher_position: i64,
    pub publisher_limit: i64,
    pub sender_position: i64,
    pub sender_limit: i64,
    pub back_pressure_events: i64,
}

impl PublisherCounters {
    /// Fresh record for the given identity.
    pub fn new(channel: impl Into<String>, session_id: i32, stream_id: i32) -> Self {
        Self {
            channel: channel.into(),
            session_id,
            stream_id,
            ..Self::default()
        }
    }

    /// Term buffer space still available to the publisher.
    pub fn publisher_buffer_remaining(&self) -> i64 {
        self.publisher_limit - self.publisher_position
    }

    /// Bytes written by the publisher but not yet passed to the sender.
    pub fn buffered(&self) -> i64 {
        (self.publisher_position - self.sender_position).max(0)
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.channel.clone(), self.session_id, self.stream_id)
    }
}

/// Counters associated with one subscriber-side endpoint.
///
/// A single stream may be consumed by several local subscriptions at
/// once; each is tracked independently under its registration id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriberCounters {
    pub channel: String,
    pub session_id: i32,
    pub stream_id: i32,
    pub receiver_position: i64,
    pub receiver_high_water_mark: i64,
    pub subscriber_positions: BTreeMap<i64, i64>,
}

impl SubscriberCounters {
    /// Fresh record for the given identity. Any registration entries from
    /// a previous incarnation of this identity are gone by construction.
    pub fn new(channel: impl Into<String>, session_id: i32, stream_id: i32) -> Self {
        Self {
            channel: channel.into(),
            session_id,
            stream_id,
            ..Self::default()
        }
    }

    /// Record the position of one local subscription.
    pub fn set_subscriber_position(&mut self, registration_id: i64, position: i64) {
        self.subscriber_positions.insert(registration_id, position);
    }

    /// Number of local subscriptions observed for this endpoint.
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_positions.len()
    }

    /// Bytes received out-of-order and not yet contiguous.
    pub fn incomplete_data(&self) -> i64 {
        (self.receiver_high_water_mark - self.receiver_position).max(0)
    }

    /// Bytes sent by the given publisher but not yet seen here.
    pub fn inflight(&self, publisher: &PublisherCounters) -> i64 {
        (self.receiver_high_water_mark - publisher.sender_position).max(0)
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.channel.clone(), self.session_id, self.stream_id)
    }
}

/// Process-wide counters for one monitored context. Overwritten, not
/// accumulated, on every observation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SystemCounters {
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub naks_sent: i64,
    pub naks_received: i64,
    pub errors: i64,
    pub client_timeouts: i64,
}

/// One immutable bundle of aggregated counters for one scan batch.
///
/// All contained records are detached clones; nothing here aliases the
/// aggregation engine's live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub context: String,
    pub timestamp_ms: i64,
    pub publishers: Vec<PublisherCounters>,
    pub subscribers: Vec<SubscriberCounters>,
    pub system: SystemCounters,
}
