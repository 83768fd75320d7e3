//! Wire codec for snapshot distribution.
//!
//! A snapshot is serialized into a fixed, length-prefixed little-endian
//! layout: header id, format version, context label, timestamp, system
//! counters, then the publisher and subscriber counter lists in order.
//! Text is encoded as UTF-16 code units, two bytes each. Decoding
//! validates the header id and version against the expected constants
//! and fails hard on any mismatch; there is no lenient or partial
//! decode.

use thiserror::Error;

use crate::model::{PublisherCounters, Snapshot, SubscriberCounters, SystemCounters};

/// Identifies a snapshot message. Any other value is rejected.
pub const SNAPSHOT_HEADER_ID: i32 = 0x534E_4150;

/// The single supported wire format version.
pub const WIRE_VERSION: i8 = 1;

/// Decode failures. All of these are hard errors: a message that cannot
/// be decoded in full produces no snapshot at all.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown message type: 0x{actual:08X}")]
    UnknownHeader { actual: i32 },

    #[error("unknown snapshot version: {actual}")]
    UnknownVersion { actual: i8 },

    #[error("message truncated at offset {offset}: {needed} more bytes needed")]
    Truncated { offset: usize, needed: usize },

    #[error("negative length or count: {value}")]
    BadLength { value: i32 },

    #[error("label text is not valid UTF-16")]
    BadText,
}

/// Serialize one snapshot into `buffer`, replacing its contents.
///
/// The buffer is caller-supplied so a transport can reuse one scratch
/// allocation across sends. Returns the number of bytes written.
pub fn encode_snapshot(snapshot: &Snapshot, buffer: &mut Vec<u8>) -> usize {
    buffer.clear();
    put_i32(buffer, SNAPSHOT_HEADER_ID);
    put_i8(buffer, WIRE_VERSION);
    put_text(buffer, &snapshot.context);
    put_i64(buffer, snapshot.timestamp_ms);

    put_i64(buffer, snapshot.system.bytes_sent);
    put_i64(buffer, snapshot.system.bytes_received);
    put_i64(buffer, snapshot.system.naks_sent);
    put_i64(buffer, snapshot.system.naks_received);
    put_i64(buffer, snapshot.system.errors);
    put_i64(buffer, snapshot.system.client_timeouts);

    put_i32(buffer, snapshot.publishers.len() as i32);
    for publisher in &snapshot.publishers {
        put_text(buffer, &publisher.channel);
        put_i32(buffer, publisher.stream_id);
        put_i32(buffer, publisher.session_id);
        put_i64(buffer, publisher.publisher_position);
        put_i64(buffer, publisher.back_pressure_events);
        put_i64(buffer, publisher.sender_position);
        put_i64(buffer, publisher.sender_limit);
        put_i64(buffer, publisher.publisher_limit);
    }

    put_i32(buffer, snapshot.subscribers.len() as i32);
    for subscriber in &snapshot.subscribers {
        put_text(buffer, &subscriber.channel);
        put_i32(buffer, subscriber.stream_id);
        put_i32(buffer, subscriber.session_id);
        put_i32(buffer, subscriber.subscriber_positions.len() as i32);
        for (registration_id, position) in &subscriber.subscriber_positions {
            put_i64(buffer, *registration_id);
            put_i64(buffer, *position);
        }
        put_i64(buffer, subscriber.receiver_position);
        put_i64(buffer, subscriber.receiver_high_water_mark);
    }

    buffer.len()
}

/// Reconstruct a snapshot from an encoded buffer.
pub fn decode_snapshot(data: &[u8]) -> Result<Snapshot, WireError> {
    let mut reader = Reader { data, offset: 0 };

    let header_id = reader.i32()?;
    if header_id != SNAPSHOT_HEADER_ID {
        return Err(WireError::UnknownHeader { actual: header_id });
    }
    let version = reader.i8()?;
    if version != WIRE_VERSION {
        return Err(WireError::UnknownVersion { actual: version });
    }

    let context = reader.text()?;
    let timestamp_ms = reader.i64()?;

    let system = SystemCounters {
        bytes_sent: reader.i64()?,
        bytes_received: reader.i64()?,
        naks_sent: reader.i64()?,
        naks_received: reader.i64()?,
        errors: reader.i64()?,
        client_timeouts: reader.i64()?,
    };

    let publisher_count = reader.count()?;
    let mut publishers = Vec::with_capacity(publisher_count);
    for _ in 0..publisher_count {
        let channel = reader.text()?;
        let stream_id = reader.i32()?;
        let session_id = reader.i32()?;
        let mut publisher = PublisherCounters::new(channel, session_id, stream_id);
        publisher.publisher_position = reader.i64()?;
        publisher.back_pressure_events = reader.i64()?;
        publisher.sender_position = reader.i64()?;
        publisher.sender_limit = reader.i64()?;
        publisher.publisher_limit = reader.i64()?;
        publishers.push(publisher);
    }

    let subscriber_count = reader.count()?;
    let mut subscribers = Vec::with_capacity(subscriber_count);
    for _ in 0..subscriber_count {
        let channel = reader.text()?;
        let stream_id = reader.i32()?;
        let session_id = reader.i32()?;
        let mut subscriber = SubscriberCounters::new(channel, session_id, stream_id);
        let registration_count = reader.count()?;
        for _ in 0..registration_count {
            let registration_id = reader.i64()?;
            let position = reader.i64()?;
            subscriber.set_subscriber_position(registration_id, position);
        }
        subscriber.receiver_position = reader.i64()?;
        subscriber.receiver_high_water_mark = reader.i64()?;
        subscribers.push(subscriber);
    }

    Ok(Snapshot {
        context,
        timestamp_ms,
        publishers,
        subscribers,
        system,
    })
}

fn put_i8(buffer: &mut Vec<u8>, value: i8) {
    buffer.push(value as u8);
}

fn put_i32(buffer: &mut Vec<u8>, value: i32) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(buffer: &mut Vec<u8>, value: i64) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

/// Length-prefixed UTF-16 text: code unit count, then two bytes each.
fn put_text(buffer: &mut Vec<u8>, text: &str) {
    let length_offset = buffer.len();
    put_i32(buffer, 0);
    let mut code_units = 0i32;
    for unit in text.encode_utf16() {
        buffer.extend_from_slice(&unit.to_le_bytes());
        code_units += 1;
    }
    buffer[length_offset..length_offset + 4].copy_from_slice(&code_units.to_le_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8], WireError> {
        let available = self.data.len() - self.offset;
        if available < len {
            return Err(WireError::Truncated {
                offset: self.offset,
                needed: len - available,
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn i8(&mut self) -> Result<i8, WireError> {
        Ok(self.take(1)?[0] as i8)
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(bytes))
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(bytes))
    }

    fn count(&mut self) -> Result<usize, WireError> {
        let value = self.i32()?;
        if value < 0 {
            return Err(WireError::BadLength { value });
        }
        Ok(value as usize)
    }

    fn text(&mut self) -> Result<String, WireError> {
        let code_units = self.count()?;
        let bytes = self.take(code_units * 2)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| WireError::BadText)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> Snapshot {
        let mut first = PublisherCounters::new("udp://h:40123", 2, 7);
        first.sender_position = 1_234;
        first.publisher_position = 1_300;
        first.publisher_limit = 4_096;
        first.sender_limit = 4_000;
        first.back_pressure_events = 3;

        let mut second = PublisherCounters::new("ipc://local", 5, 11);
        second.publisher_limit = 1_234;

        let mut subscriber = SubscriberCounters::new("udp://h:40123", 2, 7);
        subscriber.receiver_high_water_mark = 1_234;
        subscriber.receiver_position = 1_200;
        subscriber.set_subscriber_position(31, 1_100);
        subscriber.set_subscriber_position(32, 1_150);

        Snapshot {
            context: "driver-0".to_owned(),
            timestamp_ms: 1_234_567_890_333,
            publishers: vec![first, second],
            subscribers: vec![subscriber],
            system: SystemCounters {
                bytes_sent: 1,
                bytes_received: 2,
                naks_sent: 3,
                naks_received: 4,
                errors: 5,
                client_timeouts: 6,
            },
        }
    }

    #[test]
    fn test_round_trip() {
        let snapshot = sample_snapshot();
        let mut buffer = Vec::new();
        let length = encode_snapshot(&snapshot, &mut buffer);
        assert_eq!(length, buffer.len());

        let decoded = decode_snapshot(&buffer).expect("decode");
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_round_trip_preserves_list_order() {
        let snapshot = sample_snapshot();
        let mut buffer = Vec::new();
        encode_snapshot(&snapshot, &mut buffer);

        let decoded = decode_snapshot(&buffer).expect("decode");
        assert_eq!(decoded.publishers[0].channel, "udp://h:40123");
        assert_eq!(decoded.publishers[1].channel, "ipc://local");
    }

    #[test]
    fn test_round_trip_empty_lists() {
        let snapshot = Snapshot {
            context: String::new(),
            timestamp_ms: 0,
            publishers: Vec::new(),
            subscribers: Vec::new(),
            system: SystemCounters::default(),
        };
        let mut buffer = Vec::new();
        encode_snapshot(&snapshot, &mut buffer);
        assert_eq!(decode_snapshot(&buffer).expect("decode"), snapshot);
    }

    #[test]
    fn test_round_trip_non_ascii_label() {
        let mut snapshot = sample_snapshot();
        snapshot.context = "ctx-λ-monitor".to_owned();
        let mut buffer = Vec::new();
        encode_snapshot(&snapshot, &mut buffer);
        assert_eq!(decode_snapshot(&buffer).expect("decode").context, snapshot.context);
    }

    #[test]
    fn test_encoder_replaces_buffer_contents() {
        let snapshot = sample_snapshot();
        let mut buffer = vec![0xFF; 4_096];
        let length = encode_snapshot(&snapshot, &mut buffer);
        assert_eq!(buffer.len(), length);
        assert_eq!(decode_snapshot(&buffer).expect("decode"), snapshot);
    }

    #[test]
    fn test_unknown_header_rejected() {
        let mut buffer = Vec::new();
        encode_snapshot(&sample_snapshot(), &mut buffer);
        buffer[0] ^= 0x01;

        assert!(matches!(
            decode_snapshot(&buffer),
            Err(WireError::UnknownHeader { .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut buffer = Vec::new();
        encode_snapshot(&sample_snapshot(), &mut buffer);
        buffer[4] = 99;

        assert_eq!(
            decode_snapshot(&buffer),
            Err(WireError::UnknownVersion { actual: 99 })
        );
    }

    #[test]
    fn test_truncated_message_rejected() {
        let mut buffer = Vec::new();
        encode_snapshot(&sample_snapshot(), &mut buffer);
        buffer.truncate(buffer.len() - 5);

        assert!(matches!(
            decode_snapshot(&buffer),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_negative_count_rejected() {
        let snapshot = Snapshot {
            context: String::new(),
            timestamp_ms: 0,
            publishers: Vec::new(),
            subscribers: Vec::new(),
            system: SystemCounters::default(),
        };
        let mut buffer = Vec::new();
        encode_snapshot(&snapshot, &mut buffer);

        // Publisher count sits right after the fixed-size prelude.
        let count_offset = 4 + 1 + 4 + 8 + 6 * 8;
        buffer[count_offset..count_offset + 4].copy_from_slice(&(-1i32).to_le_bytes());

        assert_eq!(
            decode_snapshot(&buffer),
            Err(WireError::BadLength { value: -1 })
        );
    }
}
