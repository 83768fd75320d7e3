//! Periodic scan of a transport's counters file.
//!
//! Each scan pass visits every allocated slot once, emits one typed
//! [`CounterEvent`] per monitored slot, and finishes with a single
//! end-of-batch signal carrying the monitored context's label. Scans are
//! debounced against an injected clock so the surrounding work loop can
//! spin as fast as it likes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::debug;

use super::layout::{CounterKind, CounterSlot, CountersFile, CountersFileError};
use crate::clock::EpochClock;

/// Default interval between scan passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// One matched counter slot, valid for the duration of the listener
/// callback only. The channel text borrows from the mapped file.
#[derive(Debug, Clone, Copy)]
pub struct CounterEvent<'a> {
    pub counter_id: i32,
    pub kind: CounterKind,
    /// Raw channel text from the slot label; empty for system counters.
    pub channel: &'a str,
    pub session_id: i32,
    pub stream_id: i32,
    pub registration_id: i64,
    pub value: i64,
}

/// Receiver of scan output. One `on_end_of_batch` call follows every
/// completed scan pass, whether or not any events matched.
pub trait CounterListener {
    fn on_counter_event(&mut self, event: &CounterEvent<'_>);

    fn on_end_of_batch(&mut self, context: &str) -> Result<()>;
}

/// Malformed slot labels for monitored counter types. The transport is
/// expected to produce well-formed labels; these indicate a contract
/// violation, not a recoverable runtime condition.
#[derive(Error, Debug)]
pub enum LabelError {
    #[error("counter {counter_id} ({kind:?}): label is missing token {index}: {label:?}")]
    MissingToken {
        counter_id: i32,
        kind: CounterKind,
        index: usize,
        label: String,
    },

    #[error("counter {counter_id} ({kind:?}): token {index} is not numeric: {token:?}")]
    BadToken {
        counter_id: i32,
        kind: CounterKind,
        index: usize,
        token: String,
    },
}

/// Scans one monitored context's counters file on a fixed interval.
pub struct CountersPoller {
    file: CountersFile,
    context: String,
    clock: Arc<dyn EpochClock>,
    poll_interval_ms: i64,
    last_poll_ms: i64,
}

impl CountersPoller {
    /// Map the counters file under `dir` and prepare for scanning.
    ///
    /// Fails if the file is absent or its header does not match the
    /// supported format version.
    pub fn new(
        context: impl Into<String>,
        dir: &Path,
        poll_interval: Duration,
        clock: Arc<dyn EpochClock>,
    ) -> Result<Self, CountersFileError> {
        let context = context.into();
        let file = CountersFile::map_read_only(dir)?;
        debug!(
            context,
            slots = file.slot_count(),
            dir = %dir.display(),
            "mapped counters file",
        );

        Ok(Self {
            file,
            context,
            clock,
            poll_interval_ms: poll_interval.as_millis() as i64,
            last_poll_ms: 0,
        })
    }

    /// Label identifying the monitored context in emitted snapshots.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Run at most one scan pass, if the poll interval has elapsed.
    ///
    /// Returns the number of slots visited (zero when debounced). Errors
    /// indicate either a malformed label (contract violation) or a
    /// failure propagated from the listener's end-of-batch handling.
    pub fn do_work(&mut self, listener: &mut dyn CounterListener) -> Result<usize> {
        let now_ms = self.clock.time_millis();
        if now_ms <= self.last_poll_ms + self.poll_interval_ms {
            return Ok(0);
        }
        self.last_poll_ms = now_ms;

        let mut visited = 0usize;
        let mut scan_error: Option<LabelError> = None;
        self.file.each_allocated(|slot| {
            visited += 1;
            if scan_error.is_some() {
                return;
            }

            let Some(kind) = CounterKind::from_slot(slot.type_id, slot.counter_id) else {
                return;
            };

            let value = self.file.counter_value(slot.counter_id);
            if kind.is_session_keyed() {
                match parse_identity(kind, &slot) {
                    Ok(identity) => listener.on_counter_event(&CounterEvent {
                        counter_id: slot.counter_id,
                        kind,
                        channel: identity.channel,
                        session_id: identity.session_id,
                        stream_id: identity.stream_id,
                        registration_id: identity.registration_id,
                        value,
                    }),
                    Err(e) => scan_error = Some(e),
                }
            } else {
                listener.on_counter_event(&CounterEvent {
                    counter_id: slot.counter_id,
                    kind,
                    channel: "",
                    session_id: -1,
                    stream_id: -1,
                    registration_id: -1,
                    value,
                });
            }
        });

        if let Some(e) = scan_error {
            return Err(e.into());
        }

        listener.on_end_of_batch(&self.context)?;
        Ok(visited)
    }
}

struct SlotIdentity<'a> {
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    channel: &'a str,
}

/// Pull the identity tokens out of a session-keyed slot label.
fn parse_identity<'a>(
    kind: CounterKind,
    slot: &CounterSlot<'a>,
) -> Result<SlotIdentity<'a>, LabelError> {
    let base = kind.first_identity_token();
    let mut tokens = slot.label.split_whitespace().skip(base);

    let mut next = |index: usize| {
        tokens.next().ok_or_else(|| LabelError::MissingToken {
            counter_id: slot.counter_id,
            kind,
            index,
            label: slot.label.to_owned(),
        })
    };

    let registration_token = next(base)?;
    let session_token = next(base + 1)?;
    let stream_token = next(base + 2)?;
    let channel = next(base + 3)?;

    Ok(SlotIdentity {
        registration_id: parse_numeric(kind, slot.counter_id, base, registration_token)?,
        session_id: parse_numeric(kind, slot.counter_id, base + 1, session_token)? as i32,
        stream_id: parse_numeric(kind, slot.counter_id, base + 2, stream_token)? as i32,
        channel,
    })
}

fn parse_numeric(
    kind: CounterKind,
    counter_id: i32,
    index: usize,
    token: &str,
) -> Result<i64, LabelError> {
    token.parse().map_err(|_| LabelError::BadToken {
        counter_id,
        kind,
        index,
        token: token.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use super::super::layout::*;
    use super::*;
    use crate::clock::ManualClock;

    /// Minimal counters file builder mirroring the transport's writer.
    struct FileImage {
        buf: Vec<u8>,
        slot_count: usize,
    }

    impl FileImage {
        fn new(slot_count: usize) -> Self {
            let mut buf = vec![0u8; expected_file_length(slot_count)];
            buf[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
            buf[4..8].copy_from_slice(&FILE_VERSION.to_le_bytes());
            buf[8..12].copy_from_slice(&(slot_count as i32).to_le_bytes());
            Self { buf, slot_count }
        }

        fn slot(&mut self, index: usize, type_id: i32, label: &str, value: i64) -> &mut Self {
            let base = HEADER_LENGTH + index * METADATA_SLOT_LENGTH;
            self.buf[base..base + 4].copy_from_slice(&SLOT_ALLOCATED.to_le_bytes());
            self.buf[base + SLOT_TYPE_ID_OFFSET..base + SLOT_TYPE_ID_OFFSET + 4]
                .copy_from_slice(&type_id.to_le_bytes());
            self.buf[base + SLOT_LABEL_LEN_OFFSET..base + SLOT_LABEL_LEN_OFFSET + 4]
                .copy_from_slice(&(label.len() as i32).to_le_bytes());
            self.buf[base + SLOT_LABEL_OFFSET..base + SLOT_LABEL_OFFSET + label.len()]
                .copy_from_slice(label.as_bytes());

            let value_offset = HEADER_LENGTH
                + self.slot_count * METADATA_SLOT_LENGTH
                + index * VALUE_SLOT_LENGTH;
            self.buf[value_offset..value_offset + 8].copy_from_slice(&value.to_le_bytes());
            self
        }

        fn write_to(&self, dir: &std::path::Path) {
            let mut file = File::create(dir.join(COUNTERS_FILE)).expect("create file");
            file.write_all(&self.buf).expect("write file");
        }
    }

    #[derive(Default)]
    struct Capture {
        events: Vec<(CounterKind, String, i32, i32, i64, i64)>,
        batches: Vec<String>,
    }

    impl CounterListener for Capture {
        fn on_counter_event(&mut self, event: &CounterEvent<'_>) {
            self.events.push((
                event.kind,
                event.channel.to_owned(),
                event.session_id,
                event.stream_id,
                event.registration_id,
                event.value,
            ));
        }

        fn on_end_of_batch(&mut self, context: &str) -> Result<()> {
            self.batches.push(context.to_owned());
            Ok(())
        }
    }

    fn poller(dir: &std::path::Path, clock: &ManualClock) -> CountersPoller {
        CountersPoller::new(
            "ctx",
            dir,
            DEFAULT_POLL_INTERVAL,
            Arc::new(clock.clone()),
        )
        .expect("construct poller")
    }

    #[test]
    fn test_scan_emits_typed_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        FileImage::new(8)
            .slot(0, SENDER_POSITION_TYPE_ID, "snd-pos 12 5 7 udp://h:40123", 1000)
            .slot(
                1,
                PUBLISHER_POSITION_TYPE_ID,
                "pub-pos (sampled) 12 5 7 udp://h:40123",
                900,
            )
            .slot(2, SUBSCRIBER_POSITION_TYPE_ID, "sub-pos 31 5 7 udp://h:40123", 800)
            .slot(3, SYSTEM_COUNTER_TYPE_ID, "NAKs received", 123_456)
            // System counter id 7 is outside the monitored set.
            .slot(7, SYSTEM_COUNTER_TYPE_ID, "Loss gap fills", 1)
            .write_to(dir.path());

        let clock = ManualClock::new(10_000);
        let mut poller = poller(dir.path(), &clock);
        let mut capture = Capture::default();

        let visited = poller.do_work(&mut capture).expect("scan");
        assert_eq!(visited, 5);
        assert_eq!(capture.batches, vec!["ctx".to_owned()]);

        assert_eq!(
            capture.events[0],
            (
                CounterKind::SenderPosition,
                "udp://h:40123".to_owned(),
                5,
                7,
                12,
                1000
            )
        );
        assert_eq!(
            capture.events[1],
            (
                CounterKind::PublisherPosition,
                "udp://h:40123".to_owned(),
                5,
                7,
                12,
                900
            )
        );
        assert_eq!(
            capture.events[2],
            (
                CounterKind::SubscriberPosition,
                "udp://h:40123".to_owned(),
                5,
                7,
                31,
                800
            )
        );
        assert_eq!(
            capture.events[3],
            (
                CounterKind::System(SystemCounterKind::NaksReceived),
                String::new(),
                -1,
                -1,
                -1,
                123_456
            )
        );
        assert_eq!(capture.events.len(), 4);
    }

    #[test]
    fn test_scan_debounced_by_poll_interval() {
        let dir = tempfile::tempdir().expect("tempdir");
        FileImage::new(2)
            .slot(0, SENDER_POSITION_TYPE_ID, "snd-pos 1 2 3 udp://h:1", 10)
            .write_to(dir.path());

        let clock = ManualClock::new(5_000);
        let mut poller = poller(dir.path(), &clock);
        let mut capture = Capture::default();

        assert_eq!(poller.do_work(&mut capture).expect("scan"), 2);
        assert_eq!(capture.batches.len(), 1);

        // Within the interval: nothing happens.
        clock.advance(999);
        assert_eq!(poller.do_work(&mut capture).expect("scan"), 0);
        assert_eq!(capture.batches.len(), 1);

        // Strictly past the interval: scans again.
        clock.advance(2);
        assert_eq!(poller.do_work(&mut capture).expect("scan"), 2);
        assert_eq!(capture.batches.len(), 2);
    }

    #[test]
    fn test_end_of_batch_signalled_without_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        FileImage::new(2).write_to(dir.path());

        let clock = ManualClock::new(5_000);
        let mut poller = poller(dir.path(), &clock);
        let mut capture = Capture::default();

        poller.do_work(&mut capture).expect("scan");
        assert!(capture.events.is_empty());
        assert_eq!(capture.batches, vec!["ctx".to_owned()]);
    }

    #[test]
    fn test_malformed_label_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        FileImage::new(2)
            .slot(0, SENDER_POSITION_TYPE_ID, "snd-pos 12 5", 10)
            .write_to(dir.path());

        let clock = ManualClock::new(5_000);
        let mut poller = poller(dir.path(), &clock);
        let mut capture = Capture::default();

        let err = poller.do_work(&mut capture).expect_err("malformed label");
        let label_error = err.downcast_ref::<LabelError>().expect("label error");
        assert!(matches!(label_error, LabelError::MissingToken { .. }));
    }

    #[test]
    fn test_non_numeric_token_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        FileImage::new(2)
            .slot(0, SENDER_POSITION_TYPE_ID, "snd-pos twelve 5 7 udp://h:1", 10)
            .write_to(dir.path());

        let clock = ManualClock::new(5_000);
        let mut poller = poller(dir.path(), &clock);
        let mut capture = Capture::default();

        let err = poller.do_work(&mut capture).expect_err("bad token");
        let label_error = err.downcast_ref::<LabelError>().expect("label error");
        assert!(matches!(label_error, LabelError::BadToken { .. }));
    }
}
