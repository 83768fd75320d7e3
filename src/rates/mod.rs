//! Rolling throughput rates per publisher stream.
//!
//! Each tracked stream owns one circular sample buffer per configured
//! rate window. Samples are debounced to at most one per wall-clock
//! second, which keeps memory and averaging cost independent of how
//! often snapshots arrive. The moving average is the mean of deltas
//! between adjacent accepted samples, so a partially filled buffer
//! averages over the samples it actually holds.

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use serde::Deserialize;
use thiserror::Error;

use crate::aggregator::SnapshotConsumer;
use crate::model::{ChannelSessionKey, Snapshot};

/// Minimum spacing between accepted samples.
const SAMPLE_INTERVAL_MS: i64 = 1_000;

/// Units a rate window duration may be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    const fn seconds_per_unit(self) -> u64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 3_600,
        }
    }

    /// Convert a duration in this unit to whole seconds.
    pub const fn to_seconds(self, duration: u64) -> u64 {
        duration * self.seconds_per_unit()
    }

    /// Convert a duration in this unit to nanoseconds.
    pub const fn to_nanos(self, duration: u64) -> u64 {
        self.to_seconds(duration) * 1_000_000_000
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seconds => f.write_str("s"),
            Self::Minutes => f.write_str("m"),
            Self::Hours => f.write_str("h"),
        }
    }
}

/// Definition of one rate window, e.g. `(10, Seconds)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct RateWindow {
    pub duration: u64,
    pub unit: TimeUnit,
}

impl RateWindow {
    pub const fn new(duration: u64, unit: TimeUnit) -> Self {
        Self { duration, unit }
    }

    fn nanos(&self) -> u64 {
        self.unit.to_nanos(self.duration)
    }
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.duration, self.unit)
    }
}

/// Invalid rate window configuration.
#[derive(Error, Debug)]
pub enum RateConfigError {
    #[error("rate window defined twice: {window}")]
    Duplicate { window: RateWindow },

    #[error("no rate windows configured")]
    Empty,

    #[error("rate window duration must be positive")]
    ZeroDuration,
}

/// Validate windows and fix their reporting order: ascending duration in
/// nanoseconds. Duplicate `(duration, unit)` pairs are rejected.
fn sorted_windows(windows: &[RateWindow]) -> Result<Vec<RateWindow>, RateConfigError> {
    if windows.is_empty() {
        return Err(RateConfigError::Empty);
    }
    if windows.iter().any(|w| w.duration == 0) {
        return Err(RateConfigError::ZeroDuration);
    }

    let mut sorted = windows.to_vec();
    sorted.sort_by_key(RateWindow::nanos);
    for pair in sorted.windows(2) {
        if pair[0] == pair[1] {
            return Err(RateConfigError::Duplicate { window: pair[0] });
        }
    }
    Ok(sorted)
}

/// One circular buffer of position samples.
struct RollingWindow {
    samples: Vec<i64>,
    last_update_ms: i64,
    pointer: usize,
}

impl RollingWindow {
    fn new(slots: usize) -> Self {
        Self {
            samples: vec![0; slots],
            last_update_ms: 0,
            pointer: 0,
        }
    }

    /// Accept at most one sample per second of wall-clock progress.
    fn update_byte_position(&mut self, epoch_ms: i64, position: i64) {
        if epoch_ms >= self.last_update_ms + SAMPLE_INTERVAL_MS {
            let slot = self.pointer % self.samples.len();
            self.samples[slot] = position;
            self.pointer += 1;
            self.last_update_ms = epoch_ms;
        }
    }

    fn sample_count(&self) -> usize {
        self.pointer.min(self.samples.len())
    }

    /// Average bytes/second over the currently populated samples.
    ///
    /// Panics if fewer than two samples have been accepted; callers must
    /// wait for warmup before consuming rates.
    fn average_value(&self) -> i64 {
        let end = self.pointer as i64 - 1;
        let start = (self.pointer as i64 - self.samples.len() as i64).max(0);
        let count = end - start;
        assert!(count > 0, "rate consumed before two samples were accepted");

        let mut accumulator = 0i64;
        for i in start..end {
            let next = self.samples[(i + 1) as usize % self.samples.len()];
            let current = self.samples[i as usize % self.samples.len()];
            accumulator += next - current;
        }
        accumulator / count
    }
}

/// Rolling windows for one publisher stream.
pub struct StreamRate {
    windows: Vec<(RateWindow, RollingWindow)>,
}

impl StreamRate {
    /// Build windows from the given definitions. Duplicate definitions
    /// are a configuration error.
    pub fn new(windows: &[RateWindow]) -> Result<Self, RateConfigError> {
        Ok(Self::from_sorted(&sorted_windows(windows)?))
    }

    /// Build from definitions already validated and sorted.
    fn from_sorted(sorted: &[RateWindow]) -> Self {
        Self {
            windows: sorted
                .iter()
                .map(|w| {
                    let slots = w.unit.to_seconds(w.duration) as usize;
                    (*w, RollingWindow::new(slots))
                })
                .collect(),
        }
    }

    /// Feed one observed stream position into every window.
    pub fn stream_position(&mut self, epoch_ms: i64, position: i64) {
        for (_, window) in &mut self.windows {
            window.update_byte_position(epoch_ms, position);
        }
    }

    /// True once every window can produce an average.
    pub fn warmed_up(&self) -> bool {
        self.windows.iter().all(|(_, w)| w.sample_count() >= 2)
    }

    /// Report the current average for every window, in ascending order
    /// of window duration as fixed at construction.
    ///
    /// Panics if any window has accepted fewer than two samples; check
    /// [`StreamRate::warmed_up`] first when in doubt.
    pub fn consume_rates(&self, mut consumer: impl FnMut(u64, TimeUnit, i64)) {
        for (definition, window) in &self.windows {
            consumer(definition.duration, definition.unit, window.average_value());
        }
    }
}

/// Tracks a [`StreamRate`] per publisher stream across snapshots.
pub struct RateMonitor {
    windows: Vec<RateWindow>,
    rates_by_publisher: HashMap<ChannelSessionKey, StreamRate>,
}

impl RateMonitor {
    pub fn new(windows: &[RateWindow]) -> Result<Self, RateConfigError> {
        Ok(Self {
            windows: sorted_windows(windows)?,
            rates_by_publisher: HashMap::new(),
        })
    }

    /// Feed one snapshot's publisher positions into the tracked rates.
    pub fn apply(&mut self, snapshot: &Snapshot) {
        for publisher in &snapshot.publishers {
            let key = ChannelSessionKey::new(
                snapshot.context.clone(),
                publisher.channel.clone(),
                publisher.stream_id,
                publisher.session_id,
            );
            self.rates_by_publisher
                .entry(key)
                .or_insert_with(|| StreamRate::from_sorted(&self.windows))
                .stream_position(snapshot.timestamp_ms, publisher.publisher_position);
        }
    }

    /// Rates keyed by publisher identity.
    pub fn publisher_rates(&self) -> &HashMap<ChannelSessionKey, StreamRate> {
        &self.rates_by_publisher
    }
}

impl SnapshotConsumer for RateMonitor {
    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.apply(snapshot);
        Ok(())
    }
}
