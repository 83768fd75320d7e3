//! Human-readable rendering of the aggregate view.

use std::fmt::Write;

use anyhow::Result;

use crate::aggregator::SnapshotConsumer;
use crate::model::{ChannelSessionKey, Snapshot};
use crate::rates::{RateConfigError, RateMonitor, RateWindow};
use crate::view::SystemView;

/// Folds snapshots into a [`SystemView`] and prints the whole picture
/// after every update. Optionally tracks and prints per-publisher
/// throughput rates.
#[derive(Default)]
pub struct ConsolePrinter {
    view: SystemView,
    rates: Option<RateMonitor>,
}

impl ConsolePrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Printer that also reports moving-average rates for the given
    /// windows.
    pub fn with_rates(windows: &[RateWindow]) -> Result<Self, RateConfigError> {
        Ok(Self {
            view: SystemView::new(),
            rates: Some(RateMonitor::new(windows)?),
        })
    }

    /// Render the current aggregate view.
    pub fn render(&self, out: &mut impl Write) -> std::fmt::Result {
        for (context, counters) in self.view.system_counters() {
            writeln!(out, "===== System counters for \"{context}\" =====")?;
            writeln!(out, "Bytes sent:      {:>20}", counters.bytes_sent)?;
            writeln!(out, "Bytes received:  {:>20}", counters.bytes_received)?;
            writeln!(out, "NAKs sent:       {:>20}", counters.naks_sent)?;
            writeln!(out, "NAKs received:   {:>20}", counters.naks_received)?;
            writeln!(out, "Errors:          {:>20}", counters.errors)?;
            writeln!(out, "Client timeouts: {:>20}", counters.client_timeouts)?;
        }

        let connections = self.view.connections_by_stream();
        writeln!(out, "===== Monitoring {} streams =====", connections.len())?;
        for (stream, publishers) in connections {
            writeln!(out, "==== {}/{} ====", stream.channel, stream.stream_id)?;
            for (publisher_key, subscriber_keys) in publishers {
                let Some(publisher) = self.view.publisher(publisher_key) else {
                    continue;
                };
                writeln!(out)?;
                writeln!(out, "---- Publisher session {} ----", publisher.session_id)?;
                writeln!(out, "| publisher position: {:>20}", publisher.publisher_position)?;
                writeln!(out, "| publisher limit:    {:>20}", publisher.publisher_limit)?;
                writeln!(out, "| sender position:    {:>20}", publisher.sender_position)?;
                writeln!(out, "| sender limit:       {:>20}", publisher.sender_limit)?;
                writeln!(out, "| buffered:           {:>20}", publisher.buffered())?;
                self.render_rates(out, publisher_key)?;

                for subscriber_key in subscriber_keys {
                    let Some(subscriber) = self.view.subscriber(subscriber_key) else {
                        continue;
                    };
                    writeln!(out, "---- Subscriber ({}) ----", subscriber_key.context)?;
                    writeln!(out, "| receiver position:  {:>20}", subscriber.receiver_position)?;
                    writeln!(
                        out,
                        "| receiver HWM:       {:>20}",
                        subscriber.receiver_high_water_mark
                    )?;
                    for (registration_id, position) in &subscriber.subscriber_positions {
                        writeln!(out, "| position ({registration_id}):       {position:>14}")?;
                    }
                }
                writeln!(out, "-----------------------------------------")?;
            }
        }
        Ok(())
    }

    fn render_rates(
        &self,
        out: &mut impl Write,
        publisher_key: &ChannelSessionKey,
    ) -> std::fmt::Result {
        let Some(rates) = &self.rates else {
            return Ok(());
        };
        let Some(rate) = rates.publisher_rates().get(publisher_key) else {
            return Ok(());
        };
        if !rate.warmed_up() {
            return Ok(());
        }

        let mut result = Ok(());
        rate.consume_rates(|duration, unit, bytes_per_second| {
            if result.is_ok() {
                result = writeln!(
                    out,
                    "| rate ({duration}{unit}):          {bytes_per_second:>14} B/s"
                );
            }
        });
        result
    }
}

impl SnapshotConsumer for ConsolePrinter {
    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.view.apply(snapshot);
        if let Some(rates) = &mut self.rates {
            rates.apply(snapshot);
        }

        let mut out = String::new();
        self.render(&mut out)?;
        print!("{out}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PublisherCounters, SubscriberCounters, SystemCounters};
    use crate::rates::TimeUnit;

    fn snapshot_at(timestamp_ms: i64, publisher_position: i64) -> Snapshot {
        let mut publisher = PublisherCounters::new("udp://h:40123", 3, 7);
        publisher.publisher_position = publisher_position;
        publisher.sender_position = publisher_position / 2;

        let mut subscriber = SubscriberCounters::new("udp://h:40123", 3, 7);
        subscriber.receiver_position = 900;
        subscriber.set_subscriber_position(21, 850);

        Snapshot {
            context: "driver-0".to_owned(),
            timestamp_ms,
            publishers: vec![publisher],
            subscribers: vec![subscriber],
            system: SystemCounters {
                bytes_sent: 4_096,
                ..SystemCounters::default()
            },
        }
    }

    #[test]
    fn test_render_shows_counters_and_connections() {
        let mut printer = ConsolePrinter::new();
        printer.view.apply(&snapshot_at(0, 2_048));

        let mut out = String::new();
        printer.render(&mut out).expect("render");

        assert!(out.contains("System counters for \"driver-0\""));
        assert!(out.contains("4096"));
        assert!(out.contains("udp://h:40123/7"));
        assert!(out.contains("Publisher session 3"));
        assert!(out.contains("buffered:"));
        assert!(out.contains("Subscriber (driver-0)"));
        assert!(out.contains("position (21)"));
    }

    #[test]
    fn test_render_includes_rates_after_warmup() {
        let mut printer = ConsolePrinter::with_rates(&[RateWindow::new(5, TimeUnit::Seconds)])
            .expect("valid windows");

        for i in 0..3 {
            let snapshot = snapshot_at(i * 1_000, i * 2_000);
            printer.view.apply(&snapshot);
            printer
                .rates
                .as_mut()
                .expect("rates configured")
                .apply(&snapshot);
        }

        let mut out = String::new();
        printer.render(&mut out).expect("render");
        assert!(out.contains("rate (5s):"));
        assert!(out.contains("2000 B/s"));
    }

    #[test]
    fn test_render_omits_rates_before_warmup() {
        let mut printer = ConsolePrinter::with_rates(&[RateWindow::new(5, TimeUnit::Seconds)])
            .expect("valid windows");

        let snapshot = snapshot_at(0, 1_000);
        printer.view.apply(&snapshot);
        printer
            .rates
            .as_mut()
            .expect("rates configured")
            .apply(&snapshot);

        let mut out = String::new();
        printer.render(&mut out).expect("render");
        assert!(!out.contains("rate (5s):"));
    }
}
