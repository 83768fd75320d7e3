//! Wires the configured pipelines together and drives them.
//!
//! One pipeline per monitored context: counters poller feeding the
//! aggregation engine, which hands each batch's snapshot to the
//! mode-selected consumer. All pipeline work happens inside a single
//! non-blocking [`Agent::do_work`] call, invoked repeatedly by the run
//! loop; nothing here blocks on I/O.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregator::{CounterEventHandler, SharedConsumer, SnapshotConsumer};
use crate::clock::{EpochClock, SystemEpochClock};
use crate::config::{Config, Mode};
use crate::console::ConsolePrinter;
use crate::counters::CountersPoller;
use crate::transport::{SnapshotPublisher, SnapshotSubscriber};

/// Run-loop tick. Scan debouncing happens in the pollers, so the tick
/// only bounds shutdown latency and subscriber poll frequency.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

struct Pipeline {
    poller: CountersPoller,
    handler: CounterEventHandler,
}

impl Pipeline {
    fn do_work(&mut self) -> Result<usize> {
        self.poller.do_work(&mut self.handler)
    }
}

/// The assembled monitor: local pipelines and/or the remote subscriber.
pub struct Agent {
    pipelines: Vec<Pipeline>,
    subscriber: Option<SnapshotSubscriber>,
}

impl Agent {
    /// Build pipelines according to the configured mode. Fails on a
    /// missing or incompatible counters file, or an unusable transport
    /// endpoint.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn EpochClock> = Arc::new(SystemEpochClock);

        let mut pipelines = Vec::new();
        let mut subscriber = None;

        match config.mode {
            Mode::Subscribe => {
                let printer = ConsolePrinter::with_rates(&config.rate_windows)
                    .context("configuring rate windows")?;
                subscriber = Some(
                    SnapshotSubscriber::bind(&config.transport, Box::new(printer))
                        .context("binding snapshot subscription")?,
                );
                info!(
                    endpoint = %config.transport.endpoint,
                    stream_id = config.transport.stream_id,
                    "subscribed to remote snapshots",
                );
            }
            Mode::Local | Mode::Publish => {
                let consumers = Self::consumers(config)?;
                for (context, consumer) in config.contexts.iter().zip(consumers) {
                    let poller = CountersPoller::new(
                        &context.label,
                        &context.dir,
                        config.poll_interval,
                        Arc::clone(&clock),
                    )
                    .with_context(|| {
                        format!("attaching to counters of context {}", context.label)
                    })?;
                    let handler = CounterEventHandler::new(consumer, Arc::clone(&clock));
                    pipelines.push(Pipeline { poller, handler });
                    info!(context = context.label, dir = %context.dir.display(), "monitoring");
                }
            }
        }

        Ok(Self {
            pipelines,
            subscriber,
        })
    }

    /// One snapshot consumer per context, sharing mode-specific state.
    fn consumers(config: &Config) -> Result<Vec<Box<dyn SnapshotConsumer>>> {
        let count = config.contexts.len();
        match config.mode {
            Mode::Local => {
                let printer = ConsolePrinter::with_rates(&config.rate_windows)
                    .context("configuring rate windows")?;
                let shared = SharedConsumer::new(printer);
                Ok((0..count)
                    .map(|_| Box::new(shared.clone()) as Box<dyn SnapshotConsumer>)
                    .collect())
            }
            Mode::Publish => {
                let publisher = SnapshotPublisher::connect(&config.transport)
                    .context("connecting snapshot publication")?;
                info!(
                    endpoint = %config.transport.endpoint,
                    stream_id = config.transport.stream_id,
                    "publishing snapshots",
                );
                let shared = SharedConsumer::new(publisher);
                Ok((0..count)
                    .map(|_| Box::new(shared.clone()) as Box<dyn SnapshotConsumer>)
                    .collect())
            }
            Mode::Subscribe => Ok(Vec::new()),
        }
    }

    /// Execute one unit of work across every pipeline.
    ///
    /// Non-blocking; returns the amount of work done so an external
    /// scheduler could apply an idle strategy.
    pub fn do_work(&mut self) -> Result<usize> {
        let mut work = 0;
        for pipeline in &mut self.pipelines {
            work += pipeline.do_work()?;
        }
        if let Some(subscriber) = &mut self.subscriber {
            work += subscriber.do_work()?;
        }
        Ok(work)
    }

    /// Drive [`Agent::do_work`] until cancelled or a fatal error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("agent cancelled");
                    return Ok(());
                }
                _ = interval.tick() => {
                    self.do_work().context("agent work cycle")?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::MonitoredContext;
    use crate::counters::layout::{
        expected_file_length, COUNTERS_FILE, FILE_MAGIC, FILE_VERSION,
    };

    fn empty_counters_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut image = vec![0u8; expected_file_length(4)];
        image[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        image[4..8].copy_from_slice(&FILE_VERSION.to_le_bytes());
        image[8..12].copy_from_slice(&4i32.to_le_bytes());

        let mut file =
            std::fs::File::create(dir.path().join(COUNTERS_FILE)).expect("create file");
        file.write_all(&image).expect("write file");
        dir
    }

    #[test]
    fn test_local_agent_runs_pipelines() {
        let dir = empty_counters_dir();
        let config = Config {
            contexts: vec![MonitoredContext {
                label: "ctx".to_owned(),
                dir: dir.path().to_owned(),
            }],
            ..Config::default()
        };

        let mut agent = Agent::new(&config).expect("construct agent");
        // A scan of an all-unused file visits nothing but must succeed.
        agent.do_work().expect("work");
    }

    #[test]
    fn test_agent_fails_on_missing_counters_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            contexts: vec![MonitoredContext {
                label: "ctx".to_owned(),
                dir: dir.path().to_owned(),
            }],
            ..Config::default()
        };

        assert!(Agent::new(&config).is_err());
    }

    #[test]
    fn test_subscribe_agent_polls_without_pipelines() {
        let config = Config {
            mode: Mode::Subscribe,
            transport: crate::transport::ChannelConfig {
                endpoint: "127.0.0.1:0".to_owned(),
                ..Default::default()
            },
            ..Config::default()
        };

        let mut agent = Agent::new(&config).expect("construct agent");
        assert_eq!(agent.do_work().expect("work"), 0);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_cancellation() {
        let dir = empty_counters_dir();
        let config = Config {
            contexts: vec![MonitoredContext {
                label: "ctx".to_owned(),
                dir: dir.path().to_owned(),
            }],
            ..Config::default()
        };

        let mut agent = Agent::new(&config).expect("construct agent");
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        agent.run(cancel).await.expect("run until cancelled");
    }
}
