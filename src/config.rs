use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::rates::{RateWindow, TimeUnit};
use crate::transport::ChannelConfig;

/// Top-level configuration for the streamlens monitor.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How snapshots leave this process.
    #[serde(default)]
    pub mode: Mode,

    /// Monitored transport instances, one pipeline each. Must be empty
    /// in subscribe mode and non-empty otherwise.
    #[serde(default)]
    pub contexts: Vec<MonitoredContext>,

    /// Interval between counters-file scans. Default: 1s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Addressing for snapshot distribution (publish/subscribe modes).
    #[serde(default)]
    pub transport: ChannelConfig,

    /// Moving-average windows reported per publisher stream.
    #[serde(default = "default_rate_windows")]
    pub rate_windows: Vec<RateWindow>,
}

/// Where snapshots are consumed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Render locally.
    #[default]
    Local,

    /// Forward snapshots to a remote monitor.
    Publish,

    /// Receive snapshots from remote monitors and render them.
    Subscribe,
}

/// One monitored transport instance.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoredContext {
    /// Label identifying this context in snapshots.
    pub label: String,

    /// Directory containing the transport's counters file.
    pub dir: PathBuf,
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_rate_windows() -> Vec<RateWindow> {
    vec![
        RateWindow::new(10, TimeUnit::Seconds),
        RateWindow::new(1, TimeUnit::Minutes),
        RateWindow::new(10, TimeUnit::Minutes),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            mode: Mode::default(),
            contexts: Vec::new(),
            poll_interval: default_poll_interval(),
            transport: ChannelConfig::default(),
            rate_windows: default_rate_windows(),
        }
    }
}

impl Config {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Subscribe => {
                if !self.contexts.is_empty() {
                    bail!("subscribe mode does not scan local counters; remove contexts");
                }
            }
            Mode::Local | Mode::Publish => {
                if self.contexts.is_empty() {
                    bail!("at least one monitored context is required");
                }
            }
        }

        let mut labels = HashSet::new();
        for context in &self.contexts {
            if !labels.insert(context.label.as_str()) {
                bail!("duplicate context label: {}", context.label);
            }
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than zero");
        }

        Ok(())
    }
}
