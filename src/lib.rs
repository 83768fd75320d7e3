//! streamlens: live visibility into a messaging transport's health
//! counters.
//!
//! The pipeline scans a transport's memory-mapped counters file on a
//! fixed interval, folds the typed counter events into session-keyed
//! records, and emits one immutable snapshot per scan batch. Snapshots
//! feed local consumers (console rendering, the cross-context connection
//! graph, moving-average rates) or travel to a remote monitor over a
//! compact versioned wire format.

pub mod agent;
pub mod aggregator;
pub mod clock;
pub mod config;
pub mod console;
pub mod counters;
pub mod model;
pub mod rates;
pub mod transport;
pub mod view;
pub mod wire;
