pub mod layout;
pub mod poller;

pub use layout::{CounterKind, CountersFile, CountersFileError, SystemCounterKind};
pub use poller::{CounterEvent, CounterListener, CountersPoller, DEFAULT_POLL_INTERVAL};
