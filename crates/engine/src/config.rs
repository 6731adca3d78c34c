//! Engine configuration

use std::time::Duration;

/// Default bound on a single completion wait before the reaper re-checks
/// for shutdown
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-handle engine settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on how long the reaper blocks in one kernel wait.
    /// Also bounds how long `close` waits for the reaper to notice shutdown.
    pub poll_interval: Duration,
    /// Name given to the reaper thread
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            thread_name: "usb-reaper".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}
