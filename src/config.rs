use std::time::Duration;

/// Tuning knobs of the streaming bridge.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use ufo_fluent::Options;
///
/// let options = Options::default().drain_timeout(Duration::from_millis(50));
/// assert_eq!(options.get_drain_timeout(), Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    start_poll: Duration,
    drain_timeout: Duration,
}

impl Options {
    /// How often a feeder re-checks whether the run has started.
    pub fn start_poll(mut self, interval: Duration) -> Self {
        self.start_poll = interval;
        self
    }

    /// How long a drainer waits on its result queue before re-checking
    /// whether the run is done.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn get_start_poll(&self) -> Duration {
        self.start_poll
    }

    pub fn get_drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            start_poll: Duration::from_millis(10),
            drain_timeout: Duration::from_millis(10),
        }
    }
}
