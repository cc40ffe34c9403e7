use std::time::Duration;

/// Controls how the tracker observes the process.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
  /// Continue tracing in forked children when the writer can be cloned.
  pub follow_fork: bool,
  /// How often the background worker samples resident memory.
  pub memory_interval: Duration,
  /// Whether allocations also capture a native stack trace.
  pub native_traces: bool,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      follow_fork: false,
      memory_interval: Duration::from_millis(10),
      native_traces: false,
    }
  }
}

impl TrackerConfig {
  #[must_use]
  pub fn with_follow_fork(mut self, follow_fork: bool) -> Self {
    self.follow_fork = follow_fork;
    self
  }

  #[must_use]
  pub fn with_memory_interval(mut self, interval: Duration) -> Self {
    self.memory_interval = interval;
    self
  }

  #[must_use]
  pub fn with_native_traces(mut self, native_traces: bool) -> Self {
    self.native_traces = native_traces;
    self
  }
}
