/// Redirects the process's allocator symbols into the tracker and back.
///
/// The patching mechanism itself lives outside this crate. Both
/// operations must be idempotent and safe to call while tracing is
/// inactive; hook-table validation is the implementation's concern.
pub trait SymbolPatcher: Send + Sync {
  fn overwrite_symbols(&self);
  fn restore_symbols(&self);
}

#[cfg(test)]
pub(crate) mod testing {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::SymbolPatcher;

  #[derive(Default)]
  pub(crate) struct RecordingPatcher {
    pub(crate) overwrites: AtomicUsize,
    pub(crate) restores: AtomicUsize,
  }

  impl SymbolPatcher for RecordingPatcher {
    fn overwrite_symbols(&self) {
      self.overwrites.fetch_add(1, Ordering::Relaxed);
    }

    fn restore_symbols(&self) {
      self.restores.fetch_add(1, Ordering::Relaxed);
    }
  }
}
