use std::cell::Cell;

thread_local! {
  // Accessed through `try_with` only: once this thread's TLS has been
  // torn down the flag reads as suppressed and writes are dropped, so a
  // late allocator callback can never resurrect destroyed state.
  static SUPPRESSED: Cell<bool> = const { Cell::new(false) };
}

/// Scoped reentrancy marker. While one is alive, the interposer fast
/// paths on this thread return immediately, so any allocation the
/// tracker provokes in its own code is ignored.
pub(crate) struct RecursionGuard {
  saved: bool,
}

impl RecursionGuard {
  pub(crate) fn new() -> Self {
    let saved = SUPPRESSED
      .try_with(|flag| flag.replace(true))
      .unwrap_or(true);

    Self { saved }
  }

  #[must_use]
  pub(crate) fn suppressed() -> bool {
    SUPPRESSED.try_with(Cell::get).unwrap_or(true)
  }
}

impl Drop for RecursionGuard {
  fn drop(&mut self) {
    let _ = SUPPRESSED.try_with(|flag| flag.set(self.saved));
  }
}

/// Non-scoped flag access for the fork hooks and the sampler worker,
/// which hold the flag across scopes.
pub(crate) fn set_suppressed(value: bool) {
  let _ = SUPPRESSED.try_with(|flag| flag.set(value));
}
