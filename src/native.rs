use std::{
  collections::HashMap,
  sync::{Mutex, MutexGuard},
};

use smallvec::SmallVec;

/// Deepest native stack the tracker captures per allocation.
const MAX_NATIVE_FRAMES: usize = 64;

/// Raw instruction pointers of the current native call stack, leaf
/// first.
pub struct NativeTrace {
  frames: SmallVec<[usize; MAX_NATIVE_FRAMES]>,
}

impl NativeTrace {
  /// Capture the current stack, dropping the `skip` innermost frames.
  /// Returns whether anything was captured.
  pub fn fill(&mut self, skip: usize) -> bool {
    self.frames.clear();

    let mut remaining_skip = skip;

    backtrace::trace(|frame| {
      if remaining_skip > 0 {
        remaining_skip -= 1;
        return true;
      }

      if self.frames.len() >= MAX_NATIVE_FRAMES {
        return false;
      }

      self.frames.push(frame.ip() as usize);

      true
    });

    !self.frames.is_empty()
  }

  #[must_use]
  pub fn frames(&self) -> &[usize] {
    &self.frames
  }

  #[cfg(test)]
  pub(crate) fn from_ips(ips: &[usize]) -> Self {
    Self {
      frames: SmallVec::from_slice(ips),
    }
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      frames: SmallVec::new(),
    }
  }
}

impl Default for NativeTrace {
  fn default() -> Self {
    Self::new()
  }
}

/// One-time unwinder warm-up. The first capture initializes lazy state
/// inside the unwinding machinery, and that must not happen for the
/// first time inside an allocator hook or after a fork.
pub(crate) fn setup() {
  let mut trace = NativeTrace::new();
  let _ = trace.fill(0);
}

#[derive(Debug, Default)]
struct TreeInner {
  nodes: HashMap<(usize, u32), u32>,
}

/// Deduplicating tree of native frames.
///
/// A trace reduces to the index of its leaf node; every
/// `(instruction pointer, parent index)` pair is reported to `emit`
/// exactly once, on first sighting. Index 0 is the empty trace.
#[derive(Debug, Default)]
pub(crate) struct NativeTraceTree {
  inner: Mutex<TreeInner>,
}

impl NativeTraceTree {
  /// Returns the leaf index for `trace`, or 0 if `emit` refused a new
  /// node. A refused node is not recorded, so a later intern retries it.
  pub(crate) fn intern(
    &self,
    trace: &NativeTrace,
    mut emit: impl FnMut(usize, u32) -> bool,
  ) -> u32 {
    let mut inner = self.lock_inner();
    let mut parent = 0u32;

    // The capture is leaf first; the tree grows from the root.
    for &ip in trace.frames().iter().rev() {
      if let Some(&index) = inner.nodes.get(&(ip, parent)) {
        parent = index;
        continue;
      }

      let index = inner.nodes.len() as u32 + 1;
      if !emit(ip, parent) {
        return 0;
      }

      inner.nodes.insert((ip, parent), index);
      parent = index;
    }

    parent
  }

  fn lock_inner(&self) -> MutexGuard<'_, TreeInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  pub(crate) fn new() -> Self {
    Self::default()
  }
}
