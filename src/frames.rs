use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::records::{FrameId, RawFrame};

/// Assigns stable identifiers to source frames.
///
/// Hit from every tracked thread without the host's lock, so lookups go
/// through a sharded map; the entry shard serializes first sightings,
/// which keeps identifiers unique without a global lock.
#[derive(Debug, Default)]
pub(crate) struct FrameRegistry {
  frames: DashMap<RawFrame, FrameId>,
  next_id: AtomicU64,
}

impl FrameRegistry {
  /// Returns the frame's identifier and whether this is its first
  /// sighting.
  pub(crate) fn get_or_register(&self, frame: &RawFrame) -> (FrameId, bool) {
    if let Some(existing) = self.frames.get(frame) {
      return (*existing, false);
    }

    let mut is_new = false;
    let frame_id = *self.frames.entry(frame.clone()).or_insert_with(|| {
      is_new = true;
      self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    });

    (frame_id, is_new)
  }

  pub(crate) fn new() -> Self {
    Self::default()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;

  #[test]
  fn registers_each_frame_exactly_once() {
    let registry = FrameRegistry::new();
    let frame = RawFrame::new("run", "worker.py", 4);

    let (first_id, first_sighting) = registry.get_or_register(&frame);
    let (second_id, second_sighting) = registry.get_or_register(&frame);

    assert_eq!(first_id, second_id);
    assert!(first_sighting);
    assert!(!second_sighting);
  }

  #[test]
  fn distinct_triples_get_distinct_identifiers() {
    let registry = FrameRegistry::new();

    let (outer, _) = registry.get_or_register(&RawFrame::new("f", "a.py", 1));
    let (inner, _) = registry.get_or_register(&RawFrame::new("f", "a.py", 2));

    assert_ne!(outer, inner);
  }

  #[test]
  fn concurrent_registration_is_a_single_sighting() {
    let registry = Arc::new(FrameRegistry::new());
    let frame = RawFrame::new("hot", "loop.py", 9);

    let handles = (0..4)
      .map(|_| {
        let registry = Arc::clone(&registry);
        let frame = frame.clone();
        std::thread::spawn(move || registry.get_or_register(&frame))
      })
      .collect::<Vec<_>>();

    let results = handles
      .into_iter()
      .map(|handle| handle.join().expect("registration thread"))
      .collect::<Vec<_>>();

    let sightings = results.iter().filter(|(_, is_new)| *is_new).count();
    assert_eq!(sightings, 1);
    assert!(results.windows(2).all(|pair| pair[0].0 == pair[1].0));
  }
}
