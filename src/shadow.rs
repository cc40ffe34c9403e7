use std::{
  cell::RefCell,
  sync::{Arc, Weak},
};

use crate::{host::HostFrame, records::RawFrame, tracker::Tracker};

const INITIAL_STACK_CAPACITY: usize = 1024;

struct ShadowFrame {
  emitted: bool,
  frame: Weak<dyn HostFrame>,
  raw: RawFrame,
}

/// Per-thread mirror of the host interpreter's frame stack.
///
/// Allocator callbacks can fire during thread teardown, after this
/// thread's TLS has already been destroyed. Every access therefore goes
/// through `try_with`, which refuses to resurrect destroyed state, and
/// the frame container itself is an `Option` that only `push_frame`
/// populates: a dying thread sees "no stack" instead of re-creating a
/// container whose destructor would never run in the right order.
#[derive(Default)]
struct ThreadStack {
  entry_frame: Option<Weak<dyn HostFrame>>,
  frames: Option<Vec<ShadowFrame>>,
  pending_pops: u64,
}

thread_local! {
  static THREAD_STACK: RefCell<ThreadStack> = RefCell::new(ThreadStack::default());
}

fn with_stack<R>(f: impl FnOnce(&mut ThreadStack) -> R) -> Option<R> {
  THREAD_STACK.try_with(|stack| f(&mut stack.borrow_mut())).ok()
}

/// Line number of the innermost frame the tracker knows about: the top
/// of the shadow stack, the entry frame before anything was pushed, or
/// 0 once execution has returned above the observation point.
pub(crate) fn current_line() -> u32 {
  with_stack(|stack| {
    let top = stack
      .frames
      .as_ref()
      .and_then(|frames| frames.last())
      .map(|frame| &frame.frame)
      .or(stack.entry_frame.as_ref());

    let Some(weak) = top else { return 0 };

    debug_assert!(weak.strong_count() > 0);
    weak.upgrade().map_or(0, |frame| frame.line_number())
  })
  .unwrap_or(0)
}

/// Emit the coalesced pop count through `tracker`, clearing the counter
/// only on success.
pub(crate) fn flush_pops(tracker: &Tracker) {
  let pending = with_stack(|stack| stack.pending_pops).unwrap_or(0);
  if pending == 0 {
    return;
  }

  if tracker.pop_frames(pending).is_ok() {
    let _ = with_stack(|stack| stack.pending_pops = 0);
  }
}

/// Emit push records for every frame above the deepest already-emitted
/// one, stopping at the first writer failure so a later retry resumes
/// from the same boundary.
pub(crate) fn flush_pushes(tracker: &Tracker) {
  let _ = with_stack(|stack| {
    let Some(frames) = stack.frames.as_mut() else {
      return;
    };

    let first_unemitted = frames
      .iter()
      .rposition(|frame| frame.emitted)
      .map_or(0, |deepest| deepest + 1);

    for frame in &mut frames[first_unemitted..] {
      if tracker.push_frame(&frame.raw).is_err() {
        break;
      }
      frame.emitted = true;
    }
  });
}

/// Record a host return.
pub(crate) fn pop_frame() {
  let flush_now = with_stack(|stack| match stack.frames.as_mut() {
    Some(frames) if !frames.is_empty() => {
      if let Some(frame) = frames.pop() {
        if frame.emitted {
          stack.pending_pops += 1;
        }
      }

      // Emptied: flush now, in case the thread is exiting and this is
      // the last chance.
      frames.is_empty() && stack.pending_pops > 0
    }
    _ => {
      // Returning above the observation point; the entry frame is
      // about to be freed and must not be consulted again.
      stack.entry_frame = None;
      false
    }
  })
  .unwrap_or(false);

  if flush_now {
    if let Some(tracker) = Tracker::instance() {
      flush_pops(tracker);
    }
  }
}

/// Record a host call. The only operation that creates the frame
/// container.
pub(crate) fn push_frame(
  frame: &Arc<dyn HostFrame>,
  function: String,
  file_name: String,
  parent_line: u32,
) {
  let _ = with_stack(|stack| {
    stack
      .frames
      .get_or_insert_with(|| Vec::with_capacity(INITIAL_STACK_CAPACITY))
      .push(ShadowFrame {
        emitted: false,
        frame: Arc::downgrade(frame),
        raw: RawFrame::new(function, file_name, parent_line),
      });
  });
}

/// Forget emission state after a fork. The child's stream starts empty,
/// so the logical stack is kept but every frame will be re-emitted to
/// the child's writer.
pub(crate) fn reset_in_child() {
  let _ = with_stack(|stack| {
    stack.pending_pops = 0;

    if let Some(frames) = stack.frames.as_mut() {
      for frame in frames {
        frame.emitted = false;
      }
    }
  });
}

/// Start (or restart) observation on this thread from `current_frame`.
pub(crate) fn reset_thread(current_frame: Option<&Arc<dyn HostFrame>>) {
  let _ = with_stack(|stack| {
    stack.entry_frame = current_frame.map(Arc::downgrade);

    if let Some(frames) = stack.frames.as_mut() {
      frames.clear();
    }
  });
}

#[cfg(test)]
pub(crate) fn clear_thread() {
  let _ = with_stack(|stack| {
    stack.entry_frame = None;
    stack.frames = None;
    stack.pending_pops = 0;
  });
}

#[cfg(test)]
pub(crate) fn depth() -> usize {
  with_stack(|stack| stack.frames.as_ref().map_or(0, Vec::len)).unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn emitted_depth() -> usize {
  with_stack(|stack| {
    stack
      .frames
      .as_ref()
      .map_or(0, |frames| frames.iter().filter(|frame| frame.emitted).count())
  })
  .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn has_entry_frame() -> bool {
  with_stack(|stack| stack.entry_frame.is_some()).unwrap_or(false)
}

#[cfg(test)]
pub(crate) fn mark_all_emitted() {
  let _ = with_stack(|stack| {
    if let Some(frames) = stack.frames.as_mut() {
      for frame in frames {
        frame.emitted = true;
      }
    }
  });
}

#[cfg(test)]
pub(crate) fn pending_pops() -> u64 {
  with_stack(|stack| stack.pending_pops).unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::testing::StubFrame;

  fn stub(line: u32) -> Arc<dyn HostFrame> {
    StubFrame::new("f", "test.py", line)
  }

  #[test]
  fn mirrors_calls_and_returns() {
    clear_thread();

    let frame = stub(1);
    push_frame(&frame, "a".into(), "test.py".into(), 0);
    push_frame(&frame, "b".into(), "test.py".into(), 1);
    push_frame(&frame, "c".into(), "test.py".into(), 2);
    assert_eq!(depth(), 3);

    pop_frame();
    assert_eq!(depth(), 2);

    pop_frame();
    pop_frame();
    assert_eq!(depth(), 0);
  }

  #[test]
  fn unemitted_frames_pop_silently() {
    clear_thread();

    let frame = stub(1);
    push_frame(&frame, "a".into(), "test.py".into(), 0);
    push_frame(&frame, "b".into(), "test.py".into(), 1);

    pop_frame();
    pop_frame();

    assert_eq!(pending_pops(), 0);
  }

  #[test]
  fn returns_past_the_bottom_clear_the_entry_frame() {
    clear_thread();

    let frame = stub(7);
    reset_thread(Some(&frame));
    assert!(has_entry_frame());

    pop_frame();
    assert!(!has_entry_frame());

    // Further returns above the observation point stay absorbed.
    pop_frame();
    assert_eq!(depth(), 0);
  }

  #[test]
  fn current_line_prefers_the_top_of_the_stack() {
    clear_thread();

    let entry = stub(5);
    reset_thread(Some(&entry));
    assert_eq!(current_line(), 5);

    let inner = stub(9);
    push_frame(&inner, "g".into(), "test.py".into(), 5);
    assert_eq!(current_line(), 9);

    pop_frame();
    assert_eq!(current_line(), 5);

    pop_frame();
    assert_eq!(current_line(), 0);
  }

  #[test]
  fn child_reset_keeps_the_stack_but_forgets_emission() {
    clear_thread();

    let frame = stub(1);
    push_frame(&frame, "a".into(), "test.py".into(), 0);
    push_frame(&frame, "b".into(), "test.py".into(), 1);
    mark_all_emitted();
    assert_eq!(emitted_depth(), 2);

    pop_frame();
    assert_eq!(pending_pops(), 1);

    reset_in_child();

    assert_eq!(depth(), 1);
    assert_eq!(emitted_depth(), 0);
    assert_eq!(pending_pops(), 0);
  }
}
