use super::*;

/// Hook the process fork machinery so tracker state survives a fork.
/// Called once from the one-time setup path.
pub(crate) fn register_fork_handlers() {
  // SAFETY: the hooks touch only atomics, thread-local flags, and
  // try-locked state, all of which is async-signal-tolerant on the
  // single thread that exists inside fork.
  unsafe {
    libc::pthread_atfork(Some(prepare_fork), Some(parent_fork), Some(child_fork));
  }
}

extern "C" fn prepare_fork() {
  // libc's own fork path may allocate; none of that may recurse into
  // the tracker while the process is serialized around fork.
  guard::set_suppressed(true);
}

extern "C" fn parent_fork() {
  guard::set_suppressed(false);
}

pub(crate) extern "C" fn child_fork() {
  // The child starts with an empty stream, so the logical stack is kept
  // but every frame must be re-emitted.
  shadow::reset_in_child();

  let Some(mut owner) = Tracker::try_lock_owner() else {
    // Another thread held the owning handle when the fork happened; the
    // inherited tracker is unusable, so tracing stays off in the child.
    Tracker::deactivate();
    Tracker::clear_instance();
    guard::set_suppressed(false);
    return;
  };

  // Leak the inherited tracker rather than dropping it. Its mutexes may
  // be held by threads that did not survive the fork, its sampler
  // thread is gone, and its writer may own a descriptor that means
  // nothing here.
  if let Some(inherited) = owner.take() {
    mem::forget(inherited);
  }

  match rebuild_in_child() {
    Some(tracker) => {
      Tracker::activate();
      *owner = Some(tracker);
    }
    None => {
      Tracker::deactivate();
      Tracker::clear_instance();
    }
  }

  drop(owner);
  guard::set_suppressed(false);
}

/// Build a fresh tracker from the leaked parent instance, or `None`
/// when tracing cannot continue in this child.
fn rebuild_in_child() -> Option<tracker::OwnedTracker> {
  let inherited = Tracker::instance()?;
  if !Tracker::is_active() || !inherited.follows_fork() {
    return None;
  }

  let writer = inherited.clone_writer_for_child()?;

  match Tracker::build(
    writer,
    inherited.clone_patcher(),
    inherited.child_config(),
    false,
  ) {
    Ok(tracker) => Some(tracker),
    Err(err) => {
      warn!("could not continue tracing in fork child: {err}");
      None
    }
  }
}
