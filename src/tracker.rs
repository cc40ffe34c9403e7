use super::*;

/// Failures surfaced by `Tracker::install`. Nothing global is left set
/// when installation fails.
#[derive(Debug)]
pub enum InstallError {
  Header(WriteError),
  Sampler(io::Error),
}

impl Display for InstallError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Header(err) => write!(f, "failed to write trace header: {err}"),
      Self::Sampler(err) => write!(f, "failed to start memory sampler: {err}"),
    }
  }
}

impl std::error::Error for InstallError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Header(err) => Some(err),
      Self::Sampler(err) => Some(err),
    }
  }
}

// Singleton handles. Ordering contract:
//
// - TRACKER_INSTANCE is stored before allocator symbols are overwritten
//   and cleared only after they are restored, so a patched symbol can
//   always resolve the instance it is about to use.
// - TRACKER_ACTIVE is set last during install and cleared first during
//   teardown; fast paths must check it before dereferencing
//   TRACKER_INSTANCE. In-flight calls that already passed the check
//   complete against the still-allocated tracker: teardown is
//   serialized by the embedder, and a fork child leaks the inherited
//   tracker instead of freeing it.
// - TRACKER_OWNER drives destruction and is only leaked, never dropped,
//   in a fork child.
static TRACKER_ACTIVE: AtomicBool = AtomicBool::new(false);
static TRACKER_INSTANCE: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());
static TRACKER_OWNER: Mutex<Option<OwnedTracker>> = Mutex::new(None);
static SETUP_ONCE: Once = Once::new();

/// Owning handle to the heap-allocated tracker. The tracker stays
/// reachable through the raw observable pointer for its whole life, so
/// the owner holds the same raw pointer and frees it explicitly; a fork
/// child leaks it with `mem::forget` instead.
pub(crate) struct OwnedTracker(*mut Tracker);

// SAFETY: Tracker is Send + Sync (asserted below) and this handle is
// the allocation's only owner.
unsafe impl Send for OwnedTracker {}

impl Drop for OwnedTracker {
  fn drop(&mut self) {
    // SAFETY: the pointer came from Box::into_raw in `build` and has
    // not been freed.
    drop(unsafe { Box::from_raw(self.0) });
  }
}

const _: () = {
  const fn require_send_sync<T: Send + Sync>() {}
  require_send_sync::<Tracker>();
};

pub(crate) fn thread_id() -> ThreadId {
  // The pthread id doubles as the stream's thread identifier.
  unsafe { libc::pthread_self() as ThreadId }
}

fn lock_owner() -> MutexGuard<'static, Option<OwnedTracker>> {
  match TRACKER_OWNER.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

/// Process-wide tracking engine: owns the writer, the frame registry,
/// the native trace tree, the symbol patcher, and the background
/// sampler. At most one exists per process.
pub struct Tracker {
  follow_fork: bool,
  frames: FrameRegistry,
  memory_interval: Duration,
  native_traces: bool,
  native_tree: NativeTraceTree,
  patcher: Arc<dyn SymbolPatcher>,
  sampler: Mutex<Option<BackgroundSampler>>,
  writer: SharedWriter,
}

impl Tracker {
  pub(crate) fn activate() {
    TRACKER_ACTIVE.store(true, Ordering::Release);
  }

  /// Undo a partial construction: clear the observable pointer, then
  /// free the allocation (its teardown is idempotent and tolerates the
  /// half-built state).
  fn abort_build(tracker: *mut Tracker, error: InstallError) -> InstallError {
    TRACKER_INSTANCE.store(ptr::null_mut(), Ordering::Release);
    drop(OwnedTracker(tracker));
    error
  }

  /// Construct a tracker and wire it into the process, leaving only the
  /// active flag and the owner registration to the caller.
  pub(crate) fn build(
    writer: Box<dyn RecordWriter>,
    patcher: Arc<dyn SymbolPatcher>,
    config: TrackerConfig,
    reset_thread_stack: bool,
  ) -> Result<OwnedTracker, InstallError> {
    let tracker = Box::into_raw(Box::new(Self {
      follow_fork: config.follow_fork,
      frames: FrameRegistry::new(),
      memory_interval: config.memory_interval,
      native_traces: config.native_traces,
      native_tree: NativeTraceTree::new(),
      patcher,
      sampler: Mutex::new(None),
      writer: Arc::new(Mutex::new(writer)),
    }));

    // Interposers can see the instance from here on, but the active
    // flag is still false, so they return without touching it.
    TRACKER_INSTANCE.store(tracker, Ordering::Release);

    // SAFETY: freshly allocated above and not freed on any path that
    // still uses `this`.
    let this = unsafe { &*tracker };

    // One-time process setup must finish before any child could inherit
    // a half-initialized state.
    SETUP_ONCE.call_once(|| {
      native::setup();
      fork::register_fork_handlers();
    });

    if let Err(err) = lock_writer(&this.writer).write_header(false) {
      return Err(Self::abort_build(tracker, InstallError::Header(err)));
    }

    this.update_module_cache();

    {
      let _guard = RecursionGuard::new();
      // A fork child inherits a thread that is already being observed;
      // resetting there would drop the logical stack it must re-emit.
      if reset_thread_stack {
        shadow::reset_thread(None);
      }
      this.patcher.overwrite_symbols();
    }

    match BackgroundSampler::start(Arc::clone(&this.writer), this.memory_interval) {
      Ok(sampler) => {
        if let Ok(mut slot) = this.sampler.lock() {
          *slot = Some(sampler);
        }
      }
      Err(err) => {
        return Err(Self::abort_build(tracker, InstallError::Sampler(err)));
      }
    }

    Ok(OwnedTracker(tracker))
  }

  pub(crate) fn child_config(&self) -> TrackerConfig {
    TrackerConfig {
      follow_fork: self.follow_fork,
      memory_interval: self.memory_interval,
      native_traces: self.native_traces,
    }
  }

  pub(crate) fn clear_instance() {
    TRACKER_INSTANCE.store(ptr::null_mut(), Ordering::Release);
  }

  pub(crate) fn clone_patcher(&self) -> Arc<dyn SymbolPatcher> {
    Arc::clone(&self.patcher)
  }

  /// Clone the writer for a fork child. `None` when the writer is
  /// locked by a thread that did not survive the fork or when the sink
  /// cannot be cloned.
  pub(crate) fn clone_writer_for_child(&self) -> Option<Box<dyn RecordWriter>> {
    match self.writer.try_lock() {
      Ok(writer) => writer.clone_in_child(),
      Err(TryLockError::Poisoned(err)) => err.into_inner().clone_in_child(),
      Err(TryLockError::WouldBlock) => None,
    }
  }

  pub(crate) fn deactivate() {
    TRACKER_ACTIVE.store(false, Ordering::Release);
  }

  pub(crate) fn follows_fork(&self) -> bool {
    self.follow_fork
  }

  /// Install the tracker, replacing (and first tearing down) any live
  /// one. Construction order: observable pointer, one-time setup,
  /// stream header, module snapshot, thread reset + symbol overwrite
  /// under a reentrancy guard, sampler, active flag.
  ///
  /// # Errors
  ///
  /// Returns an `InstallError` when the header cannot be written or the
  /// sampler cannot start; no global state is left set.
  pub fn install(
    writer: Box<dyn RecordWriter>,
    patcher: Arc<dyn SymbolPatcher>,
    config: TrackerConfig,
  ) -> Result<(), InstallError> {
    let mut owner = lock_owner();

    // Tear down any live tracker first.
    owner.take();

    let tracker = Self::build(writer, patcher, config, true)?;
    Self::activate();
    *owner = Some(tracker);

    Ok(())
  }

  pub(crate) fn instance() -> Option<&'static Self> {
    let tracker = TRACKER_INSTANCE.load(Ordering::Acquire);
    // SAFETY: see the ordering contract on the statics above. The
    // pointer is only ever nulled after the active flag is cleared, and
    // the pointee is either owned by TRACKER_OWNER or intentionally
    // leaked, so a caller that observed it non-null may use it.
    unsafe { tracker.as_ref() }
  }

  /// Re-overwrite symbols and re-snapshot loaded modules. The external
  /// trigger for "loaded objects may have changed", e.g. after `dlopen`.
  pub fn invalidate_module_cache() {
    let _guard = RecursionGuard::new();

    let Some(tracker) = Self::instance() else {
      return;
    };

    tracker.patcher.overwrite_symbols();
    tracker.update_module_cache();
  }

  #[must_use]
  pub fn is_active() -> bool {
    TRACKER_ACTIVE.load(Ordering::Acquire)
  }

  /// Emit coalesced pop records for this thread, splitting counts
  /// larger than 255.
  pub(crate) fn pop_frames(&self, mut count: u64) -> Result<(), WriteError> {
    let thread_id = thread_id();

    while count > 0 {
      let to_pop = count.min(u64::from(u8::MAX)) as u8;
      count -= u64::from(to_pop);

      let record = Record::FramePop {
        thread_id,
        count: to_pop,
      };
      if let Err(err) = lock_writer(&self.writer).write_record(&record) {
        warn!("failed to write frame pop, deactivating tracking: {err}");
        Self::deactivate();
        return Err(err);
      }
    }

    Ok(())
  }

  /// Emit a push record for `frame`, preceded by its index record on
  /// first sighting.
  pub(crate) fn push_frame(&self, frame: &RawFrame) -> Result<(), WriteError> {
    let (frame_id, is_new) = self.frames.get_or_register(frame);

    if is_new {
      let record = Record::FrameIndex {
        frame_id,
        frame: frame.clone(),
      };
      if let Err(err) = lock_writer(&self.writer).write_record(&record) {
        warn!("failed to write frame index, deactivating tracking: {err}");
        Self::deactivate();
        return Err(err);
      }
    }

    let record = Record::FramePush {
      frame_id,
      thread_id: thread_id(),
    };
    if let Err(err) = lock_writer(&self.writer).write_record(&record) {
      warn!("failed to write frame push, deactivating tracking: {err}");
      Self::deactivate();
      return Err(err);
    }

    Ok(())
  }

  fn record_event(
    &self,
    address: usize,
    size: usize,
    allocator: AllocatorKind,
    capture_native: bool,
  ) {
    let line = shadow::current_line();

    shadow::flush_pops(self);
    shadow::flush_pushes(self);

    let mut native_index = 0;
    if capture_native && self.native_traces {
      let mut trace = NativeTrace::new();
      // Skip this function and the `track_*` entry point.
      if trace.fill(2) {
        native_index = self.native_tree.intern(&trace, |instruction_pointer, parent_index| {
          lock_writer(&self.writer)
            .write_record(&Record::NativeTraceIndex {
              instruction_pointer,
              parent_index,
            })
            .is_ok()
        });
      }
    }

    let record = Record::Allocation {
      thread_id: thread_id(),
      address,
      size,
      allocator,
      line,
      native_index,
    };
    if let Err(err) = lock_writer(&self.writer).write_record(&record) {
      warn!("failed to write allocation record, deactivating tracking: {err}");
      Self::deactivate();
    }
  }

  /// Emit a `ThreadRecord` naming the calling thread.
  pub fn register_thread_name(name: &str) {
    if RecursionGuard::suppressed() || !Self::is_active() {
      return;
    }
    let _guard = RecursionGuard::new();

    let Some(tracker) = Self::instance() else {
      return;
    };

    let record = Record::ThreadRecord {
      thread_id: thread_id(),
      name: name.to_string(),
    };
    if let Err(err) = lock_writer(&tracker.writer).write_record(&record) {
      warn!("failed to write thread record, deactivating tracking: {err}");
      Self::deactivate();
    }
  }

  /// Fast-path entry point for patched allocation symbols.
  pub fn track_allocation(address: usize, size: usize, allocator: AllocatorKind) {
    if RecursionGuard::suppressed() || !Self::is_active() {
      return;
    }
    let _guard = RecursionGuard::new();

    let Some(tracker) = Self::instance() else {
      return;
    };

    tracker.record_event(address, size, allocator, true);
  }

  /// Fast-path entry point for patched deallocation symbols. Never
  /// captures a native trace.
  pub fn track_deallocation(address: usize, size: usize, allocator: AllocatorKind) {
    if RecursionGuard::suppressed() || !Self::is_active() {
      return;
    }
    let _guard = RecursionGuard::new();

    let Some(tracker) = Self::instance() else {
      return;
    };

    tracker.record_event(address, size, allocator, false);
  }

  pub(crate) fn try_lock_owner() -> Option<MutexGuard<'static, Option<OwnedTracker>>> {
    match TRACKER_OWNER.try_lock() {
      Ok(guard) => Some(guard),
      Err(TryLockError::Poisoned(err)) => Some(err.into_inner()),
      Err(TryLockError::WouldBlock) => None,
    }
  }

  /// Tear down the live tracker, if any. Idempotent.
  pub fn uninstall() {
    lock_owner().take();
  }

  fn update_module_cache(&self) {
    if !self.native_traces {
      return;
    }

    if let Err(err) = modules::write_module_snapshot(&self.writer) {
      warn!("failed to write module map, deactivating tracking: {err}");
      Self::deactivate();
    }
  }
}

impl Drop for Tracker {
  fn drop(&mut self) {
    let _guard = RecursionGuard::new();

    Self::deactivate();

    let sampler = match self.sampler.get_mut() {
      Ok(slot) => slot.take(),
      Err(err) => err.into_inner().take(),
    };
    if let Some(sampler) = sampler {
      sampler.stop();
    }

    shadow::reset_thread(None);
    self.patcher.restore_symbols();

    if let Err(err) = lock_writer(&self.writer).write_header(true) {
      warn!("failed to write closing trace header: {err}");
    }

    TRACKER_INSTANCE.store(ptr::null_mut(), Ordering::Release);
  }
}
