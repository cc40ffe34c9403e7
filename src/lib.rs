//! Runtime tracking engine for a memory profiler of a hosted
//! interpreted language.
//!
//! The tracker interposes on the process allocator, mirrors the host
//! interpreter's call stack per thread, and streams typed records to a
//! writer for offline analysis. Everything is best-effort and
//! fail-stop: a writer failure turns tracing off, never the host
//! process.

mod config;
mod fork;
mod frames;
mod guard;
mod host;
mod modules;
mod native;
mod patcher;
mod records;
mod sampler;
mod shadow;
mod tracker;
mod writer;

use {
  frames::FrameRegistry,
  guard::RecursionGuard,
  log::warn,
  native::{NativeTrace, NativeTraceTree},
  sampler::BackgroundSampler,
  serde::Serialize,
  std::{
    fmt::{self, Display, Formatter},
    fs::File,
    io::{self, BufWriter, Read, Seek, SeekFrom, Write},
    mem,
    path::{Path, PathBuf},
    ptr,
    sync::{
      atomic::{AtomicBool, AtomicPtr, Ordering},
      Arc, Condvar, Mutex, MutexGuard, Once, TryLockError,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
  },
  writer::lock_writer,
};

pub use {
  config::TrackerConfig,
  host::{DecodeError, HostFrame, ProfileEvent, handle_profile_event, register_thread},
  patcher::SymbolPatcher,
  records::{AllocatorKind, FrameId, RawFrame, Record, ThreadId},
  tracker::{InstallError, Tracker},
  writer::{FileWriter, RecordWriter, SharedWriter, WriteError},
};
