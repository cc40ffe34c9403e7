use std::sync::Arc;

use serde::Serialize;

/// Identifier of the thread an event was observed on.
pub type ThreadId = u64;

/// Identifier assigned to a source frame on its first sighting.
pub type FrameId = u64;

/// Which patched allocator entry point produced an event.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub enum AllocatorKind {
  Malloc,
  Calloc,
  Realloc,
  Free,
  PosixMemalign,
  AlignedAlloc,
  Memalign,
  Valloc,
  Pvalloc,
  Mmap,
  Munmap,
}

/// A source frame ready to be emitted: enough to name a call site
/// without holding onto the host frame object itself.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct RawFrame {
  pub function_name: Arc<str>,
  pub file_name: Arc<str>,
  pub parent_line: u32,
}

impl RawFrame {
  #[must_use]
  pub fn new(
    function_name: impl Into<String>,
    file_name: impl Into<String>,
    parent_line: u32,
  ) -> Self {
    Self {
      function_name: Arc::<str>::from(function_name.into()),
      file_name: Arc::<str>::from(file_name.into()),
      parent_line,
    }
  }
}

/// One entry of the trace stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Record {
  /// First sighting of a source frame anywhere in the stream.
  FrameIndex { frame_id: FrameId, frame: RawFrame },
  FramePush { frame_id: FrameId, thread_id: ThreadId },
  /// One or more coalesced returns; `count` never exceeds 255.
  FramePop { thread_id: ThreadId, count: u8 },
  Allocation {
    thread_id: ThreadId,
    address: usize,
    size: usize,
    allocator: AllocatorKind,
    line: u32,
    native_index: u32,
  },
  /// First sighting of a native frame within the trace tree.
  NativeTraceIndex {
    instruction_pointer: usize,
    parent_index: u32,
  },
  MemoryRecord { timestamp_ms: u64, rss_bytes: u64 },
  /// Marks the start of a loaded-module snapshot batch.
  MemoryMapStart,
  SegmentHeader {
    module_name: String,
    segment_count: usize,
    load_address: usize,
  },
  Segment {
    virtual_address: usize,
    memory_size: usize,
  },
  ThreadRecord { thread_id: ThreadId, name: String },
}
