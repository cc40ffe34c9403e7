use super::*;

/// Failures reported by a record writer.
#[derive(Debug)]
pub enum WriteError {
  Encode(serde_json::Error),
  Io(io::Error),
}

impl Display for WriteError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Encode(err) => write!(f, "failed to encode record: {err}"),
      Self::Io(err) => write!(f, "i/o error while writing record: {err}"),
    }
  }
}

impl std::error::Error for WriteError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Encode(err) => Some(err),
      Self::Io(err) => Some(err),
    }
  }
}

impl From<io::Error> for WriteError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for WriteError {
  fn from(value: serde_json::Error) -> Self {
    Self::Encode(value)
  }
}

/// Sink for the typed record stream.
///
/// Implementations report failure instead of panicking and must never
/// call back into a tracked allocator; any allocation they do perform is
/// contained by the caller's reentrancy guard.
pub trait RecordWriter: Send {
  /// Clone this writer for a freshly forked child, or `None` when the
  /// sink cannot follow a fork.
  fn clone_in_child(&self) -> Option<Box<dyn RecordWriter>>;

  /// Write the stream header; `is_final` marks the closing header
  /// written at teardown.
  ///
  /// # Errors
  ///
  /// Returns a `WriteError` if the header cannot be persisted.
  fn write_header(&mut self, is_final: bool) -> Result<(), WriteError>;

  /// # Errors
  ///
  /// Returns a `WriteError` if the record cannot be persisted.
  fn write_record(&mut self, record: &Record) -> Result<(), WriteError>;
}

/// Shared handle to the writer.
///
/// Per-record writes take the lock briefly; holding the guard across
/// several `write_record` calls is the exclusive-lock protocol that
/// keeps a multi-record batch contiguous in the stream.
pub type SharedWriter = Arc<Mutex<Box<dyn RecordWriter>>>;

pub(crate) fn lock_writer(
  writer: &SharedWriter,
) -> MutexGuard<'_, Box<dyn RecordWriter>> {
  match writer.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct HeaderLine {
  format: &'static str,
  version: u32,
  pid: u32,
  is_final: bool,
}

/// JSON-lines sink: one object per record, bracketed by header lines.
pub struct FileWriter {
  file: BufWriter<File>,
  path: PathBuf,
}

impl FileWriter {
  /// # Errors
  ///
  /// Returns a `WriteError` if the file cannot be created.
  pub fn create(path: impl AsRef<Path>) -> Result<Self, WriteError> {
    let path = path.as_ref().to_path_buf();
    let file = BufWriter::new(File::create(&path)?);

    Ok(Self { file, path })
  }

  fn write_line<T: Serialize>(&mut self, value: &T) -> Result<(), WriteError> {
    serde_json::to_writer(&mut self.file, value)?;
    self.file.write_all(b"\n")?;
    Ok(())
  }
}

impl RecordWriter for FileWriter {
  fn clone_in_child(&self) -> Option<Box<dyn RecordWriter>> {
    // Runs in the child, so the suffix is the child's pid.
    let mut path = self.path.clone().into_os_string();
    path.push(format!(".{}", std::process::id()));

    FileWriter::create(PathBuf::from(path))
      .ok()
      .map(|writer| Box::new(writer) as Box<dyn RecordWriter>)
  }

  fn write_header(&mut self, is_final: bool) -> Result<(), WriteError> {
    self.write_line(&HeaderLine {
      format: "memtrail",
      version: FORMAT_VERSION,
      pid: std::process::id(),
      is_final,
    })?;

    if is_final {
      self.file.flush()?;
    }

    Ok(())
  }

  fn write_record(&mut self, record: &Record) -> Result<(), WriteError> {
    self.write_line(record)
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;

  /// Record and header logs of a writer cloned for a fork child.
  pub(crate) struct CollectedStream {
    pub(crate) headers: Arc<Mutex<Vec<bool>>>,
    pub(crate) records: Arc<Mutex<Vec<Record>>>,
  }

  /// In-memory writer used across the crate's tests. The log handles
  /// survive the writer being boxed into the tracker.
  pub(crate) struct CollectingWriter {
    pub(crate) child: Arc<Mutex<Option<CollectedStream>>>,
    cloneable: bool,
    fail_after: Option<usize>,
    pub(crate) headers: Arc<Mutex<Vec<bool>>>,
    pub(crate) records: Arc<Mutex<Vec<Record>>>,
  }

  impl CollectingWriter {
    pub(crate) fn logs(&self) -> (Arc<Mutex<Vec<Record>>>, Arc<Mutex<Vec<bool>>>) {
      (Arc::clone(&self.records), Arc::clone(&self.headers))
    }

    pub(crate) fn new() -> Self {
      Self::with_limit(None)
    }

    /// Refuse cloning for a fork child, emulating an uncloneable sink.
    pub(crate) fn sealed_for_fork(mut self) -> Self {
      self.cloneable = false;
      self
    }

    /// Accept `fail_after` records, then fail every write.
    pub(crate) fn with_limit(fail_after: Option<usize>) -> Self {
      Self {
        child: Arc::new(Mutex::new(None)),
        cloneable: true,
        fail_after,
        headers: Arc::new(Mutex::new(Vec::new())),
        records: Arc::new(Mutex::new(Vec::new())),
      }
    }
  }

  impl RecordWriter for CollectingWriter {
    fn clone_in_child(&self) -> Option<Box<dyn RecordWriter>> {
      if !self.cloneable {
        return None;
      }

      let clone = CollectingWriter::new();
      let stream = CollectedStream {
        headers: Arc::clone(&clone.headers),
        records: Arc::clone(&clone.records),
      };

      if let Ok(mut child) = self.child.lock() {
        *child = Some(stream);
      }

      Some(Box::new(clone))
    }

    fn write_header(&mut self, is_final: bool) -> Result<(), WriteError> {
      if let Ok(mut headers) = self.headers.lock() {
        headers.push(is_final);
      }
      Ok(())
    }

    fn write_record(&mut self, record: &Record) -> Result<(), WriteError> {
      let mut records = match self.records.lock() {
        Ok(guard) => guard,
        Err(err) => err.into_inner(),
      };

      if let Some(limit) = self.fail_after {
        if records.len() >= limit {
          return Err(WriteError::Io(io::Error::other("synthetic writer failure")));
        }
      }

      records.push(record.clone());
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn file_writer_emits_one_line_per_entry() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("stream.trace");

    let mut writer = FileWriter::create(&path).expect("create writer");
    writer.write_header(false).expect("open header");
    writer
      .write_record(&Record::FramePop { thread_id: 1, count: 3 })
      .expect("record");
    writer.write_header(true).expect("closing header");
    drop(writer);

    let contents = std::fs::read_to_string(&path).expect("read back");
    let lines = contents.lines().collect::<Vec<_>>();

    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("\"is_final\":false"));
    assert!(lines[1].contains("\"kind\":\"FramePop\""));
    assert!(lines[2].contains("\"is_final\":true"));
  }

  #[test]
  fn file_writer_clones_to_a_pid_suffixed_sibling() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("stream.trace");

    let writer = FileWriter::create(&path).expect("create writer");
    let clone = writer.clone_in_child();
    assert!(clone.is_some());

    let sibling = dir
      .path()
      .join(format!("stream.trace.{}", std::process::id()));
    assert!(sibling.exists());
  }
}
