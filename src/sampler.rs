use super::*;

/// Background worker that samples resident-set size while the main
/// application is being instrumented.
///
/// The worker holds a shared handle to the writer only, never to the
/// tracker, so there is no ownership cycle to break at teardown.
pub(crate) struct BackgroundSampler {
  handle: Option<thread::JoinHandle<()>>,
  shared: Arc<SamplerShared>,
}

struct SamplerShared {
  stopped: Mutex<bool>,
  wakeup: Condvar,
}

impl BackgroundSampler {
  /// # Errors
  ///
  /// Fails when the statistics pseudo-file cannot be opened or the
  /// worker thread cannot be spawned.
  pub(crate) fn start(writer: SharedWriter, interval: Duration) -> io::Result<Self> {
    let mut statm = StatmReader::open()?;

    let shared = Arc::new(SamplerShared {
      stopped: Mutex::new(false),
      wakeup: Condvar::new(),
    });
    let worker_shared = Arc::clone(&shared);

    let handle = thread::Builder::new()
      .name("memtrail-sampler".into())
      .spawn(move || {
        // Everything this thread allocates is the tracker's own doing.
        guard::set_suppressed(true);

        loop {
          {
            let stopped = match worker_shared.stopped.lock() {
              Ok(guard) => guard,
              Err(err) => err.into_inner(),
            };

            // `wait_timeout_while` re-waits the remaining interval on a
            // spurious wakeup that does not see the stop flag.
            let (stopped, _) = match worker_shared.wakeup.wait_timeout_while(
              stopped,
              interval,
              |stopped| !*stopped,
            ) {
              Ok(result) => result,
              Err(err) => err.into_inner(),
            };

            if *stopped {
              break;
            }
          }

          let rss_bytes = statm.read_rss();
          if rss_bytes == 0 {
            warn!("could not read resident-set size, deactivating tracking");
            Tracker::deactivate();
            break;
          }

          let record = Record::MemoryRecord {
            timestamp_ms: timestamp_ms(),
            rss_bytes,
          };
          if let Err(err) = lock_writer(&writer).write_record(&record) {
            warn!("failed to write memory record, deactivating tracking: {err}");
            Tracker::deactivate();
            break;
          }
        }
      })?;

    Ok(Self {
      handle: Some(handle),
      shared,
    })
  }

  pub(crate) fn stop(mut self) {
    {
      let mut stopped = match self.shared.stopped.lock() {
        Ok(guard) => guard,
        Err(err) => err.into_inner(),
      };
      *stopped = true;
      self.shared.wakeup.notify_one();
    }

    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

struct StatmReader {
  file: File,
  page_size: u64,
}

impl StatmReader {
  fn open() -> io::Result<Self> {
    let file = File::open("/proc/self/statm")?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    Ok(Self {
      file,
      page_size: page_size.max(0) as u64,
    })
  }

  /// Resident-set size in bytes, or 0 when the pseudo-file cannot be
  /// read or parsed.
  fn read_rss(&mut self) -> u64 {
    if self.file.seek(SeekFrom::Start(0)).is_err() {
      return 0;
    }

    let mut buffer = String::new();
    if self.file.read_to_string(&mut buffer).is_err() {
      return 0;
    }

    // Second field of statm: resident pages.
    let pages = buffer
      .split_whitespace()
      .nth(1)
      .and_then(|field| field.parse::<u64>().ok())
      .unwrap_or(0);

    pages * self.page_size
  }
}

fn timestamp_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::writer::testing::CollectingWriter;

  #[test]
  fn statm_reports_a_nonzero_resident_size() {
    let mut reader = StatmReader::open().expect("statm opens");
    assert!(reader.read_rss() > 0);
    // Seek-back makes the handle reusable across ticks.
    assert!(reader.read_rss() > 0);
  }

  #[test]
  fn emits_memory_records_at_the_configured_interval() {
    let collecting = CollectingWriter::new();
    let (records, _) = collecting.logs();
    let writer: SharedWriter =
      Arc::new(Mutex::new(Box::new(collecting) as Box<dyn RecordWriter>));

    let sampler = BackgroundSampler::start(writer, Duration::from_millis(50))
      .expect("sampler starts");
    thread::sleep(Duration::from_millis(525));
    sampler.stop();

    let records = records.lock().expect("records log");
    let samples = records
      .iter()
      .filter_map(|record| match record {
        Record::MemoryRecord {
          timestamp_ms,
          rss_bytes,
        } => Some((*timestamp_ms, *rss_bytes)),
        _ => None,
      })
      .collect::<Vec<_>>();

    assert!(
      (8..=11).contains(&samples.len()),
      "expected ~10 samples over 525ms, got {}",
      samples.len()
    );
    assert!(samples.iter().all(|(_, rss)| *rss > 0));
    assert!(samples
      .windows(2)
      .all(|pair| pair[0].0 <= pair[1].0));
  }

  #[test]
  fn stop_returns_before_the_next_tick() {
    let collecting = CollectingWriter::new();
    let writer: SharedWriter =
      Arc::new(Mutex::new(Box::new(collecting) as Box<dyn RecordWriter>));

    let sampler = BackgroundSampler::start(writer, Duration::from_secs(3600))
      .expect("sampler starts");

    let started = std::time::Instant::now();
    sampler.stop();
    assert!(started.elapsed() < Duration::from_secs(10));
  }
}
