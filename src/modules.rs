use std::fs;

use crate::{
  records::Record,
  writer::{SharedWriter, WriteError, lock_writer},
};

// Loader pseudo-entry that cannot be resolved to a file on disk.
const VDSO_PREFIX: &str = "linux-vdso.so";

/// Snapshot the loadable-segment layout of every object currently
/// mapped: a `MemoryMapStart` marker, then one `SegmentHeader` plus its
/// `Segment`s per module. The whole batch goes out under a single
/// writer-lock acquisition so no other record lands inside it.
pub(crate) fn write_module_snapshot(writer: &SharedWriter) -> Result<(), WriteError> {
  let mut writer = lock_writer(writer);
  writer.write_record(&Record::MemoryMapStart)?;

  for object in &phdrs::objects() {
    let name = object.name().to_string_lossy();

    // The loader reports the main executable with an empty name.
    let module_name = if name.is_empty() {
      match executable_path() {
        Some(path) => path,
        None => continue,
      }
    } else {
      name.into_owned()
    };

    if module_name.starts_with(VDSO_PREFIX) {
      continue;
    }

    let segments = object
      .iter_phdrs()
      .filter(|phdr| phdr.type_() == libc::PT_LOAD)
      .map(|phdr| (phdr.vaddr() as usize, phdr.memsz() as usize))
      .collect::<Vec<_>>();

    writer.write_record(&Record::SegmentHeader {
      module_name,
      segment_count: segments.len(),
      load_address: object.addr() as usize,
    })?;

    for (virtual_address, memory_size) in segments {
      writer.write_record(&Record::Segment {
        virtual_address,
        memory_size,
      })?;
    }
  }

  Ok(())
}

fn executable_path() -> Option<String> {
  fs::read_link("/proc/self/exe")
    .ok()
    .map(|path| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
  use std::sync::{Arc, Mutex};

  use super::*;
  use crate::writer::{RecordWriter, testing::CollectingWriter};

  #[test]
  fn snapshot_is_a_contiguous_well_formed_batch() {
    let collecting = CollectingWriter::new();
    let (records, _) = collecting.logs();
    let writer: SharedWriter =
      Arc::new(Mutex::new(Box::new(collecting) as Box<dyn RecordWriter>));

    write_module_snapshot(&writer).expect("snapshot succeeds");

    let records = records.lock().expect("records log");
    assert_eq!(records[0], Record::MemoryMapStart);

    let mut expected_segments = 0;
    for record in records.iter().skip(1) {
      match record {
        Record::SegmentHeader {
          module_name,
          segment_count,
          ..
        } => {
          assert_eq!(expected_segments, 0, "previous module was incomplete");
          assert!(!module_name.starts_with("linux-vdso.so"));
          assert!(!module_name.is_empty());
          expected_segments = *segment_count;
        }
        Record::Segment { .. } => {
          assert!(expected_segments > 0, "segment outside a module");
          expected_segments -= 1;
        }
        other => panic!("unexpected record in module batch: {other:?}"),
      }
    }

    assert_eq!(expected_segments, 0);
    assert!(
      records.iter().any(|record| matches!(
        record,
        Record::SegmentHeader { segment_count, .. } if *segment_count > 0
      )),
      "at least one module has loadable segments"
    );
  }
}
