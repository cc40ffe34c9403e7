use std::sync::Arc;

use memtrail::{
  AllocatorKind, FileWriter, HostFrame, ProfileEvent, SymbolPatcher, Tracker,
  TrackerConfig, handle_profile_event, register_thread,
};

struct DemoPatcher;

impl SymbolPatcher for DemoPatcher {
  fn overwrite_symbols(&self) {}

  fn restore_symbols(&self) {}
}

struct DemoFrame {
  function: &'static str,
  line: u32,
}

impl HostFrame for DemoFrame {
  fn file_name(&self) -> Option<String> {
    Some("demo.py".to_string())
  }

  fn function_name(&self) -> Option<String> {
    Some(self.function.to_string())
  }

  fn line_number(&self) -> u32 {
    self.line
  }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
  let path = std::env::temp_dir().join("memtrail-demo.trace");
  let writer = FileWriter::create(&path)?;

  Tracker::install(
    Box::new(writer),
    Arc::new(DemoPatcher),
    TrackerConfig::default(),
  )?;
  Tracker::register_thread_name("main");

  let entry: Arc<dyn HostFrame> = Arc::new(DemoFrame {
    function: "main",
    line: 3,
  });
  let inner: Arc<dyn HostFrame> = Arc::new(DemoFrame {
    function: "load_config",
    line: 17,
  });

  register_thread(Some(&entry));
  handle_profile_event(ProfileEvent::Call(Arc::clone(&inner)))?;

  Tracker::track_allocation(0x5000, 256, AllocatorKind::Malloc);
  Tracker::track_allocation(0x5400, 64, AllocatorKind::Malloc);
  Tracker::track_deallocation(0x5400, 64, AllocatorKind::Free);

  handle_profile_event(ProfileEvent::Return)?;

  Tracker::uninstall();
  println!("trace written to {}", path.display());

  Ok(())
}
