use std::{
  fmt::{self, Display, Formatter},
  sync::Arc,
};

use crate::{guard::RecursionGuard, shadow, tracker::Tracker};

/// Raised when a host frame's names cannot be decoded as text. The
/// frame is not pushed; tracing continues.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DecodeError {
  FileName,
  FunctionName,
}

impl Display for DecodeError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::FileName => write!(f, "could not decode host file name"),
      Self::FunctionName => write!(f, "could not decode host function name"),
    }
  }
}

impl std::error::Error for DecodeError {}

/// An activation record of the host interpreter, as surfaced by the
/// embedding layer.
pub trait HostFrame: Send + Sync {
  /// `None` when the name is not decodable as text.
  fn file_name(&self) -> Option<String>;

  /// `None` when the name is not decodable as text.
  fn function_name(&self) -> Option<String>;

  fn line_number(&self) -> u32;
}

/// A host profile event. Only calls and returns are consumed; anything
/// else the interpreter reports is ignored.
pub enum ProfileEvent {
  Call(Arc<dyn HostFrame>),
  Return,
  Other,
}

/// Entry point for the host's profile callback, invoked under the
/// host's serialization lock.
///
/// # Errors
///
/// Returns a `DecodeError` when a frame name is not decodable; nothing
/// is pushed and tracing continues.
pub fn handle_profile_event(event: ProfileEvent) -> Result<(), DecodeError> {
  let _guard = RecursionGuard::new();

  if !Tracker::is_active() {
    return Ok(());
  }

  match event {
    ProfileEvent::Call(frame) => {
      let Some(function) = frame.function_name() else {
        return Err(DecodeError::FunctionName);
      };
      let Some(file) = frame.file_name() else {
        return Err(DecodeError::FileName);
      };

      let parent_line = shadow::current_line();
      shadow::push_frame(&frame, function, file, parent_line);
    }
    ProfileEvent::Return => shadow::pop_frame(),
    ProfileEvent::Other => {}
  }

  Ok(())
}

/// Attach tracing to the calling thread, recording the host frame that
/// is active right now as the observation entry point.
pub fn register_thread(current_frame: Option<&Arc<dyn HostFrame>>) {
  let _guard = RecursionGuard::new();
  shadow::reset_thread(current_frame);
}
