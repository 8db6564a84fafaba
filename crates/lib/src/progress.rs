//! Progress reporting and cooperative cancellation.
//!
//! The resolver polls [`ProgressObserver::canceled`] at well-defined
//! checkpoints (entering a product, a module, a property batch) and fails
//! fast with a cancellation error. Cancellation is advisory: an in-flight
//! expression evaluation is never interrupted.

/// Implemented by the embedding application. All methods have no-op
/// defaults, so `&NullProgress` is a valid observer.
pub trait ProgressObserver {
  fn set_maximum(&self, _maximum: usize) {}
  fn increment(&self) {}
  fn canceled(&self) -> bool {
    false
  }
}

/// Observer that never cancels and reports nothing.
pub struct NullProgress;

impl ProgressObserver for NullProgress {}
