//! Panic plumbing for checked threads.

use std::any::Any;

/// Payload used to unwind a checked thread that the session abandons
/// (blocked at the end of an execution, or not yet started). Caught by the
/// worker's top-level `catch_unwind` and never observed by model code.
pub(crate) struct AbortToken;

/// Best-effort extraction of a panic message for error reporting.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else {
        "<non-string panic payload>".to_owned()
    }
}
