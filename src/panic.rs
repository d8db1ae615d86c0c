//! Panic containment for work executed on the event-loop thread.
//!
//! Tasks and handlers run inside [`catch_unwind`] so that one faulty callback
//! cannot take the loop, and every channel it owns, down with it.

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
};

/// Displays a panic payload for logging.
///
/// `String` and `&'static str` payloads are shown verbatim; anything else is
/// reported as opaque.
///
/// ```
/// use wirebridge::panic::format_panic;
/// assert_eq!(format_panic(Box::new("boom")).to_string(), "boom");
/// assert_eq!(
///     format_panic(Box::new(5_u32)).to_string(),
///     "<non-string panic payload>"
/// );
/// ```
#[derive(Debug)]
#[must_use]
pub struct PanicMessage(Box<dyn Any + Send>);

impl PanicMessage {
    fn as_str(&self) -> Option<&str> {
        self.0
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| self.0.downcast_ref::<&'static str>().copied())
    }
}

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("<non-string panic payload>"))
    }
}

/// Wrap a payload returned by [`catch_unwind`] for display.
pub fn format_panic(panic: Box<dyn Any + Send>) -> PanicMessage { PanicMessage(panic) }

/// Run `f`, logging and swallowing any panic it raises.
///
/// Returns `None` if `f` panicked.
pub(crate) fn contain<R>(what: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            log::error!("{what} panicked: panic={}", format_panic(payload));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contained_panics_yield_none() {
        assert_eq!(contain("test", || 3), Some(3));
        assert_eq!(contain("test", || -> u8 { panic!("boom") }), None);
    }

    #[test]
    fn owned_messages_are_shown_verbatim() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(format_panic(payload).to_string(), "owned");
    }
}
