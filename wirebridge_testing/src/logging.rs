//! Log capture for tests asserting on lifecycle messages.

use std::sync::{Mutex, MutexGuard, OnceLock};

use logtest::{Logger, Record};
use rstest::fixture;

/// Exclusive handle to the process-wide [`Logger`].
///
/// Holding the handle serialises log capture between tests in one binary.
/// Records left over from earlier tests are discarded on acquisition.
pub struct LoggerHandle {
    guard: MutexGuard<'static, Logger>,
}

impl LoggerHandle {
    /// Acquire the logger, waiting for other holders to release it.
    #[expect(
        clippy::expect_used,
        reason = "a poisoned logger means an earlier test already failed"
    )]
    #[must_use]
    pub fn new() -> Self {
        static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

        let logger = LOGGER.get_or_init(|| Mutex::new(Logger::start()));
        let mut guard = logger.lock().expect("logger poisoned");
        while guard.pop().is_some() {}
        Self { guard }
    }

    /// Drain captured records, oldest first.
    pub fn records(&mut self) -> Vec<Record> { std::iter::from_fn(|| self.guard.pop()).collect() }

    /// Returns `true` if any captured record's message contains `needle`.
    ///
    /// Matching records and everything before them are consumed.
    pub fn saw(&mut self, needle: &str) -> bool {
        std::iter::from_fn(|| self.guard.pop()).any(|record| record.args().contains(needle))
    }
}

impl Default for LoggerHandle {
    fn default() -> Self { Self::new() }
}

#[allow(
    unused_braces,
    reason = "rustc false positive for single line rstest fixtures"
)]
#[fixture]
pub fn logger() -> LoggerHandle { LoggerHandle::new() }
