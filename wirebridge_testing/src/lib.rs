//! Utilities for exercising [`wirebridge`] channels in tests.
//!
//! Provides an event-loop fixture, a shared error type and a few handlers
//! that observe or interfere with the close path of a channel's chain.
//!
//! ```rust
//! use wirebridge::{AsyncChannel, EventLoop};
//!
//! # async fn example(event_loop: EventLoop) -> wirebridge::Result<()> {
//! let embedded = event_loop.handle().embedded_channel().await?;
//! embedded.write_inbound(7_u32)?;
//! let bridged = AsyncChannel::<u32, u32>::wrap(embedded.handle().clone()).await?;
//! assert_eq!(bridged.next().await?, Some(7));
//! # Ok(())
//! # }
//! ```

pub mod handlers;
pub mod logging;
pub mod macros;

use std::sync::{Arc, Weak};

pub use handlers::{CloseRecorder, CloseSuppressor};
pub use logging::{LoggerHandle, logger};
use rstest::fixture;
use thiserror::Error;
use wirebridge::EventLoop;

/// Error injected by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TestError {
    /// Generic injected failure.
    #[error("bang")]
    Bang,
}

/// Start a fresh event loop with the default configuration.
///
/// The loop stops and joins its thread when dropped.
#[allow(
    clippy::expect_used,
    reason = "a loop that cannot start must abort the test immediately"
)]
#[fixture]
pub fn event_loop() -> EventLoop { EventLoop::new().expect("failed to start event loop") }

/// Value whose release can be observed through a [`Weak`] reference.
#[derive(Debug, Default)]
pub struct Sentinel;

impl Sentinel {
    /// Create a sentinel and a weak reference to it.
    #[must_use]
    pub fn tracked() -> (Arc<Sentinel>, Weak<Sentinel>) {
        let sentinel = Arc::new(Sentinel);
        let weak = Arc::downgrade(&sentinel);
        (sentinel, weak)
    }
}
