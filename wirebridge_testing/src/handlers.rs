//! Handlers that observe or interfere with a channel's close path.
//!
//! Add them to a channel before wrapping it so they sit between the bridge
//! and the transport.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use wirebridge::{
    ChannelError,
    CloseMode,
    channel::{ChannelHandler, HandlerContext, Promise},
};

use crate::TestError;

/// Counts output closes travelling towards the transport.
#[derive(Debug, Clone, Default)]
pub struct CloseRecorder {
    output_closes: Arc<AtomicUsize>,
}

impl CloseRecorder {
    /// Create a recorder with a zeroed count.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Output closes observed so far. Clones share the count.
    #[must_use]
    pub fn output_closes(&self) -> usize { self.output_closes.load(Ordering::SeqCst) }
}

impl ChannelHandler for CloseRecorder {
    fn close(&mut self, ctx: &mut HandlerContext<'_>, mode: CloseMode, promise: Promise) {
        if mode == CloseMode::Output {
            self.output_closes.fetch_add(1, Ordering::SeqCst);
        }
        ctx.close(mode, promise);
    }
}

/// Fails every close with [`TestError::Bang`] instead of forwarding it.
#[derive(Debug, Default)]
pub struct CloseSuppressor;

impl ChannelHandler for CloseSuppressor {
    fn close(&mut self, _ctx: &mut HandlerContext<'_>, _mode: CloseMode, promise: Promise) {
        promise.fail(ChannelError::new(TestError::Bang));
    }
}
