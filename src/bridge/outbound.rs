//! Outbound half of the bridge.
//!
//! [`OutboundWriter`] ships write requests to the event loop where the
//! [`OutboundAdapter`] queues them until the channel is writable. Requests
//! leave the queue in submission order, one per wake-up, and writability is
//! re-checked after each one.

use std::{collections::VecDeque, fmt, marker::PhantomData, sync::Arc};

use tracing::trace;

use super::OUTBOUND_ADAPTER;
use crate::{
    channel::{
        Channel,
        ChannelHandle,
        ChannelHandler,
        CloseMode,
        HandlerContext,
        Message,
        Promise,
    },
    error::{ChannelError, Result},
};

/// A queued outbound operation.
pub(crate) enum WriteRequest {
    Write {
        message: Message,
        flush: bool,
        promise: Promise,
    },
    Flush {
        promise: Promise,
    },
}

impl WriteRequest {
    fn fail(self, error: ChannelError) {
        match self {
            WriteRequest::Write { promise, .. } | WriteRequest::Flush { promise } => {
                promise.fail(error);
            }
        }
    }

    fn needs_writability(&self) -> bool { matches!(self, WriteRequest::Write { .. }) }
}

/// Loop-side queue of writes waiting for writability.
#[derive(Default)]
pub struct OutboundAdapter {
    writers: VecDeque<WriteRequest>,
    draining: bool,
    failure: Option<ChannelError>,
    output_closed: bool,
    close_pending: bool,
    removed: bool,
}

impl OutboundAdapter {
    /// Create an adapter with no queued writes.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Writes waiting for the channel to become writable.
    #[must_use]
    pub fn queued(&self) -> usize { self.writers.len() }

    pub(crate) fn submit(&mut self, ctx: &mut HandlerContext<'_>, request: WriteRequest) {
        if let Some(error) = &self.failure {
            request.fail(error.clone());
            return;
        }
        if self.output_closed || !ctx.is_active() {
            request.fail(ChannelError::closed());
            return;
        }
        if self.removed {
            dispatch(ctx, request);
            return;
        }
        self.writers.push_back(request);
        if !self.draining {
            self.drain(ctx);
        }
    }

    /// The last [`OutboundWriter`] was dropped: close output once the queue
    /// has drained.
    pub(crate) fn writer_gone(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.output_closed {
            return;
        }
        self.output_closed = true;
        self.close_pending = true;
        self.finish_close(ctx);
    }

    /// Dispatch the head of the queue if the channel can take it, then ask
    /// to be woken once its effects have been processed.
    fn drain(&mut self, ctx: &mut HandlerContext<'_>) {
        self.draining = false;
        let ready = self
            .writers
            .front()
            .is_some_and(|request| !request.needs_writability() || ctx.is_writable());
        if ready {
            if let Some(request) = self.writers.pop_front() {
                dispatch(ctx, request);
            }
            self.draining = true;
            ctx.wake();
            return;
        }
        self.finish_close(ctx);
    }

    fn finish_close(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.close_pending && self.writers.is_empty() && !self.draining {
            self.close_pending = false;
            trace!(channel = %ctx.channel_id(), "writer gone; closing output");
            ctx.flush(Promise::none());
            ctx.close(CloseMode::Output, Promise::none());
        }
    }

    fn fail_all(&mut self, error: &ChannelError) {
        for request in self.writers.drain(..) {
            request.fail(error.clone());
        }
        self.close_pending = false;
    }
}

fn dispatch(ctx: &mut HandlerContext<'_>, request: WriteRequest) {
    match request {
        WriteRequest::Write {
            message,
            flush,
            promise,
        } => {
            ctx.write(message, promise);
            if flush {
                ctx.flush(Promise::none());
            }
        }
        WriteRequest::Flush { promise } => ctx.flush(promise),
    }
}

impl ChannelHandler for OutboundAdapter {
    fn handler_removed(&mut self, ctx: &mut HandlerContext<'_>) {
        self.removed = true;
        self.draining = false;
        if ctx.is_active() {
            for request in self.writers.drain(..) {
                dispatch(ctx, request);
            }
            self.finish_close(ctx);
        } else {
            self.fail_all(&ChannelError::closed());
        }
    }

    fn error_caught(&mut self, ctx: &mut HandlerContext<'_>, error: ChannelError) {
        if self.failure.is_none() {
            self.fail_all(&error);
            self.failure = Some(error.clone());
        }
        ctx.fire_error_caught(error);
    }

    fn channel_inactive(&mut self, ctx: &mut HandlerContext<'_>) {
        let error = self.failure.clone().unwrap_or_else(ChannelError::closed);
        self.fail_all(&error);
        ctx.fire_channel_inactive();
    }

    fn writability_changed(&mut self, ctx: &mut HandlerContext<'_>) {
        if ctx.is_writable() && !self.draining {
            self.drain(ctx);
        }
        ctx.fire_writability_changed();
    }

    fn woken(&mut self, ctx: &mut HandlerContext<'_>) { self.drain(ctx); }
}

impl fmt::Debug for OutboundAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundAdapter")
            .field("queued", &self.writers.len())
            .field("draining", &self.draining)
            .field("failure", &self.failure)
            .field("output_closed", &self.output_closed)
            .finish_non_exhaustive()
    }
}

struct WriterInner {
    handle: ChannelHandle,
}

impl Drop for WriterInner {
    fn drop(&mut self) {
        let _ = self.handle.execute(|channel| {
            channel.invoke_handler::<OutboundAdapter, _>(OUTBOUND_ADAPTER, |adapter, ctx| {
                adapter.writer_gone(ctx);
            });
        });
    }
}

/// Suspending writer for the outbound side of an
/// [`AsyncChannel`](super::AsyncChannel).
///
/// Clones share one writer. Dropping the last clone closes the channel's
/// output once every queued write has gone out; the input side stays open.
pub struct OutboundWriter<Out> {
    inner: Arc<WriterInner>,
    _marker: PhantomData<fn(Out)>,
}

impl<Out: Send + 'static> OutboundWriter<Out> {
    pub(crate) fn new(handle: ChannelHandle) -> Self {
        Self {
            inner: Arc::new(WriterInner { handle }),
            _marker: PhantomData,
        }
    }

    /// Write `message` without flushing, waiting until the channel has
    /// accepted it.
    ///
    /// # Errors
    ///
    /// Returns the channel's captured error, or a closed error if the output
    /// side or the channel is closed.
    pub async fn write(&self, message: Out) -> Result<()> {
        self.submit(move |promise| WriteRequest::Write {
            message: Box::new(message),
            flush: false,
            promise,
        })
        .await
    }

    /// Write `message` and flush it towards the peer.
    ///
    /// # Errors
    ///
    /// As for [`OutboundWriter::write`].
    pub async fn write_and_flush(&self, message: Out) -> Result<()> {
        self.submit(move |promise| WriteRequest::Write {
            message: Box::new(message),
            flush: true,
            promise,
        })
        .await
    }

    /// Flush everything written so far.
    ///
    /// # Errors
    ///
    /// As for [`OutboundWriter::write`].
    pub async fn flush(&self) -> Result<()> {
        self.submit(|promise| WriteRequest::Flush { promise }).await
    }

    async fn submit<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(Promise) -> WriteRequest + Send + 'static,
    {
        let (promise, outcome) = Promise::new();
        let request = build(promise);
        self.inner.handle.execute(move |channel: &mut Channel| {
            // Without the adapter the request is dropped and reports closure.
            channel.invoke_handler::<OutboundAdapter, _>(OUTBOUND_ADAPTER, |adapter, ctx| {
                adapter.submit(ctx, request);
            });
        })?;
        Ok(outcome.wait().await?)
    }
}

impl<Out> Clone for OutboundWriter<Out> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<Out> fmt::Debug for OutboundWriter<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundWriter")
            .field("channel", &self.inner.handle.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelId, embedded::EmbeddedTransport};

    fn channel() -> Channel {
        let mut channel = Channel::new(ChannelId::new(0), EmbeddedTransport::new());
        channel
            .add_handler(OUTBOUND_ADAPTER, OutboundAdapter::new())
            .expect("add adapter");
        channel
    }

    fn submit(channel: &mut Channel, value: u8) -> crate::channel::PromiseReceiver {
        let (promise, outcome) = Promise::new();
        let request = WriteRequest::Write {
            message: Box::new(value),
            flush: true,
            promise,
        };
        channel
            .invoke_handler::<OutboundAdapter, _>(OUTBOUND_ADAPTER, |adapter, ctx| {
                adapter.submit(ctx, request);
            })
            .expect("adapter present");
        outcome
    }

    fn transport(channel: &mut Channel) -> &mut EmbeddedTransport {
        channel
            .transport_mut::<EmbeddedTransport>()
            .expect("embedded transport")
    }

    fn flushed(channel: &mut Channel) -> Vec<u8> {
        transport(channel)
            .take_flushed()
            .into_iter()
            .filter_map(|message| message.downcast::<u8>().ok().map(|value| *value))
            .collect()
    }

    #[test]
    fn queued_writes_wait_for_writability_and_keep_order() {
        let mut channel = channel();
        transport(&mut channel).set_writable(false);
        channel.poll_transport();

        let _a = submit(&mut channel, 1);
        let _b = submit(&mut channel, 2);
        assert!(flushed(&mut channel).is_empty());
        let queued = channel.invoke_handler::<OutboundAdapter, _>(OUTBOUND_ADAPTER, |a, _| a.queued());
        assert_eq!(queued, Some(2));

        transport(&mut channel).set_writable(true);
        channel.poll_transport();
        assert_eq!(flushed(&mut channel), [1, 2]);
    }

    #[tokio::test]
    async fn captured_errors_fail_queued_and_later_writes() {
        let mut channel = channel();
        transport(&mut channel).set_writable(false);
        channel.poll_transport();
        let queued = submit(&mut channel, 1);

        channel.fire_error_caught(ChannelError::new(std::io::Error::other("bang")));
        let err = queued.wait().await.expect_err("failed");
        assert_eq!(err.to_string(), "bang");
        let later = submit(&mut channel, 2).wait().await.expect_err("failed");
        assert_eq!(later.to_string(), "bang");
    }

    #[test]
    fn writer_gone_closes_output_after_the_queue_drains() {
        let mut channel = channel();
        transport(&mut channel).set_writable(false);
        channel.poll_transport();
        let _pending = submit(&mut channel, 1);
        channel.invoke_handler::<OutboundAdapter, _>(OUTBOUND_ADAPTER, |a, ctx| a.writer_gone(ctx));
        assert!(transport(&mut channel).closes().is_empty());

        transport(&mut channel).set_writable(true);
        channel.poll_transport();
        assert_eq!(flushed(&mut channel), [1]);
        assert_eq!(transport(&mut channel).closes(), [CloseMode::Output]);
        assert!(channel.is_active());
    }
}
