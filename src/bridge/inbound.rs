//! Consumer half of the inbound bridge.

use std::{fmt, marker::PhantomData, sync::Arc};

use futures::{Stream, stream};
use tokio::sync::oneshot;

use super::{INBOUND_ADAPTER, adapter::InboundAdapter};
use crate::{channel::ChannelHandle, error::Result};

struct StreamInner<In: Send + 'static> {
    handle: ChannelHandle,
    _marker: PhantomData<fn() -> In>,
}

impl<In: Send + 'static> Drop for StreamInner<In> {
    fn drop(&mut self) {
        let _ = self.handle.execute(|channel| {
            channel.invoke_handler::<InboundAdapter<In>, _>(INBOUND_ADAPTER, |adapter, ctx| {
                adapter.consumer_gone(ctx);
            });
        });
    }
}

/// Pull-based view of a channel's inbound messages.
///
/// Clones share one consumer: only one read may be outstanding at a time,
/// and dropping the last clone discards unread messages and closes the
/// channel's input side.
pub struct InboundStream<In: Send + 'static> {
    inner: Arc<StreamInner<In>>,
}

impl<In: Send + 'static> InboundStream<In> {
    pub(crate) fn new(handle: ChannelHandle) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                handle,
                _marker: PhantomData,
            }),
        }
    }

    /// Wait for the next inbound message.
    ///
    /// Returns `Ok(None)` once the input side has ended. After an error every
    /// later call returns the same error.
    ///
    /// # Errors
    ///
    /// Returns the channel's captured error,
    /// [`BridgeError::ConcurrentConsumptionNotAllowed`](crate::BridgeError::ConcurrentConsumptionNotAllowed)
    /// if another read is outstanding, or
    /// [`BridgeError::EventLoopClosed`](crate::BridgeError::EventLoopClosed)
    /// if the loop has stopped.
    pub async fn next(&self) -> Result<Option<In>> {
        let (tx, rx) = oneshot::channel();
        self.inner.handle.execute(move |channel| {
            channel.invoke_handler::<InboundAdapter<In>, _>(INBOUND_ADAPTER, |adapter, ctx| {
                adapter.read_next(ctx, tx);
            });
        })?;
        rx.await.unwrap_or(Ok(None))
    }

    /// Convert into a [`Stream`] that yields messages until end-of-input. A
    /// captured error is yielded once and ends the stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<In>> + Send {
        stream::unfold(Some(self), |state| async move {
            let inbound = state?;
            match inbound.next().await {
                Ok(Some(message)) => Some((Ok(message), Some(inbound))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl<In: Send + 'static> Clone for InboundStream<In> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<In: Send + 'static> fmt::Debug for InboundStream<In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream")
            .field("channel", &self.inner.handle.id())
            .finish()
    }
}
