//! Thread-safe reference to a channel living on an event loop.

use std::{fmt, sync::Arc};

use super::{Channel, ChannelHandler, ChannelId, CloseMode, Promise};
use crate::{
    error::{ChannelError, Result},
    event_loop::EventLoopHandle,
};

struct Inner {
    id: ChannelId,
    event_loop: EventLoopHandle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let id = self.id;
        // A stopped loop has already closed the channel.
        let _ = self.event_loop.execute(move |cx| cx.release_handle(id));
    }
}

/// Cloneable handle used to operate on a channel from any thread.
///
/// Every operation is shipped to the owning event loop. The channel stays
/// registered while at least one handle exists; dropping the last handle of
/// an open channel closes it.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<Inner>,
}

impl ChannelHandle {
    /// Only [`LoopContext::attach`](crate::event_loop::LoopContext::attach)
    /// and [`LoopContext::channel_handle`](crate::event_loop::LoopContext::channel_handle)
    /// create handles, after counting them on the channel.
    pub(crate) fn new(id: ChannelId, event_loop: EventLoopHandle) -> Self {
        Self {
            inner: Arc::new(Inner { id, event_loop }),
        }
    }

    /// Identifier of the channel.
    #[must_use]
    pub fn id(&self) -> ChannelId { self.inner.id }

    /// The loop owning the channel.
    #[must_use]
    pub fn event_loop(&self) -> &EventLoopHandle { &self.inner.event_loop }

    /// Run `f` against the channel on its loop without waiting.
    ///
    /// `f` is skipped if the channel no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::EventLoopClosed`](crate::BridgeError::EventLoopClosed)
    /// if the loop has stopped.
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Channel) + Send + 'static,
    {
        let id = self.id();
        self.inner.event_loop.execute(move |cx| {
            cx.with_channel(id, f);
        })
    }

    /// Run `f` against the channel on its loop and return its result.
    ///
    /// # Errors
    ///
    /// Returns a closed channel error if the channel no longer exists and
    /// [`BridgeError::EventLoopClosed`](crate::BridgeError::EventLoopClosed)
    /// if the loop has stopped.
    pub async fn submit<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Channel) -> R + Send + 'static,
        R: Send + 'static,
    {
        let id = self.id();
        self.inner
            .event_loop
            .submit(move |cx| cx.with_channel(id, f))
            .await?
            .ok_or_else(|| ChannelError::closed().into())
    }

    /// Append `handler` to the channel's chain under `name`.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken, the channel is closed or the loop has
    /// stopped.
    pub async fn add_handler<H: ChannelHandler>(
        &self,
        name: impl Into<String>,
        handler: H,
    ) -> Result<()> {
        let name = name.into();
        self.submit(move |channel| channel.add_handler(name, handler))
            .await?
            .map_err(|e| ChannelError::from(e).into())
    }

    /// Remove the handler registered under `name`.
    ///
    /// # Errors
    ///
    /// Fails if no such handler exists or the loop has stopped.
    pub async fn remove_handler(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.submit(move |channel| channel.remove_handler(&name))
            .await?
            .map_err(|e| ChannelError::from(e).into())
    }

    /// Close `mode` from the tail of the chain and wait for the outcome.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the chain or transport.
    pub async fn close(&self, mode: CloseMode) -> Result<()> {
        let (promise, outcome) = Promise::new();
        self.execute(move |channel| channel.close(mode, promise))?;
        Ok(outcome.wait().await?)
    }

    /// Whether the channel is still open.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::EventLoopClosed`](crate::BridgeError::EventLoopClosed)
    /// if the loop has stopped.
    pub async fn is_active(&self) -> Result<bool> {
        match self.submit(|channel| channel.is_active()).await {
            Ok(active) => Ok(active),
            Err(e) if e.as_channel_error().is_some_and(ChannelError::is_closed) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether the channel currently accepts writes without queueing.
    ///
    /// # Errors
    ///
    /// Fails if the channel no longer exists or the loop has stopped.
    pub async fn is_writable(&self) -> Result<bool> {
        self.submit(|channel| channel.is_writable()).await
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}
