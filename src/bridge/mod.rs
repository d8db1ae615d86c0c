//! Async bridge over event-loop channels.
//!
//! [`AsyncChannel::wrap`] appends three handlers to a channel's chain:
//!
//! * [`CloseSplitter`] closes each direction at most once and escalates to a
//!   full close when both are closed;
//! * [`OutboundAdapter`] queues writes from an [`OutboundWriter`] until the
//!   channel is writable;
//! * [`InboundAdapter`] buffers inbound messages for an [`InboundStream`].
//!
//! All three run on the loop thread. Consumers interact with them only
//! through tasks and oneshot completions.
//!
//! ```no_run
//! use bytes::Bytes;
//! use wirebridge::{bridge::AsyncChannel, channel::ChannelHandle};
//!
//! async fn echo(channel: ChannelHandle) -> wirebridge::Result<()> {
//!     let bridged = AsyncChannel::<Bytes, Bytes>::wrap(channel).await?;
//!     while let Some(chunk) = bridged.inbound().next().await? {
//!         bridged.outbound().write_and_flush(chunk).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod close;
mod inbound;
mod outbound;

pub use adapter::InboundAdapter;
pub use close::{CloseSplitter, HalfCloseState};
pub use inbound::InboundStream;
pub use outbound::{OutboundAdapter, OutboundWriter};

use crate::{
    channel::{ChannelHandle, CloseMode},
    error::{ChannelError, Result},
};

/// Chain name of the [`CloseSplitter`] installed by [`AsyncChannel::wrap`].
pub const CLOSE_SPLITTER: &str = "wirebridge.close-splitter";
/// Chain name of the [`OutboundAdapter`] installed by [`AsyncChannel::wrap`].
pub const OUTBOUND_ADAPTER: &str = "wirebridge.outbound";
/// Chain name of the [`InboundAdapter`] installed by [`AsyncChannel::wrap`].
pub const INBOUND_ADAPTER: &str = "wirebridge.inbound";

/// A channel exposed as an inbound stream of `In` and an outbound writer of
/// `Out`.
#[derive(Debug)]
pub struct AsyncChannel<In: Send + 'static, Out: Send + 'static> {
    channel: ChannelHandle,
    inbound: InboundStream<In>,
    outbound: OutboundWriter<Out>,
}

impl<In: Send + 'static, Out: Send + 'static> AsyncChannel<In, Out> {
    /// Install the bridge handlers at the end of `channel`'s chain.
    ///
    /// # Errors
    ///
    /// Returns a closed channel error if the channel is inactive or gone, a
    /// channel error if the bridge is already installed, and
    /// [`BridgeError::EventLoopClosed`](crate::BridgeError::EventLoopClosed)
    /// if the loop has stopped.
    pub async fn wrap(channel: ChannelHandle) -> Result<Self> {
        channel
            .submit(|channel| -> std::result::Result<(), ChannelError> {
                if !channel.is_active() {
                    return Err(ChannelError::closed());
                }
                channel.add_handler(CLOSE_SPLITTER, CloseSplitter::new())?;
                channel.add_handler(OUTBOUND_ADAPTER, OutboundAdapter::new())?;
                channel.add_handler(INBOUND_ADAPTER, InboundAdapter::<In>::new())?;
                Ok(())
            })
            .await??;
        Ok(Self {
            inbound: InboundStream::new(channel.clone()),
            outbound: OutboundWriter::new(channel.clone()),
            channel,
        })
    }

    /// Handle to the wrapped channel.
    #[must_use]
    pub fn channel(&self) -> &ChannelHandle { &self.channel }

    /// The inbound half.
    #[must_use]
    pub fn inbound(&self) -> &InboundStream<In> { &self.inbound }

    /// The outbound half.
    #[must_use]
    pub fn outbound(&self) -> &OutboundWriter<Out> { &self.outbound }

    /// Split into the channel handle and both halves, so each half can be
    /// dropped independently.
    #[must_use]
    pub fn into_parts(self) -> (ChannelHandle, InboundStream<In>, OutboundWriter<Out>) {
        (self.channel, self.inbound, self.outbound)
    }

    /// Shorthand for `self.inbound().next()`.
    ///
    /// # Errors
    ///
    /// As for [`InboundStream::next`].
    pub async fn next(&self) -> Result<Option<In>> { self.inbound.next().await }

    /// Shorthand for `self.outbound().write_and_flush(message)`.
    ///
    /// # Errors
    ///
    /// As for [`OutboundWriter::write`].
    pub async fn write_and_flush(&self, message: Out) -> Result<()> {
        self.outbound.write_and_flush(message).await
    }

    /// Close `mode` through the bridge's half-close handling.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the chain or transport.
    pub async fn close(&self, mode: CloseMode) -> Result<()> { self.channel.close(mode).await }
}
