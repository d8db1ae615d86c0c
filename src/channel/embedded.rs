//! In-memory transport for driving channels without a socket.
//!
//! [`EmbeddedTransport`] buffers writes until they are flushed and lets the
//! caller inject inbound traffic, failures and writability changes.
//! [`EmbeddedChannel`] wraps one that lives on a running event loop and
//! exposes the injection points as thread-safe calls.

use std::{any::Any, error::Error as StdError};

use tokio::sync::mpsc;

use super::{Channel, ChannelHandle, CloseMode, Message, Transport, TransportEvent};
use crate::error::{ChannelError, Result};

/// Transport that keeps everything in memory.
#[derive(Debug, Default)]
pub struct EmbeddedTransport {
    pending: Vec<Message>,
    flushed: Vec<Message>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    unwritable: bool,
    closes: Vec<CloseMode>,
    events: Vec<TransportEvent>,
    read_demand: usize,
}

impl EmbeddedTransport {
    /// Create a writable transport that keeps flushed messages for
    /// [`EmbeddedTransport::take_flushed`].
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Create a transport that forwards flushed messages to `outbound`.
    #[must_use]
    pub fn with_outbound(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            outbound: Some(outbound),
            ..Self::default()
        }
    }

    /// Take the flushed messages not forwarded elsewhere.
    pub fn take_flushed(&mut self) -> Vec<Message> { std::mem::take(&mut self.flushed) }

    /// Number of messages written but not flushed yet.
    #[must_use]
    pub fn pending_writes(&self) -> usize { self.pending.len() }

    /// Change writability. Observed by the channel on its next poll.
    pub fn set_writable(&mut self, writable: bool) { self.unwritable = !writable; }

    /// Queue an event for delivery on the channel's next poll.
    pub fn push_event(&mut self, event: TransportEvent) { self.events.push(event); }

    /// Every close the transport received, in order.
    #[must_use]
    pub fn closes(&self) -> &[CloseMode] { &self.closes }

    /// How many read requests reached the transport.
    #[must_use]
    pub fn read_demand(&self) -> usize { self.read_demand }
}

impl Transport for EmbeddedTransport {
    fn write(&mut self, message: Message) -> std::result::Result<(), ChannelError> {
        self.pending.push(message);
        Ok(())
    }

    fn flush(&mut self) -> std::result::Result<(), ChannelError> {
        for message in self.pending.drain(..) {
            match &self.outbound {
                Some(tx) => {
                    // A dropped receiver just means nobody watches output.
                    let _ = tx.send(message);
                }
                None => self.flushed.push(message),
            }
        }
        Ok(())
    }

    fn close(&mut self, mode: CloseMode) -> std::result::Result<(), ChannelError> {
        self.closes.push(mode);
        if mode == CloseMode::All {
            self.pending.clear();
        }
        Ok(())
    }

    fn is_writable(&self) -> bool { !self.unwritable }

    fn read(&mut self) { self.read_demand += 1; }

    fn drain_events(&mut self, events: &mut Vec<TransportEvent>) { events.append(&mut self.events); }
}

/// An embedded channel running on an event loop.
///
/// Created by [`EventLoopHandle::embedded_channel`](crate::event_loop::EventLoopHandle::embedded_channel).
/// Injections are queued on the loop in call order, so an operation issued
/// afterwards through any handle to the same loop observes their effects.
#[derive(Debug)]
pub struct EmbeddedChannel {
    handle: ChannelHandle,
    outbound: mpsc::UnboundedReceiver<Message>,
}

impl EmbeddedChannel {
    pub(crate) fn new(handle: ChannelHandle, outbound: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { handle, outbound }
    }

    /// Handle to the underlying channel.
    #[must_use]
    pub fn handle(&self) -> &ChannelHandle { &self.handle }

    /// Deliver `message` as if it had been read from the peer.
    ///
    /// # Errors
    ///
    /// Fails if the loop has stopped.
    pub fn write_inbound<T: Any + Send>(&self, message: T) -> Result<()> {
        self.handle
            .execute(move |channel| channel.fire_channel_read(Box::new(message)))
    }

    /// Deliver a transport failure.
    ///
    /// # Errors
    ///
    /// Fails if the loop has stopped.
    pub fn fire_error<E>(&self, error: E) -> Result<()>
    where
        E: StdError + Send + Sync + 'static,
    {
        let error = ChannelError::new(error);
        self.inject(move |_| vec![TransportEvent::Error(error)])
    }

    /// Signal that the peer closed its sending side.
    ///
    /// # Errors
    ///
    /// Fails if the loop has stopped.
    pub fn fire_input_closed(&self) -> Result<()> {
        self.inject(|_| vec![TransportEvent::InputClosed])
    }

    /// Fail the transport and close the channel, as a connection reset would.
    ///
    /// # Errors
    ///
    /// Fails if the loop has stopped.
    pub fn reset<E>(&self, error: E) -> Result<()>
    where
        E: StdError + Send + Sync + 'static,
    {
        let error = ChannelError::new(error);
        self.inject(move |_| vec![TransportEvent::Error(error), TransportEvent::Closed])
    }

    /// Flip transport writability.
    ///
    /// # Errors
    ///
    /// Fails if the loop has stopped.
    pub fn set_writable(&self, writable: bool) -> Result<()> {
        self.inject(move |transport| {
            transport.set_writable(writable);
            Vec::new()
        })
    }

    /// Close `mode` from the tail of the chain.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the chain.
    pub async fn close(&self, mode: CloseMode) -> Result<()> { self.handle.close(mode).await }

    /// Wait for the next flushed outbound message, downcast to `T`.
    ///
    /// Returns `None` once the channel is gone or if the message is not a
    /// `T`.
    pub async fn next_outbound<T: Any>(&mut self) -> Option<T> {
        let message = self.outbound.recv().await?;
        message.downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// Return an already flushed outbound message, if any.
    pub fn try_next_outbound<T: Any>(&mut self) -> Option<T> {
        let message = self.outbound.try_recv().ok()?;
        message.downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// Closes the transport received so far.
    ///
    /// # Errors
    ///
    /// Fails if the loop has stopped.
    pub async fn transport_closes(&self) -> Result<Vec<CloseMode>> {
        self.query(|transport| transport.closes().to_vec()).await
    }

    /// Read requests that reached the transport so far.
    ///
    /// # Errors
    ///
    /// Fails if the loop has stopped.
    pub async fn read_demand(&self) -> Result<usize> {
        self.query(EmbeddedTransport::read_demand).await
    }

    fn inject<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut EmbeddedTransport) -> Vec<TransportEvent> + Send + 'static,
    {
        self.handle.execute(move |channel: &mut Channel| {
            if let Some(transport) = channel.transport_mut::<EmbeddedTransport>() {
                for event in f(transport) {
                    transport.push_event(event);
                }
            }
            channel.poll_transport();
        })
    }

    async fn query<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EmbeddedTransport) -> R + Send + 'static,
        R: Default + Send + 'static,
    {
        self.handle
            .submit(move |channel| {
                channel
                    .transport_mut::<EmbeddedTransport>()
                    .map(|transport| f(&*transport))
                    .unwrap_or_default()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_become_visible_on_flush() {
        let mut transport = EmbeddedTransport::new();
        transport.write(Box::new(1_u8)).expect("write");
        assert!(transport.take_flushed().is_empty());
        assert_eq!(transport.pending_writes(), 1);

        transport.flush().expect("flush");
        let flushed = transport.take_flushed();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].downcast_ref::<u8>(), Some(&1));
    }

    #[test]
    fn closes_are_recorded_in_order() {
        let mut transport = EmbeddedTransport::new();
        transport.close(CloseMode::Output).expect("close output");
        transport.close(CloseMode::All).expect("close all");
        assert_eq!(transport.closes(), [CloseMode::Output, CloseMode::All]);
    }
}
