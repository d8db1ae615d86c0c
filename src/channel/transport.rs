//! The byte- or message-moving end of a channel.

use std::{any::Any, fmt};

use mio::event::Source;

use super::{CloseMode, Message};
use crate::{error::ChannelError, reactor::Interest, reactor::Readiness};

/// Event produced by a [`Transport`] for the channel to deliver inbound.
pub enum TransportEvent {
    /// A message was received.
    Read(Message),
    /// The peer closed its sending side.
    InputClosed,
    /// The transport failed.
    Error(ChannelError),
    /// The transport is gone in both directions.
    Closed,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Read(_) => f.write_str("Read(..)"),
            TransportEvent::InputClosed => f.write_str("InputClosed"),
            TransportEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
            TransportEvent::Closed => f.write_str("Closed"),
        }
    }
}

/// Sink and source beneath a channel's handler chain.
///
/// Writes are accepted with [`Transport::write`] and only become visible to
/// the peer once flushed. Inbound traffic and failures are collected by
/// [`Transport::drain_events`] after every interaction with the transport.
pub trait Transport: Any + Send {
    /// Accept one outbound message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be accepted.
    fn write(&mut self, message: Message) -> Result<(), ChannelError>;

    /// Push accepted messages towards the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport has failed.
    fn flush(&mut self) -> Result<(), ChannelError>;

    /// Close the given direction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails while closing.
    fn close(&mut self, mode: CloseMode) -> Result<(), ChannelError>;

    /// Whether writes are currently accepted without queueing past the
    /// transport's limits.
    fn is_writable(&self) -> bool;

    /// Signal demand for inbound data.
    fn read(&mut self) {}

    /// Move pending events into `events`.
    fn drain_events(&mut self, _events: &mut Vec<TransportEvent>) {}

    /// Readiness the transport currently needs from the reactor. `None` for
    /// transports that are not backed by an OS resource.
    fn interest(&self) -> Option<Interest> { None }

    /// OS resource to register with the reactor.
    fn source(&mut self) -> Option<&mut dyn Source> { None }

    /// React to readiness reported by the reactor.
    fn on_ready(&mut self, _readiness: Readiness) {}
}
