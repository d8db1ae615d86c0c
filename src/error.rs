//! Canonical error and result types for the crate.
//!
//! [`ChannelError`] carries failures raised by a channel (transport faults,
//! protocol decode failures, closure) and is replayed verbatim to every
//! consumer that observes it. [`BridgeError`] is the surface returned by the
//! asynchronous bridge API.

use std::{error::Error as StdError, fmt, io, sync::Arc};

use thiserror::Error;

/// Broad classification of a [`ChannelError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// The underlying transport reported an I/O failure.
    Io,
    /// The channel, or the requested direction of it, is already closed.
    Closed,
    /// An inbound message did not match the type the consumer expects.
    UnexpectedMessage,
    /// Any other error raised by a handler in the chain.
    Other,
}

/// Opaque, cloneable error captured from a channel.
///
/// The original error value is kept behind an [`Arc`] so that one captured
/// failure can be handed to every reader and writer that asks after the fact.
/// Use [`ChannelError::downcast_ref`] to recover it.
#[derive(Clone)]
pub struct ChannelError {
    kind: ChannelErrorKind,
    source: Arc<dyn StdError + Send + Sync + 'static>,
}

impl ChannelError {
    /// Wrap an arbitrary error raised inside the handler chain.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::with_kind(ChannelErrorKind::Other, error)
    }

    /// Wrap `error` with an explicit kind.
    pub fn with_kind<E>(kind: ChannelErrorKind, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind,
            source: Arc::new(error),
        }
    }

    /// Convert a transport I/O failure.
    #[must_use]
    pub fn io(error: io::Error) -> Self { Self::with_kind(ChannelErrorKind::Io, error) }

    /// Error reported when an operation targets a closed channel or direction.
    #[must_use]
    pub fn closed() -> Self {
        Self::with_kind(
            ChannelErrorKind::Closed,
            io::Error::new(io::ErrorKind::NotConnected, "channel closed"),
        )
    }

    /// Error reported when an inbound message has an unexpected type.
    #[must_use]
    pub fn unexpected_message(expected: &'static str) -> Self {
        Self::with_kind(
            ChannelErrorKind::UnexpectedMessage,
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("inbound message is not a {expected}"),
            ),
        )
    }

    /// Return the error classification.
    #[must_use]
    pub fn kind(&self) -> ChannelErrorKind { self.kind }

    /// Returns `true` if the error signals a closed channel.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.kind == ChannelErrorKind::Closed }

    /// Attempt to borrow the captured error as a concrete type.
    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }
}

impl fmt::Debug for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelError")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(&self.source, f) }
}

impl StdError for ChannelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> { Some(&*self.source) }
}

impl From<io::Error> for ChannelError {
    fn from(error: io::Error) -> Self { Self::io(error) }
}

/// Errors surfaced to code consuming an [`AsyncChannel`](crate::bridge::AsyncChannel).
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The channel failed; the payload is the captured error.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    /// A second reader attempted to consume the inbound stream concurrently.
    #[error("concurrent consumption of the inbound stream is not allowed")]
    ConcurrentConsumptionNotAllowed,
    /// The event loop owning the channel has stopped.
    #[error("event loop is closed")]
    EventLoopClosed,
}

impl BridgeError {
    /// Borrow the captured channel error, if this is one.
    #[must_use]
    pub fn as_channel_error(&self) -> Option<&ChannelError> {
        match self {
            Self::Channel(error) => Some(error),
            _ => None,
        }
    }
}

/// Canonical result alias used by `wirebridge` public APIs.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("bang")]
    struct Bang;

    #[test]
    fn downcast_recovers_original_error() {
        let err = ChannelError::new(Bang);
        assert_eq!(err.kind(), ChannelErrorKind::Other);
        assert_eq!(err.downcast_ref::<Bang>(), Some(&Bang));
        assert_eq!(err.to_string(), "bang");
    }

    #[test]
    fn clones_share_the_captured_error() {
        let err = ChannelError::new(Bang);
        let copy = err.clone();
        assert!(std::ptr::addr_eq(
            err.downcast_ref::<Bang>().expect("bang"),
            copy.downcast_ref::<Bang>().expect("bang"),
        ));
    }

    #[test]
    fn closed_errors_are_classified() {
        let err = BridgeError::from(ChannelError::closed());
        assert!(err.as_channel_error().is_some_and(ChannelError::is_closed));
    }
}
