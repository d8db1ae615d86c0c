//! Loop-side half of the inbound bridge.
//!
//! [`InboundAdapter`] sits at the end of the handler chain and turns the
//! channel's event feed into the state read by an
//! [`InboundStream`](super::InboundStream): a buffer of messages, at most one
//! pending read, and a terminal outcome that never reverts once reached.

use std::{any::type_name, collections::VecDeque, fmt};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{
    channel::{ChannelEvent, ChannelHandler, CloseMode, HandlerContext, Message, Promise},
    error::{BridgeError, ChannelError},
    metrics,
};

pub(crate) type ReadResult<In> = Result<Option<In>, BridgeError>;

/// How the inbound stream ended.
#[derive(Clone, Debug)]
enum Terminal {
    Open,
    Completed(Option<ChannelError>),
}

/// Captures inbound messages, errors and end-of-input for one consumer.
pub struct InboundAdapter<In> {
    buffer: VecDeque<In>,
    terminal: Terminal,
    pending: Option<oneshot::Sender<ReadResult<In>>>,
    consumer_gone: bool,
}

impl<In> Default for InboundAdapter<In> {
    fn default() -> Self {
        Self {
            buffer: VecDeque::new(),
            terminal: Terminal::Open,
            pending: None,
            consumer_gone: false,
        }
    }
}

impl<In: Send + 'static> InboundAdapter<In> {
    /// Create an adapter with an empty buffer.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Messages received but not yet read.
    #[must_use]
    pub fn buffered(&self) -> usize { self.buffer.len() }

    /// Returns `true` once end-of-input or an error has been recorded.
    #[must_use]
    pub fn is_completed(&self) -> bool { matches!(self.terminal, Terminal::Completed(_)) }

    /// Serve one read request.
    ///
    /// Buffered messages are returned first, then the terminal outcome. With
    /// nothing to return the request is parked and read demand is sent
    /// towards the transport.
    pub(crate) fn read_next(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        reply: oneshot::Sender<ReadResult<In>>,
    ) {
        if let Some(pending) = &self.pending {
            if !pending.is_closed() {
                let _ = reply.send(Err(BridgeError::ConcurrentConsumptionNotAllowed));
                return;
            }
            // Its reader stopped waiting.
            self.pending = None;
        }

        if let Some(message) = self.buffer.pop_front() {
            if let Err(Ok(Some(message))) = reply.send(Ok(Some(message))) {
                self.buffer.push_front(message);
            }
            return;
        }

        match &self.terminal {
            Terminal::Completed(outcome) => {
                let _ = reply.send(replay(outcome));
            }
            Terminal::Open => {
                self.pending = Some(reply);
                ctx.read();
            }
        }
    }

    /// The last [`InboundStream`](super::InboundStream) was dropped.
    pub(crate) fn consumer_gone(&mut self, ctx: &mut HandlerContext<'_>) {
        if self.consumer_gone {
            return;
        }
        self.consumer_gone = true;
        self.pending = None;
        let dropped = self.buffer.len();
        self.buffer.clear();
        if dropped > 0 {
            trace!(channel = %ctx.channel_id(), dropped, "discarded unread inbound messages");
            metrics::inc_dropped(dropped as u64);
        }
        if !self.is_completed() {
            ctx.close(CloseMode::Input, Promise::none());
        }
    }

    fn deliver(&mut self, ctx: &HandlerContext<'_>, message: In) {
        if self.consumer_gone {
            trace!(channel = %ctx.channel_id(), "no consumer; dropping inbound message");
            metrics::inc_dropped(1);
            return;
        }
        if self.is_completed() {
            trace!(channel = %ctx.channel_id(), "stream completed; dropping inbound message");
            return;
        }
        match self.pending.take() {
            Some(reply) => {
                if let Err(Ok(Some(message))) = reply.send(Ok(Some(message))) {
                    self.buffer.push_back(message);
                }
            }
            None => self.buffer.push_back(message),
        }
    }

    fn complete(&mut self, ctx: &HandlerContext<'_>, error: Option<ChannelError>) {
        if self.is_completed() {
            if let Some(error) = error {
                trace!(channel = %ctx.channel_id(), %error, "stream completed; swallowing error");
            }
            return;
        }
        match &error {
            Some(error) => {
                metrics::inc_errors();
                debug!(channel = %ctx.channel_id(), %error, "inbound stream failed");
            }
            None => trace!(channel = %ctx.channel_id(), "inbound stream ended"),
        }
        self.terminal = Terminal::Completed(error);
        if self.buffer.is_empty() {
            if let Some(reply) = self.pending.take() {
                let _ = reply.send(replay_terminal(&self.terminal));
            }
        }
    }
}

fn replay<In>(outcome: &Option<ChannelError>) -> ReadResult<In> {
    match outcome {
        Some(error) => Err(BridgeError::Channel(error.clone())),
        None => Ok(None),
    }
}

fn replay_terminal<In>(terminal: &Terminal) -> ReadResult<In> {
    match terminal {
        Terminal::Completed(outcome) => replay(outcome),
        Terminal::Open => Ok(None),
    }
}

impl<In: Send + 'static> ChannelHandler for InboundAdapter<In> {
    fn handler_removed(&mut self, ctx: &mut HandlerContext<'_>) { self.complete(ctx, None); }

    fn channel_read(&mut self, ctx: &mut HandlerContext<'_>, message: Message) {
        match message.downcast::<In>() {
            Ok(message) => self.deliver(ctx, *message),
            Err(_) => {
                // Raised from the head so the writer queue fails as well; the
                // error comes back here through `error_caught`.
                ctx.raise_error(ChannelError::unexpected_message(type_name::<In>()));
            }
        }
    }

    fn error_caught(&mut self, ctx: &mut HandlerContext<'_>, error: ChannelError) {
        self.complete(ctx, Some(error));
    }

    fn user_event(&mut self, ctx: &mut HandlerContext<'_>, event: ChannelEvent) {
        if event == ChannelEvent::InputClosed {
            self.complete(ctx, None);
        }
        ctx.fire_user_event(event);
    }

    fn channel_inactive(&mut self, ctx: &mut HandlerContext<'_>) {
        self.complete(ctx, None);
        ctx.fire_channel_inactive();
    }
}

impl<In> fmt::Debug for InboundAdapter<In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundAdapter")
            .field("buffered", &self.buffer.len())
            .field("terminal", &self.terminal)
            .field("pending", &self.pending.is_some())
            .field("consumer_gone", &self.consumer_gone)
            .finish()
    }
}
