//! Channels owned by an event loop.
//!
//! A [`Channel`] couples a [`Transport`] with a chain of
//! [`ChannelHandler`]s. All of its state lives on the owning loop thread;
//! other threads reach it through a [`ChannelHandle`].

pub mod embedded;
mod handle;
pub mod pipeline;
pub mod socket;
mod transport;

use std::{any::Any, fmt, sync::Arc};

pub use handle::ChannelHandle;
pub use pipeline::{ChannelHandler, HandlerContext, PipelineError};
use pipeline::{InboundOp, Location, OutboundOp, Pipeline, Step};
use tokio::sync::oneshot;
use tracing::{trace, warn};
pub use transport::{Transport, TransportEvent};

use crate::{
    error::ChannelError,
    metrics::{self, Direction},
    panic,
    reactor::{Interest, Readiness, Token},
};

/// Type-erased message travelling through a handler chain.
pub type Message = Box<dyn Any + Send>;

/// Identifier of a channel within its event loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Create a new identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self { Self(id) }

    /// Raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 { self.0 }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "ids are allocated sequentially from zero"
    )]
    pub(crate) fn token(self) -> Token { Token(self.0 as usize) }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ChannelId({})", self.0) }
}

/// Which direction of a channel to close.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseMode {
    /// Stop receiving.
    Input,
    /// Stop sending.
    Output,
    /// Close both directions.
    All,
}

/// Lifecycle event delivered through [`ChannelHandler::user_event`].
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The peer will send nothing further.
    InputClosed,
}

/// Single-use completion slot for an outbound operation.
///
/// Dropping an uncompleted promise resolves its receiver with a closed
/// error.
#[must_use]
#[derive(Debug, Default)]
pub struct Promise(Option<oneshot::Sender<Result<(), ChannelError>>>);

impl Promise {
    /// Create a promise and the receiver observing it.
    pub fn new() -> (Self, PromiseReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), PromiseReceiver(rx))
    }

    /// A promise nobody observes.
    pub fn none() -> Self { Self(None) }

    /// Complete successfully.
    pub fn succeed(self) { self.complete(Ok(())); }

    /// Complete with `error`.
    pub fn fail(self, error: ChannelError) { self.complete(Err(error)); }

    /// Complete with `result`.
    pub fn complete(mut self, result: Result<(), ChannelError>) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(result);
        }
    }
}

/// Awaitable outcome of a [`Promise`].
#[derive(Debug)]
pub struct PromiseReceiver(oneshot::Receiver<Result<(), ChannelError>>);

impl PromiseReceiver {
    /// Wait for the promise to complete.
    ///
    /// # Errors
    ///
    /// Returns the error the promise was failed with, or a closed error if it
    /// was dropped.
    pub async fn wait(self) -> Result<(), ChannelError> {
        self.0.await.unwrap_or_else(|_| Err(ChannelError::closed()))
    }
}

/// Flags shared with handlers through their [`HandlerContext`].
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub(crate) id: ChannelId,
    pub(crate) active: bool,
    pub(crate) writable: bool,
    pub(crate) input_closed: bool,
    pub(crate) output_closed: bool,
}

/// A transport plus its handler chain.
pub struct Channel {
    state: ChannelState,
    pipeline: Pipeline,
    transport: Box<dyn Transport>,
    running: bool,
    torn_down: bool,
    pub(crate) handles: usize,
    pub(crate) registered: Option<Interest>,
}

impl Channel {
    /// Create an active channel over `transport`.
    pub fn new(id: ChannelId, transport: impl Transport) -> Self {
        let writable = transport.is_writable();
        Self {
            state: ChannelState {
                id,
                active: true,
                writable,
                input_closed: false,
                output_closed: false,
            },
            pipeline: Pipeline::default(),
            transport: Box::new(transport),
            running: false,
            torn_down: false,
            handles: 0,
            registered: None,
        }
    }

    /// Channel identifier.
    #[must_use]
    pub fn id(&self) -> ChannelId { self.state.id }

    /// Whether the channel is open in at least one direction.
    #[must_use]
    pub fn is_active(&self) -> bool { self.state.active }

    /// Whether writes are accepted without queueing.
    #[must_use]
    pub fn is_writable(&self) -> bool { self.state.writable }

    /// Whether the input side has been closed.
    #[must_use]
    pub fn is_input_closed(&self) -> bool { self.state.input_closed }

    /// Whether the output side has been closed.
    #[must_use]
    pub fn is_output_closed(&self) -> bool { self.state.output_closed }

    /// Returns `true` if a live handler is registered under `name`.
    #[must_use]
    pub fn contains_handler(&self, name: &str) -> bool {
        matches!(self.pipeline.locate(name), Some(Location::Live(_)))
    }

    /// Borrow the transport as its concrete type.
    pub fn transport_mut<T: Transport>(&mut self) -> Option<&mut T> {
        let transport: &mut dyn Any = &mut *self.transport;
        transport.downcast_mut()
    }

    /// Append a handler to the end of the chain.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Inactive`] once the channel has closed and
    /// [`PipelineError::DuplicateName`] if `name` is taken.
    pub fn add_handler(
        &mut self,
        name: impl Into<String>,
        handler: impl ChannelHandler,
    ) -> Result<(), PipelineError> {
        self.add_boxed_handler(name.into(), Box::new(handler))
    }

    pub(crate) fn add_boxed_handler(
        &mut self,
        name: String,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<(), PipelineError> {
        if !self.state.active || self.torn_down {
            return Err(PipelineError::Inactive);
        }
        let index = self.pipeline.add_last(name, handler)?;
        self.invoke_at(index, |handler, ctx| handler.handler_added(ctx));
        self.run();
        Ok(())
    }

    /// Remove the handler registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotFound`] if no live handler has that name.
    pub fn remove_handler(&mut self, name: &str) -> Result<(), PipelineError> {
        let Some(Location::Live(index)) = self.pipeline.locate(name) else {
            return Err(PipelineError::NotFound(name.to_owned()));
        };
        self.retire(index);
        self.run();
        Ok(())
    }

    /// Run `f` against the handler registered under `name`, downcast to `H`.
    ///
    /// Handlers removed from the chain remain reachable, so owners can still
    /// collect state they buffered before removal. Returns `None` if no
    /// handler of that name and type exists.
    pub fn invoke_handler<H, R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut H, &mut HandlerContext<'_>) -> R,
    ) -> Option<R>
    where
        H: ChannelHandler,
    {
        let typed = move |handler: &mut (dyn ChannelHandler + 'static), ctx: &mut HandlerContext<'_>| {
            let handler: &mut (dyn Any + 'static) = handler;
            handler.downcast_mut::<H>().map(|handler| f(handler, ctx))
        };
        let out = match self.pipeline.locate(name)? {
            Location::Live(index) => self.invoke_at(index, typed),
            Location::Retired(index) => self.invoke_retired(index, typed),
        };
        self.run();
        out.flatten()
    }

    /// Inject an inbound message at the head of the chain.
    pub fn fire_channel_read(&mut self, message: Message) {
        metrics::inc_messages(Direction::Inbound);
        self.enqueue(Step::inbound(InboundOp::Read(message)));
    }

    /// Inject an error at the head of the chain.
    pub fn fire_error_caught(&mut self, error: ChannelError) {
        self.enqueue(Step::inbound(InboundOp::Error(error)));
    }

    /// Inject a lifecycle event at the head of the chain.
    pub fn fire_user_event(&mut self, event: ChannelEvent) {
        self.enqueue(Step::inbound(InboundOp::UserEvent(event)));
    }

    /// Write `message` from the tail of the chain.
    pub fn write(&mut self, message: Message, promise: Promise) {
        self.enqueue(Step::outbound(OutboundOp::Write(message, promise)));
    }

    /// Flush from the tail of the chain.
    pub fn flush(&mut self, promise: Promise) {
        self.enqueue(Step::outbound(OutboundOp::Flush(promise)));
    }

    /// Close from the tail of the chain.
    pub fn close(&mut self, mode: CloseMode, promise: Promise) {
        self.enqueue(Step::outbound(OutboundOp::Close(mode, promise)));
    }

    /// Request more inbound data from the tail of the chain.
    pub fn read(&mut self) { self.enqueue(Step::outbound(OutboundOp::Read)); }

    /// Deliver readiness reported by the reactor to the transport.
    pub(crate) fn on_transport_ready(&mut self, readiness: Readiness) {
        self.transport.on_ready(readiness);
        self.poll_transport();
    }

    /// Collect events the transport produced outside the chain's control.
    pub(crate) fn poll_transport(&mut self) {
        let steps = self.transport_steps();
        self.pipeline.queue.extend(steps);
        self.run();
    }

    pub(crate) fn transport_interest(&self) -> Option<Interest> {
        if self.state.active {
            self.transport.interest()
        } else {
            None
        }
    }

    pub(crate) fn transport_source(&mut self) -> Option<&mut dyn mio::event::Source> {
        self.transport.source()
    }

    /// Returns `true` once the channel is closed, its handlers are removed
    /// and no handle refers to it any more.
    pub(crate) fn is_reapable(&self) -> bool {
        !self.state.active && self.torn_down && self.handles == 0
    }

    fn enqueue(&mut self, step: Step) {
        self.pipeline.queue.push_back(step);
        self.run();
    }

    /// Drain the step queue. Re-entrant calls return immediately; the outer
    /// call picks up whatever they queued.
    fn run(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        loop {
            while let Some(step) = self.pipeline.queue.pop_front() {
                self.process(step);
            }
            if !self.state.active && !self.torn_down {
                self.tear_down();
                continue;
            }
            break;
        }
        self.running = false;
    }

    fn process(&mut self, step: Step) {
        match step {
            Step::Inbound { from, op } => match self.pipeline.next_inbound(from) {
                Some(index) => {
                    self.invoke_at(index, move |handler, ctx| dispatch_inbound(handler, ctx, op));
                }
                None => tail(op),
            },
            Step::Outbound { from, op } => match self.pipeline.next_outbound(from) {
                Some(index) => {
                    self.invoke_at(index, move |handler, ctx| {
                        dispatch_outbound(handler, ctx, op);
                    });
                }
                None => self.head(op),
            },
            Step::Wake(id) => {
                if let Some(index) = self.pipeline.position(id) {
                    self.invoke_at(index, |handler, ctx| handler.woken(ctx));
                }
            }
        }
    }

    /// Call into the live handler at `index`, then schedule what it emitted.
    fn invoke_at<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut (dyn ChannelHandler + 'static), &mut HandlerContext<'_>) -> R,
    ) -> Option<R> {
        let slot = &mut self.pipeline.slots[index];
        let mut handler = slot.handler.take()?;
        let mut ctx = HandlerContext::new(slot.id, Arc::clone(&slot.name), &self.state);
        let out = panic::contain("channel handler", || f(&mut *handler, &mut ctx));
        let (emitted, remove) = ctx.finish();
        self.pipeline.slots[index].handler = Some(handler);
        self.pipeline.prepend(emitted);
        if remove {
            self.retire(index);
        }
        out
    }

    fn invoke_retired<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut (dyn ChannelHandler + 'static), &mut HandlerContext<'_>) -> R,
    ) -> Option<R> {
        let slot = &mut self.pipeline.retired[index];
        let mut handler = slot.handler.take()?;
        let mut ctx = HandlerContext::new(slot.id, Arc::clone(&slot.name), &self.state);
        let out = panic::contain("channel handler", || f(&mut *handler, &mut ctx));
        let (emitted, _) = ctx.finish();
        self.pipeline.retired[index].handler = Some(handler);
        self.pipeline.prepend(emitted);
        out
    }

    /// Move the live handler at `index` out of the chain and notify it.
    fn retire(&mut self, index: usize) {
        let mut slot = self.pipeline.slots.remove(index);
        if let Some(mut handler) = slot.handler.take() {
            let mut ctx = HandlerContext::new(slot.id, Arc::clone(&slot.name), &self.state);
            panic::contain("channel handler", || handler.handler_removed(&mut ctx));
            let (emitted, _) = ctx.finish();
            slot.handler = Some(handler);
            self.pipeline.prepend(emitted);
        }
        trace!(channel = %self.state.id, name = %slot.name, "handler removed");
        self.pipeline.retired.push(slot);
    }

    fn tear_down(&mut self) {
        self.torn_down = true;
        while !self.pipeline.slots.is_empty() {
            self.retire(0);
        }
    }

    /// Outbound operations that passed every handler.
    fn head(&mut self, op: OutboundOp) {
        let mut steps = Vec::new();
        match op {
            OutboundOp::Write(message, promise) => {
                if !self.state.active || self.state.output_closed {
                    promise.fail(ChannelError::closed());
                    return;
                }
                let result = self.transport.write(message);
                if result.is_ok() {
                    metrics::inc_messages(Direction::Outbound);
                }
                promise.complete(result);
            }
            OutboundOp::Flush(promise) => {
                if !self.state.active || self.state.output_closed {
                    promise.fail(ChannelError::closed());
                    return;
                }
                promise.complete(self.transport.flush());
            }
            OutboundOp::Close(mode, promise) => {
                promise.complete(self.close_transport(mode, &mut steps));
            }
            OutboundOp::Read => {
                if self.state.active && !self.state.input_closed {
                    self.transport.read();
                }
            }
        }
        steps.extend(self.transport_steps());
        self.pipeline.prepend(steps);
    }

    fn close_transport(
        &mut self,
        mode: CloseMode,
        steps: &mut Vec<Step>,
    ) -> Result<(), ChannelError> {
        if !self.state.active {
            return Ok(());
        }
        match mode {
            CloseMode::Input if self.state.input_closed => Ok(()),
            CloseMode::Output if self.state.output_closed => Ok(()),
            CloseMode::Input => {
                self.state.input_closed = true;
                self.transport.close(CloseMode::Input)
            }
            CloseMode::Output => {
                self.state.output_closed = true;
                self.transport.close(CloseMode::Output)
            }
            CloseMode::All => {
                let result = self.transport.close(CloseMode::All);
                self.mark_inactive(steps);
                result
            }
        }
    }

    fn mark_inactive(&mut self, steps: &mut Vec<Step>) {
        if !self.state.active {
            return;
        }
        self.state.active = false;
        self.state.input_closed = true;
        self.state.output_closed = true;
        trace!(channel = %self.state.id, "channel inactive");
        steps.push(Step::inbound(InboundOp::Inactive));
    }

    /// Translate pending transport events and writability into steps.
    fn transport_steps(&mut self) -> Vec<Step> {
        let mut events = Vec::new();
        self.transport.drain_events(&mut events);
        let mut steps = Vec::with_capacity(events.len() + 1);
        for event in events {
            match event {
                TransportEvent::Read(message) => {
                    metrics::inc_messages(Direction::Inbound);
                    steps.push(Step::inbound(InboundOp::Read(message)));
                }
                TransportEvent::InputClosed => {
                    if !self.state.input_closed {
                        self.state.input_closed = true;
                        steps.push(Step::inbound(InboundOp::UserEvent(ChannelEvent::InputClosed)));
                    }
                }
                TransportEvent::Error(error) => {
                    steps.push(Step::inbound(InboundOp::Error(error)));
                }
                TransportEvent::Closed => self.mark_inactive(&mut steps),
            }
        }
        let writable = self.transport.is_writable();
        if self.state.active && writable != self.state.writable {
            self.state.writable = writable;
            steps.push(Step::inbound(InboundOp::WritabilityChanged));
        }
        steps
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state)
            .field("handlers", &self.pipeline.slots.len())
            .field("handles", &self.handles)
            .finish_non_exhaustive()
    }
}

fn dispatch_inbound(handler: &mut dyn ChannelHandler, ctx: &mut HandlerContext<'_>, op: InboundOp) {
    match op {
        InboundOp::Read(message) => handler.channel_read(ctx, message),
        InboundOp::Error(error) => handler.error_caught(ctx, error),
        InboundOp::UserEvent(event) => handler.user_event(ctx, event),
        InboundOp::Inactive => handler.channel_inactive(ctx),
        InboundOp::WritabilityChanged => handler.writability_changed(ctx),
    }
}

fn dispatch_outbound(
    handler: &mut dyn ChannelHandler,
    ctx: &mut HandlerContext<'_>,
    op: OutboundOp,
) {
    match op {
        OutboundOp::Write(message, promise) => handler.write(ctx, message, promise),
        OutboundOp::Flush(promise) => handler.flush(ctx, promise),
        OutboundOp::Close(mode, promise) => handler.close(ctx, mode, promise),
        OutboundOp::Read => handler.read(ctx),
    }
}

/// Inbound events nobody consumed.
fn tail(op: InboundOp) {
    match op {
        InboundOp::Read(_) => trace!("inbound message reached the end of the chain"),
        InboundOp::Error(error) => warn!(%error, "unhandled channel error"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{embedded::EmbeddedTransport, *};

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Records what it sees and forwards everything.
    struct Recorder {
        tag: &'static str,
        journal: Journal,
    }

    impl Recorder {
        fn note(&self, what: &str) {
            self.journal
                .lock()
                .expect("journal lock")
                .push(format!("{}:{what}", self.tag));
        }
    }

    impl ChannelHandler for Recorder {
        fn handler_removed(&mut self, _ctx: &mut HandlerContext<'_>) { self.note("removed"); }

        fn channel_read(&mut self, ctx: &mut HandlerContext<'_>, message: Message) {
            self.note("read");
            ctx.fire_channel_read(message);
        }

        fn channel_inactive(&mut self, ctx: &mut HandlerContext<'_>) {
            self.note("inactive");
            ctx.fire_channel_inactive();
        }

        fn write(&mut self, ctx: &mut HandlerContext<'_>, message: Message, promise: Promise) {
            self.note("write");
            ctx.write(message, promise);
        }
    }

    /// Answers every inbound message with an outbound one.
    struct Echo;

    impl ChannelHandler for Echo {
        fn channel_read(&mut self, ctx: &mut HandlerContext<'_>, message: Message) {
            ctx.write(message, Promise::none());
            ctx.flush(Promise::none());
        }
    }

    fn channel() -> Channel { Channel::new(ChannelId::new(1), EmbeddedTransport::new()) }

    fn recorder(tag: &'static str, journal: &Journal) -> Recorder {
        Recorder {
            tag,
            journal: Arc::clone(journal),
        }
    }

    #[test]
    fn inbound_and_outbound_traverse_in_opposite_orders() {
        let journal = Journal::default();
        let mut channel = channel();
        channel.add_handler("a", recorder("a", &journal)).expect("add a");
        channel.add_handler("b", recorder("b", &journal)).expect("add b");
        channel.add_handler("echo", Echo).expect("add echo");

        channel.fire_channel_read(Box::new(7_u32));

        let journal = journal.lock().expect("journal lock").clone();
        assert_eq!(journal, ["a:read", "b:read", "b:write", "a:write"]);
        let transport = channel
            .transport_mut::<EmbeddedTransport>()
            .expect("embedded transport");
        let written = transport.take_flushed();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].downcast_ref::<u32>(), Some(&7));
    }

    #[test]
    fn closing_tears_down_every_handler() {
        let journal = Journal::default();
        let mut channel = channel();
        channel.add_handler("a", recorder("a", &journal)).expect("add a");
        channel.add_handler("b", recorder("b", &journal)).expect("add b");

        channel.close(CloseMode::All, Promise::none());

        assert!(!channel.is_active());
        assert!(!channel.contains_handler("a"));
        let journal = journal.lock().expect("journal lock").clone();
        assert_eq!(journal, ["a:inactive", "b:inactive", "a:removed", "b:removed"]);
        assert_eq!(
            channel.add_handler("c", Echo).expect_err("inactive"),
            PipelineError::Inactive
        );
    }

    #[test]
    fn removed_handlers_remain_reachable() {
        let journal = Journal::default();
        let mut channel = channel();
        channel.add_handler("a", recorder("a", &journal)).expect("add a");
        channel.remove_handler("a").expect("remove a");

        let tag = channel.invoke_handler::<Recorder, _>("a", |handler, _| handler.tag);
        assert_eq!(tag, Some("a"));
        assert_eq!(
            channel.remove_handler("a").expect_err("already removed"),
            PipelineError::NotFound("a".to_owned())
        );
    }

    #[test]
    fn writes_from_removed_handlers_still_pass_live_handlers() {
        let journal = Journal::default();
        let mut channel = channel();
        channel.add_handler("a", recorder("a", &journal)).expect("add a");
        channel.add_handler("echo", Echo).expect("add echo");
        channel.remove_handler("echo").expect("remove echo");

        channel.invoke_handler::<Echo, _>("echo", |echo, ctx| {
            echo.channel_read(ctx, Box::new(3_u32));
        });

        let journal = journal.lock().expect("journal lock").clone();
        assert_eq!(journal, ["a:write"]);
        let transport = channel
            .transport_mut::<EmbeddedTransport>()
            .expect("embedded transport");
        assert_eq!(transport.take_flushed().len(), 1);
    }

    #[tokio::test]
    async fn writes_to_a_closed_output_fail() {
        let mut channel = channel();
        channel.close(CloseMode::Output, Promise::none());
        let (promise, outcome) = Promise::new();
        channel.write(Box::new(1_u8), promise);
        let err = outcome.wait().await.expect_err("output closed");
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn dropped_promises_report_closure() {
        let (promise, outcome) = Promise::new();
        drop(promise);
        assert!(outcome.wait().await.expect_err("dropped").is_closed());
    }
}
