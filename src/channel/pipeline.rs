//! Ordered handler chain of a [`Channel`](super::Channel).
//!
//! Inbound events travel from the transport (the head) towards the last
//! handler (the tail); outbound operations travel the other way and end in
//! the transport. Handlers never call their neighbours directly: forwarding
//! through a [`HandlerContext`] records a step, and the channel drains the
//! recorded steps once the handler returns. Steps emitted by one handler run
//! before anything queued earlier, so a forwarded event completes its journey
//! through the chain before the next pending event starts. No handler is
//! ever entered while it is already running.

use std::{any::Any, collections::VecDeque, sync::Arc};

use thiserror::Error;

use super::{ChannelEvent, ChannelState, CloseMode, Message, Promise};
use crate::error::ChannelError;

/// A participant in a channel's handler chain.
///
/// Every callback has a default that forwards the event unchanged, so an
/// implementation only overrides what it intercepts. Callbacks run on the
/// event-loop thread and must not block.
pub trait ChannelHandler: Any + Send {
    /// Called once the handler has been inserted into the chain.
    fn handler_added(&mut self, _ctx: &mut HandlerContext<'_>) {}

    /// Called once the handler has been removed from the chain, either
    /// explicitly or because the channel closed.
    fn handler_removed(&mut self, _ctx: &mut HandlerContext<'_>) {}

    /// An inbound message arrived.
    fn channel_read(&mut self, ctx: &mut HandlerContext<'_>, message: Message) {
        ctx.fire_channel_read(message);
    }

    /// An error was raised by the transport or an earlier handler.
    fn error_caught(&mut self, ctx: &mut HandlerContext<'_>, error: ChannelError) {
        ctx.fire_error_caught(error);
    }

    /// A lifecycle event such as [`ChannelEvent::InputClosed`].
    fn user_event(&mut self, ctx: &mut HandlerContext<'_>, event: ChannelEvent) {
        ctx.fire_user_event(event);
    }

    /// The channel closed in both directions.
    fn channel_inactive(&mut self, ctx: &mut HandlerContext<'_>) { ctx.fire_channel_inactive(); }

    /// The channel's writability flag flipped; read it with
    /// [`HandlerContext::is_writable`].
    fn writability_changed(&mut self, ctx: &mut HandlerContext<'_>) {
        ctx.fire_writability_changed();
    }

    /// Delivered after [`HandlerContext::wake`] once the steps emitted
    /// alongside the wake request have run.
    fn woken(&mut self, _ctx: &mut HandlerContext<'_>) {}

    /// An outbound message is travelling towards the transport.
    fn write(&mut self, ctx: &mut HandlerContext<'_>, message: Message, promise: Promise) {
        ctx.write(message, promise);
    }

    /// A flush request is travelling towards the transport.
    fn flush(&mut self, ctx: &mut HandlerContext<'_>, promise: Promise) { ctx.flush(promise); }

    /// A close request is travelling towards the transport.
    fn close(&mut self, ctx: &mut HandlerContext<'_>, mode: CloseMode, promise: Promise) {
        ctx.close(mode, promise);
    }

    /// Demand for more inbound data is travelling towards the transport.
    fn read(&mut self, ctx: &mut HandlerContext<'_>) { ctx.read(); }
}

/// Errors returned when editing a handler chain.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A handler with this name is already part of the chain.
    #[error("handler {0:?} already exists")]
    DuplicateName(String),
    /// No handler with this name is part of the chain.
    #[error("handler {0:?} not found")]
    NotFound(String),
    /// The channel is closed and no longer accepts handlers.
    #[error("channel is inactive")]
    Inactive,
}

impl From<PipelineError> for ChannelError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Inactive => ChannelError::closed(),
            other => ChannelError::new(other),
        }
    }
}

/// Identity of a handler within one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HandlerId(u64);

pub(crate) enum InboundOp {
    Read(Message),
    Error(ChannelError),
    UserEvent(ChannelEvent),
    Inactive,
    WritabilityChanged,
}

pub(crate) enum OutboundOp {
    Write(Message, Promise),
    Flush(Promise),
    Close(CloseMode, Promise),
    Read,
}

/// One unit of pending work. `from` names the handler that emitted the step;
/// `None` means the step entered at the head (inbound) or tail (outbound).
pub(crate) enum Step {
    Inbound {
        from: Option<HandlerId>,
        op: InboundOp,
    },
    Outbound {
        from: Option<HandlerId>,
        op: OutboundOp,
    },
    Wake(HandlerId),
}

impl Step {
    pub(crate) fn inbound(op: InboundOp) -> Self { Step::Inbound { from: None, op } }

    pub(crate) fn outbound(op: OutboundOp) -> Self { Step::Outbound { from: None, op } }
}

/// Per-invocation view of the channel handed to a [`ChannelHandler`].
pub struct HandlerContext<'a> {
    id: HandlerId,
    name: Arc<str>,
    channel: &'a ChannelState,
    emitted: Vec<Step>,
    remove_requested: bool,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(id: HandlerId, name: Arc<str>, channel: &'a ChannelState) -> Self {
        Self {
            id,
            name,
            channel,
            emitted: Vec::new(),
            remove_requested: false,
        }
    }

    pub(crate) fn finish(self) -> (Vec<Step>, bool) { (self.emitted, self.remove_requested) }

    /// Name this handler was registered under.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Identifier of the owning channel.
    #[must_use]
    pub fn channel_id(&self) -> super::ChannelId { self.channel.id }

    /// Whether the channel currently accepts writes without queueing.
    #[must_use]
    pub fn is_writable(&self) -> bool { self.channel.writable }

    /// Whether the channel is still open in at least one direction.
    #[must_use]
    pub fn is_active(&self) -> bool { self.channel.active }

    /// Pass an inbound message to the next handler.
    pub fn fire_channel_read(&mut self, message: Message) {
        self.emit_inbound(InboundOp::Read(message));
    }

    /// Pass an error to the next handler.
    pub fn fire_error_caught(&mut self, error: ChannelError) {
        self.emit_inbound(InboundOp::Error(error));
    }

    /// Pass a lifecycle event to the next handler.
    pub fn fire_user_event(&mut self, event: ChannelEvent) {
        self.emit_inbound(InboundOp::UserEvent(event));
    }

    /// Raise `error` at the head of the chain, so handlers ahead of this one
    /// observe it too.
    pub fn raise_error(&mut self, error: ChannelError) {
        self.emitted.push(Step::inbound(InboundOp::Error(error)));
    }

    /// Pass channel inactivity to the next handler.
    pub fn fire_channel_inactive(&mut self) { self.emit_inbound(InboundOp::Inactive); }

    /// Pass a writability change to the next handler.
    pub fn fire_writability_changed(&mut self) { self.emit_inbound(InboundOp::WritabilityChanged); }

    /// Send a message towards the transport.
    pub fn write(&mut self, message: Message, promise: Promise) {
        self.emit_outbound(OutboundOp::Write(message, promise));
    }

    /// Send a flush request towards the transport.
    pub fn flush(&mut self, promise: Promise) { self.emit_outbound(OutboundOp::Flush(promise)); }

    /// Send a close request towards the transport.
    pub fn close(&mut self, mode: CloseMode, promise: Promise) {
        self.emit_outbound(OutboundOp::Close(mode, promise));
    }

    /// Ask the transport for more inbound data.
    pub fn read(&mut self) { self.emit_outbound(OutboundOp::Read); }

    /// Ask for [`ChannelHandler::woken`] once everything emitted so far in
    /// this callback has been processed.
    pub fn wake(&mut self) { self.emitted.push(Step::Wake(self.id)); }

    /// Remove this handler from the chain when the callback returns.
    pub fn remove(&mut self) { self.remove_requested = true; }

    fn emit_inbound(&mut self, op: InboundOp) {
        self.emitted.push(Step::Inbound {
            from: Some(self.id),
            op,
        });
    }

    fn emit_outbound(&mut self, op: OutboundOp) {
        self.emitted.push(Step::Outbound {
            from: Some(self.id),
            op,
        });
    }
}

pub(crate) struct Slot {
    pub(crate) id: HandlerId,
    pub(crate) name: Arc<str>,
    pub(crate) handler: Option<Box<dyn ChannelHandler>>,
}

/// Where a named handler currently lives.
pub(crate) enum Location {
    Live(usize),
    Retired(usize),
}

/// Handler storage plus the queue of pending steps.
#[derive(Default)]
pub(crate) struct Pipeline {
    pub(crate) slots: Vec<Slot>,
    /// Removed handlers, kept so their owners can still query them.
    pub(crate) retired: Vec<Slot>,
    pub(crate) queue: VecDeque<Step>,
    next_id: u64,
}

impl Pipeline {
    pub(crate) fn add_last(
        &mut self,
        name: String,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<usize, PipelineError> {
        if self.slots.iter().any(|slot| *slot.name == *name) {
            return Err(PipelineError::DuplicateName(name));
        }
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.slots.push(Slot {
            id,
            name: name.into(),
            handler: Some(handler),
        });
        Ok(self.slots.len() - 1)
    }

    pub(crate) fn position(&self, id: HandlerId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    pub(crate) fn locate(&self, name: &str) -> Option<Location> {
        if let Some(index) = self.slots.iter().position(|slot| &*slot.name == name) {
            return Some(Location::Live(index));
        }
        self.retired
            .iter()
            .rposition(|slot| &*slot.name == name)
            .map(Location::Retired)
    }

    /// Index of the handler that receives an inbound step emitted by `from`,
    /// or `None` when the step falls off the tail.
    pub(crate) fn next_inbound(&self, from: Option<HandlerId>) -> Option<usize> {
        let start = match from {
            None => 0,
            Some(id) => self.position(id)? + 1,
        };
        (start..self.slots.len()).find(|&i| self.slots[i].handler.is_some())
    }

    /// Index of the handler that receives an outbound step emitted by `from`,
    /// or `None` when the step reaches the transport.
    ///
    /// Steps from a removed handler re-enter at the tail so that every live
    /// handler still sees them.
    pub(crate) fn next_outbound(&self, from: Option<HandlerId>) -> Option<usize> {
        let end = from
            .and_then(|id| self.position(id))
            .unwrap_or(self.slots.len());
        (0..end).rev().find(|&i| self.slots[i].handler.is_some())
    }

    pub(crate) fn prepend(&mut self, steps: Vec<Step>) {
        for step in steps.into_iter().rev() {
            self.queue.push_front(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl ChannelHandler for Noop {}

    fn pipeline(names: &[&str]) -> Pipeline {
        let mut pipeline = Pipeline::default();
        for name in names {
            pipeline
                .add_last((*name).to_owned(), Box::new(Noop))
                .expect("unique name");
        }
        pipeline
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut pipeline = pipeline(&["a"]);
        let err = pipeline
            .add_last("a".to_owned(), Box::new(Noop))
            .expect_err("duplicate");
        assert_eq!(err, PipelineError::DuplicateName("a".to_owned()));
    }

    #[test]
    fn inbound_walks_towards_the_tail() {
        let pipeline = pipeline(&["a", "b"]);
        let first = pipeline.next_inbound(None).expect("first handler");
        assert_eq!(first, 0);
        let second = pipeline.next_inbound(Some(pipeline.slots[0].id));
        assert_eq!(second, Some(1));
        assert_eq!(pipeline.next_inbound(Some(pipeline.slots[1].id)), None);
    }

    #[test]
    fn outbound_walks_towards_the_head() {
        let pipeline = pipeline(&["a", "b"]);
        assert_eq!(pipeline.next_outbound(None), Some(1));
        assert_eq!(pipeline.next_outbound(Some(pipeline.slots[1].id)), Some(0));
        assert_eq!(pipeline.next_outbound(Some(pipeline.slots[0].id)), None);
    }

    #[test]
    fn removed_emitters_reenter_outbound_at_the_tail() {
        let mut pipeline = pipeline(&["a", "b", "c"]);
        let slot = pipeline.slots.remove(2);
        assert_eq!(pipeline.next_inbound(Some(slot.id)), None);
        assert_eq!(pipeline.next_outbound(Some(slot.id)), Some(1));
        pipeline.retired.push(slot);
        assert!(matches!(pipeline.locate("c"), Some(Location::Retired(0))));
    }
}
