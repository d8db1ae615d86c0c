//! Half-close bookkeeping for bridged channels.

use tracing::trace;

use crate::channel::{ChannelEvent, ChannelHandler, CloseMode, HandlerContext, Promise};

/// Which directions of a channel have been closed.
///
/// Transitions only move forward: a closed direction never reopens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HalfCloseState {
    /// Both directions open.
    #[default]
    BothOpen,
    /// Input closed, output open.
    ReadClosed,
    /// Output closed, input open.
    WriteClosed,
    /// Both directions closed.
    BothClosed,
}

impl HalfCloseState {
    /// State after closing `mode`, and the close to forward (if any).
    #[must_use]
    pub fn close(self, mode: CloseMode) -> (Self, Option<CloseMode>) {
        use HalfCloseState::{BothClosed, BothOpen, ReadClosed, WriteClosed};
        match (self, mode) {
            (BothClosed, _)
            | (ReadClosed, CloseMode::Input)
            | (WriteClosed, CloseMode::Output) => (self, None),
            (_, CloseMode::All) => (BothClosed, Some(CloseMode::All)),
            (BothOpen, CloseMode::Input) => (ReadClosed, Some(CloseMode::Input)),
            (BothOpen, CloseMode::Output) => (WriteClosed, Some(CloseMode::Output)),
            (WriteClosed, CloseMode::Input) | (ReadClosed, CloseMode::Output) => {
                (BothClosed, Some(CloseMode::All))
            }
        }
    }

    /// State after the peer closed its sending side, and the close to
    /// forward (if any).
    ///
    /// Output already closed means both directions are now done, so the
    /// channel is closed outright.
    #[must_use]
    pub fn input_closed(self) -> (Self, Option<CloseMode>) {
        match self {
            HalfCloseState::BothOpen => (HalfCloseState::ReadClosed, None),
            HalfCloseState::WriteClosed => (HalfCloseState::BothClosed, Some(CloseMode::All)),
            other => (other, None),
        }
    }
}

/// Intercepts close requests so each direction closes at most once.
///
/// Once both directions are closed, the second close is escalated to
/// [`CloseMode::All`] and the channel goes inactive. [`HalfCloseState::BothClosed`]
/// is only entered by forwarding an `All`, so later closes have nothing
/// left to do.
#[derive(Debug, Default)]
pub struct CloseSplitter {
    state: HalfCloseState,
}

impl CloseSplitter {
    /// Create a splitter with both directions open.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Current half-close state.
    #[must_use]
    pub fn state(&self) -> HalfCloseState { self.state }
}

impl ChannelHandler for CloseSplitter {
    fn user_event(&mut self, ctx: &mut HandlerContext<'_>, event: ChannelEvent) {
        let escalate = if event == ChannelEvent::InputClosed {
            let (next, forward) = self.state.input_closed();
            self.state = next;
            forward
        } else {
            None
        };
        ctx.fire_user_event(event);
        if let Some(mode) = escalate {
            trace!(channel = %ctx.channel_id(), "peer closed input after output; closing channel");
            ctx.close(mode, Promise::none());
        }
    }

    fn close(&mut self, ctx: &mut HandlerContext<'_>, mode: CloseMode, promise: Promise) {
        let (next, forward) = self.state.close(mode);
        trace!(channel = %ctx.channel_id(), ?mode, from = ?self.state, to = ?next, "close requested");
        self.state = next;
        match forward {
            Some(mode) => ctx.close(mode, promise),
            None => promise.succeed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::channel::{Channel, ChannelId, TransportEvent, embedded::EmbeddedTransport};

    #[rstest]
    #[case(HalfCloseState::BothOpen, CloseMode::Input, HalfCloseState::ReadClosed, Some(CloseMode::Input))]
    #[case(HalfCloseState::BothOpen, CloseMode::Output, HalfCloseState::WriteClosed, Some(CloseMode::Output))]
    #[case(HalfCloseState::BothOpen, CloseMode::All, HalfCloseState::BothClosed, Some(CloseMode::All))]
    #[case(HalfCloseState::ReadClosed, CloseMode::Input, HalfCloseState::ReadClosed, None)]
    #[case(HalfCloseState::ReadClosed, CloseMode::Output, HalfCloseState::BothClosed, Some(CloseMode::All))]
    #[case(HalfCloseState::WriteClosed, CloseMode::Input, HalfCloseState::BothClosed, Some(CloseMode::All))]
    #[case(HalfCloseState::WriteClosed, CloseMode::Output, HalfCloseState::WriteClosed, None)]
    #[case(HalfCloseState::WriteClosed, CloseMode::All, HalfCloseState::BothClosed, Some(CloseMode::All))]
    #[case(HalfCloseState::BothClosed, CloseMode::All, HalfCloseState::BothClosed, None)]
    fn close_transitions(
        #[case] from: HalfCloseState,
        #[case] mode: CloseMode,
        #[case] to: HalfCloseState,
        #[case] forwarded: Option<CloseMode>,
    ) {
        assert_eq!(from.close(mode), (to, forwarded));
    }

    #[rstest]
    #[case(HalfCloseState::BothOpen, HalfCloseState::ReadClosed, None)]
    #[case(HalfCloseState::ReadClosed, HalfCloseState::ReadClosed, None)]
    #[case(HalfCloseState::WriteClosed, HalfCloseState::BothClosed, Some(CloseMode::All))]
    #[case(HalfCloseState::BothClosed, HalfCloseState::BothClosed, None)]
    fn peer_input_close_transitions(
        #[case] from: HalfCloseState,
        #[case] to: HalfCloseState,
        #[case] forwarded: Option<CloseMode>,
    ) {
        assert_eq!(from.input_closed(), (to, forwarded));
    }

    #[test]
    fn peer_eof_after_output_close_closes_the_channel() {
        let mut channel = Channel::new(ChannelId::new(0), EmbeddedTransport::new());
        channel
            .add_handler("splitter", CloseSplitter::new())
            .expect("add splitter");
        channel.close(CloseMode::Output, Promise::none());
        channel
            .transport_mut::<EmbeddedTransport>()
            .expect("embedded transport")
            .push_event(TransportEvent::InputClosed);
        channel.poll_transport();

        assert!(!channel.is_active());
        assert_eq!(
            channel
                .transport_mut::<EmbeddedTransport>()
                .expect("embedded transport")
                .closes(),
            [CloseMode::Output, CloseMode::All]
        );
    }
}
