#![doc(html_root_url = "https://docs.rs/wirebridge/latest")]
//! Public API for the `wirebridge` library.
//!
//! This crate bridges callback-driven channels running on a dedicated event
//! loop thread to sequential async code: inbound messages become a
//! pull-based stream and writes suspend until the channel can take them.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod metrics;
pub mod panic;
pub mod reactor;

pub use bridge::{AsyncChannel, InboundStream, OutboundWriter};
pub use channel::{ChannelHandle, ChannelId, CloseMode};
pub use config::{ConfigError, EventLoopConfig, SocketConfig, WriteBufferWaterMark};
/// Result type alias used across the async bridge API.
pub use error::Result;
pub use error::{BridgeError, ChannelError, ChannelErrorKind};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use metrics::{CHANNELS_ACTIVE, Direction, ERRORS_TOTAL, INBOUND_DROPPED, MESSAGES_PROCESSED};
