//! Configuration for event loops and socket transports.
//!
//! Values are assembled with builders in the style of the push queue
//! configuration: defaults are usable as-is and `build` validates the result.

use static_assertions::const_assert;
use thiserror::Error;

/// Default number of readiness events collected per poll.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
/// Default name given to the event-loop thread.
pub const DEFAULT_THREAD_NAME: &str = "wirebridge-event-loop";
/// Default low water mark, in bytes, for socket write buffers.
pub const DEFAULT_LOW_WATER_MARK: usize = 32 * 1024;
/// Default high water mark, in bytes, for socket write buffers.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;
/// Default size of a single socket read.
pub const DEFAULT_READ_CHUNK: usize = 8 * 1024;

const_assert!(DEFAULT_LOW_WATER_MARK <= DEFAULT_HIGH_WATER_MARK);
const_assert!(DEFAULT_HIGH_WATER_MARK > 0);

/// Errors returned when validating configuration.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The events capacity was zero.
    #[error("events capacity must be at least 1")]
    InvalidEventsCapacity,
    /// The water marks were inconsistent.
    #[error("invalid water mark; low={low}, high={high}; require 0 < high and low <= high")]
    InvalidWaterMark {
        /// Configured low water mark.
        low: usize,
        /// Configured high water mark.
        high: usize,
    },
    /// The read chunk size was zero.
    #[error("read chunk size must be at least 1")]
    InvalidReadChunk,
}

/// Settings for an [`EventLoop`](crate::event_loop::EventLoop).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventLoopConfig {
    /// Maximum readiness events handled per reactor turn.
    pub events_capacity: usize,
    /// Name of the spawned loop thread.
    pub thread_name: String,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl EventLoopConfig {
    /// Start building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> EventLoopConfigBuilder { EventLoopConfigBuilder::default() }
}

/// Builder for [`EventLoopConfig`].
///
/// ```
/// use wirebridge::config::EventLoopConfig;
///
/// let config = EventLoopConfig::builder()
///     .events_capacity(64)
///     .thread_name("io-0")
///     .build()
///     .expect("valid configuration");
/// assert_eq!(config.thread_name, "io-0");
/// ```
#[derive(Debug, Default)]
pub struct EventLoopConfigBuilder {
    config: EventLoopConfig,
}

impl EventLoopConfigBuilder {
    /// Set how many readiness events are handled per reactor turn.
    #[must_use]
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    /// Set the loop thread name.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEventsCapacity`] if the capacity is zero.
    pub fn build(self) -> Result<EventLoopConfig, ConfigError> {
        if self.config.events_capacity == 0 {
            return Err(ConfigError::InvalidEventsCapacity);
        }
        Ok(self.config)
    }
}

/// Byte thresholds governing socket writability.
///
/// A socket becomes unwritable once more than `high` bytes are queued and
/// writable again when the queue drains below `low`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteBufferWaterMark {
    low: usize,
    high: usize,
}

impl WriteBufferWaterMark {
    /// Create a water mark.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidWaterMark`] unless `0 < high` and
    /// `low <= high`.
    pub fn new(low: usize, high: usize) -> Result<Self, ConfigError> {
        if high == 0 || low > high {
            return Err(ConfigError::InvalidWaterMark { low, high });
        }
        Ok(Self { low, high })
    }

    /// Low threshold in bytes.
    #[must_use]
    pub fn low(&self) -> usize { self.low }

    /// High threshold in bytes.
    #[must_use]
    pub fn high(&self) -> usize { self.high }
}

impl Default for WriteBufferWaterMark {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_WATER_MARK,
            high: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Settings for a [`SocketTransport`](crate::channel::socket::SocketTransport).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketConfig {
    /// Writability thresholds.
    pub water_mark: WriteBufferWaterMark,
    /// Bytes requested per `read` call.
    pub read_chunk: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            water_mark: WriteBufferWaterMark::default(),
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl SocketConfig {
    /// Replace the water mark.
    #[must_use]
    pub fn with_water_mark(mut self, water_mark: WriteBufferWaterMark) -> Self {
        self.water_mark = water_mark;
        self
    }

    /// Replace the read chunk size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidReadChunk`] if `size` is zero.
    pub fn with_read_chunk(mut self, size: usize) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::InvalidReadChunk);
        }
        self.read_chunk = size;
        Ok(self)
    }
}
