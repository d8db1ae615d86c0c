//! TCP transport driven by reactor readiness.
//!
//! Inbound bytes are read only while there is demand, so a consumer that
//! stops reading leaves data in the kernel and the peer is throttled by TCP
//! flow control. Outbound [`Bytes`] are queued until flushed and drained as
//! the socket accepts them; writability follows the configured
//! [`WriteBufferWaterMark`](crate::config::WriteBufferWaterMark).

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
};

use bytes::{Buf, Bytes};
use mio::{event::Source, net::TcpStream};
use tracing::{debug, trace};

use super::{CloseMode, Message, Transport, TransportEvent};
use crate::{
    config::SocketConfig,
    error::ChannelError,
    reactor::{Interest, Readiness},
};

/// Non-blocking TCP transport carrying [`Bytes`] in both directions.
#[derive(Debug)]
pub struct SocketTransport {
    stream: TcpStream,
    config: SocketConfig,
    /// Written but not yet flushed.
    queued: VecDeque<Bytes>,
    /// Flushed and waiting for socket capacity.
    flushing: VecDeque<Bytes>,
    buffered: usize,
    writable: bool,
    wants_read: bool,
    read_closed: bool,
    write_closed: bool,
    shutdown_pending: bool,
    failed: Option<ChannelError>,
    events: Vec<TransportEvent>,
}

impl SocketTransport {
    /// Wrap a connected non-blocking stream.
    #[must_use]
    pub fn new(stream: TcpStream, config: SocketConfig) -> Self {
        Self {
            stream,
            config,
            queued: VecDeque::new(),
            flushing: VecDeque::new(),
            buffered: 0,
            writable: true,
            wants_read: false,
            read_closed: false,
            write_closed: false,
            shutdown_pending: false,
            failed: None,
            events: Vec::new(),
        }
    }

    /// Wrap a connected standard library stream, switching it to
    /// non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be made non-blocking.
    pub fn from_std(stream: std::net::TcpStream, config: SocketConfig) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(TcpStream::from_std(stream), config))
    }

    /// Address of the remote peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is no longer connected.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> { self.stream.peer_addr() }

    /// Bytes accepted but not yet handed to the kernel.
    #[must_use]
    pub fn buffered(&self) -> usize { self.buffered }

    fn fail(&mut self, error: io::Error) -> ChannelError {
        if let Some(existing) = &self.failed {
            return existing.clone();
        }
        debug!(%error, "socket failed");
        let error = ChannelError::io(error);
        self.failed = Some(error.clone());
        self.queued.clear();
        self.flushing.clear();
        self.buffered = 0;
        self.wants_read = false;
        self.read_closed = true;
        self.write_closed = true;
        self.events.push(TransportEvent::Error(error.clone()));
        self.events.push(TransportEvent::Closed);
        error
    }

    fn update_writability(&mut self) {
        let mark = self.config.water_mark;
        if self.writable && self.buffered > mark.high() {
            self.writable = false;
        } else if !self.writable && self.buffered < mark.low() {
            self.writable = true;
        }
    }

    /// Read until the socket would block. With `force` the read ignores
    /// demand; used to collect what is left once the peer hung up.
    fn read_available(&mut self, force: bool) {
        while (self.wants_read || force) && !self.read_closed && self.failed.is_none() {
            let mut buf = vec![0; self.config.read_chunk];
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    trace!("socket input closed by peer");
                    self.read_closed = true;
                    self.wants_read = false;
                    self.events.push(TransportEvent::InputClosed);
                }
                Ok(n) => {
                    buf.truncate(n);
                    self.events
                        .push(TransportEvent::Read(Box::new(Bytes::from(buf))));
                    if !force {
                        self.wants_read = false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.fail(e);
                }
            }
        }
    }

    fn write_available(&mut self) -> Result<(), ChannelError> {
        if let Some(error) = &self.failed {
            return Err(error.clone());
        }
        while let Some(front) = self.flushing.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return Err(self.fail(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    self.buffered -= n;
                    front.advance(n);
                    if front.is_empty() {
                        self.flushing.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
        if self.flushing.is_empty() && self.shutdown_pending {
            self.shutdown_pending = false;
            self.shutdown(Shutdown::Write);
        }
        self.update_writability();
        Ok(())
    }

    fn shutdown(&mut self, how: Shutdown) {
        match self.stream.shutdown(how) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => debug!(error = %e, ?how, "socket shutdown failed"),
        }
    }
}

impl Transport for SocketTransport {
    fn write(&mut self, message: Message) -> Result<(), ChannelError> {
        let bytes = message
            .downcast::<Bytes>()
            .map_err(|_| ChannelError::unexpected_message("Bytes"))?;
        if let Some(error) = &self.failed {
            return Err(error.clone());
        }
        if self.write_closed {
            return Err(ChannelError::closed());
        }
        self.buffered += bytes.len();
        self.queued.push_back(*bytes);
        self.update_writability();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ChannelError> {
        self.flushing.extend(self.queued.drain(..));
        self.write_available()
    }

    fn close(&mut self, mode: CloseMode) -> Result<(), ChannelError> {
        match mode {
            CloseMode::Input => {
                self.wants_read = false;
                self.read_closed = true;
                self.shutdown(Shutdown::Read);
            }
            CloseMode::Output => {
                self.write_closed = true;
                self.flushing.extend(self.queued.drain(..));
                if self.flushing.is_empty() {
                    self.shutdown(Shutdown::Write);
                } else {
                    self.shutdown_pending = true;
                    self.write_available()?;
                }
            }
            CloseMode::All => {
                self.wants_read = false;
                self.read_closed = true;
                self.write_closed = true;
                self.queued.clear();
                self.flushing.clear();
                self.buffered = 0;
                self.shutdown(Shutdown::Both);
            }
        }
        Ok(())
    }

    fn is_writable(&self) -> bool { self.writable }

    fn read(&mut self) {
        if self.read_closed {
            return;
        }
        self.wants_read = true;
        self.read_available(false);
    }

    fn drain_events(&mut self, events: &mut Vec<TransportEvent>) { events.append(&mut self.events); }

    fn interest(&self) -> Option<Interest> {
        if self.failed.is_some() {
            return None;
        }
        let mut interest = Interest::RESET;
        if self.wants_read && !self.read_closed {
            interest = interest | Interest::READ;
        }
        if !self.flushing.is_empty() {
            interest = interest | Interest::WRITE;
        }
        Some(interest)
    }

    fn source(&mut self) -> Option<&mut dyn Source> { Some(&mut self.stream) }

    fn on_ready(&mut self, readiness: Readiness) {
        match readiness {
            Readiness::Read => self.read_available(false),
            Readiness::Write => {
                // Failures are queued as events.
                let _ = self.write_available();
            }
            Readiness::Reset => match self.stream.take_error() {
                Ok(Some(error)) | Err(error) => {
                    self.fail(error);
                }
                Ok(None) => {
                    self.read_available(true);
                    if self.failed.is_none() {
                        trace!("socket hung up");
                        self.read_closed = true;
                        self.write_closed = true;
                        self.events.push(TransportEvent::Closed);
                    }
                }
            },
        }
    }
}
