//! Event loop thread owning a reactor and the channels registered with it.
//!
//! Every [`Channel`] lives on exactly one loop and is only touched from that
//! loop's thread. Work from other threads arrives as tasks through an
//! [`EventLoopHandle`]; the loop runs them in submission order, dispatches
//! resumed readiness waiters and then blocks in the reactor until the next
//! readiness event or wake-up.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        OnceLock,
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use log::{error, info};
use mio::Waker;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    channel::{
        Channel,
        ChannelHandle,
        ChannelId,
        CloseMode,
        Promise,
        Transport,
        embedded::{EmbeddedChannel, EmbeddedTransport},
        socket::SocketTransport,
    },
    config::{EventLoopConfig, SocketConfig},
    error::{BridgeError, ChannelError, Result},
    metrics,
    panic,
    reactor::{Interest, Reactor, ReactorError, Readiness, Registration},
};

type Task = Box<dyn FnOnce(&mut LoopContext) + Send>;

struct Shared {
    tasks: mpsc::UnboundedSender<Task>,
    waker: OnceLock<Waker>,
    thread_id: OnceLock<ThreadId>,
    closed: AtomicBool,
}

impl Shared {
    fn wake(&self) {
        let Some(waker) = self.waker.get() else {
            return;
        };
        if let Err(e) = waker.wake() {
            warn!(error = %e, "failed to wake event loop");
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake();
    }
}

/// Cloneable, thread-safe handle for submitting work to an event loop.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<Shared>,
}

impl EventLoopHandle {
    /// Queue `f` to run on the loop thread.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::EventLoopClosed`] if the loop has stopped.
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut LoopContext) + Send + 'static,
    {
        if self.is_closed() {
            return Err(BridgeError::EventLoopClosed);
        }
        self.shared
            .tasks
            .send(Box::new(f))
            .map_err(|_| BridgeError::EventLoopClosed)?;
        self.shared.wake();
        Ok(())
    }

    /// Run `f` on the loop thread and wait for its result.
    ///
    /// Must not be awaited from the loop thread itself.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::EventLoopClosed`] if the loop stops before `f`
    /// completes or if `f` panics.
    pub async fn submit<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut LoopContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move |cx| {
            let _ = tx.send(f(cx));
        })?;
        rx.await.map_err(|_| BridgeError::EventLoopClosed)
    }

    /// Returns `true` when called from the loop thread.
    #[must_use]
    pub fn in_event_loop(&self) -> bool {
        self.shared.thread_id.get() == Some(&thread::current().id())
    }

    /// Returns `true` once the loop has been asked to stop.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.shared.closed.load(Ordering::Acquire) }

    /// Create a channel over an in-memory transport.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::EventLoopClosed`] if the loop has stopped.
    pub async fn embedded_channel(&self) -> Result<EmbeddedChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self
            .submit(move |cx| cx.attach(EmbeddedTransport::with_outbound(tx)))
            .await?;
        Ok(EmbeddedChannel::new(handle, rx))
    }

    /// Move a connected TCP stream onto the loop.
    ///
    /// # Errors
    ///
    /// Fails if the stream cannot be made non-blocking or the loop has
    /// stopped.
    pub async fn register_stream(
        &self,
        stream: std::net::TcpStream,
        config: SocketConfig,
    ) -> Result<ChannelHandle> {
        let transport = SocketTransport::from_std(stream, config).map_err(ChannelError::io)?;
        self.submit(move |cx| cx.attach(transport)).await
    }
}

impl fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopHandle")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// An event loop running on its own thread.
///
/// Dropping the loop stops it: open channels are closed, tasks still queued
/// run against the closed channels and the thread is joined.
///
/// ```no_run
/// use wirebridge::event_loop::EventLoop;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let event_loop = EventLoop::new()?;
/// let answer = event_loop.handle().submit(|_| 42).await?;
/// assert_eq!(answer, 42);
/// event_loop.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct EventLoop {
    handle: EventLoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Start a loop with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Io`] if the reactor or thread cannot be
    /// created.
    pub fn new() -> std::result::Result<Self, ReactorError> {
        Self::with_config(EventLoopConfig::default())
    }

    /// Start a loop with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Io`] if the reactor or thread cannot be
    /// created.
    pub fn with_config(config: EventLoopConfig) -> std::result::Result<Self, ReactorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            tasks: tx,
            waker: OnceLock::new(),
            thread_id: OnceLock::new(),
            closed: AtomicBool::new(false),
        });
        let handle = EventLoopHandle {
            shared: Arc::clone(&shared),
        };
        let loop_handle = handle.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let capacity = config.events_capacity;
        let thread = thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || {
                let reactor = match start_reactor(capacity, &loop_handle.shared) {
                    Ok(reactor) => reactor,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run(reactor, rx, loop_handle);
            })?;

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(ReactorError::Cancelled));
        if let Err(e) = started {
            shared.closed.store(true, Ordering::Release);
            let _ = thread.join();
            return Err(e);
        }
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Handle for submitting work to this loop.
    #[must_use]
    pub fn handle(&self) -> &EventLoopHandle { &self.handle }

    /// Stop the loop and wait for its thread to exit.
    pub fn shutdown(mut self) { self.stop(); }

    fn stop(&mut self) {
        self.handle.shared.close();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!("event loop thread panicked");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) { self.stop(); }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

fn start_reactor(
    capacity: usize,
    shared: &Shared,
) -> std::result::Result<Reactor<LoopContext>, ReactorError> {
    let reactor = Reactor::new(capacity)?;
    let waker = reactor.waker()?;
    let _ = shared.waker.set(waker);
    let _ = shared.thread_id.set(thread::current().id());
    Ok(reactor)
}

fn run(
    reactor: Reactor<LoopContext>,
    mut tasks: mpsc::UnboundedReceiver<Task>,
    handle: EventLoopHandle,
) {
    let shared = Arc::clone(&handle.shared);
    let mut cx = LoopContext {
        reactor,
        channels: HashMap::new(),
        next_id: 0,
        handle,
    };
    info!("event loop started: thread={:?}", thread::current().name());

    loop {
        while let Ok(task) = tasks.try_recv() {
            panic::contain("event loop task", || task(&mut cx));
        }
        for (waiter, outcome) in cx.reactor.take_resumed() {
            panic::contain("readiness waiter", || waiter(&mut cx, outcome));
        }
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        let timeout = cx.reactor.has_resumed().then_some(Duration::ZERO);
        if let Err(e) = cx.reactor.run_until_ready(timeout) {
            error!("event loop stopping after reactor failure: error={e}");
            shared.closed.store(true, Ordering::Release);
            break;
        }
    }

    cx.close_all();
    tasks.close();
    while let Ok(task) = tasks.try_recv() {
        panic::contain("event loop task", || task(&mut cx));
    }
    cx.reap_all();
    info!("event loop stopped: thread={:?}", thread::current().name());
}

/// Loop-thread state handed to every task.
pub struct LoopContext {
    reactor: Reactor<LoopContext>,
    channels: HashMap<ChannelId, Channel>,
    next_id: u64,
    handle: EventLoopHandle,
}

impl LoopContext {
    /// Handle of the running loop.
    #[must_use]
    pub fn event_loop(&self) -> &EventLoopHandle { &self.handle }

    /// Number of channels owned by the loop.
    #[must_use]
    pub fn channel_count(&self) -> usize { self.channels.len() }

    /// Take ownership of `transport` as a new channel and return the first
    /// handle to it.
    pub fn attach(&mut self, transport: impl Transport) -> ChannelHandle {
        let id = ChannelId::new(self.next_id);
        self.next_id += 1;
        let mut channel = Channel::new(id, transport);
        channel.handles = 1;
        self.channels.insert(id, channel);
        metrics::inc_channels();
        info!("channel attached: id={id}");
        self.settle(id);
        ChannelHandle::new(id, self.handle.clone())
    }

    /// Create another handle to a channel owned by this loop.
    pub fn channel_handle(&mut self, id: ChannelId) -> Option<ChannelHandle> {
        let channel = self.channels.get_mut(&id)?;
        channel.handles += 1;
        Some(ChannelHandle::new(id, self.handle.clone()))
    }

    /// Run `f` against channel `id`, then bring its reactor registration up
    /// to date. Returns `None` if the channel does not exist.
    pub fn with_channel<R>(
        &mut self,
        id: ChannelId,
        f: impl FnOnce(&mut Channel) -> R,
    ) -> Option<R> {
        let channel = self.channels.get_mut(&id)?;
        let out = f(channel);
        self.settle(id);
        Some(out)
    }

    pub(crate) fn release_handle(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.handles = channel.handles.saturating_sub(1);
        if channel.handles == 0 && channel.is_active() {
            debug!(channel = %id, "last handle dropped; closing channel");
            channel.close(CloseMode::All, Promise::none());
        }
        self.settle(id);
    }

    fn on_ready(&mut self, id: ChannelId, outcome: std::result::Result<Readiness, ReactorError>) {
        match outcome {
            Ok(readiness) => {
                self.with_channel(id, |channel| channel.on_transport_ready(readiness));
            }
            Err(ReactorError::Cancelled) => {}
            Err(e) => warn!(channel = %id, error = %e, "readiness wait failed"),
        }
    }

    /// Reap a finished channel or sync its reactor registration with the
    /// interest its transport currently reports.
    fn settle(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if channel.is_reapable() {
            self.reap(id);
            return;
        }

        let token = id.token();
        let desired = channel.transport_interest();
        let result = match (channel.registered, desired) {
            (None, None) => Ok(()),
            (Some(_), None) => {
                channel.registered = None;
                match channel.transport_source() {
                    Some(source) => self.reactor.deregister(source, token),
                    None => Ok(()),
                }
            }
            (current, Some(interest)) if current != Some(interest) => {
                match channel.transport_source() {
                    Some(source) => {
                        let outcome = if current.is_some() {
                            self.reactor
                                .reregister(source, token, interest, |i, _| registration(id, i))
                        } else {
                            self.reactor
                                .register(source, token, interest, |i, _| registration(id, i))
                        };
                        if outcome.is_ok() {
                            channel.registered = Some(interest);
                        }
                        outcome
                    }
                    None => Ok(()),
                }
            }
            (_, Some(interest)) => {
                let mut outcome = Ok(());
                for kind in interest.kinds() {
                    if self.reactor.has_waiter(token, kind) {
                        continue;
                    }
                    outcome = self
                        .reactor
                        .await_readiness(token, kind, Box::new(waiter(id)));
                    if outcome.is_err() {
                        break;
                    }
                }
                outcome
            }
        };

        if let Err(e) = result {
            warn!(channel = %id, error = %e, "reactor registration failed");
            channel.registered = None;
            channel.fire_error_caught(ChannelError::new(e));
            channel.close(CloseMode::All, Promise::none());
        }
    }

    fn reap(&mut self, id: ChannelId) {
        let Some(mut channel) = self.channels.remove(&id) else {
            return;
        };
        if channel.registered.take().is_some() {
            if let Some(source) = channel.transport_source() {
                if let Err(e) = self.reactor.deregister(source, id.token()) {
                    debug!(channel = %id, error = %e, "deregistration failed");
                }
            }
        }
        metrics::dec_channels();
        info!("channel closed: id={id}");
    }

    fn close_all(&mut self) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.with_channel(id, |channel| channel.close(CloseMode::All, Promise::none()));
        }
    }

    /// Drop every remaining channel, regardless of outstanding handles.
    fn reap_all(&mut self) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.reap(id);
        }
    }
}

impl fmt::Debug for LoopContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopContext")
            .field("channels", &self.channels.len())
            .field("registered", &self.reactor.len())
            .finish_non_exhaustive()
    }
}

fn waiter(
    id: ChannelId,
) -> impl FnOnce(&mut LoopContext, std::result::Result<Readiness, ReactorError>) + 'static {
    move |cx, outcome| cx.on_ready(id, outcome)
}

fn registration(id: ChannelId, interest: Interest) -> Registration<LoopContext> {
    interest
        .kinds()
        .fold(Registration::new(interest), |registration, kind| {
            registration.with_waiter(kind, waiter(id))
        })
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn event_loop() -> EventLoop { EventLoop::new().expect("start event loop") }

    #[rstest]
    #[tokio::test]
    async fn submit_returns_the_task_result(event_loop: EventLoop) {
        let handle = event_loop.handle().clone();
        let on_loop = handle
            .submit(|cx| cx.event_loop().in_event_loop())
            .await
            .expect("submit");
        assert!(on_loop);
        assert!(!handle.in_event_loop());
    }

    #[rstest]
    #[tokio::test]
    async fn tasks_run_in_submission_order(event_loop: EventLoop) {
        let handle = event_loop.handle();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..16 {
            let seen = Arc::clone(&seen);
            handle
                .execute(move |_| seen.lock().expect("lock").push(i))
                .expect("execute");
        }
        handle.submit(|_| ()).await.expect("barrier");
        assert_eq!(*seen.lock().expect("lock"), (0..16).collect::<Vec<_>>());
    }

    #[rstest]
    #[tokio::test]
    async fn panicking_tasks_do_not_stop_the_loop(event_loop: EventLoop) {
        let handle = event_loop.handle();
        let err = handle
            .submit(|_| -> u8 { panic!("boom") })
            .await
            .expect_err("task panicked");
        assert!(matches!(err, BridgeError::EventLoopClosed));
        assert_eq!(handle.submit(|_| 7).await.expect("loop alive"), 7);
    }

    #[rstest]
    #[tokio::test]
    async fn closed_loop_rejects_work(event_loop: EventLoop) {
        let handle = event_loop.handle().clone();
        event_loop.shutdown();
        assert!(handle.is_closed());
        assert!(matches!(handle.execute(|_| ()), Err(BridgeError::EventLoopClosed)));
        assert!(matches!(
            handle.submit(|_| ()).await,
            Err(BridgeError::EventLoopClosed)
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn dropping_the_last_handle_reaps_the_channel(event_loop: EventLoop) {
        let handle = event_loop.handle();
        let channel = handle.embedded_channel().await.expect("channel");
        assert_eq!(handle.submit(|cx| cx.channel_count()).await.expect("count"), 1);

        drop(channel);
        assert_eq!(handle.submit(|cx| cx.channel_count()).await.expect("count"), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn shutdown_stops_channel_operations(event_loop: EventLoop) {
        let channel = event_loop
            .handle()
            .embedded_channel()
            .await
            .expect("channel");
        assert!(channel.handle().is_active().await.expect("loop running"));

        event_loop.shutdown();
        assert!(matches!(
            channel.handle().is_active().await,
            Err(BridgeError::EventLoopClosed)
        ));
    }
}
