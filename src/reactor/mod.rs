//! Readiness multiplexing over a single `mio::Poll`.
//!
//! The [`Reactor`] owns one OS-level multiplexer. Resources are registered
//! under a caller-chosen [`Token`] with an [`Interest`] set and a
//! [`Registration`] record holding the waiters to resume. Each call to
//! [`Reactor::run_until_ready`] blocks on the multiplexer and, for every
//! signalled resource, removes the waiter for each observed [`Readiness`]
//! from the [`ContinuationRegistry`] and queues it for resumption. Queued
//! waiters run exactly once, either through [`Reactor::resume`] or after
//! being handed out by [`Reactor::take_resumed`].
//!
//! `mio` is edge-triggered: readiness observed while no waiter is present is
//! remembered and resumes the next waiter for that kind immediately.

pub mod registry;

use std::{collections::HashMap, fmt, io, time::Duration};

pub use mio::Token;
use mio::{Events, Poll, Waker, event::Source};
pub use registry::{ContinuationRegistry, Occupied};
use thiserror::Error;
use tracing::{error, trace};

/// Token reserved for the loop waker.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Kind of readiness signalled for a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Readiness {
    /// The resource can be read without blocking.
    Read,
    /// The resource can accept writes without blocking.
    Write,
    /// The resource reported an error or was reset by the peer.
    Reset,
}

impl Readiness {
    const ALL: [Readiness; 3] = [Readiness::Read, Readiness::Write, Readiness::Reset];

    fn bit(self) -> u8 {
        match self {
            Readiness::Read => Interest::READ.0,
            Readiness::Write => Interest::WRITE.0,
            Readiness::Reset => Interest::RESET.0,
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Readiness::Read => "read",
            Readiness::Write => "write",
            Readiness::Reset => "reset",
        })
    }
}

/// Set of readiness kinds a resource is interested in.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    /// Interest in read readiness.
    pub const READ: Interest = Interest(0b001);
    /// Interest in write readiness.
    pub const WRITE: Interest = Interest(0b010);
    /// Interest in errors and resets. Always reported by the OS.
    pub const RESET: Interest = Interest(0b100);

    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self { Interest(0) }

    /// Union of `self` and `other`.
    #[must_use]
    pub const fn add(self, other: Interest) -> Self { Interest(self.0 | other.0) }

    /// `self` without the kinds in `other`.
    #[must_use]
    pub const fn remove(self, other: Interest) -> Self { Interest(self.0 & !other.0) }

    /// Returns `true` if every kind in `other` is present.
    #[must_use]
    pub const fn contains(self, other: Interest) -> bool { self.0 & other.0 == other.0 }

    /// Returns `true` if `kind` is part of the set.
    #[must_use]
    pub fn has(self, kind: Readiness) -> bool { self.0 & kind.bit() != 0 }

    /// Returns `true` when no kind is present.
    #[must_use]
    pub const fn is_empty(self) -> bool { self.0 == 0 }

    /// Iterate the readiness kinds in the set.
    pub fn kinds(self) -> impl Iterator<Item = Readiness> {
        Readiness::ALL.into_iter().filter(move |kind| self.has(*kind))
    }

    /// Map onto a `mio` interest. Errors are always reported by `mio`, so a
    /// reset-only set registers for readability.
    fn to_mio(self) -> mio::Interest {
        match (self.contains(Interest::READ), self.contains(Interest::WRITE)) {
            (true, true) => mio::Interest::READABLE.add(mio::Interest::WRITABLE),
            (false, true) => mio::Interest::WRITABLE,
            _ => mio::Interest::READABLE,
        }
    }
}

impl From<Readiness> for Interest {
    fn from(kind: Readiness) -> Self { Interest(kind.bit()) }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest { self.add(rhs) }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kinds()).finish()
    }
}

/// Errors raised by the [`Reactor`].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The token is already registered (or is the reserved waker token).
    #[error("resource {0:?} is already registered")]
    DuplicateRegistration(Token),
    /// A second waiter was registered for the same resource and readiness.
    #[error("resource {token:?} already has a pending {readiness} waiter")]
    DuplicateWaiter {
        /// Resource the waiter targeted.
        token: Token,
        /// Readiness kind that was already awaited.
        readiness: Readiness,
    },
    /// The token is not registered with this reactor.
    #[error("resource {0:?} is not registered")]
    NotRegistered(Token),
    /// The waiter was resolved because its resource was torn down.
    #[error("operation cancelled")]
    Cancelled,
    /// The OS multiplexer failed. The reactor cannot make progress.
    #[error("reactor I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Continuation resumed with the observed readiness, or an error such as
/// [`ReactorError::Cancelled`]. `C` is the context the resumer provides.
pub type Waiter<C> = Box<dyn FnOnce(&mut C, Result<Readiness, ReactorError>)>;

/// Record produced by the `make_registration` factory passed to
/// [`Reactor::register`] and [`Reactor::reregister`].
pub struct Registration<C> {
    interest: Interest,
    waiters: Vec<(Readiness, Waiter<C>)>,
}

impl<C> Registration<C> {
    /// Create a registration without waiters.
    #[must_use]
    pub fn new(interest: Interest) -> Self {
        Self {
            interest,
            waiters: Vec::new(),
        }
    }

    /// Attach a waiter for `kind`.
    #[must_use]
    pub fn with_waiter(
        mut self,
        kind: Readiness,
        waiter: impl FnOnce(&mut C, Result<Readiness, ReactorError>) + 'static,
    ) -> Self {
        self.waiters.push((kind, Box::new(waiter)));
        self
    }

    /// Interest set this registration was created for.
    #[must_use]
    pub fn interest(&self) -> Interest { self.interest }
}

struct SourceState {
    interest: Interest,
    /// Readiness observed without a waiter to receive it.
    unclaimed: Interest,
}

type Resumption<C> = (Waiter<C>, Result<Readiness, ReactorError>);

/// Single-threaded readiness multiplexer.
pub struct Reactor<C> {
    poll: Poll,
    events: Events,
    sources: HashMap<Token, SourceState>,
    continuations: ContinuationRegistry<(Token, Readiness), Waiter<C>>,
    resumed: Vec<Resumption<C>>,
}

impl<C> Reactor<C> {
    /// Create a reactor able to report up to `events_capacity` events per
    /// poll.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Io`] if the OS multiplexer cannot be created.
    pub fn new(events_capacity: usize) -> Result<Self, ReactorError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity.max(1)),
            sources: HashMap::new(),
            continuations: ContinuationRegistry::new(),
            resumed: Vec::new(),
        })
    }

    /// Create a waker that interrupts [`Reactor::run_until_ready`] from any
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Io`] if the waker cannot be registered.
    pub fn waker(&self) -> Result<Waker, ReactorError> {
        Ok(Waker::new(self.poll.registry(), WAKE_TOKEN)?)
    }

    /// Register `source` under `token`.
    ///
    /// `make_registration` receives the interest set and token and returns the
    /// record holding the waiters to install.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::DuplicateRegistration`] if `token` is already
    /// registered, [`ReactorError::DuplicateWaiter`] if the registration holds
    /// two waiters for one kind, or [`ReactorError::Io`] if the OS rejects
    /// the source.
    pub fn register<S, F>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
        make_registration: F,
    ) -> Result<(), ReactorError>
    where
        S: Source + ?Sized,
        F: FnOnce(Interest, Token) -> Registration<C>,
    {
        if token == WAKE_TOKEN || self.sources.contains_key(&token) {
            return Err(ReactorError::DuplicateRegistration(token));
        }
        self.poll
            .registry()
            .register(source, token, interest.to_mio())?;
        self.sources.insert(
            token,
            SourceState {
                interest,
                unclaimed: Interest::empty(),
            },
        );
        trace!(?token, ?interest, "resource registered");
        self.install(token, make_registration(interest, token))
    }

    /// Replace the interest set and waiters of a registered resource.
    ///
    /// Waiters of the previous registration are resolved with
    /// [`ReactorError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::NotRegistered`] for unknown tokens,
    /// [`ReactorError::DuplicateWaiter`] for a malformed registration, or
    /// [`ReactorError::Io`] if the OS rejects the change.
    pub fn reregister<S, F>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
        make_registration: F,
    ) -> Result<(), ReactorError>
    where
        S: Source + ?Sized,
        F: FnOnce(Interest, Token) -> Registration<C>,
    {
        let Some(state) = self.sources.get_mut(&token) else {
            return Err(ReactorError::NotRegistered(token));
        };
        self.poll
            .registry()
            .reregister(source, token, interest.to_mio())?;
        state.interest = interest;
        self.cancel_waiters(token);
        trace!(?token, ?interest, "resource reregistered");
        self.install(token, make_registration(interest, token))
    }

    /// Remove a resource, resolving its pending waiters with
    /// [`ReactorError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::NotRegistered`] for unknown tokens or
    /// [`ReactorError::Io`] if the OS deregistration fails. Waiters are
    /// cancelled in either case.
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> Result<(), ReactorError>
    where
        S: Source + ?Sized,
    {
        if self.sources.remove(&token).is_none() {
            return Err(ReactorError::NotRegistered(token));
        }
        self.cancel_waiters(token);
        trace!(?token, "resource deregistered");
        self.poll.registry().deregister(source)?;
        Ok(())
    }

    /// Add one waiter to an existing registration.
    ///
    /// If readiness of `kind` was observed while nobody waited, the waiter is
    /// queued for resumption straight away.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::NotRegistered`] for unknown tokens and
    /// [`ReactorError::DuplicateWaiter`] if a waiter for `kind` is pending.
    pub fn await_readiness(
        &mut self,
        token: Token,
        kind: Readiness,
        waiter: Waiter<C>,
    ) -> Result<(), ReactorError> {
        let Some(state) = self.sources.get_mut(&token) else {
            return Err(ReactorError::NotRegistered(token));
        };
        if state.unclaimed.has(Readiness::Reset) {
            self.resumed.push((waiter, Ok(Readiness::Reset)));
            return Ok(());
        }
        if state.unclaimed.has(kind) {
            state.unclaimed = state.unclaimed.remove(kind.into());
            self.resumed.push((waiter, Ok(kind)));
            return Ok(());
        }
        self.continuations
            .insert((token, kind), waiter)
            .map_err(|occupied| {
                let (token, readiness) = occupied.key;
                error!(?token, %readiness, "duplicate waiter registered");
                ReactorError::DuplicateWaiter { token, readiness }
            })
    }

    /// Returns `true` if a waiter for `kind` is pending on `token`.
    #[must_use]
    pub fn has_waiter(&self, token: Token, kind: Readiness) -> bool {
        self.continuations.contains(&(token, kind))
    }

    /// Interest set currently registered for `token`.
    #[must_use]
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.sources.get(&token).map(|state| state.interest)
    }

    /// Number of registered resources.
    #[must_use]
    pub fn len(&self) -> usize { self.sources.len() }

    /// Returns `true` when no resource is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.sources.is_empty() }

    /// Returns `true` if resumed waiters are waiting to be invoked.
    #[must_use]
    pub fn has_resumed(&self) -> bool { !self.resumed.is_empty() }

    /// Block until readiness is reported or `timeout` elapses, then queue the
    /// waiters for every observed readiness kind.
    ///
    /// Returns the number of waiters queued by this call. A reset or error
    /// resumes every waiter of the affected resource. Waker events are
    /// consumed silently.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Io`] if polling fails; the reactor should then
    /// be considered dead. An interrupted poll is reported as zero events.
    pub fn run_until_ready(&mut self, timeout: Option<Duration>) -> Result<usize, ReactorError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => {
                error!(error = %e, "reactor poll failed");
                return Err(ReactorError::Io(e));
            }
        }

        let mut observed = Vec::with_capacity(self.events.iter().count());
        for event in &self.events {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let mut kinds = Interest::empty();
            if event.is_readable() || event.is_read_closed() {
                kinds = kinds | Interest::READ;
            }
            if event.is_writable() || event.is_write_closed() {
                kinds = kinds | Interest::WRITE;
            }
            if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
                kinds = kinds | Interest::RESET;
            }
            observed.push((event.token(), kinds));
        }

        let before = self.resumed.len();
        for (token, kinds) in observed {
            self.signal(token, kinds);
        }
        Ok(self.resumed.len() - before)
    }

    /// Hand out the queued resumptions. Each waiter must be invoked exactly
    /// once with its paired outcome.
    pub fn take_resumed(&mut self) -> Vec<(Waiter<C>, Result<Readiness, ReactorError>)> {
        std::mem::take(&mut self.resumed)
    }

    /// Invoke every queued resumption with `ctx`, returning how many ran.
    pub fn resume(&mut self, ctx: &mut C) -> usize {
        let resumed = self.take_resumed();
        let count = resumed.len();
        for (waiter, outcome) in resumed {
            waiter(ctx, outcome);
        }
        count
    }

    /// Route observed readiness to waiters or remember it for later.
    fn signal(&mut self, token: Token, kinds: Interest) {
        let Some(state) = self.sources.get_mut(&token) else {
            trace!(?token, "readiness for unregistered resource");
            return;
        };
        if kinds.has(Readiness::Reset) {
            let waiters = self.continuations.drain_where(|(t, _)| *t == token);
            if waiters.is_empty() {
                state.unclaimed = state.unclaimed | Interest::RESET;
            }
            for (_, waiter) in waiters {
                self.resumed.push((waiter, Ok(Readiness::Reset)));
            }
            return;
        }
        for kind in kinds.kinds() {
            match self.continuations.take(&(token, kind)) {
                Some(waiter) => self.resumed.push((waiter, Ok(kind))),
                None => state.unclaimed = state.unclaimed | kind.into(),
            }
        }
    }

    fn install(&mut self, token: Token, registration: Registration<C>) -> Result<(), ReactorError> {
        for (kind, waiter) in registration.waiters {
            self.await_readiness(token, kind, waiter)?;
        }
        Ok(())
    }

    fn cancel_waiters(&mut self, token: Token) {
        for (_, waiter) in self.continuations.drain_where(|(t, _)| *t == token) {
            self.resumed.push((waiter, Err(ReactorError::Cancelled)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use mio::net::UnixStream;
    use rstest::{fixture, rstest};

    use super::*;

    type Log = Vec<(u8, Result<Readiness, String>)>;

    fn recorder(tag: u8) -> impl FnOnce(&mut Log, Result<Readiness, ReactorError>) {
        move |log: &mut Log, outcome| log.push((tag, outcome.map_err(|e| e.to_string())))
    }

    #[fixture]
    fn reactor() -> Reactor<Log> { Reactor::new(16).expect("create reactor") }

    #[rstest]
    fn duplicate_registration_is_rejected(mut reactor: Reactor<Log>) {
        let (mut a, _b) = UnixStream::pair().expect("socket pair");
        reactor
            .register(&mut a, Token(1), Interest::READ, |i, _| Registration::new(i))
            .expect("first registration");
        let err = reactor
            .register(&mut a, Token(1), Interest::READ, |i, _| Registration::new(i))
            .expect_err("second registration");
        assert!(matches!(err, ReactorError::DuplicateRegistration(Token(1))));
    }

    #[rstest]
    fn duplicate_waiter_is_rejected(mut reactor: Reactor<Log>) {
        let (mut a, _b) = UnixStream::pair().expect("socket pair");
        reactor
            .register(&mut a, Token(1), Interest::READ, |i, _| {
                Registration::new(i).with_waiter(Readiness::Read, recorder(1))
            })
            .expect("register");
        let err = reactor
            .await_readiness(Token(1), Readiness::Read, Box::new(recorder(2)))
            .expect_err("second waiter");
        assert!(matches!(
            err,
            ReactorError::DuplicateWaiter {
                token: Token(1),
                readiness: Readiness::Read
            }
        ));
    }

    #[rstest]
    fn readable_socket_resumes_its_waiter_once(mut reactor: Reactor<Log>) {
        let (mut a, mut b) = UnixStream::pair().expect("socket pair");
        reactor
            .register(&mut a, Token(3), Interest::READ, |i, _| {
                Registration::new(i).with_waiter(Readiness::Read, recorder(3))
            })
            .expect("register");
        b.write_all(b"ping").expect("write");

        let mut log = Log::new();
        while log.is_empty() {
            reactor
                .run_until_ready(Some(Duration::from_secs(1)))
                .expect("poll");
            reactor.resume(&mut log);
        }
        assert_eq!(log, vec![(3, Ok(Readiness::Read))]);
        assert!(!reactor.has_waiter(Token(3), Readiness::Read));
    }

    #[rstest]
    fn deregister_cancels_pending_waiters(mut reactor: Reactor<Log>) {
        let (mut a, _b) = UnixStream::pair().expect("socket pair");
        reactor
            .register(&mut a, Token(4), Interest::READ | Interest::WRITE, |i, _| {
                Registration::new(i).with_waiter(Readiness::Read, recorder(4))
            })
            .expect("register");
        reactor.deregister(&mut a, Token(4)).expect("deregister");

        let mut log = Log::new();
        assert_eq!(reactor.resume(&mut log), 1);
        assert_eq!(log, vec![(4, Err("operation cancelled".to_owned()))]);
        assert!(reactor.is_empty());
    }

    #[rstest]
    fn reregister_replaces_interest_and_cancels_old_waiters(mut reactor: Reactor<Log>) {
        let (mut a, _b) = UnixStream::pair().expect("socket pair");
        reactor
            .register(&mut a, Token(5), Interest::RESET, |i, _| {
                Registration::new(i).with_waiter(Readiness::Reset, recorder(1))
            })
            .expect("register");
        reactor
            .reregister(&mut a, Token(5), Interest::READ | Interest::RESET, |i, _| {
                Registration::new(i).with_waiter(Readiness::Read, recorder(2))
            })
            .expect("reregister");

        assert_eq!(reactor.interest(Token(5)), Some(Interest::READ | Interest::RESET));
        assert!(reactor.has_waiter(Token(5), Readiness::Read));
        let mut log = Log::new();
        reactor.resume(&mut log);
        assert_eq!(log, vec![(1, Err("operation cancelled".to_owned()))]);
    }

    #[rstest]
    fn unknown_tokens_are_reported(mut reactor: Reactor<Log>) {
        let err = reactor
            .await_readiness(Token(9), Readiness::Write, Box::new(recorder(9)))
            .expect_err("unregistered");
        assert!(matches!(err, ReactorError::NotRegistered(Token(9))));
    }

    #[test]
    fn interest_set_operations() {
        let set = Interest::READ | Interest::RESET;
        assert!(set.has(Readiness::Read));
        assert!(!set.has(Readiness::Write));
        assert_eq!(set.kinds().collect::<Vec<_>>(), vec![Readiness::Read, Readiness::Reset]);
        assert_eq!(set.remove(Interest::READ), Interest::RESET);
        assert!(Interest::empty().is_empty());
    }
}
