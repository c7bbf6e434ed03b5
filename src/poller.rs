use mio::{event::Source, Events, Interest, Poll, Token};
use std::io;
use std::time::Duration;

/// Maximum number of readiness events drained per `wait` call, matching the
/// original shim's `kMaxEvents`.
const MAX_EVENTS: usize = 32;

/// How long a single `wait` call blocks when nothing is ready, matching the
/// original's `kWaitTimeoutMillis` for its real-epoll branch. `mio` itself
/// absorbs the epoll-vs-poll platform distinction the original shim made
/// explicit (see DESIGN.md Open Question (c)), so this is the only
/// `Poller` implementation the crate carries.
const WAIT_TIMEOUT: Duration = Duration::from_millis(5);

/// A readiness event delivered by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Edge-triggered, one-shot readiness poller. Every registration is
/// one-shot: once an event fires for a token, that token delivers no further
/// events until [`Poller::rearm`] is called again, matching the original's
/// `EPOLLONESHOT` discipline and its "at most one concurrent delivery per
/// handle" invariant.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS),
        })
    }

    /// Registers `source` for one-shot readability/writability notification
    /// under `token`.
    pub fn register(&mut self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Rearms a previously-registered source for another one-shot delivery.
    /// Returns `Err` if the source is no longer registered (e.g. the
    /// underlying fd was closed), which callers must treat as "tear down
    /// this connection", per spec.
    pub fn rearm(&mut self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Deregisters `source`; idempotent failures (already gone) are ignored
    /// by callers, matching the original's `try_delete_one_shot_callback`
    /// being a no-op once the kernel has already dropped the fd.
    pub fn deregister(&mut self, source: &mut dyn Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Returns a cheap, thread-safe clone of the registry, usable to
    /// register/reregister/deregister sources from any thread without
    /// touching the `Poll` instance itself (which only the thread calling
    /// [`wait`](Self::wait) needs exclusive access to).
    pub fn try_clone_registry(&self) -> io::Result<mio::Registry> {
        self.poll.registry().try_clone()
    }

    /// Blocks for up to [`WAIT_TIMEOUT`] and returns the events observed.
    /// An empty slice is a normal result, not an error: callers loop back
    /// around to check their own shutdown flag.
    pub fn wait(&mut self) -> io::Result<Vec<ReadyEvent>> {
        self.poll.poll(&mut self.events, Some(WAIT_TIMEOUT))?;
        Ok(self
            .events
            .iter()
            .map(|ev| ReadyEvent {
                token: ev.token(),
                readable: ev.is_readable(),
                writable: ev.is_writable(),
                error: ev.is_error(),
            })
            .collect())
    }
}
