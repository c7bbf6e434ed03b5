use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::poller::Poller;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Reserved token for the listening socket; real connections are tokened by
/// their handle id, which never reaches `usize::MAX` in practice.
const ACCEPTOR_TOKEN: Token = Token(usize::MAX);

/// Maximum bytes read per burst from a ready connection, matching the
/// original's `kReceiverSize`.
const RECEIVER_SIZE: usize = 1024;

/// Per-connection upcalls, grounded on
/// `original_source/code_root/cc/net/epoll_server.h`'s
/// `EpollConnectionHandler` interface.
pub trait ConnectionHandler: Send {
    /// Delivers a burst of newly-read bytes. Returns `true` to keep the
    /// connection open and rearmed for further reads, `false` to tear it
    /// down immediately (a malformed request). A completed request does not
    /// by itself close the connection: `handle_buffer` is expected to hand
    /// the finished parse off to a response context and reset its own
    /// parser slot, exactly as the original's `ConnectionHandler` does —
    /// this is what leaves request pipelining on the same connection
    /// possible (see spec's Non-goals: "pipelining beyond what the parser
    /// allows").
    fn handle_buffer(&mut self, data: &[u8]) -> bool;

    /// Called exactly once when the connection is being torn down, for any
    /// reason: peer closed, read error, rearm failure, malformed request,
    /// or an explicit [`Reactor::close_connection`]. Mirrors
    /// `upcall_connection_closed`.
    fn finalize(&mut self);
}

/// Creates a fresh [`ConnectionHandler`] for each newly-accepted connection,
/// grounded on `EpollConnectionHandlerFactory::get()`. Invoked before the
/// connection is armed for readiness, matching the original's explicit
/// ordering requirement ("add this callback after sending the upcall for
/// starting connection").
pub trait ConnectionHandlerFactory: Send + Sync {
    fn create(&self, handle: u64, peer: SocketAddr) -> Box<dyn ConnectionHandler>;
}

/// A live connection's shared state. Reachable only through `Arc<Conn>`, so
/// every field that can change after insertion into `Reactor::conns` carries
/// its own lock or, for `record`, its own interior mutability — the global
/// `conns` map lock is never held while touching any of these.
struct Conn {
    stream: Mutex<TcpStream>,
    handler: Mutex<Box<dyn ConnectionHandler>>,
    record: Connection,
}

/// The non-blocking accept-loop I/O reactor, grounded on
/// `original_source/code_root/cc/net/epoll_server.cc`. A fixed pool of
/// worker threads share one `mio::Poll` instance (serialized via a mutex
/// around the blocking `wait` call only; registration itself uses a cloned,
/// thread-safe `Registry` and needs no lock) so that, as in the original's
/// multiple `wait_worker` threads calling `epoll_wait` on the same fd, no
/// connection is ever handed to two workers at once: `EPOLLONESHOT`
/// (emulated by `mio`'s edge-triggered, explicit-rearm registration) means
/// a ready connection is removed from consideration until its handler
/// explicitly rearms it.
///
/// `conns` guards only the handle→connection lookup, exactly as the
/// original's `lock_` guards only `handle_to_fd_lookup_`/`handler_lookup_`:
/// every caller takes the lock just long enough to clone an `Arc<Conn>` (or
/// insert/remove one), then releases it before touching the stream, the
/// handler, or doing any I/O. Two different connections' reads, writes, and
/// upcalls therefore proceed fully concurrently; only the map itself is
/// ever serialized, and only briefly.
pub struct Reactor {
    listener: Mutex<TcpListener>,
    poller: Mutex<Poller>,
    registry: mio::Registry,
    conns: Mutex<HashMap<u64, Arc<Conn>>>,
    handle_seed: AtomicU64,
    factory: Arc<dyn ConnectionHandlerFactory>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Reactor {
    /// Binds `host:port`, non-blocking, with `SO_REUSEADDR` off, and spawns
    /// `worker_count` reactor worker threads.
    pub fn bind(
        host: &str,
        port: u16,
        worker_count: usize,
        factory: Arc<dyn ConnectionHandlerFactory>,
    ) -> Result<Arc<Self>> {
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|e: std::net::AddrParseError| Error::Bind {
                addr: format!("{}:{}", host, port),
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(|e| Error::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        socket.set_reuse_address(false).map_err(|e| Error::Bind { addr: addr.to_string(), source: e })?;
        socket.bind(&addr.into()).map_err(|e| Error::Bind { addr: addr.to_string(), source: e })?;
        socket.listen(1024).map_err(|e| Error::Bind { addr: addr.to_string(), source: e })?;
        socket.set_nonblocking(true).map_err(|e| Error::Bind { addr: addr.to_string(), source: e })?;

        let std_listener: std::net::TcpListener = socket.into();
        let mut listener = TcpListener::from_std(std_listener);

        let mut poller = Poller::new().map_err(Error::Poller)?;
        let registry = poller.try_clone_registry().map_err(Error::Poller)?;
        poller
            .register(&mut listener, ACCEPTOR_TOKEN, Interest::READABLE)
            .map_err(Error::Poller)?;

        let reactor = Arc::new(Self {
            listener: Mutex::new(listener),
            poller: Mutex::new(poller),
            registry,
            conns: Mutex::new(HashMap::new()),
            handle_seed: AtomicU64::new(0),
            factory,
            running: Arc::new(AtomicBool::new(true)),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for i in 0..worker_count.max(1) {
            let reactor = reactor.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("pullserve-reactor-{}", i))
                    .spawn(move || reactor.worker_loop())
                    .map_err(Error::Spawn)?,
            );
        }
        *reactor.workers.lock() = workers;

        Ok(reactor)
    }

    /// The local address actually bound, resolving an ephemeral port (0)
    /// to the one the kernel assigned.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.lock().local_addr()
    }

    fn worker_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let events = match self.poller.lock().wait() {
                Ok(events) => events,
                Err(_) => continue,
            };
            for event in events {
                if event.token == ACCEPTOR_TOKEN {
                    self.accept_loop();
                } else {
                    self.handle_data_event(event.token.0 as u64);
                }
            }
        }
    }

    /// Drains pending connections off the listener, then unconditionally
    /// rearms the acceptor token for the next readiness edge — mirroring
    /// `do_connection_accept`'s unconditional
    /// `reapply_one_shot_callback(acceptor_handle_, acceptor_fd_)` at the end
    /// of every accept burst. The acceptor is a one-shot registration like
    /// any other handle; skipping the rearm would leave the server
    /// permanently unable to accept once the first readiness edge fires.
    fn accept_loop(&self) {
        let mut listener = self.listener.lock();
        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let handle = self.handle_seed.fetch_add(1, Ordering::Relaxed);
                    let local = stream.local_addr().ok();
                    // Upcall first: the handler must exist before the
                    // connection can be armed for readiness.
                    let handler = self.factory.create(handle, peer);
                    if self
                        .registry
                        .register(&mut stream, Token(handle as usize), Interest::READABLE)
                        .is_err()
                    {
                        continue;
                    }
                    let mut record = Connection::default();
                    record.open(Some(peer.ip()), Some(peer.port()), local.map(|a| a.ip()), local.map(|a| a.port()), None);
                    let conn = Arc::new(Conn {
                        stream: Mutex::new(stream),
                        handler: Mutex::new(handler),
                        record,
                    });
                    self.conns.lock().insert(handle, conn);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        // Matches the original's fatal `CHECK_EQ(0, result) << "Accept has
        // stopped working, shutting down."` — a rearm failure here means the
        // whole server can no longer accept, so stop it outright rather than
        // limp along silently refusing connections.
        if self
            .registry
            .reregister(&mut *listener, ACCEPTOR_TOKEN, Interest::READABLE)
            .is_err()
        {
            tracing::error!("failed to rearm acceptor; shutting down reactor");
            self.running.store(false, Ordering::SeqCst);
        }
    }

    /// Handles a readiness edge for one connection. The `conns` lock is held
    /// only to clone the connection's `Arc`; the read burst, every
    /// `handle_buffer` upcall, and the rearm all happen after it's released,
    /// so other connections' events proceed concurrently on other worker
    /// threads.
    ///
    /// Each chunk's upcall is bracketed by [`Connection::ref_inc`]/
    /// [`Connection::ref_dec`] around just that call — not the whole read
    /// burst — mirroring the original's per-chunk `handler_ref`/
    /// `handler_deref` in `upcall_handle_buffer`. This is what lets an
    /// explicit [`Reactor::close_connection`] race a concurrent (or, for a
    /// same-thread reentrant call made from inside the upcall itself,
    /// nested) upcall safely: whichever decrement observes the count reach
    /// zero is the one that finalizes, and a same-thread reentrant close
    /// during the upcall can only ever bring the count from 2 to 1, so it
    /// never needs the handler lock the outer call still holds.
    fn handle_data_event(&self, handle: u64) {
        let conn = match self.conns.lock().get(&handle).cloned() {
            Some(conn) => conn,
            None => return,
        };

        let mut buf = [0u8; RECEIVER_SIZE];
        let mut keep_open = true;
        loop {
            let read = conn.stream.lock().read(&mut buf);
            match read {
                Ok(0) => {
                    keep_open = false;
                    break;
                }
                Ok(n) => {
                    conn.record.track_inbound_data(n);
                    conn.record.ref_inc();
                    let handler_wants_more = conn.handler.lock().handle_buffer(&buf[..n]);
                    if conn.record.ref_dec() == 0 {
                        // A racing close observed the baseline drop to zero
                        // while this upcall was in flight; finish what it
                        // deferred to us.
                        self.finish_teardown(handle, &conn);
                        return;
                    }
                    keep_open = handler_wants_more;
                    if !keep_open {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    keep_open = false;
                    break;
                }
            }
        }

        if !keep_open {
            self.release(handle, &conn);
        } else if self
            .registry
            .reregister(&mut *conn.stream.lock(), Token(handle as usize), Interest::READABLE)
            .is_err()
        {
            self.release(handle, &conn);
        }
    }

    /// Releases the caller's reference on `handle`'s connection, finalizing
    /// it if that was the last one outstanding.
    fn release(&self, handle: u64, conn: &Arc<Conn>) {
        if conn.record.ref_dec() == 0 {
            self.finish_teardown(handle, conn);
        }
    }

    /// Removes `handle` from the connection table, deregisters its socket,
    /// and runs its close upcall. Only ever called by the single decrement
    /// that observes the refcount reach zero, so it runs at most once per
    /// connection.
    fn finish_teardown(&self, handle: u64, conn: &Arc<Conn>) {
        self.conns.lock().remove(&handle);
        let _ = self.registry.deregister(&mut *conn.stream.lock());
        conn.record.close(None);
        conn.handler.lock().finalize();
    }

    /// Writes `data` to `handle`'s socket, blocking until the whole buffer
    /// is accepted by the kernel. Matches the original's `send_blocking`:
    /// the `conns` lock is held only to find the connection, never for the
    /// write itself, so a slow or stalled peer cannot stall any other
    /// connection's I/O. Write backpressure beyond what a blocking write
    /// naturally absorbs is out of scope (see SPEC_FULL.md §1).
    pub fn send_blocking(&self, handle: u64, data: &[u8]) -> bool {
        let conn = match self.conns.lock().get(&handle).cloned() {
            Some(conn) => conn,
            None => return false,
        };
        let ok = conn.stream.lock().write_all(data).is_ok();
        if ok {
            conn.record.track_outbound_data(data.len());
        }
        ok
    }

    /// Releases the baseline reference held on `handle`'s connection by the
    /// reactor itself, e.g. once its response has been committed. Safe to
    /// call more than once (a second call finds nothing in the table and is
    /// a no-op) and safe to call reentrantly from inside an in-flight
    /// `handle_buffer` upcall on the same connection — see
    /// [`handle_data_event`](Self::handle_data_event).
    pub fn close_connection(&self, handle: u64) {
        let conn = match self.conns.lock().get(&handle).cloned() {
            Some(conn) => conn,
            None => return,
        };
        self.release(handle, &conn);
    }

    /// Interrupts the worker threads, joins them, then tears down every
    /// still-live connection, issuing a close upcall for each. Idempotent:
    /// a second call finds an empty worker list and an empty connection
    /// table and returns immediately.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
        let remaining: Vec<u64> = self.conns.lock().keys().copied().collect();
        for handle in remaining {
            self.close_connection(handle);
        }
    }

    pub fn open_connection_count(&self) -> usize {
        self.conns.lock().len()
    }
}
