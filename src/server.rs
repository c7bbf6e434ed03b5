use crate::config::ServerConfig;
use crate::error::Result;
use crate::handle_table::HandleTable;
use crate::parser::{HttpParser, Mode};
use crate::processor::RequestProcessor;
use crate::reactor::{ConnectionHandler, ConnectionHandlerFactory, Reactor};
use crate::ready_pool::ReadyPool;
use crate::request::Request;
use crate::timer::TimerQueue;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

/// Counters exposed by [`HttpServer`], grounded on `InnerHttpServer`'s four
/// atomic counters in `http_server.cc`.
#[derive(Debug, Default)]
pub struct Counters {
    pub total: AtomicI64,
    pub processed: AtomicI64,
    pub timeout: AtomicI64,
    pub checked_out: AtomicI64,
}

struct RequestState {
    request: Request,
    committed: bool,
}

/// Holds a single in-flight request's response-building state, grounded on
/// the inner `ResponseContext` class of `http_server.cc`. `apply_processor`
/// is the exactly-once commit arbitration point: whichever caller — a
/// worker via `checkout`/`reprocess`, or the timer queue via
/// `send_timeout_response` — gets here first while `committed` is still
/// false wins; everyone else sees it already true and is a no-op.
struct ResponseContext {
    state: Mutex<RequestState>,
}

impl ResponseContext {
    fn new(request: Request) -> Self {
        Self { state: Mutex::new(RequestState { request, committed: false }) }
    }

    fn apply_processor(&self, processor: &dyn RequestProcessor, is_timeout: bool, counters: &Counters) -> bool {
        let mut state = self.state.lock();
        if state.committed {
            return false;
        }
        processor.process(&mut state.request);
        if state.request.is_committed() {
            state.committed = true;
            if is_timeout {
                counters.timeout.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            true
        } else {
            false
        }
    }

    /// Forces a response via the timeout processor if nothing has
    /// committed yet. Grounded on `ResponseContext::finalize`, which always
    /// leaves the request committed — either because a regular processor
    /// already got there first, or because the timeout processor has no
    /// excuse to decline.
    fn finalize(&self, timeout_processor: &dyn RequestProcessor, counters: &Counters) {
        self.apply_processor(timeout_processor, true, counters);
        assert!(self.state.lock().committed, "finalize must always result in a committed response");
    }
}

struct Handler {
    server: Arc<HttpServer>,
    handle: u64,
    parser: HttpParser,
}

impl ConnectionHandler for Handler {
    fn handle_buffer(&mut self, data: &[u8]) -> bool {
        self.parser.execute(data);
        if !self.parser.ok() {
            return false;
        }
        if self.parser.completed() {
            // Hand the finished parse off and reset the slot, exactly as
            // the original does, so a pipelined follow-up request on the
            // same connection starts its own fresh parser.
            let parser = std::mem::replace(&mut self.parser, HttpParser::new(Mode::Request));
            self.server.add_ready(self.handle, parser);
        }
        true
    }

    fn finalize(&mut self) {
        tracing::trace!(handle = self.handle, "connection closed before a request completed");
    }
}

struct Factory {
    server: OnceLock<Arc<HttpServer>>,
}

impl ConnectionHandlerFactory for Factory {
    fn create(&self, handle: u64, _peer: SocketAddr) -> Box<dyn ConnectionHandler> {
        match self.server.get() {
            Some(server) => Box::new(Handler {
                server: server.clone(),
                handle,
                parser: HttpParser::new(Mode::Request),
            }),
            None => Box::new(RejectingHandler),
        }
    }
}

/// Used only in the vanishingly unlikely startup window between the
/// reactor's worker threads starting and the server's own `Arc` being
/// published into the factory.
struct RejectingHandler;
impl ConnectionHandler for RejectingHandler {
    fn handle_buffer(&mut self, _data: &[u8]) -> bool {
        false
    }
    fn finalize(&mut self) {}
}

/// The HTTP server core, grounded on
/// `original_source/code_root/cc/net/http_server.cc`'s `InnerHttpServer`.
/// Wires the reactor, ready pool, handle table, and timer queue together
/// and exposes `checkout`/`reprocess`/`run`/`cancel`/`stop`.
pub struct HttpServer {
    reactor: Arc<Reactor>,
    ready_pool: ReadyPool,
    handle_table: HandleTable<ResponseContext>,
    timer_queue: Mutex<TimerQueue>,
    max_latency_millis: i64,
    timeout_processor: Arc<dyn RequestProcessor>,
    running: AtomicBool,
    stopped: AtomicBool,
    counters: Counters,
    self_weak: OnceLock<Weak<HttpServer>>,
}

impl HttpServer {
    /// Binds the listener and starts the reactor's worker threads. The
    /// server itself is not yet servicing logical work until [`run`] (or
    /// manual `checkout`/`reprocess` calls) begins pulling from the ready
    /// pool.
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let factory = Arc::new(Factory { server: OnceLock::new() });
        let reactor = Reactor::bind(&config.host, config.port, config.reactor_workers, factory.clone())?;

        let server = Arc::new(Self {
            reactor,
            ready_pool: ReadyPool::new(),
            handle_table: HandleTable::new(),
            timer_queue: Mutex::new(TimerQueue::new(config.timer_thread_count)),
            max_latency_millis: config.max_latency_millis,
            timeout_processor: config.timeout_processor,
            running: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            counters: Counters::default(),
            self_weak: OnceLock::new(),
        });
        let _ = server.self_weak.set(Arc::downgrade(&server));
        let _ = factory.server.set(server.clone());
        Ok(server)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.reactor.local_addr()
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    fn self_arc(&self) -> Arc<HttpServer> {
        self.self_weak
            .get()
            .and_then(Weak::upgrade)
            .expect("self_weak is populated in HttpServer::new before any request can arrive")
    }

    /// Called by a connection [`Handler`] once a full request has been
    /// parsed. Grounded on `InnerHttpServer::add_ready`.
    fn add_ready(&self, connection_handle: u64, parser: HttpParser) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let request = Request::new(self.reactor.clone(), connection_handle, 0, parser);

        if !self.running.load(Ordering::SeqCst) || self.max_latency_millis <= 0 {
            let context = ResponseContext::new(request);
            context.finalize(self.timeout_processor.as_ref(), &self.counters);
            self.reactor.close_connection(connection_handle);
            return;
        }

        let context = Arc::new(ResponseContext::new(request));
        let server = self.self_arc();
        let id = self.handle_table.new_id(context.clone(), move |context| {
            context.finalize(server.timeout_processor.as_ref(), &server.counters);
        });
        context.state.lock().request.set_id(id);
        self.ready_pool.insert(id);

        let deadline = now_millis() + self.max_latency_millis;
        let server = self.self_arc();
        self.timer_queue.lock().add_item(deadline, move || {
            server.send_timeout_response(id);
        });
    }

    /// Invoked by the timer queue once a request's deadline elapses.
    /// Grounded on `InnerHttpServer::send_timeout_response`.
    fn send_timeout_response(&self, id: u64) {
        self.ready_pool.erase(id);
        if let Some(context) = self.handle_table.addref_and_get(id) {
            let applied = context.apply_processor(self.timeout_processor.as_ref(), true, &self.counters);
            self.handle_table.deref(id, if applied { 2 } else { 1 });
        }
    }

    /// Pops the most-recently-ready request and applies `processor` to it.
    /// Grounded on `InnerHttpServer::checkout`.
    pub fn checkout(&self, processor: &dyn RequestProcessor) -> bool {
        match self.ready_pool.pop() {
            Some(id) => {
                self.counters.checked_out.fetch_add(1, Ordering::Relaxed);
                self.apply_processor(id, processor)
            }
            None => false,
        }
    }

    /// Re-applies `processor` to an already-checked-out request id.
    /// Grounded on `InnerHttpServer::re_process`.
    pub fn reprocess(&self, id: u64, processor: &dyn RequestProcessor) -> bool {
        self.apply_processor(id, processor)
    }

    fn apply_processor(&self, id: u64, processor: &dyn RequestProcessor) -> bool {
        match self.handle_table.addref_and_get(id) {
            None => false,
            Some(context) => {
                let applied = context.apply_processor(processor, false, &self.counters);
                self.handle_table.deref(id, if applied { 2 } else { 1 });
                applied
            }
        }
    }

    /// Stops accepting further scheduling; does not itself block until
    /// drained. Grounded on `InnerHttpServer::cancel`.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Idempotent shutdown: stops the timer queue (force-flushing every
    /// pending deadline), finalizes every still-registered handle-table
    /// entry, and tears down the reactor. Grounded on
    /// `InnerHttpServer::stop`.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.timer_queue.lock().stop();
        self.handle_table.clean_all();
        self.reactor.stop();
    }

    /// Runs the 50ms-sliced lifecycle loop described in SPEC_FULL.md §4.9,
    /// returning once `cancel()` has been called; `stop()` is invoked
    /// automatically before returning.
    pub fn run(&self) {
        let debug_out = std::env::var("DEBUG_OUT").is_ok();
        let mut iterations: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
            iterations += 1;
            if debug_out && iterations % 100 == 0 {
                let total = self.counters.total.load(Ordering::Relaxed).max(1);
                let processed = self.counters.processed.load(Ordering::Relaxed);
                let timeout = self.counters.timeout.load(Ordering::Relaxed);
                tracing::info!(
                    total,
                    processed_pct = (processed as f64 / total as f64) * 100.0,
                    timeout_pct = (timeout as f64 / total as f64) * 100.0,
                    "server progress"
                );
            }
        }
        self.stop();
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}
