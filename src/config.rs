use crate::processor::RequestProcessor;
use std::sync::Arc;

/// Default number of worker threads servicing the deadline timer queue.
pub const DEFAULT_TIMER_THREAD_COUNT: usize = 5;

/// Builder-style server configuration, grounded on the teacher's `Config`
/// struct in `connection_parser.rs` (itself built incrementally via setters
/// before being handed to the parser). `ServerConfig` is consumed once, at
/// `HttpServer::new`, rather than mutated afterwards.
pub struct ServerConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) reactor_workers: usize,
    pub(crate) max_latency_millis: i64,
    pub(crate) timer_thread_count: usize,
    pub(crate) timeout_processor: Arc<dyn RequestProcessor>,
}

impl ServerConfig {
    /// Starts a new configuration bound to `host:port`, with one reactor
    /// worker, no deadline (`max_latency_millis = 0`, meaning requests are
    /// finalized synchronously as soon as they become ready), and the
    /// default timer thread count.
    pub fn new(host: impl Into<String>, port: u16, timeout_processor: Arc<dyn RequestProcessor>) -> Self {
        Self {
            host: host.into(),
            port,
            reactor_workers: 1,
            max_latency_millis: 0,
            timer_thread_count: DEFAULT_TIMER_THREAD_COUNT,
            timeout_processor,
        }
    }

    /// Sets the number of reactor worker threads pulling from the poller.
    pub fn reactor_workers(mut self, count: usize) -> Self {
        self.reactor_workers = count.max(1);
        self
    }

    /// Sets the deadline, in milliseconds, after which a checked-out but
    /// uncommitted request is handed to the timeout processor instead. A
    /// value of zero or less disables deadline scheduling entirely: ready
    /// requests are finalized the instant they are produced.
    pub fn max_latency_millis(mut self, millis: i64) -> Self {
        self.max_latency_millis = millis;
        self
    }

    /// Sets the number of worker threads servicing the timer queue.
    pub fn timer_thread_count(mut self, count: usize) -> Self {
        self.timer_thread_count = count.max(1);
        self
    }
}
