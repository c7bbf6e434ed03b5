//! A multithreaded, deadline-bound, pull-dispatch HTTP/1.1 server engine.
//!
//! A [`reactor::Reactor`] accepts connections and parses requests off a
//! pool of worker threads; completed requests are placed in a
//! [`ready_pool::ReadyPool`] for a caller to pull via
//! [`server::HttpServer::checkout`]. A request left uncommitted past its
//! configured deadline is handed to a mandatory timeout
//! [`processor::RequestProcessor`] by the [`timer::TimerQueue`], so every
//! accepted request is guaranteed to eventually receive a response.
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handle_table;
pub mod parser;
pub mod poller;
pub mod processor;
pub mod reactor;
pub mod ready_pool;
pub mod request;
pub mod server;
pub mod timer;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use processor::RequestProcessor;
pub use request::Request;
pub use server::HttpServer;
