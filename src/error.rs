use std::io;

/// Errors that can occur while standing up a server. Nothing on the hot
/// request path returns one of these; parser/protocol failures are handled
/// internally per the taxonomy in the request lifecycle instead.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Resolving the actual bound local address failed.
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),

    /// Registering the listener (or any socket) with the poller failed.
    #[error("failed to register with poller: {0}")]
    Poller(#[source] io::Error),

    /// Spawning a reactor worker or timer thread failed.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Convenience alias for the crate's setup-time fallible operations.
pub type Result<T> = std::result::Result<T, Error>;
