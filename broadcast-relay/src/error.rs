use std::{io, net::SocketAddr};

use thiserror::Error;

/// Failures that end a server or client before it gets going.
///
/// Anything that goes wrong on an established connection stays inside that
/// connection's tasks and is only logged.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to send name to the server: {0}")]
    Handshake(#[source] io::Error),

    #[error("standard input closed before a name was entered")]
    NoName,
}
