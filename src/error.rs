//! Error types for the forwarding engine.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the proxy and its upstream exchanges.
///
/// Only [`Error::AlreadyRunning`], [`Error::Config`] and [`Error::Bind`] ever
/// reach the caller of [`Proxy::start`](crate::Proxy::start). The remaining
/// variants are produced inside per-query tasks and end up in the log.
#[derive(Debug, Error)]
pub enum Error {
    #[error("DNS proxy is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed query: {0}")]
    MalformedQuery(&'static str),

    #[error("upstream {upstream} unreachable: {source}")]
    UpstreamUnreachable {
        upstream: String,
        #[source]
        source: io::Error,
    },

    #[error("upstream {upstream} did not answer within {after:?}")]
    UpstreamTimeout { upstream: String, after: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
