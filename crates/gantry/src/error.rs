//! Service lifecycle errors.

use std::io;

/// Errors surfaced by [`Service::start`](crate::Service::start) and
/// [`Service::stop`](crate::Service::stop).
///
/// Listener serve faults after a successful start are not represented here:
/// auxiliary listeners log and die quietly, and a primary listener fault
/// terminates the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A listener socket could not be bound.
    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The gateway's loopback channel to the primary listener could not be
    /// constructed.
    #[error("failed to open gateway channel to {addr}: {source}")]
    GatewayChannel {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },

    /// `start` was called on a service that is already running.
    #[error("service is already started")]
    AlreadyStarted,

    /// `stop` was called on a service that was never started.
    #[error("service is not started")]
    NotStarted,

    /// One or more listeners failed to drain within the shutdown deadline.
    /// Every listener is still asked to stop before this is returned.
    #[error("shutdown incomplete: {}", .failures.join("; "))]
    Shutdown { failures: Vec<String> },
}
