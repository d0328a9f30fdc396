use thiserror::Error;

/// Errors surfaced by [`crate::server::ControlServer`]'s public API.
///
/// Per-connection I/O errors and transient accept errors are deliberately
/// absent: they are contained and logged, never returned.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called from a state other than `Idle` (e.g. a second
    /// start on a running server). The server is left exactly as it was.
    #[error("start is only valid on an idle server (server is {0})")]
    InvalidState(&'static str),

    /// The listening socket could not be bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),
}

/// Failures talking to the local network gateway. Both variants are
/// recoverable: the server keeps listening locally and reports the failure
/// through the ready event instead of aborting startup.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No UPnP-capable gateway answered the discovery search.
    #[error("no UPnP gateway responded: {0}")]
    Unavailable(String),

    /// A gateway was found but refused the mapping (port already taken by
    /// another rule, mapping table full, ...).
    #[error("gateway refused the port mapping: {0}")]
    Rejected(String),
}
