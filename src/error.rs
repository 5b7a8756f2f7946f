//! Error types for the RPC runtime.

/// Error type for runtime operations.
///
/// Synchronous errors are returned directly from the public API; transport
/// and connection failures discovered later are surfaced through the
/// session-management callback instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A public API call was made with an invalid argument; no state changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The buffer pool could not satisfy an allocation.
    #[error("out of memory")]
    OutOfMemory,

    /// The session's credits are exhausted.
    #[error("no credits available on session")]
    NoCredits,

    /// Routing information could not be resolved.
    #[error("routing info resolution failed")]
    RoutingResolutionFailure,

    /// The remote endpoint rejected the fabric port named in a connect.
    #[error("invalid remote fabric port")]
    InvalidRemotePort,

    /// The transport failed fatally; all sessions on this runtime error out.
    #[error("transport fatal: {0}")]
    TransportFatal(#[from] std::io::Error),

    /// A malformed or out-of-protocol packet was seen. The datapath drops
    /// these silently and bumps a counter; this variant is for decode APIs.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
