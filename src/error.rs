//! Error types for fraglink.

use thiserror::Error;

/// Transport operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A descriptor or buffer pool stayed empty past the retry bound.
    /// Recoverable: the caller may progress completions and retry.
    #[error("{pool} pool exhausted after {retries} retries")]
    ResourceExhausted { pool: &'static str, retries: u32 },

    /// A delivered header failed validation. The fragment is dropped and
    /// the transport keeps running; this indicates an upstream bug.
    #[error("protocol desync: kind {kind} size {size}")]
    ProtocolDesync { kind: u32, size: u32 },

    /// Payload copy/conversion failed while building a fragment.
    /// The fragment is abandoned with shared state unmodified.
    #[error("payload pack failed: {0}")]
    PackFailure(String),

    /// The requested transfer needs a capability the rail does not expose.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// The peer refused a fragment. Retransmission policy is owned by the
    /// matching layer, not this transport.
    #[error("peer nacked fragment (descriptor {src_ref})")]
    NackReceived { src_ref: u32 },

    /// Command submission to the interface failed.
    #[error("command submission failed: {0}")]
    Submit(String),
}

/// Result type for fraglink operations.
pub type Result<T> = std::result::Result<T, Error>;
