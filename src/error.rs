//! Error taxonomy surfaced by the core (see spec §7).

use thiserror::Error;

/// Everything that can go wrong while driving a DAP.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A transport-level or sticky error, after a best-effort clear was attempted.
    /// Carries the raw ACK/fault code reported by the transport.
    #[error("fault response from target (code {0:#x})")]
    Fault(u8),

    /// The target asked us to retry and retries were exhausted.
    #[error("target requested WAIT and retries were exhausted")]
    Wait,

    /// The caller asked for an access this AP's policy forbids.
    #[error("unaligned access to {address:#010x} with size {size}")]
    UnalignedAccess {
        /// Address of the rejected access.
        address: u32,
        /// Requested access size in bytes.
        size: u8,
    },

    /// A polled register did not reach the expected value before the deadline.
    #[error("timed out after {timeout_ms} ms waiting for register {register:#x}")]
    Timeout {
        /// Register selector being polled.
        register: u8,
        /// Deadline that was exceeded.
        timeout_ms: u32,
    },

    /// No AP or CoreSight component of the requested kind exists.
    #[error("not found")]
    NotFound,

    /// The block engine's scratch allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// CLI-only: the command or its arguments could not be parsed.
    #[error("command syntax error")]
    CommandSyntax,
}

/// Result of a block transfer that may have partially completed.
///
/// The block engine (§4.5) only ever attempts recovery to *report* how far it
/// got; it never resumes a failed transfer. `bytes_transferred` is valid
/// regardless of whether `cause` is `Some`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{cause}: transferred {bytes_transferred} of {requested} bytes")]
pub struct TransferError {
    /// The underlying failure.
    pub cause: Error,
    /// Bytes that are known to have completed before the failure.
    pub bytes_transferred: usize,
    /// Bytes that were originally requested.
    pub requested: usize,
}

/// Result type for whole-buffer transfers: `Ok(bytes)` on full success,
/// `Err(TransferError)` describing how much actually completed.
pub type TransferResult = Result<usize, TransferError>;
