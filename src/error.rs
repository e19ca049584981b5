//! Errors surfaced by the lock engine.

/// Result of engine operations with error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors, mirroring the codes the DLM protocol surfaces to its
/// callers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The server refused the lock but the reply is authoritative; an
    /// LVB may still have been delivered.
    Aborted,
    /// RPC failure beyond an authoritative refusal.
    Failed,
    /// Flock-specific: the lock was already freed when the reply came
    /// back.
    NoLock,
    /// The lock was destroyed or marked failed while waiting.
    IO,
    /// Reply missing or malformed.
    Proto,
    /// Invalid argument, e.g. a reply LVB larger than the negotiated
    /// length.
    Inval,
    /// Allocation failure reported by the transport.
    NoMem,
    /// The peer no longer knows the object being addressed, or it is on
    /// its way out locally.
    Stale,
    /// The completion wait was interrupted.
    Interrupted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Error::Aborted => "lock aborted by server",
            Error::Failed => "rpc failed",
            Error::NoLock => "lock already freed",
            Error::IO => "lock destroyed or failed",
            Error::Proto => "protocol error",
            Error::Inval => "invalid argument",
            Error::NoMem => "out of memory",
            Error::Stale => "stale object",
            Error::Interrupted => "interrupted",
        };
        f.write_str(text)
    }
}

impl std::error::Error for Error {}
