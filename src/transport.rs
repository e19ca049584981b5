//! Narrow contract with the RPC transport.
//!
//! The engine never talks to the network itself: it builds [`Request`]
//! values and hands them to a [`Transport`], which owns allocation,
//! queueing, timeouts and recovery mechanics.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::import::Import;
use crate::wire::{DlmReply, DlmRequest, LockDesc, Opcode, PortalPair, DLM_PORTALS};

/// Transport-level outcome of one RPC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RpcCode {
    /// Server processed the request.
    Ok,
    /// Server refused the lock but answered authoritatively.
    LockAborted,
    /// Peer no longer knows the object; benign for cancels.
    Stale,
    /// No reply within the deadline.
    Timeout,
    /// Connection is shutting down.
    Shutdown,
    /// Transport could not allocate.
    NoMem,
    /// Reply arrived but could not be understood.
    Proto,
    /// Any other failure.
    Failed,
}

impl RpcCode {
    pub fn is_ok(self) -> bool {
        self == RpcCode::Ok
    }

    /// Maps a failed code onto the engine error surface.
    pub fn to_error(self) -> Error {
        match self {
            RpcCode::Ok => Error::Failed,
            RpcCode::LockAborted => Error::Aborted,
            RpcCode::Stale => Error::Stale,
            RpcCode::NoMem => Error::NoMem,
            RpcCode::Proto => Error::Proto,
            RpcCode::Timeout | RpcCode::Shutdown | RpcCode::Failed => Error::Failed,
        }
    }
}

/// Which transport queue a request rides.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SendState {
    /// Normal operation; queued behind recovery.
    #[default]
    Full,
    /// Recovery traffic: bypasses normal queueing during lock replay.
    ReplayLocks,
}

/// One DLM RPC under construction or in flight.
#[derive(Debug)]
pub struct Request {
    pub opcode: Opcode,
    pub portals: PortalPair,
    pub body: DlmRequest,
    /// Bytes reserved for the body; bounds how many handles fit.
    pub buf_size: usize,
    /// Expected reply payload size (the LVB length for enqueues).
    pub reply_size: usize,
    pub send_state: SendState,
    /// Tells the server this request closes the replay phase.
    pub replay_done: bool,
    /// Adaptive per-request timeout has been stamped.
    pub at_stamped: bool,
    /// Import generation the request was built under.
    pub import_generation: u32,
    /// Filled by the transport once a reply arrives.
    pub reply: Option<DlmReply>,
}

impl Request {
    /// Builds an empty request against `import` for `opcode`.
    pub fn new(import: &Import, opcode: Opcode, desc: LockDesc) -> Request {
        Request {
            opcode,
            portals: DLM_PORTALS,
            body: DlmRequest::new(desc),
            buf_size: crate::wire::BASE_WIRE_SIZE,
            reply_size: 0,
            send_state: SendState::Full,
            replay_done: false,
            at_stamped: false,
            import_generation: import.generation(),
            reply: None,
        }
    }
}

/// Callback invoked with the finished request and its outcome when an
/// asynchronously dispatched RPC completes.
pub type InterpretFn = Box<dyn FnOnce(&mut Request, RpcCode) + Send>;

/// The RPC transport as seen by the lock engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Allocates a request against the import.
    fn new_request(&self, import: &Arc<Import>, opcode: Opcode, desc: LockDesc)
        -> Result<Request>;

    /// Sends synchronously and waits for the reply, filling
    /// `req.reply`.
    async fn queue_wait(&self, req: &mut Request) -> RpcCode;

    /// Hands the request to the async dispatcher. The interpret
    /// callback, if any, runs when the reply (or failure) comes back.
    fn dispatch(&self, req: Request, interpret: Option<InterpretFn>);

    /// Kicks the import into recovery because a request timed out at
    /// the given connection count.
    fn fail_import(&self, import: &Arc<Import>, conn_cnt: u32);

    /// Initiates a reconnect of a failed import.
    fn connect_import(&self, import: &Arc<Import>);

    /// Advances the import recovery state machine after a replay ack.
    fn recovery_advance(&self, import: &Arc<Import>);
}
