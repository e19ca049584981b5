//! DLM Client - the client-side request engine of a distributed lock
//! manager.
//!
//! Applications acquire advisory locks on named resources held by a
//! remote lock server. This crate owns the client half of that
//! protocol: two-phase enqueue with completion waits, batched
//! cancellation, LRU eviction of unused locks, and replay of surviving
//! locks after a server reconnect. The RPC transport, wire framing
//! beyond the DLM buffers, and all server-side logic live behind the
//! [`transport::Transport`] seam.

pub mod bl_task;
pub mod cancel;
pub mod completion;
pub mod config;
pub mod enqueue;
pub mod error;
pub mod export;
pub mod fault;
pub mod import;
pub mod lock;
pub mod lru;
pub mod namespace;
pub mod pool;
pub mod replay;
pub mod resource;
pub mod timing;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
