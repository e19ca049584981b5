//! Background blocking-AST service task.
//!
//! Deferred cancels and blocking-callback work are pushed onto a
//! channel and drained here, so the paths that discover the work never
//! sleep on the resulting RPCs.

use std::sync::Arc;

use async_channel::Receiver;
use tokio::task::JoinHandle;

use crate::cancel::{self, CancelFlags};
use crate::lock::{BlockingReason, Lock, LockFlags};
use crate::namespace::Namespace;
use crate::transport::Transport;

/// Work items accepted by the service.
pub enum BlWork {
    /// A harvested LRU batch to cancel.
    CancelList { locks: Vec<Arc<Lock>>, count: usize, flags: CancelFlags },
    /// A single lock whose blocking callback must run.
    Blocking { lock: Arc<Lock> },
}

/// Drains blocking-AST work; one per process is plenty.
pub struct BlTask {
    transport: Arc<dyn Transport>,
    recv: Receiver<BlWork>,
}

impl BlTask {
    /// Creates a new instance of [`BlTask`] and runs it.
    pub fn spawn(transport: Arc<dyn Transport>, recv: Receiver<BlWork>) -> JoinHandle<()> {
        tokio::spawn(Self { transport, recv }.run())
    }

    async fn run(self) {
        while let Ok(work) = self.recv.recv().await {
            match work {
                BlWork::CancelList { mut locks, count, flags } => {
                    let remaining =
                        cancel::cancel_list_local(&self.transport, &mut locks, count, flags).await;
                    cancel::cancel_list(&self.transport, &mut locks, remaining, None, flags).await;
                }
                BlWork::Blocking { lock } => {
                    handle_bl_callback(&self.transport, &lock).await;
                }
            }
        }
    }
}

/// Processes one blocking callback: notify the owner, cancel the lock,
/// and mark the callback as done.
async fn handle_bl_callback(transport: &Arc<dyn Transport>, lock: &Arc<Lock>) {
    tracing::debug!(cookie = lock.cookie(), "client blocking AST callback handler");
    if let Some(cb) = lock.callbacks().blocking.clone() {
        cb(lock, BlockingReason::Conflict);
    }
    let ns = lock.namespace().clone();
    let _ = cancel::cli_cancel(transport, &ns, lock.handle(), CancelFlags::empty()).await;
    lock.state().flags |= LockFlags::BL_DONE;
}

/// Spawns the blocking-AST service for a namespace and wires its work
/// queue in. Later submissions from the cancel and LRU engines land on
/// the returned task.
pub fn start_bl_service(ns: &Arc<Namespace>, transport: Arc<dyn Transport>) -> JoinHandle<()> {
    let (send, recv) = async_channel::unbounded();
    ns.attach_bl_queue(send);
    BlTask::spawn(transport, recv)
}
