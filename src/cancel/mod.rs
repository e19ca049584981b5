//! The cancellation pipeline: local bookkeeping, batched cancel RPCs
//! and the split between voluntary cancels and those driven by a
//! blocking callback.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use bitflags::bitflags;

use crate::bl_task::BlWork;
use crate::error::Result;
use crate::fault::FaultSite;
use crate::lock::{BlockingReason, Lock, LockFlags, LockHandle, LockMode, PolicyData};
use crate::namespace::Namespace;
use crate::resource::{Resource, ResourceId};
use crate::transport::{Request, RpcCode, Transport};
use crate::wire::{
    format_handles_avail, request_bufsize, Opcode, BASE_WIRE_SIZE, CANCEL_PORTALS,
    HANDLE_WIRE_SIZE, LOCKREQ_HANDLES,
};

bitflags! {
    /// Caller-supplied cancel behavior.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct CancelFlags: u32 {
        /// Do not wait on somebody else's in-flight cancel.
        const ASYNC = 0x1;
        /// Cancel locally only; never tell the server.
        const LOCAL = 0x2;
        /// Blocking-callback-driven cancels may ride in this batch.
        const BL_AST = 0x4;
    }
}

/// What a local cancel decided about server notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CancelPath {
    /// No CANCEL RPC is owed to the server.
    LocalOnly,
    /// An ordinary CANCEL RPC is owed.
    Canceling,
    /// A CANCEL RPC is owed, but it must travel separately from
    /// voluntary cancels.
    BlAst,
}

/// Local cancel of a single lock: marks it dying, runs the cancel
/// notification once, and removes it from its resource. Returns what
/// kind of server notification is still owed.
pub(crate) fn cancel_local(lock: &Arc<Lock>) -> CancelPath {
    if lock.conn_export().is_none() {
        debug_assert!(false, "trying to cancel a lock with no connection");
        tracing::error!(cookie = lock.cookie(), "cancel of a lock with no connection");
        lock.lock_cancel();
        return CancelPath::LocalOnly;
    }

    tracing::debug!(cookie = lock.cookie(), "client-side cancel");
    let (local_only, need_cb, owed) = {
        let mut st = lock.state();
        st.flags |= LockFlags::CBPENDING;
        let local_only =
            st.flags.intersects(LockFlags::LOCAL_ONLY | LockFlags::CANCEL_ON_BLOCK);
        let need_cb = !st.flags.contains(LockFlags::CANCEL);
        if need_cb {
            st.flags |= LockFlags::CANCEL;
        }
        let owed = if st.flags.contains(LockFlags::BL_AST) {
            CancelPath::BlAst
        } else {
            CancelPath::Canceling
        };
        (local_only, need_cb, owed)
    };

    // The cancel notification frees lock-specific caller state; it must
    // run outside the lock's mutex.
    if need_cb {
        if let Some(cb) = lock.callbacks().blocking.clone() {
            cb(lock, BlockingReason::Canceling);
        }
    }

    let owed = if local_only {
        tracing::debug!(cookie = lock.cookie(), "not sending request (at caller's instruction)");
        CancelPath::LocalOnly
    } else {
        owed
    };

    lock.lock_cancel();
    owed
}

/// Client-side lock cancel. The lock must carry no readers or writers
/// by this time.
pub async fn cli_cancel(
    transport: &Arc<dyn Transport>,
    ns: &Arc<Namespace>,
    handle: LockHandle,
    flags: CancelFlags,
) -> Result<()> {
    let Some(lock) = ns.lock_by_handle(handle) else {
        tracing::debug!(handle = handle.0, "lock is already being destroyed");
        return Ok(());
    };

    {
        let mut st = lock.state();
        // Somebody else owns the cancel and the caller will not wait.
        if st.flags.contains(LockFlags::CANCELING) && flags.contains(CancelFlags::ASYNC) {
            return Ok(());
        }
        st.flags |= LockFlags::CANCELING;
    }

    let owed = cancel_local(&lock);
    if owed == CancelPath::LocalOnly || flags.contains(CancelFlags::LOCAL) {
        return Ok(());
    }

    // Even a blocking-callback-driven cancel goes to the cancel portal
    // here, so other LRU locks can share the RPC.
    {
        let mut st = lock.state();
        debug_assert!(!st.on_bl_list);
        st.on_bl_list = true;
    }
    let mut cancels = vec![lock.clone()];
    let mut count = 1;

    if ns.caps().cancelset {
        let avail = format_handles_avail(Opcode::Cancel, 0);
        debug_assert!(avail > 0);
        let lru_flags = if ns.caps().lru_resize {
            crate::lru::LruFlags::LRUR
        } else {
            crate::lru::LruFlags::AGED
        };
        count += crate::lru::cancel_lru_local(
            transport,
            ns,
            &mut cancels,
            0,
            avail - 1,
            CancelFlags::BL_AST,
            lru_flags,
        )
        .await;
    }

    cancel_list(transport, &mut cancels, count, None, flags).await;
    Ok(())
}

/// Locally cancels up to `count` locks at the front of `cancels`.
/// Locks owing no RPC leave the batch; blocking-callback-driven ones
/// are shipped in their own RPC unless the caller said they may stay.
/// Returns how many locks remain for the caller's RPC.
pub(crate) async fn cancel_list_local(
    transport: &Arc<dyn Transport>,
    cancels: &mut Vec<Arc<Lock>>,
    count: usize,
    flags: CancelFlags,
) -> usize {
    let tail = cancels.split_off(count.min(cancels.len()));
    let mut keep = Vec::with_capacity(cancels.len());
    let mut bl_batch = Vec::new();

    for lock in cancels.drain(..) {
        let owed = if flags.contains(CancelFlags::LOCAL) {
            lock.lock_cancel();
            CancelPath::LocalOnly
        } else {
            cancel_local(&lock)
        };

        if !flags.contains(CancelFlags::BL_AST) && owed == CancelPath::BlAst {
            tracing::debug!(cookie = lock.cookie(), "cancel lock separately");
            bl_batch.push(lock);
            continue;
        }
        if owed == CancelPath::LocalOnly {
            lock.state().on_bl_list = false;
            continue;
        }
        keep.push(lock);
    }

    let remaining = keep.len();
    *cancels = keep;
    cancels.extend(tail);

    if !bl_batch.is_empty() {
        let n = bl_batch.len();
        cancel_list(transport, &mut bl_batch, n, None, CancelFlags::empty()).await;
    }
    remaining
}

/// Ships `count` locks from `cancels`, either packed into an existing
/// request buffer (piggyback) or as dedicated CANCEL RPCs sliced per
/// export capability. The shipped locks leave the batch.
pub(crate) async fn cancel_list(
    transport: &Arc<dyn Transport>,
    cancels: &mut Vec<Arc<Lock>>,
    mut count: usize,
    mut piggyback: Option<&mut Request>,
    flags: CancelFlags,
) {
    if cancels.is_empty() || count == 0 {
        return;
    }

    while count > 0 {
        debug_assert!(!cancels.is_empty());
        let first = cancels[0].clone();
        let Some(exp) = first.conn_export() else {
            debug_assert!(false, "cancel batch entry with no connection");
            release_batch(cancels, 1);
            count -= 1;
            continue;
        };

        let sent = if exp.namespace().caps().cancelset {
            if let Some(req) = piggyback.as_deref_mut() {
                cancel_pack(req, cancels, count);
                count
            } else {
                match cancel_req(transport, &exp, cancels, count, flags).await {
                    Ok(sent) => sent,
                    Err(err) => {
                        tracing::debug!(%err, "cancel RPC failed: canceling anyway");
                        count
                    }
                }
            }
        } else {
            match cancel_req(transport, &exp, cancels, 1, flags).await {
                Ok(sent) => sent.max(1),
                Err(err) => {
                    tracing::debug!(%err, "cancel RPC failed: canceling anyway");
                    1
                }
            }
        };

        count -= sent.min(count);
        release_batch(cancels, sent);
    }
}

/// Prepares and sends one batched cancel RPC carrying up to `count`
/// remote handles from `cancels`. Returns how many were covered.
pub(crate) async fn cancel_req(
    transport: &Arc<dyn Transport>,
    exp: &Arc<crate::export::Export>,
    cancels: &[Arc<Lock>],
    count: usize,
    flags: CancelFlags,
) -> Result<usize> {
    debug_assert!(count > 0);

    let faults = exp.namespace().faults();
    if let Some(pause) = faults.take_pause() {
        tokio::time::sleep(pause).await;
    }
    if faults.check_reset(FaultSite::CancelRace) {
        return Ok(count);
    }

    let free = format_handles_avail(Opcode::Cancel, 0);
    let count = count.min(free);
    let imp = exp.import();

    loop {
        if imp.is_invalid() {
            // Nothing to tell a dead server; the caller's bookkeeping
            // still drains.
            tracing::debug!("skipping cancel on invalid import");
            return Ok(count);
        }

        let mut req = transport.new_request(imp, Opcode::Cancel, cancels[0].to_desc())?;
        req.buf_size = request_bufsize(count, Opcode::Cancel);
        req.portals = CANCEL_PORTALS;
        req.at_stamped = true;
        cancel_pack(&mut req, cancels, count);
        req.reply_size = 0;

        if flags.contains(CancelFlags::ASYNC) {
            transport.dispatch(req, None);
            return Ok(count);
        }

        match transport.queue_wait(&mut req).await {
            RpcCode::Ok => return Ok(count),
            RpcCode::Stale => {
                tracing::debug!("client/server out of sync -- not fatal");
                return Ok(count);
            }
            RpcCode::Timeout if req.import_generation == imp.generation() => {
                // Same connection, no reply: ask again.
                continue;
            }
            code => {
                if code == RpcCode::Shutdown {
                    tracing::debug!(?code, "cancel RPC refused on shutdown");
                } else {
                    tracing::error!(?code, "cancel RPC failed");
                }
                return Err(code.to_error());
            }
        }
    }
}

/// Packs up to `count` remote handles from `cancels` into the request
/// buffer, honoring the handle capacity implied by its size.
pub(crate) fn cancel_pack(req: &mut Request, cancels: &[Arc<Lock>], count: usize) {
    let max = (req.buf_size - BASE_WIRE_SIZE) / HANDLE_WIRE_SIZE + LOCKREQ_HANDLES;
    debug_assert!(max >= req.body.lock_count as usize + count);

    let mut packed = 0;
    for lock in cancels.iter().take(count) {
        debug_assert!(lock.conn_export().is_some());
        let slot = req.body.lock_count as usize;
        if req.body.handles.len() <= slot {
            req.body.handles.resize(slot + 1, 0);
        }
        req.body.handles[slot] = lock.remote_handle();
        req.body.lock_count += 1;
        packed += 1;
    }
    tracing::debug!(packed, "locks packed into cancel request");
}

/// Drops the first `n` locks from a cancel batch, returning their
/// exclusive batch membership.
pub(crate) fn release_batch(cancels: &mut Vec<Arc<Lock>>, n: usize) {
    for lock in cancels.drain(..n.min(cancels.len())) {
        lock.state().on_bl_list = false;
    }
}

/// Collects unused locks on one resource that conflict with `mode`
/// (everything, when no mode is given), cancels them locally and
/// returns the batch still owing a server RPC.
pub(crate) async fn cancel_resource_local(
    transport: &Arc<dyn Transport>,
    res: &Arc<Resource>,
    policy: Option<&PolicyData>,
    mode: Option<LockMode>,
    lock_flags: LockFlags,
    cancel_flags: CancelFlags,
) -> (Vec<Arc<Lock>>, usize) {
    let mut cancels = Vec::new();

    for lock in res.granted() {
        let mut st = lock.state();
        if st.readers + st.writers > 0 {
            continue;
        }
        // Somebody is already cancelling, or a blocking callback will.
        if st.flags.intersects(LockFlags::BL_AST | LockFlags::CANCELING) {
            continue;
        }
        if let Some(mode) = mode {
            if st.granted_mode.is_some_and(|g| g.compatible(mode)) {
                continue;
            }
        }
        if let (Some(PolicyData::Ibits { bits }), PolicyData::Ibits { bits: have }) =
            (policy, &st.policy)
        {
            if bits & have == 0 {
                continue;
            }
        }
        st.flags |= LockFlags::CBPENDING | LockFlags::CANCELING | lock_flags;
        debug_assert!(!st.on_bl_list);
        st.on_bl_list = true;
        drop(st);
        cancels.push(lock);
    }

    let count = cancels.len();
    let remaining = cancel_list_local(transport, &mut cancels, count, cancel_flags).await;
    (cancels, remaining)
}

/// Cancels every unused lock on one resource, telling the server
/// unless `flags` says local-only.
pub async fn cancel_unused_resource(
    transport: &Arc<dyn Transport>,
    ns: &Arc<Namespace>,
    res_id: ResourceId,
    mode: Option<LockMode>,
    flags: CancelFlags,
) -> Result<()> {
    let Some(res) = ns.resource_find(res_id) else {
        tracing::debug!(?res_id, "no such resource");
        return Ok(());
    };
    let (mut cancels, count) = cancel_resource_local(
        transport,
        &res,
        None,
        mode,
        LockFlags::empty(),
        flags | CancelFlags::BL_AST,
    )
    .await;
    cancel_list(transport, &mut cancels, count, None, flags).await;
    Ok(())
}

/// Cancels every unused lock in the namespace (or on one resource, if
/// given).
pub async fn cancel_unused(
    transport: &Arc<dyn Transport>,
    ns: &Arc<Namespace>,
    res_id: Option<ResourceId>,
    flags: CancelFlags,
) -> Result<()> {
    if let Some(res_id) = res_id {
        return cancel_unused_resource(transport, ns, res_id, None, flags).await;
    }
    for res in ns.resources_snapshot() {
        let (mut cancels, count) = cancel_resource_local(
            transport,
            &res,
            None,
            None,
            LockFlags::empty(),
            flags | CancelFlags::BL_AST,
        )
        .await;
        cancel_list(transport, &mut cancels, count, None, flags).await;
    }
    Ok(())
}

/// Runs when the last user reference of a cancel-pending lock goes
/// away. Locks that owe the server nothing (or must tear down in the
/// caller's context) are cancelled right here; the rest go to the
/// blocking-AST service.
pub(crate) fn last_ref_cancel(lock: &Arc<Lock>) {
    let inline = {
        let st = lock.state();
        st.flags.intersects(
            LockFlags::ATOMIC_CB | LockFlags::LOCAL_ONLY | LockFlags::CANCEL_ON_BLOCK,
        )
    } || lock.conn_export().is_none();

    if !inline {
        if let Some(queue) = lock.namespace().bl_queue() {
            if queue.try_send(BlWork::Blocking { lock: lock.clone() }).is_ok() {
                return;
            }
        }
        tracing::warn!(
            cookie = lock.cookie(),
            "no blocking-AST service; cancelling locally"
        );
    }
    local_cancel_only(lock);
}

/// Synchronous local teardown: cancel notification plus resource-level
/// cancel, never an RPC. Used for locks flagged to die quietly.
pub(crate) fn local_cancel_only(lock: &Arc<Lock>) {
    let need_cb = {
        let mut st = lock.state();
        st.flags |= LockFlags::CANCELING;
        let need_cb = !st.flags.contains(LockFlags::CANCEL);
        if need_cb {
            st.flags |= LockFlags::CANCEL;
        }
        need_cb
    };
    if need_cb {
        if let Some(cb) = lock.callbacks().blocking.clone() {
            cb(lock, BlockingReason::Canceling);
        }
    }
    lock.lock_cancel();
}
