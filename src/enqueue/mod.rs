//! Client-side lock enqueue: building the request, reconciling the
//! reply and undoing partial state on failure.


use std::sync::Arc;

use crate::cancel::{cancel_list, release_batch, CancelFlags};
use crate::completion::{run_completion, AstData};
use crate::error::{Error, Result};
use crate::export::Export;
use crate::lock::{
    CallbackSet, Lock, LockFlags, LockHandle, LockMode, LockType, LvbType, PolicyData,
};
use crate::lru::{cancel_lru_local, LruFlags};
use crate::namespace::Namespace;
use crate::transport::{Request, RpcCode, Transport};
use crate::wire::{
    handles_avail, policy_from_wire, request_bufsize, LockDesc, Opcode,
    ENQUEUE_CANCEL_OFF, MSG_OVERHEAD,
};

/// Caller-supplied description of the lock being acquired.
#[derive(Clone)]
pub struct EnqueueInfo {
    pub lock_type: LockType,
    pub mode: LockMode,
    pub callbacks: CallbackSet,
    /// Opaque context delivered back through the completion path; its
    /// presence enables the adaptive-timeout measurement.
    pub ast_data: Option<AstData>,
}

/// How a successful [`enqueue`] call ended.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Synchronous path: the reply has been reconciled.
    Done,
    /// Async path: the filled request is handed back for the caller to
    /// dispatch; finish with [`enqueue_fini`].
    Deferred(Request),
}

/// Cancel LRU locks and pack them into an enqueue-class request being
/// prepared, so the cancels ride for free. Packs up to the request's
/// spare handle capacity; the overflow goes out as separate cancel
/// RPCs.
pub async fn prep_elc_req(
    transport: &Arc<dyn Transport>,
    exp: &Arc<Export>,
    req: &mut Request,
    opcode: Opcode,
    canceloff: usize,
    cancels: Vec<Arc<Lock>>,
    count: usize,
) -> Result<()> {
    let ns = exp.namespace();
    let mut cancels = cancels;
    let mut count = count;

    if !ns.caps().cancelset {
        // Without the negotiated capability extra cancel RPCs would
        // only slow the enqueue down.
        let n = cancels.len();
        release_batch(&mut cancels, n);
        return Ok(());
    }

    let avail = handles_avail(MSG_OVERHEAD + req.body.wire_size(), canceloff);
    let lru_flags = if ns.caps().lru_resize {
        LruFlags::LRUR_NO_WAIT
    } else {
        LruFlags::AGED
    };
    let to_free = usize::from(!ns.caps().lru_resize && opcode == Opcode::Enqueue);

    if avail > count {
        count += cancel_lru_local(
            transport,
            ns,
            &mut cancels,
            to_free,
            avail - count,
            CancelFlags::empty(),
            lru_flags,
        )
        .await;
    }
    let pack = count.min(avail);
    req.buf_size = request_bufsize(pack, opcode);

    if canceloff > 0 {
        // Reserve the leading slots for the requested lock; packing
        // continues after them.
        req.body.lock_count = canceloff as u32;
        req.body.handles.resize(canceloff, 0);
    }
    cancel_list(transport, &mut cancels, pack, Some(req), CancelFlags::empty()).await;
    cancel_list(transport, &mut cancels, count - pack, None, CancelFlags::empty()).await;
    Ok(())
}

/// [`prep_elc_req`] specialized for the ENQUEUE layout.
pub async fn prep_enqueue_req(
    transport: &Arc<dyn Transport>,
    exp: &Arc<Export>,
    req: &mut Request,
    cancels: Vec<Arc<Lock>>,
    count: usize,
) -> Result<()> {
    prep_elc_req(transport, exp, req, Opcode::Enqueue, ENQUEUE_CANCEL_OFF, cancels, count).await
}

/// Allocates and prepares an enqueue request expecting an LVB of
/// `lvb_len` bytes in the reply.
pub(crate) async fn enqueue_pack(
    transport: &Arc<dyn Transport>,
    exp: &Arc<Export>,
    lvb_len: usize,
) -> Result<Request> {
    let mut req = transport.new_request(exp.import(), Opcode::Enqueue, LockDesc::empty())?;
    prep_enqueue_req(transport, exp, &mut req, Vec::new(), 0).await?;
    req.reply_size = lvb_len;
    Ok(req)
}

/// Arms a failed, partially installed lock for quiet local teardown.
///
/// The failure races the server's own error reply, so the lock must
/// never produce a CANCEL RPC that would cross it; it dies locally.
/// Failed flock locks have no blocking callback to drive destruction
/// later and are killed on the spot.
pub(crate) fn failed_lock_cleanup(ns: &Arc<Namespace>, lock: &Arc<Lock>, mode: LockMode) {
    let need_cancel = {
        let mut st = lock.state();
        if st.granted_mode != Some(st.req_mode) && !st.flags.contains(LockFlags::FAILED) {
            st.flags |= LockFlags::LOCAL_ONLY
                | LockFlags::FAILED
                | LockFlags::ATOMIC_CB
                | LockFlags::CBPENDING;
            true
        } else {
            false
        }
    };

    if need_cancel {
        tracing::debug!(
            cookie = lock.cookie(),
            namespace = ns.name(),
            "setting LOCAL_ONLY | FAILED | ATOMIC_CB | CBPENDING"
        );
    } else {
        tracing::debug!(cookie = lock.cookie(), "lock was granted or failed in race");
    }

    if lock.lock_type() == LockType::Flock {
        if !lock.flags().contains(LockFlags::DESTROYED) {
            lock.unlink_from_resource();
            lock.drop_ref_counts(mode);
            lock.destroy();
        }
    } else {
        lock.decref(mode);
    }
}

/// Client-side lock enqueue.
///
/// A replay enqueue re-asserts a lock the caller already owns through
/// `lockh`; otherwise a fresh lock is created and `lockh` receives its
/// handle. With `async_mode` the prepared request is handed back in
/// [`EnqueueOutcome::Deferred`] instead of being sent; the caller
/// dispatches it and finishes with [`enqueue_fini`]. A request with
/// caller-specific preparation can be passed in `prealloc`.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue(
    transport: &Arc<dyn Transport>,
    exp: &Arc<Export>,
    einfo: &EnqueueInfo,
    res_id: crate::resource::ResourceId,
    policy: Option<PolicyData>,
    flags: &mut LockFlags,
    lvb: Option<&mut Vec<u8>>,
    lvb_len: usize,
    lvb_type: LvbType,
    lockh: &mut LockHandle,
    async_mode: bool,
    prealloc: Option<Request>,
) -> Result<EnqueueOutcome> {
    let ns = exp.namespace().clone();
    let is_replay = flags.contains(LockFlags::REPLAY);

    // A replayed lock only gets its invariants checked; a new lock gets
    // everything set up.
    let lock = if is_replay {
        let Some(lock) = ns.lock_by_handle(*lockh) else {
            debug_assert!(false, "replay enqueue of an unknown handle");
            return Err(Error::Stale);
        };
        tracing::debug!(cookie = lock.cookie(), "client-side enqueue START (replay)");
        debug_assert!(lock.conn_export().is_some_and(|e| Arc::ptr_eq(&e, exp)));
        lock
    } else {
        let lock = Lock::create(
            &ns,
            res_id,
            einfo.lock_type,
            einfo.mode,
            einfo.callbacks.clone(),
            einfo.ast_data.clone(),
            lvb_len,
            lvb_type,
        );
        lock.addref_internal(einfo.mode);
        *lockh = lock.handle();
        match policy {
            Some(policy) => lock.state().policy = policy,
            // An extent lock without an extent is a caller bug.
            None => assert!(einfo.lock_type != LockType::Extent, "extent lock without policy"),
        }
        tracing::debug!(cookie = lock.cookie(), flags = ?flags, "client-side enqueue START");
        lock
    };

    lock.set_conn_export(exp.clone());
    {
        let mut st = lock.state();
        st.flags |= *flags & (LockFlags::NO_LRU | LockFlags::EXCL);
    }
    lock.touch_activity();

    // Lock not sent to the server yet.
    let mut req = match prealloc {
        Some(req) => req,
        None => match enqueue_pack(transport, exp, lvb_len).await {
            Ok(req) => req,
            Err(err) => {
                failed_lock_cleanup(&ns, &lock, einfo.mode);
                return Err(err);
            }
        },
    };

    // Dump lock data into the request buffer.
    req.body.desc = lock.to_desc();
    req.body.flags = flags.to_wire();
    if req.body.handles.is_empty() {
        req.body.handles.push(lock.cookie());
    } else {
        req.body.handles[0] = lock.cookie();
    }

    if async_mode {
        return Ok(EnqueueOutcome::Deferred(req));
    }

    tracing::debug!(cookie = lock.cookie(), "sending request");
    let rc = transport.queue_wait(&mut req).await;

    let fini = enqueue_fini(
        transport,
        exp,
        &mut req,
        einfo.lock_type,
        policy.is_some(),
        einfo.mode,
        flags,
        lvb,
        lvb_len,
        *lockh,
        rc,
    )
    .await;

    match fini {
        // The reply found the lock already freed; the reference taken
        // above dies with this frame and the RPC verdict stands.
        Err(Error::NoLock) => {
            if rc.is_ok() {
                Ok(EnqueueOutcome::Done)
            } else {
                Err(rc.to_error())
            }
        }
        Err(err) => Err(err),
        Ok(()) => Ok(EnqueueOutcome::Done),
    }
}

/// Finishing portion of the client enqueue: reconciles the server
/// reply with local lock state. Called after the reply arrives, on
/// both the sync and async paths.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue_fini(
    transport: &Arc<dyn Transport>,
    exp: &Arc<Export>,
    req: &mut Request,
    lock_type: LockType,
    with_policy: bool,
    mode: LockMode,
    flags: &mut LockFlags,
    lvb: Option<&mut Vec<u8>>,
    lvb_len: usize,
    lockh: LockHandle,
    rc: RpcCode,
) -> Result<()> {
    let ns = exp.namespace().clone();
    let is_replay = flags.contains(LockFlags::REPLAY);
    let mut lvb = lvb;

    let Some(lock) = ns.lock_by_handle(lockh) else {
        // Only flock locks legitimately vanish between the send and
        // the reply; anything else is a caller bug.
        debug_assert!(lock_type == LockType::Flock, "enqueue reply for unknown handle");
        return Err(Error::NoLock);
    };

    debug_assert!(lvb_len == 0 || lvb_len == lock.lvb_len());

    // Runs the failure path unless the lock makes it past installation.
    let mut cleanup = true;

    let result: Result<()> = 'reconcile: {
        if !rc.is_ok() {
            debug_assert!(!is_replay);
            tracing::debug!(
                cookie = lock.cookie(),
                aborted = rc == RpcCode::LockAborted,
                "client-side enqueue END"
            );
            if rc != RpcCode::LockAborted {
                break 'reconcile Err(rc.to_error());
            }
        }

        let Some(reply) = req.reply.take() else {
            break 'reconcile Err(Error::Proto);
        };

        // Validate and clip the replied LVB length.
        let mut reply_lvb_len = 0;
        if lvb_len > 0 {
            if let Some(data) = &reply.lvb {
                if data.len() > lvb_len {
                    tracing::error!(
                        cookie = lock.cookie(),
                        expected = lvb_len,
                        replied = data.len(),
                        "replied LVB is larger than expectation"
                    );
                    break 'reconcile Err(Error::Inval);
                }
                reply_lvb_len = data.len();
            }
        }

        if rc == RpcCode::LockAborted {
            if reply_lvb_len > 0 {
                if let (Some(buf), Some(data)) = (lvb.as_deref_mut(), &reply.lvb) {
                    buf.clear();
                    buf.extend_from_slice(&data[..reply_lvb_len]);
                }
            }
            break 'reconcile Err(Error::Aborted);
        }

        // This lock is now known to the server.
        cleanup = false;

        exp.rehash_lock(&lock, reply.handle);

        *flags = LockFlags::from_wire(reply.flags);
        {
            let mut st = lock.state();
            st.flags |= LockFlags::from_wire(reply.flags) & LockFlags::INHERIT_MASK;
        }
        tracing::debug!(
            cookie = lock.cookie(),
            remote = reply.handle,
            flags = ?flags,
            "reply received"
        );

        // The server may have granted a different mode or resource.
        if flags.contains(LockFlags::LOCK_CHANGED) {
            debug_assert!(!is_replay);
            let newmode = reply.desc.req_mode;
            {
                let mut st = lock.state();
                if newmode != st.req_mode {
                    tracing::debug!(cookie = lock.cookie(), ?newmode, "server returned different mode");
                    st.req_mode = newmode;
                }
            }

            if reply.desc.resource != lock.resource().name() {
                ns.change_resource(&lock, reply.desc.resource);
                tracing::debug!(cookie = lock.cookie(), "client-side enqueue, new resource");
            }

            if with_policy && !(lock_type == LockType::Ibits && !ns.caps().ibits) {
                // Lock type cannot change on the server.
                let res_type = lock.resource().lock_type();
                lock.state().policy = policy_from_wire(res_type, reply.desc.policy);
            }
            if lock_type != LockType::Plain {
                tracing::debug!(cookie = lock.cookie(), "client-side enqueue, new policy data");
            }
        }

        if flags.contains(LockFlags::AST_SENT) {
            let mut st = lock.state();
            st.flags |= LockFlags::CBPENDING | LockFlags::BL_AST;
            drop(st);
            tracing::debug!(cookie = lock.cookie(), "enqueue reply includes blocking AST");
        }

        // A racing completion callback may have installed a fresher
        // LVB; only a still-ungranted lock takes the reply's copy.
        if reply_lvb_len > 0 {
            let mut st = lock.state();
            if st.granted_mode != Some(st.req_mode) {
                if let Some(data) = &reply.lvb {
                    crate::lock::fill_lvb(&mut st, data);
                }
            }
        }

        if !is_replay {
            lock.install_from_reply(*flags);
            let data = lock.ast_data().cloned();
            if let Err(err) = run_completion(transport.as_ref(), &lock, *flags, data.as_ref()).await
            {
                cleanup = true;
                break 'reconcile Err(err);
            }
        }

        // Copy the LVB out here and not earlier: a completion callback
        // may override what came in the reply.
        if lvb_len > 0 {
            if let Some(buf) = lvb.as_deref_mut() {
                let st = lock.state();
                let n = lvb_len.min(st.lvb.len());
                buf.clear();
                buf.extend_from_slice(&st.lvb[..n]);
            }
        }

        tracing::debug!(cookie = lock.cookie(), "client-side enqueue END");
        Ok(())
    };

    if cleanup && result.is_err() {
        failed_lock_cleanup(&ns, &lock, mode);
    }
    // Both the caller's reference and the lookup reference die here.
    result
}
