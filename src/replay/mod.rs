//! Lock replay after server recovery: every surviving lock is
//! re-asserted so the server's view matches the client's.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::cancel::CancelFlags;
use crate::error::{Error, Result};
use crate::import::Import;
use crate::lock::{Lock, LockFlags, ResLink};
use crate::lru::{cancel_lru_local, LruFlags};
use crate::namespace::Namespace;
use crate::transport::{Request, RpcCode, SendState, Transport};
use crate::wire::Opcode;

/// Classifies a lock by its pre-disconnect disposition: granted,
/// converting, waiting, or in flight without a known answer.
fn replay_flags(lock: &Lock) -> LockFlags {
    let st = lock.state();
    if st.granted_mode == Some(st.req_mode) {
        LockFlags::REPLAY | LockFlags::BLOCK_GRANTED
    } else if st.granted_mode.is_some() {
        LockFlags::REPLAY | LockFlags::BLOCK_CONV
    } else if st.res_link != ResLink::None {
        LockFlags::REPLAY | LockFlags::BLOCK_WAIT
    } else {
        // The enqueue that triggered recovery; no reply was ever seen.
        LockFlags::REPLAY
    }
}

/// Interpret callback of one replay RPC.
fn replay_lock_interpret(
    transport: &Arc<dyn Transport>,
    imp: &Arc<Import>,
    cookie: u64,
    req: &mut Request,
    rc: RpcCode,
) -> Result<()> {
    imp.dec_replay_inflight();

    let outcome: Result<()> = 'interpret: {
        if !rc.is_ok() {
            break 'interpret Err(rc.to_error());
        }
        let Some(reply) = req.reply.take() else {
            break 'interpret Err(Error::Proto);
        };
        let Some(lock) = imp.namespace().lock_by_handle(crate::lock::LockHandle(cookie)) else {
            tracing::error!(
                cookie,
                remote = reply.handle,
                "received replay ack for unknown local cookie"
            );
            break 'interpret Err(Error::Stale);
        };

        // Rekey the per-export index under the fresh server cookie.
        if let Some(exp) = lock.conn_export() {
            exp.rehash_lock(&lock, reply.handle);
        } else {
            lock.state().remote_handle = reply.handle;
        }

        tracing::debug!(cookie, remote = reply.handle, "replayed lock");
        transport.recovery_advance(imp);
        Ok(())
    };

    if outcome.is_err() {
        transport.connect_import(imp);
    }
    outcome
}

/// Re-asserts a single lock to the server.
fn replay_one_lock(
    transport: &Arc<dyn Transport>,
    imp: &Arc<Import>,
    lock: &Arc<Lock>,
) -> Result<()> {
    // A lock whose blocking callback already ran is on its way out;
    // the server has nothing to learn from it.
    if lock.flags().contains(LockFlags::BL_DONE) {
        tracing::debug!(cookie = lock.cookie(), "not replaying canceled lock");
        return Ok(());
    }

    // A reply-less lock cannot be replayed: the server may have
    // dropped it during the outage and granted a conflicting lock;
    // notification of that was lost with the connection.
    if lock.flags().contains(LockFlags::CANCEL_ON_BLOCK) {
        tracing::debug!(cookie = lock.cookie(), "not replaying reply-less lock");
        lock.lock_cancel();
        return Ok(());
    }

    let flags = replay_flags(lock);

    let mut req = transport.new_request(imp, Opcode::Enqueue, lock.to_desc())?;
    // Recovery traffic must not park behind the queue it is refilling.
    req.send_state = SendState::ReplayLocks;
    req.body.flags = flags.to_wire();
    req.body.handles.resize(1, 0);
    req.body.handles[0] = lock.cookie();
    req.reply_size = lock.lvb_len();
    // Tells the server the replay phase closes with this batch.
    req.replay_done = true;

    tracing::debug!(cookie = lock.cookie(), flags = ?flags, "replaying lock");

    imp.inc_replay_inflight();
    let cookie = lock.cookie();
    let transport2 = transport.clone();
    let imp2 = imp.clone();
    transport.dispatch(
        req,
        Some(Box::new(move |req, rc| {
            let _ = replay_lock_interpret(&transport2, &imp2, cookie, req, rc);
        })),
    );
    Ok(())
}

/// Drops as many unused locks as possible before replay. The client
/// may cache thousands of unused locks; shedding them locally keeps
/// the recovering server from drowning. No RPCs are sent and nothing
/// waits: recovery context cannot afford either.
async fn cancel_unused_locks_for_replay(transport: &Arc<dyn Transport>, ns: &Arc<Namespace>) {
    tracing::debug!(
        namespace = ns.name(),
        unused = ns.nr_unused(),
        "dropping unused locks before replay"
    );
    let mut cancels = Vec::new();
    let nr = ns.nr_unused();
    let canceled = cancel_lru_local(
        transport,
        ns,
        &mut cancels,
        nr,
        0,
        CancelFlags::LOCAL,
        LruFlags::NO_WAIT,
    )
    .await;
    tracing::debug!(namespace = ns.name(), canceled, "canceled unused locks");
}

/// Replays every surviving lock of the import's namespace, classified
/// by pre-disconnect disposition. Triggered once per reconnect, right
/// after the transport re-establishes the connection.
pub async fn replay_locks(transport: &Arc<dyn Transport>, imp: &Arc<Import>) -> Result<()> {
    let ns = imp.namespace().clone();

    debug_assert_eq!(imp.replay_inflight(), 0);

    // A failed prior recovery means these locks are already lost.
    if imp.vbr_failed() {
        return Ok(());
    }

    // Hold the counter above zero so it cannot hit it while replays
    // are still being scheduled.
    imp.inc_replay_inflight();

    if ns.tunables().cancel_unused_locks_before_replay {
        cancel_unused_locks_for_replay(transport, &ns).await;
    }

    // Locks left behind by eviction or mid-cancel never replay.
    let mut chain = Vec::new();
    ns.for_each_lock(|lock| {
        if !lock.flags().intersects(LockFlags::FAILED | LockFlags::BL_DONE) {
            chain.push(lock.clone());
        }
    });

    let mut result = Ok(());
    for lock in chain {
        if result.is_err() {
            continue;
        }
        result = replay_one_lock(transport, imp, &lock);
    }

    imp.dec_replay_inflight();
    result
}
