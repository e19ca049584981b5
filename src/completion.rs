//! Completion handling: waking or parking the enqueuing task until its
//! lock is granted or cancelled.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fault::FaultSite;
use crate::lock::{CompletionStyle, Lock, LockFlags};
use crate::timing::now_seconds;
use crate::transport::Transport;

/// Opaque caller context threaded through completion; its presence
/// selects the measured branch of the completion tail.
pub type AstData = Arc<dyn Any + Send + Sync>;

/// Waiter predicate: the lock reached a state the enqueuer can act on.
/// Evaluated under the lock's own mutex.
pub fn is_granted_or_cancelled(lock: &Lock) -> bool {
    let st = lock.state();
    st.granted_mode == Some(st.req_mode)
        || st.flags.intersects(
            LockFlags::FAILED
                | LockFlags::DESTROYED
                | LockFlags::CANCEL
                | LockFlags::CANCELING,
        )
}

/// Completion timeout covering the enqueue, a possible blocking
/// callback to another client, its data flush and cancel, and the
/// replies to all of those.
pub fn cp_timeout(lock: &Lock) -> u64 {
    let tun = lock.namespace().tunables();
    if tun.at_off {
        return tun.obd_timeout;
    }
    // The server may have to call back a lock from another client and
    // evict it on silence before we get our grant.
    let estimate = lock.namespace().at_estimate().at_get() as u64;
    (3 * estimate).max(tun.enqueue_min)
}

/// Timings update once the lock is actually granted. Immediately
/// granted locks (no caller context) skip the estimator: only waits
/// that crossed the server feed it.
fn completion_tail(lock: &Arc<Lock>, data: Option<&AstData>) -> Result<()> {
    let (gone, last_activity) = {
        let st = lock.state();
        (st.flags.is_gone(), st.last_activity)
    };
    if gone {
        tracing::debug!(cookie = lock.cookie(), "client-side enqueue: destroyed");
        return Err(Error::IO);
    }
    if data.is_none() {
        tracing::debug!(cookie = lock.cookie(), "client-side enqueue: granted");
        return Ok(());
    }
    let delay = now_seconds().saturating_sub(last_activity);
    tracing::debug!(cookie = lock.cookie(), delay, "client-side enqueue: granted after wait");
    lock.namespace().at_estimate().at_measured(delay);
    Ok(())
}

/// Handles an expired completion wait. A lock with no usable
/// connection just logs and dumps its namespace now and then; a remote
/// lock kicks its import into recovery. Either way the waiter goes
/// back to sleep.
fn expired_completion_wait(transport: &dyn Transport, lock: &Arc<Lock>, conn_cnt: u32) {
    match lock.conn_export() {
        None => {
            tracing::error!(
                cookie = lock.cookie(),
                "lock timed out; no connection to recover, going back to sleep"
            );
            lock.namespace().dump_rate_limited();
        }
        Some(exp) => {
            tracing::error!(
                cookie = lock.cookie(),
                namespace = lock.namespace().name(),
                "lock timed out, entering recovery"
            );
            transport.fail_import(exp.import(), conn_cnt);
        }
    }
}

/// Non-sleeping completion handler for callers that cannot block: it
/// only wakes waiters on a granted lock and reports progress on a
/// blocked one.
pub fn completion_ast_async(lock: &Arc<Lock>, flags: LockFlags, data: Option<&AstData>) -> Result<()> {
    if flags == LockFlags::WAIT_NOREPROC {
        tracing::debug!(cookie = lock.cookie(), "enqueue waiting on pending lock");
        return Ok(());
    }
    if !flags.is_blocked() {
        lock.wake();
        return completion_tail(lock, data);
    }
    tracing::debug!(cookie = lock.cookie(), "enqueue returned a blocked lock, going forward");
    Ok(())
}

/// Generic completion handler. Invoked when an enqueue reply arrives,
/// when a server completion callback lands, when a caller insists on a
/// populated LVB, and during resource teardown to flush waiters. If
/// the lock is not granted yet, parks until it becomes granted or
/// cancelled.
pub async fn completion_ast(
    transport: &dyn Transport,
    lock: &Arc<Lock>,
    flags: LockFlags,
    data: Option<&AstData>,
) -> Result<()> {
    if flags == LockFlags::WAIT_NOREPROC {
        tracing::debug!(cookie = lock.cookie(), "enqueue waiting on pending lock");
    } else if !flags.is_blocked() {
        lock.wake();
        return Ok(());
    } else {
        tracing::debug!(cookie = lock.cookie(), "enqueue returned a blocked lock, sleeping");
    }

    let timeout = cp_timeout(lock);
    lock.touch_activity();

    let conn_cnt = lock
        .conn_export()
        .map(|exp| exp.import().conn_cnt())
        .unwrap_or(0);

    if lock.namespace().faults().check_reset(FaultSite::IntrCpAst) {
        // The interrupted waiter leaves a window for a racing server
        // callback; leave the race site armed for tests to observe.
        lock.namespace().faults().arm(FaultSite::CpBlRace);
        tracing::debug!(cookie = lock.cookie(), "completion wait interrupted");
        return Err(Error::Interrupted);
    }

    let no_timeout = lock.flags().contains(LockFlags::NO_TIMEOUT);
    if no_timeout {
        tracing::debug!(cookie = lock.cookie(), "waiting indefinitely");
    }

    loop {
        let notified = lock.waitq().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if is_granted_or_cancelled(lock) {
            break;
        }
        if no_timeout {
            notified.await;
        } else {
            match tokio::time::timeout(Duration::from_secs(timeout), notified).await {
                Ok(()) => {}
                Err(_) => expired_completion_wait(transport, lock, conn_cnt),
            }
        }
    }

    completion_tail(lock, data)
}

/// Runs the completion style registered on the lock.
pub(crate) async fn run_completion(
    transport: &dyn Transport,
    lock: &Arc<Lock>,
    flags: LockFlags,
    data: Option<&AstData>,
) -> Result<()> {
    match lock.callbacks().completion {
        CompletionStyle::Wait => completion_ast(transport, lock, flags, data).await,
        CompletionStyle::NoWait => completion_ast_async(lock, flags, data),
    }
}
