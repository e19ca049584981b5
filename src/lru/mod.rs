//! LRU eviction engine: policy selection and the scan that harvests
//! unused locks into cancel batches.


use std::sync::Arc;

use bitflags::bitflags;

use crate::bl_task::BlWork;
use crate::cancel::{cancel_list, cancel_list_local, CancelFlags};
use crate::lock::{Lock, LockFlags, LockType};
use crate::namespace::Namespace;
use crate::timing::now_seconds;
use crate::transport::Transport;

bitflags! {
    /// Which eviction policy a scan runs under.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct LruFlags: u32 {
        /// Only evict locks that require no I/O or RPC to let go.
        const NO_WAIT = 0x1;
        /// Server-fed lock-volume policy.
        const LRUR = 0x2;
        /// Evict the requested number of oldest locks.
        const PASSED = 0x4;
        /// Memory-pressure variant of PASSED.
        const SHRINK = 0x8;
        /// Age-threshold policy for servers without LRU resize.
        const AGED = 0x10;
        /// Lock-volume policy filtered by the no-wait predicate.
        const LRUR_NO_WAIT = 0x20;
    }
}

/// Verdict of a policy on one scanned lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PolicyResult {
    /// Keep it cached and stop the scan.
    KeepLock,
    /// Evict it.
    CancelLock,
    /// Leave it cached but keep scanning.
    SkipLock,
}

type PolicyFn = fn(&Arc<Namespace>, &Arc<Lock>, usize, usize, usize) -> PolicyResult;

/// Evict only what can be dropped without writing back data or waiting
/// on an RPC in flight; everything else is marked skipped. Scans the
/// whole unused list, so the added/count bounds are not consulted.
fn policy_no_wait(
    ns: &Arc<Namespace>,
    lock: &Arc<Lock>,
    _unused: usize,
    _added: usize,
    _count: usize,
) -> PolicyResult {
    if matches!(lock.lock_type(), LockType::Extent | LockType::Ibits) {
        if let Some(check) = ns.evict_check() {
            if check(lock) {
                return PolicyResult::CancelLock;
            }
        }
    }
    lock.state().flags |= LockFlags::SKIPPED;
    PolicyResult::SkipLock
}

/// Server-fed policy: a lock whose local volume exceeds the server's
/// budget goes; anything past the maximum idle age goes regardless.
fn policy_lrur(
    ns: &Arc<Namespace>,
    lock: &Arc<Lock>,
    unused: usize,
    added: usize,
    count: usize,
) -> PolicyResult {
    if count > 0 && added >= count {
        return PolicyResult::KeepLock;
    }

    let now = now_seconds();
    let last_used = lock.state().last_used;
    if now > last_used + ns.max_age_secs() {
        return PolicyResult::CancelLock;
    }

    let pool = ns.pool();
    let slv = pool.slv();
    let lvf = pool.lvf();
    let age = now.saturating_sub(last_used);
    let lv = lvf * age * unused as u64;
    pool.set_clv(lv);

    if slv == 0 || lv < slv {
        PolicyResult::KeepLock
    } else {
        PolicyResult::CancelLock
    }
}

fn policy_lrur_no_wait(
    ns: &Arc<Namespace>,
    lock: &Arc<Lock>,
    unused: usize,
    added: usize,
    count: usize,
) -> PolicyResult {
    match policy_lrur(ns, lock, unused, added, count) {
        PolicyResult::KeepLock => PolicyResult::KeepLock,
        _ => policy_no_wait(ns, lock, unused, added, count),
    }
}

/// Age policy: past the idle threshold a lock goes even when the
/// requested count has been reached.
fn policy_aged(
    ns: &Arc<Namespace>,
    lock: &Arc<Lock>,
    _unused: usize,
    added: usize,
    count: usize,
) -> PolicyResult {
    let now = now_seconds();
    if added >= count && now < lock.state().last_used + ns.max_age_secs() {
        PolicyResult::KeepLock
    } else {
        PolicyResult::CancelLock
    }
}

/// Count-bounded eviction of the oldest locks.
fn policy_passed(
    _ns: &Arc<Namespace>,
    _lock: &Arc<Lock>,
    _unused: usize,
    added: usize,
    count: usize,
) -> PolicyResult {
    if added >= count {
        PolicyResult::KeepLock
    } else {
        PolicyResult::CancelLock
    }
}

fn pick_policy(ns: &Namespace, flags: LruFlags) -> PolicyFn {
    if flags.contains(LruFlags::NO_WAIT) {
        return policy_no_wait;
    }
    if ns.caps().lru_resize {
        if flags.contains(LruFlags::SHRINK) {
            policy_passed
        } else if flags.contains(LruFlags::LRUR) {
            policy_lrur
        } else if flags.contains(LruFlags::PASSED) {
            policy_passed
        } else if flags.contains(LruFlags::LRUR_NO_WAIT) {
            policy_lrur_no_wait
        } else {
            policy_passed
        }
    } else if flags.contains(LruFlags::AGED) {
        policy_aged
    } else {
        policy_passed
    }
}

/// Walks the namespace LRU harvesting locks the selected policy wants
/// gone, marking each harvested lock as cancel-owned and appending it
/// to `cancels`. Stops at `max` harvested locks (when nonzero), at a
/// keep verdict, or when the list runs dry. Returns the number
/// harvested.
pub fn prepare_lru_list(
    ns: &Arc<Namespace>,
    cancels: &mut Vec<Arc<Lock>>,
    count: usize,
    max: usize,
    flags: LruFlags,
) -> usize {
    let no_wait = flags.intersects(LruFlags::NO_WAIT | LruFlags::LRUR_NO_WAIT);

    let mut unused = ns.nr_unused();
    let mut remained = unused as i64;

    // Without server-driven resize an enqueue is entitled to free its
    // own slot plus whatever exceeds the configured ceiling.
    let mut target = count as i64;
    if !ns.caps().lru_resize {
        target += unused as i64 - ns.max_unused() as i64;
    }
    let target = target.max(0) as usize;

    let pf = pick_policy(ns, flags);
    let mut added = 0usize;

    loop {
        if remained <= 0 {
            break;
        }
        remained -= 1;
        if max > 0 && added >= max {
            break;
        }

        // Select and detach the first eligible candidate under the
        // namespace lock.
        let candidate = ns.with_lru(|list, nr_unused| {
            let now = now_seconds();
            let mut idx = 0;
            while idx < list.len() {
                let lock = list[idx].clone();
                let mut st = lock.state();
                debug_assert!(!st.flags.contains(LockFlags::BL_AST));
                if no_wait && st.flags.contains(LockFlags::SKIPPED) {
                    idx += 1;
                    continue;
                }
                if st.last_used == now {
                    // Too young to tell whether it is really idle.
                    idx += 1;
                    continue;
                }
                if st.flags.contains(LockFlags::CANCELING) {
                    // Somebody owns the cancel already; it has no
                    // business staying on the LRU.
                    st.in_lru = false;
                    drop(st);
                    list.remove(idx);
                    *nr_unused -= 1;
                    continue;
                }
                let last_used = st.last_used;
                st.in_lru = false;
                drop(st);
                list.remove(idx);
                *nr_unused -= 1;
                return Some((lock, last_used));
            }
            None
        });

        let Some((lock, last_used)) = candidate else {
            break;
        };

        match pf(ns, &lock, unused, added, target) {
            PolicyResult::KeepLock => {
                ns.lru_restore(&lock);
                break;
            }
            PolicyResult::SkipLock => {
                ns.lru_restore(&lock);
                continue;
            }
            PolicyResult::CancelLock => {}
        }

        // The verdict was reached without the lock's mutex; discard it
        // if the lock got cancelled or touched in the meantime.
        {
            let mut st = lock.state();
            if st.flags.contains(LockFlags::CANCELING)
                || st.readers + st.writers > 0
                || st.last_used != last_used
            {
                continue;
            }
            debug_assert_eq!(st.readers + st.writers, 0);

            // This eviction is voluntary, so the server must be told
            // even if the lock was enqueued reply-less.
            st.flags -= LockFlags::CANCEL_ON_BLOCK;

            // CBPENDING stops new references from appearing; with the
            // counts already at zero nobody will run the blocking
            // callback underneath us.
            st.flags |= LockFlags::CBPENDING | LockFlags::CANCELING;

            debug_assert!(!st.on_bl_list);
            st.on_bl_list = true;
        }
        cancels.push(lock);
        added += 1;
        unused = unused.saturating_sub(1);
    }

    added
}

/// Harvests per [`prepare_lru_list`] and runs the local half of the
/// cancel on the batch. Survivors are appended to `cancels`; returns
/// how many of them still owe a server RPC.
pub async fn cancel_lru_local(
    transport: &Arc<dyn Transport>,
    ns: &Arc<Namespace>,
    cancels: &mut Vec<Arc<Lock>>,
    count: usize,
    max: usize,
    cancel_flags: CancelFlags,
    lru_flags: LruFlags,
) -> usize {
    let mut prepared = Vec::new();
    let added = prepare_lru_list(ns, &mut prepared, count, max, lru_flags);
    if added == 0 {
        return 0;
    }
    let remaining = cancel_list_local(transport, &mut prepared, added, cancel_flags).await;
    cancels.extend(prepared);
    remaining
}

/// Harvests at least `nr` locks and hands the batch to the
/// blocking-AST service for deferred cancellation, keeping this caller
/// non-blocking. Falls back to cancelling inline when no service is
/// attached. Returns the number harvested.
pub async fn cancel_lru(
    transport: &Arc<dyn Transport>,
    ns: &Arc<Namespace>,
    nr: usize,
    cancel_flags: CancelFlags,
    lru_flags: LruFlags,
) -> usize {
    let mut cancels = Vec::new();
    let count = prepare_lru_list(ns, &mut cancels, nr, 0, lru_flags);
    if count == 0 {
        return 0;
    }

    if let Some(queue) = ns.bl_queue() {
        match queue.try_send(BlWork::CancelList { locks: cancels, count, flags: cancel_flags }) {
            Ok(()) => return count,
            Err(err) => {
                let BlWork::CancelList { locks, .. } = err.into_inner() else {
                    unreachable!();
                };
                cancels = locks;
            }
        }
    }

    let remaining = cancel_list_local(transport, &mut cancels, count, cancel_flags).await;
    cancel_list(transport, &mut cancels, remaining, None, cancel_flags).await;
    count
}
