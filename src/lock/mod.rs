//! Client-side lock entity and its reference lifecycle.
//!
//! A [`Lock`] is the client's view of a lock held (or wanted) on the
//! server. It is shared between the resource lists, the namespace LRU,
//! the per-export index and transient callers; `Arc` carries the
//! structural references while `readers`/`writers` count active users
//! of the granted mode. A lock whose user count drops to zero parks on
//! the namespace LRU until an eviction policy or a server callback
//! takes it away.

mod flags;
mod mode;

#[cfg(test)]
mod tests;

pub use flags::LockFlags;
pub use mode::{LockMode, LockType, LvbType, PolicyData, EXTENT_EOF};

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::export::Export;
use crate::namespace::Namespace;
use crate::resource::{Resource, ResourceId};
use crate::timing::now_seconds;
use crate::wire::LockDesc;

/// Local lock cookie handed to callers; resolves back through the
/// namespace handle table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LockHandle(pub u64);

static NEXT_COOKIE: AtomicU64 = AtomicU64::new(1);

/// Why a blocking callback is being delivered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockingReason {
    /// Another client wants a conflicting lock; release when idle.
    Conflict,
    /// The lock is being cancelled; release lock-specific state now.
    Canceling,
}

/// Blocking/cancel notification handler.
pub type BlockingAst = Arc<dyn Fn(&Arc<Lock>, BlockingReason) + Send + Sync>;

/// Glimpse handler: the server wants the lock value block back.
pub type GlimpseAst = Arc<dyn Fn(&Arc<Lock>) + Send + Sync>;

/// How grant completion is driven for this lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CompletionStyle {
    /// Park the enqueuing task until granted or cancelled.
    #[default]
    Wait,
    /// Never park; used by callers that cannot sleep.
    NoWait,
}

/// Callback triple fixed at lock creation.
#[derive(Clone, Default)]
pub struct CallbackSet {
    pub blocking: Option<BlockingAst>,
    pub completion: CompletionStyle,
    pub glimpse: Option<GlimpseAst>,
}

/// Which resource list the lock is currently linked on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ResLink {
    None,
    Granted,
    Waiting,
}

/// Mutable lock state, guarded by the per-lock mutex. Lock ordering is
/// namespace < resource < lock; never call user callbacks while holding
/// this.
#[derive(Debug)]
pub(crate) struct LockState {
    pub flags: LockFlags,
    pub req_mode: LockMode,
    pub granted_mode: Option<LockMode>,
    pub readers: u32,
    pub writers: u32,
    pub policy: PolicyData,
    pub lvb: Vec<u8>,
    pub remote_handle: u64,
    /// Coarse seconds of the last LRU insertion.
    pub last_used: u64,
    /// Coarse seconds of the last enqueue activity; feeds the adaptive
    /// timeout estimator.
    pub last_activity: u64,
    pub in_lru: bool,
    /// Exclusive-ownership token: the lock rides in at most one cancel
    /// batch at a time.
    pub on_bl_list: bool,
    pub res_link: ResLink,
}

/// Client-side handle to a server-held lock.
pub struct Lock {
    cookie: u64,
    lock_type: LockType,
    lvb_len: usize,
    lvb_type: LvbType,
    ns: Arc<Namespace>,
    resource: Mutex<Arc<Resource>>,
    conn_export: Mutex<Option<Arc<Export>>>,
    callbacks: CallbackSet,
    ast_data: Option<Arc<dyn Any + Send + Sync>>,
    waitq: Notify,
    pub(crate) state: Mutex<LockState>,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("cookie", &self.cookie)
            .field("type", &self.lock_type)
            .finish_non_exhaustive()
    }
}

impl Lock {
    /// Creates a lock bound to `(namespace, resource, type, mode)` and
    /// registers it in the handle table. The caller owns no user
    /// references yet.
    pub fn create(
        ns: &Arc<Namespace>,
        res_id: ResourceId,
        lock_type: LockType,
        mode: LockMode,
        callbacks: CallbackSet,
        ast_data: Option<Arc<dyn Any + Send + Sync>>,
        lvb_len: usize,
        lvb_type: LvbType,
    ) -> Arc<Lock> {
        let resource = ns.resource_get(res_id, lock_type);
        let lock = Arc::new(Lock {
            cookie: NEXT_COOKIE.fetch_add(1, Ordering::Relaxed),
            lock_type,
            lvb_len,
            lvb_type,
            ns: ns.clone(),
            resource: Mutex::new(resource),
            conn_export: Mutex::new(None),
            callbacks,
            ast_data,
            waitq: Notify::new(),
            state: Mutex::new(LockState {
                flags: LockFlags::empty(),
                req_mode: mode,
                granted_mode: None,
                readers: 0,
                writers: 0,
                policy: PolicyData::empty(lock_type),
                lvb: vec![0u8; lvb_len],
                remote_handle: 0,
                last_used: now_seconds(),
                last_activity: now_seconds(),
                in_lru: false,
                on_bl_list: false,
                res_link: ResLink::None,
            }),
        });
        ns.handle_insert(&lock);
        lock
    }

    pub fn handle(&self) -> LockHandle {
        LockHandle(self.cookie)
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn lvb_len(&self) -> usize {
        self.lvb_len
    }

    pub fn lvb_type(&self) -> LvbType {
        self.lvb_type
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn resource(&self) -> Arc<Resource> {
        self.resource.lock().clone()
    }

    pub(crate) fn set_resource(&self, res: Arc<Resource>) {
        *self.resource.lock() = res;
    }

    pub fn conn_export(&self) -> Option<Arc<Export>> {
        self.conn_export.lock().clone()
    }

    pub(crate) fn set_conn_export(&self, exp: Arc<Export>) {
        *self.conn_export.lock() = Some(exp);
    }

    pub(crate) fn callbacks(&self) -> &CallbackSet {
        &self.callbacks
    }

    pub(crate) fn ast_data(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.ast_data.as_ref()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock()
    }

    pub(crate) fn waitq(&self) -> &Notify {
        &self.waitq
    }

    /// Wakes every task parked on this lock's wait queue.
    pub(crate) fn wake(&self) {
        self.waitq.notify_waiters();
    }

    // Flag and counter snapshots used by callers and tests.

    pub fn flags(&self) -> LockFlags {
        self.state.lock().flags
    }

    pub fn req_mode(&self) -> LockMode {
        self.state.lock().req_mode
    }

    pub fn granted_mode(&self) -> Option<LockMode> {
        self.state.lock().granted_mode
    }

    pub fn remote_handle(&self) -> u64 {
        self.state.lock().remote_handle
    }

    pub fn readers(&self) -> u32 {
        self.state.lock().readers
    }

    pub fn writers(&self) -> u32 {
        self.state.lock().writers
    }

    pub fn is_in_lru(&self) -> bool {
        self.state.lock().in_lru
    }

    pub fn lvb(&self) -> Vec<u8> {
        self.state.lock().lvb.clone()
    }

    /// Marks the most recent enqueue activity.
    pub(crate) fn touch_activity(&self) {
        self.state.lock().last_activity = now_seconds();
    }

    /// Overrides the LRU timestamp. Test hook for aging scenarios.
    #[doc(hidden)]
    pub fn force_last_used(&self, secs: u64) {
        self.state.lock().last_used = secs;
    }

    /// Fills a wire descriptor from the current lock state.
    pub(crate) fn to_desc(&self) -> LockDesc {
        let res = self.resource();
        let st = self.state.lock();
        LockDesc {
            resource: res.name(),
            lock_type: self.lock_type,
            req_mode: st.req_mode,
            granted_mode: st.granted_mode.map_or(0, |m| m as u32),
            policy: crate::wire::policy_to_wire(&st.policy),
        }
    }

    /// Takes one user reference in `mode`. Fails when a cancel is
    /// already pending: no new holders may be added then.
    pub fn addref(self: &Arc<Lock>, mode: LockMode) -> Result<(), crate::Error> {
        {
            let mut st = self.state.lock();
            if st.flags.contains(LockFlags::CBPENDING) {
                return Err(crate::Error::Stale);
            }
            addref_nolock(&mut st, mode);
        }
        self.ns.lru_remove(self);
        Ok(())
    }

    /// Unconditional reference, used while the lock is being set up and
    /// cannot yet carry CBPENDING.
    pub(crate) fn addref_internal(self: &Arc<Lock>, mode: LockMode) {
        addref_nolock(&mut self.state.lock(), mode);
        self.ns.lru_remove(self);
    }

    /// Drops one user reference. The last reference either parks the
    /// lock on the LRU or, with a cancel pending, hands it to the
    /// cancel machinery.
    pub fn decref(self: &Arc<Lock>, mode: LockMode) {
        let (to_lru, run_cancel) = {
            let mut st = self.state.lock();
            decref_nolock(&mut st, mode);
            if st.readers + st.writers > 0 {
                (false, false)
            } else if st.flags.contains(LockFlags::CBPENDING) {
                (false, true)
            } else {
                (!st.flags.contains(LockFlags::NO_LRU) && !st.flags.is_gone(), false)
            }
        };
        if to_lru {
            self.ns.lru_add(self);
        }
        if run_cancel {
            crate::cancel::last_ref_cancel(self);
        }
    }

    /// Installs the lock on its resource according to the reply flags:
    /// a blocked reply parks it on the waiting list, anything else is a
    /// grant.
    pub(crate) fn install_from_reply(self: &Arc<Lock>, flags: LockFlags) {
        let res = self.resource();
        if flags.is_blocked() {
            let mut st = self.state.lock();
            st.flags |= flags & LockFlags::BLOCKED_MASK;
            drop(st);
            res.link(self, ResLink::Waiting);
        } else {
            {
                let mut st = self.state.lock();
                st.granted_mode = Some(st.req_mode);
            }
            res.link(self, ResLink::Granted);
        }
    }

    /// Grants the lock, as driven by a server completion callback: the
    /// requested mode becomes the granted one, the lock moves to the
    /// granted list and every waiter wakes. An accompanying LVB becomes
    /// the authoritative copy.
    pub fn grant(self: &Arc<Lock>, lvb: Option<&[u8]>) {
        let res = self.resource();
        {
            let mut st = self.state.lock();
            st.granted_mode = Some(st.req_mode);
            st.flags -= LockFlags::BLOCKED_MASK;
            if let Some(data) = lvb {
                fill_lvb(&mut st, data);
                st.flags |= LockFlags::LVB_READY;
            }
        }
        res.link(self, ResLink::Granted);
        self.wake();
    }

    /// Drops a user reference without any lifecycle side effects.
    /// Only for teardown paths that destroy the lock in place.
    pub(crate) fn drop_ref_counts(&self, mode: LockMode) {
        decref_nolock(&mut self.state.lock(), mode);
    }

    /// Unlinks the lock from whichever resource list holds it.
    pub(crate) fn unlink_from_resource(self: &Arc<Lock>) {
        let res = self.resource();
        res.unlink(self);
    }

    /// Marks the lock destroyed and removes it from every lookup
    /// structure. Terminal: handles no longer resolve to it.
    pub(crate) fn destroy(self: &Arc<Lock>) {
        let remote = {
            let mut st = self.state.lock();
            if st.flags.contains(LockFlags::DESTROYED) {
                return;
            }
            st.flags |= LockFlags::DESTROYED;
            st.remote_handle
        };
        self.ns.lru_remove(self);
        self.ns.handle_remove(self.cookie);
        if let Some(exp) = self.conn_export() {
            exp.index_remove(remote);
        }
        self.wake();
    }

    /// Resource-level cancel: takes the lock off the LRU and its
    /// resource list and destroys it. Reader/writer counts must already
    /// be zero.
    pub(crate) fn lock_cancel(self: &Arc<Lock>) {
        {
            let st = self.state.lock();
            debug_assert_eq!(st.readers + st.writers, 0, "cancel of a held lock");
        }
        self.ns.lru_remove(self);
        self.unlink_from_resource();
        self.destroy();
    }
}

fn addref_nolock(st: &mut LockState, mode: LockMode) {
    if mode.is_reader() {
        st.readers += 1;
    } else {
        st.writers += 1;
    }
}

fn decref_nolock(st: &mut LockState, mode: LockMode) {
    if mode.is_reader() {
        debug_assert!(st.readers > 0);
        st.readers = st.readers.saturating_sub(1);
    } else {
        debug_assert!(st.writers > 0);
        st.writers = st.writers.saturating_sub(1);
    }
}

/// Copies server LVB bytes into the lock's store, clipped to the length
/// fixed at creation.
pub(crate) fn fill_lvb(st: &mut LockState, data: &[u8]) {
    let len = data.len().min(st.lvb.len());
    st.lvb[..len].copy_from_slice(&data[..len]);
}
