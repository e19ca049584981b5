//! Per-server-target namespace: resource table, handle table, LRU list
//! and the policy state driving eviction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::bl_task::BlWork;
use crate::config::Settings;
use crate::fault::FaultState;
use crate::lock::{Lock, LockFlags, LockHandle, LockType};
use crate::pool::Pool;
use crate::resource::{Resource, ResourceId};
use crate::timing::{now_seconds, AdaptiveEstimate};

/// Capabilities negotiated with the server at connect time.
#[derive(Debug, Copy, Clone, Default)]
pub struct ConnectCaps {
    /// Multiple cancel handles may ride one RPC, or piggyback on an
    /// enqueue.
    pub cancelset: bool,
    /// The server publishes an SLV budget and drives eviction.
    pub lru_resize: bool,
    /// The server understands inode-bits policy data.
    pub ibits: bool,
}

/// Predicate deciding whether an unused lock can be dropped without any
/// I/O or RPC. Consulted by the no-wait eviction policy.
pub type EvictCheck = Box<dyn Fn(&Arc<Lock>) -> bool + Send + Sync>;

#[derive(Default)]
struct LruList {
    list: VecDeque<Arc<Lock>>,
    nr_unused: usize,
}

/// Minimum seconds between namespace dumps from the expired-wait path.
const DUMP_INTERVAL: u64 = 300;

/// Client-side container of all locks, resources and policy state for
/// one import.
pub struct Namespace {
    name: String,
    caps: ConnectCaps,
    tunables: Settings,
    resources: DashMap<ResourceId, Arc<Resource>>,
    handles: DashMap<u64, Arc<Lock>>,
    lru: Mutex<LruList>,
    max_unused: AtomicUsize,
    max_age_secs: AtomicU64,
    at: AdaptiveEstimate,
    pool: Pool,
    next_dump: Mutex<u64>,
    evict_check: Option<EvictCheck>,
    bl_queue: OnceCell<async_channel::Sender<BlWork>>,
    faults: FaultState,
}

impl Namespace {
    pub fn new(name: impl Into<String>, caps: ConnectCaps, settings: &Settings) -> Arc<Namespace> {
        Self::with_evict_check(name, caps, settings, None)
    }

    /// As [`Namespace::new`], with the pluggable no-wait eviction
    /// predicate installed.
    pub fn with_evict_check(
        name: impl Into<String>,
        caps: ConnectCaps,
        settings: &Settings,
        evict_check: Option<EvictCheck>,
    ) -> Arc<Namespace> {
        Arc::new(Namespace {
            name: name.into(),
            caps,
            tunables: settings.clone(),
            resources: DashMap::new(),
            handles: DashMap::new(),
            lru: Mutex::new(LruList::default()),
            max_unused: AtomicUsize::new(settings.max_unused),
            max_age_secs: AtomicU64::new(settings.max_age_secs),
            at: AdaptiveEstimate::new(settings.enqueue_min.min(u32::MAX as u64) as u32 / 10),
            pool: Pool::new(settings.lvf),
            next_dump: Mutex::new(0),
            evict_check,
            bl_queue: OnceCell::new(),
            faults: FaultState::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caps(&self) -> ConnectCaps {
        self.caps
    }

    pub fn tunables(&self) -> &Settings {
        &self.tunables
    }

    pub fn at_estimate(&self) -> &AdaptiveEstimate {
        &self.at
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Fault-injection sites scoped to this namespace.
    pub fn faults(&self) -> &FaultState {
        &self.faults
    }

    pub(crate) fn evict_check(&self) -> Option<&EvictCheck> {
        self.evict_check.as_ref()
    }

    /// Target unused-lock count when the server does not drive eviction.
    pub fn max_unused(&self) -> usize {
        self.max_unused.load(Ordering::Relaxed)
    }

    pub fn set_max_unused(&self, n: usize) {
        self.max_unused.store(n, Ordering::Relaxed);
    }

    /// Unused locks idle longer than this are always evictable.
    pub fn max_age_secs(&self) -> u64 {
        self.max_age_secs.load(Ordering::Relaxed)
    }

    pub fn set_max_age_secs(&self, secs: u64) {
        self.max_age_secs.store(secs, Ordering::Relaxed);
    }

    /// Number of locks currently parked on the LRU.
    pub fn nr_unused(&self) -> usize {
        self.lru.lock().nr_unused
    }

    // Resource table.

    /// Looks up or creates the resource bucket for `name`.
    pub fn resource_get(&self, name: ResourceId, lock_type: LockType) -> Arc<Resource> {
        self.resources
            .entry(name)
            .or_insert_with(|| Resource::new(name, lock_type))
            .clone()
    }

    /// Looks up an existing resource bucket.
    pub fn resource_find(&self, name: ResourceId) -> Option<Arc<Resource>> {
        self.resources.get(&name).map(|r| r.value().clone())
    }

    /// Moves a lock to a different resource, as directed by a reply
    /// carrying a rewritten resource name.
    pub(crate) fn change_resource(&self, lock: &Arc<Lock>, name: ResourceId) {
        lock.unlink_from_resource();
        let res = self.resource_get(name, lock.lock_type());
        lock.set_resource(res);
    }

    // Handle table.

    pub(crate) fn handle_insert(&self, lock: &Arc<Lock>) {
        self.handles.insert(lock.cookie(), lock.clone());
    }

    pub(crate) fn handle_remove(&self, cookie: u64) {
        self.handles.remove(&cookie);
    }

    /// Resolves a handle, refusing locks already destroyed.
    pub fn lock_by_handle(&self, handle: LockHandle) -> Option<Arc<Lock>> {
        let lock = self.handles.get(&handle.0).map(|l| l.value().clone())?;
        if lock.flags().contains(LockFlags::DESTROYED) {
            return None;
        }
        Some(lock)
    }

    // LRU list. All membership changes happen with the namespace lock
    // taken before the lock's own mutex.

    /// Parks an unused lock at the tail of the LRU.
    pub(crate) fn lru_add(&self, lock: &Arc<Lock>) {
        let mut lru = self.lru.lock();
        let mut st = lock.state();
        if st.in_lru
            || st.readers + st.writers > 0
            || st.flags.intersects(
                LockFlags::CBPENDING | LockFlags::CANCELING | LockFlags::GONE_MASK,
            )
        {
            return;
        }
        st.in_lru = true;
        st.last_used = now_seconds();
        lru.list.push_back(lock.clone());
        lru.nr_unused += 1;
    }

    /// Puts a scanned-but-kept lock back at the head of the LRU.
    pub(crate) fn lru_restore(&self, lock: &Arc<Lock>) {
        let mut lru = self.lru.lock();
        let mut st = lock.state();
        if st.in_lru
            || st.readers + st.writers > 0
            || st.flags.intersects(
                LockFlags::CBPENDING | LockFlags::CANCELING | LockFlags::GONE_MASK,
            )
        {
            return;
        }
        st.in_lru = true;
        lru.list.push_front(lock.clone());
        lru.nr_unused += 1;
    }

    /// Drops a lock from the LRU if it is there.
    pub(crate) fn lru_remove(&self, lock: &Arc<Lock>) {
        let mut lru = self.lru.lock();
        let mut st = lock.state();
        if !st.in_lru {
            return;
        }
        st.in_lru = false;
        lru.list.retain(|l| !Arc::ptr_eq(l, lock));
        lru.nr_unused -= 1;
    }

    /// Runs `scan` under the namespace lock. The closure gets the LRU
    /// deque and the unused counter.
    pub(crate) fn with_lru<R>(&self, scan: impl FnOnce(&mut VecDeque<Arc<Lock>>, &mut usize) -> R) -> R {
        let mut lru = self.lru.lock();
        let LruList { ref mut list, ref mut nr_unused } = *lru;
        scan(list, nr_unused)
    }

    /// Visits every lock in the namespace, granted lists first.
    pub(crate) fn for_each_lock(&self, mut visit: impl FnMut(&Arc<Lock>)) {
        for res in self.resources.iter() {
            for lock in res.all_locks() {
                visit(&lock);
            }
        }
    }

    /// Snapshot of all resources, for whole-namespace sweeps.
    pub(crate) fn resources_snapshot(&self) -> Vec<Arc<Resource>> {
        self.resources.iter().map(|r| r.value().clone()).collect()
    }

    // Blocking-AST service plumbing.

    pub(crate) fn attach_bl_queue(&self, sender: async_channel::Sender<BlWork>) {
        let _ = self.bl_queue.set(sender);
    }

    pub(crate) fn bl_queue(&self) -> Option<&async_channel::Sender<BlWork>> {
        self.bl_queue.get()
    }

    /// Logs the namespace contents, rate-limited to once per
    /// [`DUMP_INTERVAL`]. Used when a completion wait expires on a lock
    /// with no usable connection.
    pub(crate) fn dump_rate_limited(&self) {
        let now = now_seconds();
        {
            let mut next = self.next_dump.lock();
            if now < *next {
                return;
            }
            *next = now + DUMP_INTERVAL;
        }
        tracing::debug!(
            namespace = %self.name,
            resources = self.resources.len(),
            unused = self.nr_unused(),
            "namespace dump"
        );
        for res in self.resources.iter() {
            for lock in res.all_locks() {
                tracing::debug!(
                    cookie = lock.cookie(),
                    flags = ?lock.flags(),
                    granted = ?lock.granted_mode(),
                    "  lock"
                );
            }
        }
    }
}
