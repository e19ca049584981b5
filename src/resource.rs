//! Resources: buckets of co-located locks.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::lock::{Lock, LockType, ResLink};

/// Resource name: an opaque typed 4-word key chosen by the filesystem
/// layer (object id, version, hash, ...).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(pub [u64; 4]);

#[derive(Default)]
struct ResLists {
    granted: Vec<Arc<Lock>>,
    waiting: Vec<Arc<Lock>>,
}

/// A bucket of locks sharing one resource name. Holds the granted and
/// waiting lists behind the per-resource lock.
pub struct Resource {
    name: ResourceId,
    lock_type: LockType,
    lists: Mutex<ResLists>,
}

impl Resource {
    pub(crate) fn new(name: ResourceId, lock_type: LockType) -> Arc<Resource> {
        Arc::new(Resource { name, lock_type, lists: Mutex::new(ResLists::default()) })
    }

    pub fn name(&self) -> ResourceId {
        self.name
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    /// Links `lock` on one of this resource's lists, moving it if it is
    /// already linked elsewhere.
    pub(crate) fn link(self: &Arc<Resource>, lock: &Arc<Lock>, target: ResLink) {
        let mut lists = self.lists.lock();
        let mut st = lock.state();
        match st.res_link {
            ResLink::None => {}
            current if current == target => return,
            ResLink::Granted => retain_lock(&mut lists.granted, lock),
            ResLink::Waiting => retain_lock(&mut lists.waiting, lock),
        }
        match target {
            ResLink::Granted => lists.granted.push(lock.clone()),
            ResLink::Waiting => lists.waiting.push(lock.clone()),
            ResLink::None => {}
        }
        st.res_link = target;
    }

    /// Removes `lock` from whichever list holds it.
    pub(crate) fn unlink(&self, lock: &Arc<Lock>) {
        let mut lists = self.lists.lock();
        let mut st = lock.state();
        match st.res_link {
            ResLink::None => return,
            ResLink::Granted => retain_lock(&mut lists.granted, lock),
            ResLink::Waiting => retain_lock(&mut lists.waiting, lock),
        }
        st.res_link = ResLink::None;
    }

    /// Snapshot of the granted list.
    pub fn granted(&self) -> Vec<Arc<Lock>> {
        self.lists.lock().granted.clone()
    }

    /// Snapshot of the waiting list.
    pub fn waiting(&self) -> Vec<Arc<Lock>> {
        self.lists.lock().waiting.clone()
    }

    /// Snapshot of every lock on this resource, granted first.
    pub fn all_locks(&self) -> Vec<Arc<Lock>> {
        let lists = self.lists.lock();
        lists.granted.iter().chain(lists.waiting.iter()).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        let lists = self.lists.lock();
        lists.granted.is_empty() && lists.waiting.is_empty()
    }
}

fn retain_lock(list: &mut Vec<Arc<Lock>>, lock: &Arc<Lock>) {
    list.retain(|l| !Arc::ptr_eq(l, lock));
}
