//! The export: the handle through which locks talk to their server.

use std::sync::Arc;

use dashmap::DashMap;

use crate::import::Import;
use crate::lock::Lock;
use crate::namespace::Namespace;

/// Connection handle carried by every remote lock. Owns the per-export
/// lock index, keyed by the server-assigned cookie.
pub struct Export {
    import: Arc<Import>,
    lock_index: DashMap<u64, Arc<Lock>>,
}

impl Export {
    pub fn new(import: &Arc<Import>) -> Arc<Export> {
        Arc::new(Export { import: import.clone(), lock_index: DashMap::new() })
    }

    pub fn import(&self) -> &Arc<Import> {
        &self.import
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        self.import.namespace()
    }

    /// Rekeys a lock in the index under a fresh server cookie, as
    /// happens on the first enqueue reply and on every replay ack.
    pub(crate) fn rehash_lock(&self, lock: &Arc<Lock>, new_remote: u64) {
        let old = {
            let mut st = lock.state();
            let old = st.remote_handle;
            st.remote_handle = new_remote;
            old
        };
        if old != 0 {
            self.lock_index.remove(&old);
        }
        self.lock_index.insert(new_remote, lock.clone());
    }

    /// Resolves a server cookie back to the local lock.
    pub fn lock_by_remote(&self, remote: u64) -> Option<Arc<Lock>> {
        self.lock_index.get(&remote).map(|l| l.value().clone())
    }

    pub(crate) fn index_remove(&self, remote: u64) {
        if remote != 0 {
            self.lock_index.remove(&remote);
        }
    }
}
