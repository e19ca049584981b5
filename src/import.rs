//! The import: client state for one connection to a server target.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::namespace::Namespace;

/// Transport channel state for one server target. Reconnects bump the
/// generation; requests remember the generation they were built under
/// so stale retries can be told apart from fresh ones.
pub struct Import {
    ns: Arc<Namespace>,
    generation: AtomicU32,
    conn_cnt: AtomicU32,
    invalid: AtomicBool,
    replay_inflight: AtomicUsize,
    vbr_failed: AtomicBool,
}

impl Import {
    pub fn new(ns: &Arc<Namespace>) -> Arc<Import> {
        Arc::new(Import {
            ns: ns.clone(),
            generation: AtomicU32::new(1),
            conn_cnt: AtomicU32::new(1),
            invalid: AtomicBool::new(false),
            replay_inflight: AtomicUsize::new(0),
            vbr_failed: AtomicBool::new(false),
        })
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn conn_cnt(&self) -> u32 {
        self.conn_cnt.load(Ordering::SeqCst)
    }

    /// Records a reconnect: new generation, new connection count.
    pub fn note_reconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.conn_cnt.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    pub fn set_invalid(&self, invalid: bool) {
        self.invalid.store(invalid, Ordering::SeqCst);
    }

    pub fn replay_inflight(&self) -> usize {
        self.replay_inflight.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_replay_inflight(&self) {
        self.replay_inflight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_replay_inflight(&self) {
        let prev = self.replay_inflight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    /// Whether a previous recovery attempt was declared failed; replay
    /// is skipped entirely then.
    pub fn vbr_failed(&self) -> bool {
        self.vbr_failed.load(Ordering::SeqCst)
    }

    pub fn set_vbr_failed(&self, failed: bool) {
        self.vbr_failed.store(failed, Ordering::SeqCst);
    }
}
