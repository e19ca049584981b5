//! Per-namespace pool state fed by the server.
//!
//! The server periodically publishes a lock-volume budget (SLV) and a
//! lock-count limit on its replies. The LRU-resize policy compares a
//! locally computed lock volume against the SLV to decide evictions.

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy)]
struct PoolState {
    slv: u64,
    limit: u32,
    lvf: u64,
    clv: u64,
}

/// Server-fed lock volume state.
#[derive(Debug)]
pub struct Pool {
    state: RwLock<PoolState>,
}

impl Pool {
    /// Creates a pool with no server budget yet and the given per-lock
    /// volume factor.
    pub fn new(lvf: u64) -> Self {
        Pool { state: RwLock::new(PoolState { slv: 0, limit: 0, lvf, clv: 0 }) }
    }

    /// Server lock volume; zero until the server publishes one.
    pub fn slv(&self) -> u64 {
        self.state.read().slv
    }

    /// Server lock-count limit.
    pub fn limit(&self) -> u32 {
        self.state.read().limit
    }

    /// Lock volume factor applied per unused lock.
    pub fn lvf(&self) -> u64 {
        self.state.read().lvf
    }

    pub fn set_lvf(&self, lvf: u64) {
        self.state.write().lvf = lvf;
    }

    /// Most recent client-side lock volume, published for observability.
    pub fn clv(&self) -> u64 {
        self.state.read().clv
    }

    pub fn set_clv(&self, clv: u64) {
        self.state.write().clv = clv;
    }

    /// Installs a new `(slv, limit)` pair from a server reply. A zero in
    /// either field means the server does not speak LRU resize and the
    /// previous values are kept.
    pub fn update(&self, slv: u64, limit: u32) -> bool {
        if slv == 0 || limit == 0 {
            tracing::debug!(slv, limit, "ignoring zero SLV or limit from server");
            return false;
        }
        let mut st = self.state.write();
        st.slv = slv;
        st.limit = limit;
        true
    }
}

/// Installs pool state carried by a server reply, provided the LRU
/// resize feature was negotiated on this connection.
pub fn cli_update_pool(ns: &crate::namespace::Namespace, slv: u64, limit: u32) {
    if !ns.caps().lru_resize {
        return;
    }
    ns.pool().update(slv, limit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fields_do_not_clobber() {
        let pool = Pool::new(1);
        assert!(pool.update(1_000_000, 64));
        assert!(!pool.update(0, 128));
        assert!(!pool.update(500, 0));
        assert_eq!(pool.slv(), 1_000_000);
        assert_eq!(pool.limit(), 64);
    }
}
