//! Lock flag word shared between client state and the wire protocol.
//!
//! The low 24 bits travel on the wire; bits 32 and up are client-local
//! bookkeeping and must never be sent to the server.

use bitflags::bitflags;

bitflags! {
    /// Per-lock flag word.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct LockFlags: u64 {
        /// Server granted a different mode and/or resource than requested.
        const LOCK_CHANGED = 0x1;
        /// Blocked waiting for a conflicting granted lock to go away.
        const BLOCK_GRANTED = 0x2;
        /// Blocked behind a pending mode conversion.
        const BLOCK_CONV = 0x4;
        /// Blocked behind earlier waiters on the resource.
        const BLOCK_WAIT = 0x8;
        /// The reply carries a blocking callback that fired before the
        /// grant reached us.
        const AST_SENT = 0x20;
        /// Enqueue is a recovery-time replay of an existing lock.
        const REPLAY = 0x100;
        /// Completion wait never times out.
        const NO_TIMEOUT = 0x2_0000;
        /// Drop the lock on a blocking callback instead of waiting for
        /// the cancel round trip.
        const CANCEL_ON_BLOCK = 0x80_0000;

        /// Completion AST invoked only to park the waiter.
        const WAIT_NOREPROC = 1 << 32;
        /// A cancel is pending; no new readers or writers may be added.
        const CBPENDING = 1 << 33;
        /// A blocking callback arrived for this lock.
        const BL_AST = 1 << 34;
        /// The blocking callback has been processed.
        const BL_DONE = 1 << 35;
        /// Exclusive ownership token of the cancel path.
        const CANCELING = 1 << 36;
        /// Do not inform the server when this lock is cancelled.
        const LOCAL_ONLY = 1 << 37;
        /// Terminal: enqueue or wait failed.
        const FAILED = 1 << 38;
        /// Cancel callback has already run.
        const CANCEL = 1 << 39;
        /// Terminal: lock is unlinked and unreachable through handles.
        const DESTROYED = 1 << 40;
        /// Skipped by a no-wait LRU scan; do not visit again.
        const SKIPPED = 1 << 41;
        /// Run the blocking callback in the caller's context on the
        /// last reference drop instead of queueing it.
        const ATOMIC_CB = 1 << 42;
        /// Never park this lock on the namespace LRU.
        const NO_LRU = 1 << 43;
        /// Obtained with an exclusive caller reference.
        const EXCL = 1 << 44;
        /// The lock value block holds server-fresh contents.
        const LVB_READY = 1 << 45;
    }
}

impl LockFlags {
    /// Any of these means the lock is not yet granted.
    pub const BLOCKED_MASK: LockFlags = LockFlags::BLOCK_GRANTED
        .union(LockFlags::BLOCK_CONV)
        .union(LockFlags::BLOCK_WAIT);

    /// Terminal states.
    pub const GONE_MASK: LockFlags =
        LockFlags::DESTROYED.union(LockFlags::FAILED);

    /// Reply bits the client merges into its own flag word.
    pub const INHERIT_MASK: LockFlags = LockFlags::CANCEL_ON_BLOCK;

    /// Bits that may appear on the wire.
    pub const ON_WIRE_MASK: LockFlags = LockFlags::from_bits_retain(0x00ff_ffff);

    /// Translates the in-memory word to its wire representation.
    pub fn to_wire(self) -> u64 {
        (self & Self::ON_WIRE_MASK).bits()
    }

    /// Builds an in-memory word from wire bits, dropping anything the
    /// peer has no business setting.
    pub fn from_wire(raw: u64) -> LockFlags {
        LockFlags::from_bits_retain(raw) & Self::ON_WIRE_MASK
    }

    pub fn is_blocked(self) -> bool {
        self.intersects(Self::BLOCKED_MASK)
    }

    pub fn is_gone(self) -> bool {
        self.intersects(Self::GONE_MASK)
    }
}
