//! Lock modes, lock types and type-dependent policy data.

use num_derive::FromPrimitive;

/// Lock mode, from weakest to strongest. Wire values are one-hot so a
/// mode set can be expressed as a mask.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u32)]
pub enum LockMode {
    /// Exclusive.
    Ex = 1,
    /// Protected write.
    Pw = 2,
    /// Protected read.
    Pr = 4,
    /// Concurrent write.
    Cw = 8,
    /// Concurrent read.
    Cr = 16,
    /// Null (no access, keeps the resource referenced).
    Nl = 32,
    /// Group lock, compatible only within the same group.
    Group = 64,
}

impl LockMode {
    /// Standard DLM compatibility table.
    pub fn compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            Nl => true,
            Cr => !matches!(other, Ex | Group),
            Cw => matches!(other, Nl | Cr | Cw),
            Pr => matches!(other, Nl | Cr | Pr),
            Pw => matches!(other, Nl | Cr),
            Ex => matches!(other, Nl),
            Group => matches!(other, Nl | Group),
        }
    }

    /// True for modes counted as readers; the rest count as writers.
    pub fn is_reader(self) -> bool {
        matches!(self, LockMode::Pr | LockMode::Cr | LockMode::Nl)
    }
}

/// Resource/lock type. Governs the shape of [`PolicyData`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u32)]
pub enum LockType {
    Plain = 10,
    Extent = 11,
    Flock = 12,
    Ibits = 13,
}

/// Whole-object extent used when a range covers everything.
pub const EXTENT_EOF: u64 = u64::MAX;

/// Type-dependent policy payload carried by enqueues and replies.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PolicyData {
    Plain,
    Extent { start: u64, end: u64, gid: u64 },
    Ibits { bits: u64 },
    Flock { start: u64, end: u64, owner: u64, pid: u32 },
}

impl PolicyData {
    /// The lock type this payload belongs to.
    pub fn lock_type(&self) -> LockType {
        match self {
            PolicyData::Plain => LockType::Plain,
            PolicyData::Extent { .. } => LockType::Extent,
            PolicyData::Ibits { .. } => LockType::Ibits,
            PolicyData::Flock { .. } => LockType::Flock,
        }
    }

    /// Empty payload for a lock type.
    pub fn empty(lock_type: LockType) -> PolicyData {
        match lock_type {
            LockType::Plain => PolicyData::Plain,
            LockType::Extent => {
                PolicyData::Extent { start: 0, end: EXTENT_EOF, gid: 0 }
            }
            LockType::Ibits => PolicyData::Ibits { bits: 0 },
            LockType::Flock => {
                PolicyData::Flock { start: 0, end: EXTENT_EOF, owner: 0, pid: 0 }
            }
        }
    }
}

/// Lock value block flavor. The server owns the contents; the client
/// only knows the expected length for each flavor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum LvbType {
    None = 0,
    Extent = 1,
    Quota = 2,
    Layout = 3,
}
