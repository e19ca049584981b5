//! DLM request/reply buffer layout and sizing rules.
//!
//! A request carries a fixed header (`flags`, `lock_count`, one lock
//! descriptor) followed by handle slots. [`LOCKREQ_HANDLES`] slots are
//! always present; additional handles are appended and grow the buffer.
//! For an enqueue the first [`ENQUEUE_CANCEL_OFF`] slots belong to the
//! requested lock and the remainder may carry piggybacked cancels.

pub mod primitive;


use std::io::{self, Read, Write};

use crate::lock::{LockMode, LockType, PolicyData};
use crate::resource::ResourceId;

/// Result of wire codec operations with error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Wire codec errors.
#[derive(Debug)]
pub enum Error {
    /// Truncated or unreadable buffer.
    IO(io::Error),
    /// A discriminant not covered by the protocol enum.
    EnumDiscMismatch,
}

/// Opcodes of the two client-originated DLM RPCs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(u32)]
pub enum Opcode {
    Enqueue = 101,
    Cancel = 103,
}

/// Portal pair an RPC is addressed to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PortalPair {
    pub request: u32,
    pub reply: u32,
}

/// Default portals for lock traffic.
pub const DLM_PORTALS: PortalPair = PortalPair { request: 10, reply: 11 };

/// Dedicated portals for cancel traffic.
pub const CANCEL_PORTALS: PortalPair = PortalPair { request: 12, reply: 13 };

/// Handle slots always present in a request buffer.
pub const LOCKREQ_HANDLES: usize = 2;

/// Slots reserved for the requested lock in an ENQUEUE buffer.
pub const ENQUEUE_CANCEL_OFF: usize = 1;

/// Bytes per packed lock handle.
pub const HANDLE_WIRE_SIZE: usize = 8;

/// Encoded size of a lock descriptor: 4-word resource name, type, both
/// modes, policy union.
pub const DESC_WIRE_SIZE: usize = 32 + 4 + 4 + 4 + 32;

/// Encoded size of a request with the built-in handle slots only.
pub const BASE_WIRE_SIZE: usize = 8 + 4 + DESC_WIRE_SIZE + LOCKREQ_HANDLES * HANDLE_WIRE_SIZE;

/// Transport envelope accounted to every request.
pub const MSG_OVERHEAD: usize = 192;

/// Hard cap on a DLM request buffer.
pub const MAX_REQ_SIZE: usize = 4736;

const PAGE_SIZE: usize = 4096;

/// Headroom left for transport headers within a page.
const PAGE_SLOP: usize = 512;

/// Size of the DLM request buffer needed to pack `count` handles for
/// the given opcode. Enqueue already spends [`ENQUEUE_CANCEL_OFF`] of
/// the built-in slots on the requested lock.
pub fn request_bufsize(count: usize, opcode: Opcode) -> usize {
    let mut avail = LOCKREQ_HANDLES;
    if opcode == Opcode::Enqueue {
        avail -= ENQUEUE_CANCEL_OFF;
    }
    let extra = count.saturating_sub(avail) * HANDLE_WIRE_SIZE;
    BASE_WIRE_SIZE + extra
}

/// Number of handles that fit in a single request of `req_size` encoded
/// bytes, with `off` built-in slots already spoken for. The budget is
/// bounded by both the protocol maximum and what fits in one page on
/// the send side.
pub fn handles_avail(req_size: usize, off: usize) -> usize {
    let budget = MAX_REQ_SIZE.min(PAGE_SIZE - PAGE_SLOP);
    let avail = budget.saturating_sub(req_size) / HANDLE_WIRE_SIZE;
    avail + LOCKREQ_HANDLES - off
}

/// Handle capacity of a freshly formatted request for `opcode`.
pub fn format_handles_avail(opcode: Opcode, off: usize) -> usize {
    let _ = opcode;
    handles_avail(MSG_OVERHEAD + BASE_WIRE_SIZE, off)
}

/// Wire form of a lock descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDesc {
    pub resource: ResourceId,
    pub lock_type: LockType,
    pub req_mode: LockMode,
    /// Raw granted mode; zero when nothing is granted yet.
    pub granted_mode: u32,
    pub policy: [u64; 4],
}

impl LockDesc {
    /// Placeholder descriptor for requests filled in later.
    pub fn empty() -> LockDesc {
        LockDesc {
            resource: ResourceId([0; 4]),
            lock_type: LockType::Plain,
            req_mode: LockMode::Nl,
            granted_mode: 0,
            policy: [0; 4],
        }
    }

    pub fn encode(&self, dst: &mut impl Write) -> Result<()> {
        for word in self.resource.0 {
            primitive::put_u64(dst, word)?;
        }
        primitive::put_u32(dst, self.lock_type as u32)?;
        primitive::put_u32(dst, self.req_mode as u32)?;
        primitive::put_u32(dst, self.granted_mode)?;
        for word in self.policy {
            primitive::put_u64(dst, word)?;
        }
        Ok(())
    }

    pub fn decode(src: &mut impl Read) -> Result<LockDesc> {
        let mut name = [0u64; 4];
        for word in &mut name {
            *word = primitive::u64(src)?;
        }
        let lock_type: LockType = primitive::c_enum(src)?;
        let req_mode: LockMode = primitive::c_enum(src)?;
        let granted_mode = primitive::u32(src)?;
        let mut policy = [0u64; 4];
        for word in &mut policy {
            *word = primitive::u64(src)?;
        }
        Ok(LockDesc { resource: ResourceId(name), lock_type, req_mode, granted_mode, policy })
    }
}

/// Client-to-server DLM request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlmRequest {
    /// Wire lock flags.
    pub flags: u64,
    /// Number of filled handle slots (including any reserved offset).
    pub lock_count: u32,
    pub desc: LockDesc,
    /// Handle slots; index 0 carries the requested lock on enqueue.
    pub handles: Vec<u64>,
}

impl DlmRequest {
    pub fn new(desc: LockDesc) -> DlmRequest {
        DlmRequest { flags: 0, lock_count: 0, desc, handles: Vec::new() }
    }

    /// Encodes the body, always emitting at least the built-in handle
    /// slots.
    pub fn encode(&self, dst: &mut impl Write) -> Result<()> {
        primitive::put_u64(dst, self.flags)?;
        primitive::put_u32(dst, self.lock_count)?;
        self.desc.encode(dst)?;
        let slots = self.handles.len().max(LOCKREQ_HANDLES);
        for i in 0..slots {
            primitive::put_u64(dst, self.handles.get(i).copied().unwrap_or(0))?;
        }
        Ok(())
    }

    /// Decodes a body carrying `slots` handle slots.
    pub fn decode(src: &mut impl Read, slots: usize) -> Result<DlmRequest> {
        let flags = primitive::u64(src)?;
        let lock_count = primitive::u32(src)?;
        let desc = LockDesc::decode(src)?;
        let mut handles = Vec::with_capacity(slots);
        for _ in 0..slots {
            handles.push(primitive::u64(src)?);
        }
        Ok(DlmRequest { flags, lock_count, desc, handles })
    }

    /// Encoded size of this body.
    pub fn wire_size(&self) -> usize {
        BASE_WIRE_SIZE
            + self.handles.len().saturating_sub(LOCKREQ_HANDLES) * HANDLE_WIRE_SIZE
    }
}

/// Server reply to an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlmReply {
    /// Wire lock flags.
    pub flags: u64,
    /// Server-assigned lock cookie.
    pub handle: u64,
    pub desc: LockDesc,
    /// Lock value block, when the reply carries one.
    pub lvb: Option<Vec<u8>>,
}

impl DlmReply {
    pub fn encode(&self, dst: &mut impl Write) -> Result<()> {
        primitive::put_u64(dst, self.flags)?;
        primitive::put_u64(dst, self.handle)?;
        self.desc.encode(dst)?;
        match &self.lvb {
            None => primitive::put_u32(dst, 0)?,
            Some(data) => {
                primitive::put_u32(dst, data.len() as u32)?;
                dst.write_all(data).map_err(Error::IO)?;
            }
        }
        Ok(())
    }

    pub fn decode(src: &mut impl Read) -> Result<DlmReply> {
        let flags = primitive::u64(src)?;
        let handle = primitive::u64(src)?;
        let desc = LockDesc::decode(src)?;
        let lvb_len = primitive::u32(src)? as usize;
        let lvb = if lvb_len == 0 {
            None
        } else {
            let mut data = vec![0u8; lvb_len];
            src.read_exact(&mut data).map_err(Error::IO)?;
            Some(data)
        };
        Ok(DlmReply { flags, handle, desc, lvb })
    }
}

/// Packs type-dependent policy data into the wire union.
pub fn policy_to_wire(policy: &PolicyData) -> [u64; 4] {
    match *policy {
        PolicyData::Plain => [0; 4],
        PolicyData::Extent { start, end, gid } => [start, end, gid, 0],
        PolicyData::Ibits { bits } => [bits, 0, 0, 0],
        PolicyData::Flock { start, end, owner, pid } => [start, end, owner, pid as u64],
    }
}

/// Translates the wire policy union to the local form for `lock_type`.
pub fn policy_from_wire(lock_type: LockType, raw: [u64; 4]) -> PolicyData {
    match lock_type {
        LockType::Plain => PolicyData::Plain,
        LockType::Extent => PolicyData::Extent { start: raw[0], end: raw[1], gid: raw[2] },
        LockType::Ibits => PolicyData::Ibits { bits: raw[0] },
        LockType::Flock => {
            PolicyData::Flock { start: raw[0], end: raw[1], owner: raw[2], pid: raw[3] as u32 }
        }
    }
}
