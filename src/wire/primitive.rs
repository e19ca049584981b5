//! Primitive scalar codec for the DLM wire format, network byte order.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;

use super::{Error, Result};

/// Parses a `u32` from the source.
pub fn u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<BigEndian>().map_err(Error::IO)
}

/// Parses a `u64` from the source.
pub fn u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<BigEndian>().map_err(Error::IO)
}

/// Writes a `u32` to the sink.
pub fn put_u32(dst: &mut impl Write, value: u32) -> Result<()> {
    dst.write_u32::<BigEndian>(value).map_err(Error::IO)
}

/// Writes a `u64` to the sink.
pub fn put_u64(dst: &mut impl Write, value: u64) -> Result<()> {
    dst.write_u64::<BigEndian>(value).map_err(Error::IO)
}

/// Parses a C-style enum encoded as `u32`, rejecting unknown
/// discriminants.
pub fn c_enum<T: FromPrimitive>(src: &mut impl Read) -> Result<T> {
    let raw = u32(src)?;
    T::from_u32(raw).ok_or(Error::EnumDiscMismatch)
}
