//! Binary codec: packs live state into a flat buffer in schema order and back.
//!
//! Scalars are copied at their native width with no endian conversion, booleans as a single
//! 0/1 byte, structures as the concatenation of their children and arrays as `count`
//! repetitions of their element. There is no framing of any kind.
//!
//! Both directions always return the full schema size. When the buffer is shorter, writes (or
//! reads) past its end are skipped, so packing into an empty buffer is a cheap way to measure a
//! tree against live state.

use crate::item::{ItemKind, RegisteredItem, Resolved};
use crate::memory::{MemoryError, MemoryResult, StateMemory};

pub fn pack<M: StateMemory + ?Sized>(
    item: &RegisteredItem,
    mem: &M,
    out: &mut [u8],
    base: u64,
) -> MemoryResult<u64> {
    let base = match item.resolve_base(mem, base)? {
        Resolved::Forward(pointee, base) => return pack(pointee, mem, out, base),
        Resolved::Here(base) => base,
    };

    let len = out.len() as u64;
    let mut offset = 0u64;
    match item.kind() {
        ItemKind::Bool => {
            if len >= 1 {
                let mut byte = [0u8; 1];
                mem.read_into(base, &mut byte)?;
                out[0] = u8::from(byte[0] != 0);
            }
            offset = 1;
        }
        ItemKind::Int | ItemKind::Uint | ItemKind::Float => {
            let width = u64::from(item.native_size());
            if width <= len {
                mem.read_into(base, &mut out[..width as usize])?;
            }
            offset = width;
        }
        ItemKind::Container | ItemKind::Struct => {
            for child in item.items() {
                offset += pack(child, mem, tail_mut(out, offset), base)?;
            }
        }
        ItemKind::Array { count } => {
            if let Some(element) = item.element() {
                for rep in 0..count {
                    let element_base = element_base(base, rep, item.native_size())?;
                    offset += pack(element, mem, tail_mut(out, offset), element_base)?;
                }
            }
        }
        // An indirection without a pointee describes nothing.
        ItemKind::Indirect(_) => {}
    }
    Ok(offset)
}

pub fn unpack<M: StateMemory + ?Sized>(
    item: &RegisteredItem,
    mem: &mut M,
    input: &[u8],
    base: u64,
) -> MemoryResult<u64> {
    let base = match item.resolve_base(&*mem, base)? {
        Resolved::Forward(pointee, base) => return unpack(pointee, mem, input, base),
        Resolved::Here(base) => base,
    };

    let len = input.len() as u64;
    let mut offset = 0u64;
    match item.kind() {
        ItemKind::Bool => {
            if len >= 1 {
                mem.write_from(base, &[u8::from(input[0] != 0)])?;
            }
            offset = 1;
        }
        ItemKind::Int | ItemKind::Uint | ItemKind::Float => {
            let width = u64::from(item.native_size());
            if width <= len {
                mem.write_from(base, &input[..width as usize])?;
            }
            offset = width;
        }
        ItemKind::Container | ItemKind::Struct => {
            for child in item.items() {
                offset += unpack(child, mem, tail(input, offset), base)?;
            }
        }
        ItemKind::Array { count } => {
            if let Some(element) = item.element() {
                for rep in 0..count {
                    let element_base = element_base(base, rep, item.native_size())?;
                    offset += unpack(element, mem, tail(input, offset), element_base)?;
                }
            }
        }
        ItemKind::Indirect(_) => {}
    }
    Ok(offset)
}

/// Reverses the byte order of every scalar in a packed buffer, walking the schema only.
///
/// Returns the number of bytes the schema covers; bytes past the end of `buf` are left alone.
pub fn swap_endianness(item: &RegisteredItem, buf: &mut [u8]) -> u64 {
    let len = buf.len() as u64;
    match item.kind() {
        ItemKind::Bool => 1,
        ItemKind::Int | ItemKind::Uint | ItemKind::Float => {
            let width = u64::from(item.native_size());
            if width <= len {
                buf[..width as usize].reverse();
            }
            width
        }
        ItemKind::Container | ItemKind::Struct => {
            let mut offset = 0u64;
            for child in item.items() {
                offset += swap_endianness(child, tail_mut(buf, offset));
            }
            offset
        }
        ItemKind::Array { count } => {
            let mut offset = 0u64;
            if let Some(element) = item.element() {
                for _ in 0..count {
                    offset += swap_endianness(element, tail_mut(buf, offset));
                }
            }
            offset
        }
        ItemKind::Indirect(_) => item
            .element()
            .map_or(0, |pointee| swap_endianness(pointee, buf)),
    }
}

fn element_base(base: u64, rep: u32, stride: u32) -> MemoryResult<u64> {
    base.checked_add(u64::from(rep) * u64::from(stride))
        .ok_or(MemoryError::OutOfRange { addr: base, len: 0 })
}

fn tail(buf: &[u8], offset: u64) -> &[u8] {
    let start = usize::try_from(offset).map_or(buf.len(), |o| o.min(buf.len()));
    &buf[start..]
}

fn tail_mut(buf: &mut [u8], offset: u64) -> &mut [u8] {
    let start = usize::try_from(offset).map_or(buf.len(), |o| o.min(buf.len()));
    &mut buf[start..]
}
