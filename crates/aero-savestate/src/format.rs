use std::io::{Read, Write};

use bitflags::bitflags;

use crate::codec;
use crate::error::{Result, SaveError};
use crate::io::{ReadLeExt, WriteLeExt};
use crate::manager::SaveManager;
use crate::memory::StateMemory;

pub const STATE_MAGIC: &[u8; 8] = b"AEROSAVE";
pub const STATE_VERSION: u8 = 2;
pub const STATE_HEADER_LEN: usize = 32;
/// Width of the zero-padded configuration identifier in the header.
pub const STATE_ID_LEN: usize = 18;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct StateFlags: u8 {
        /// Scalars were written most-significant byte first.
        const MSB_FIRST = 0x02;
        /// The payload is an LZ4 block prefixed with its uncompressed length.
        const COMPRESSED = 0x04;
    }
}

impl StateFlags {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            StateFlags::MSB_FIRST
        } else {
            StateFlags::empty()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateFileOptions {
    pub compress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHeader {
    pub version: u8,
    pub flags: StateFlags,
    pub id: [u8; STATE_ID_LEN],
    pub signature: u32,
}

impl StateHeader {
    pub fn new(id: &str, flags: StateFlags, signature: u32) -> Result<Self> {
        Ok(Self {
            version: STATE_VERSION,
            flags,
            id: encode_id(id)?,
            signature,
        })
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_bytes(STATE_MAGIC)?;
        w.write_u8(self.version)?;
        w.write_u8(self.flags.bits())?;
        w.write_bytes(&self.id)?;
        w.write_u32_le(self.signature)?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != STATE_MAGIC {
            return Err(SaveError::InvalidHeader("bad magic"));
        }
        let version = r.read_u8()?;
        if version != STATE_VERSION {
            return Err(SaveError::InvalidHeader("unsupported version"));
        }
        let flags = StateFlags::from_bits(r.read_u8()?)
            .ok_or(SaveError::InvalidHeader("unknown flags"))?;
        let mut id = [0u8; STATE_ID_LEN];
        r.read_exact(&mut id)?;
        let signature = r.read_u32_le()?;
        Ok(Self {
            version,
            flags,
            id,
            signature,
        })
    }

    /// The identifier with its zero padding removed.
    pub fn id(&self) -> &[u8] {
        let end = self.id.iter().position(|&b| b == 0).unwrap_or(STATE_ID_LEN);
        &self.id[..end]
    }
}

fn encode_id(id: &str) -> Result<[u8; STATE_ID_LEN]> {
    let bytes = id.as_bytes();
    if bytes.len() > STATE_ID_LEN {
        return Err(SaveError::InvalidHeader("identifier longer than 18 bytes"));
    }
    let mut out = [0u8; STATE_ID_LEN];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Saves a framed binary snapshot: header, then the packed state (optionally LZ4-compressed).
pub fn write_state_file<W: Write, M: StateMemory>(
    w: &mut W,
    manager: &mut SaveManager<M>,
    mem: &mut M,
    id: &str,
    options: StateFileOptions,
) -> Result<()> {
    let mut flags = StateFlags::native();
    if options.compress {
        flags |= StateFlags::COMPRESSED;
    }
    let header = StateHeader::new(id, flags, manager.signature())?;

    let len = usize::try_from(manager.binary_size())
        .map_err(|_| SaveError::Corrupt("state too large"))?;
    let mut payload = vec![0u8; len];
    manager.save_binary(mem, &mut payload)?;

    header.encode(w)?;
    if options.compress {
        w.write_bytes(&lz4_flex::block::compress_prepend_size(&payload))?;
    } else {
        w.write_bytes(&payload)?;
    }
    tracing::debug!(id, bytes = len, compressed = options.compress, "wrote state file");
    Ok(())
}

/// Loads a snapshot written by [`write_state_file`] for the same configuration `id` and layout.
pub fn read_state_file<R: Read, M: StateMemory>(
    r: &mut R,
    manager: &mut SaveManager<M>,
    mem: &mut M,
    id: &str,
) -> Result<()> {
    let header = StateHeader::decode(r)?;
    if header.id != encode_id(id)? {
        return Err(SaveError::InvalidHeader("configuration identifier mismatch"));
    }
    if header.signature != manager.signature() {
        return Err(SaveError::InvalidHeader("state layout signature mismatch"));
    }

    let expected = manager.binary_size();
    let mut payload = if header.flags.contains(StateFlags::COMPRESSED) {
        let uncompressed_len = u64::from(r.read_u32_le()?);
        if uncompressed_len != expected {
            return Err(SaveError::ReadError {
                expected,
                consumed: uncompressed_len,
            });
        }
        let mut compressed = Vec::new();
        r.read_to_end(&mut compressed)?;
        lz4_flex::block::decompress(&compressed, uncompressed_len as usize)?
    } else {
        let mut raw = Vec::new();
        r.take(expected.saturating_add(1)).read_to_end(&mut raw)?;
        raw
    };
    if payload.len() as u64 != expected {
        return Err(SaveError::ReadError {
            expected,
            consumed: payload.len() as u64,
        });
    }

    let foreign_order = header.flags.contains(StateFlags::MSB_FIRST) != cfg!(target_endian = "big");
    if foreign_order {
        codec::swap_endianness(manager.root(), &mut payload);
    }
    manager.load_binary(mem, &payload)?;
    tracing::debug!(id, bytes = payload.len(), "loaded state file");
    Ok(())
}
