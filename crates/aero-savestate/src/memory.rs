//! Live-state address space walked by the save state tree.
//!
//! Registered items never hold host pointers. Every field is located by a `u64` address inside a
//! [`StateMemory`], and indirections (pointers, owned boxes, growable buffers) are followed through
//! [`StateMemory::resolve`], so one sealed schema can be reused against any number of live object
//! instances.

use thiserror::Error;

use crate::item::Indirection;

/// Width of an address word stored in live state.
pub const POINTER_SIZE: u64 = 8;

/// Addresses below this value are never mapped, so a zero address always reads as null.
const ARENA_BASE: u64 = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("state memory access out of range: addr=0x{addr:x} len={len}")]
    OutOfRange { addr: u64, len: usize },

    #[error("null {kind} indirection at 0x{addr:x}")]
    NullIndirection { kind: &'static str, addr: u64 },

    #[error("state memory allocation of {len} bytes (align {align}) is not possible")]
    BadAllocation { len: u64, align: u64 },

    #[error("collection at 0x{addr:x} holds {len} items, {expected} are registered")]
    ShortCollection { addr: u64, len: u64, expected: u64 },
}

pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// Live storage an indirection currently refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Referent {
    pub addr: u64,
    /// Element count of a dynamic collection; `None` for pointers to a single object.
    pub len: Option<u64>,
}

/// Byte-addressable view of the simulation's mutable state.
pub trait StateMemory {
    /// Reads bytes starting at `addr` into `dst`.
    fn read_into(&self, addr: u64, dst: &mut [u8]) -> MemoryResult<()>;

    /// Writes `src` starting at `addr`.
    fn write_from(&mut self, addr: u64, src: &[u8]) -> MemoryResult<()>;

    /// Returns the storage an indirection located at `addr` currently refers to.
    ///
    /// The default layout matches [`StateArena`]'s helpers: pointers and owning pointers are a
    /// single native-endian address word, and a dynamic collection is an address word followed
    /// by an element-count word.
    fn resolve(&self, indirection: Indirection, addr: u64) -> MemoryResult<Referent> {
        let mut word = [0u8; POINTER_SIZE as usize];
        self.read_into(addr, &mut word)?;
        let target = u64::from_ne_bytes(word);
        if target == 0 {
            return Err(MemoryError::NullIndirection {
                kind: indirection.name(),
                addr,
            });
        }

        let len = match indirection {
            Indirection::Pointer | Indirection::Unique => None,
            Indirection::Vector => {
                let len_addr = addr
                    .checked_add(POINTER_SIZE)
                    .ok_or(MemoryError::OutOfRange {
                        addr,
                        len: 2 * POINTER_SIZE as usize,
                    })?;
                self.read_into(len_addr, &mut word)?;
                Some(u64::from_ne_bytes(word))
            }
        };
        Ok(Referent { addr: target, len })
    }
}

#[derive(Debug)]
struct Region {
    base: u64,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }
}

/// A growable set of disjoint byte regions, each mapped at its own address.
///
/// Accesses must stay inside a single region; anything else is [`MemoryError::OutOfRange`].
#[derive(Debug)]
pub struct StateArena {
    regions: Vec<Region>,
    next: u64,
}

impl Default for StateArena {
    fn default() -> Self {
        Self::new()
    }
}

impl StateArena {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            next: ARENA_BASE,
        }
    }

    /// Maps a zero-filled region of `len` bytes and returns its address.
    pub fn alloc(&mut self, len: u64, align: u64) -> MemoryResult<u64> {
        if align == 0 || !align.is_power_of_two() {
            return Err(MemoryError::BadAllocation { len, align });
        }
        let base = self
            .next
            .checked_add(align - 1)
            .map(|v| v & !(align - 1))
            .ok_or(MemoryError::BadAllocation { len, align })?;
        let size = usize::try_from(len).map_err(|_| MemoryError::BadAllocation { len, align })?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| MemoryError::BadAllocation { len, align })?;
        data.resize(size, 0);

        // Leave a gap after every region so neighbours never look contiguous.
        self.next = base
            .checked_add(len)
            .and_then(|end| end.checked_add(16))
            .ok_or(MemoryError::BadAllocation { len, align })?;
        self.regions.push(Region { base, data });
        Ok(base)
    }

    /// Number of mapped bytes across all regions.
    pub fn mapped_len(&self) -> u64 {
        self.regions.iter().map(|r| r.data.len() as u64).sum()
    }

    fn locate(&self, addr: u64, len: usize) -> MemoryResult<(usize, usize)> {
        let oob = MemoryError::OutOfRange { addr, len };
        // Regions are allocated at increasing addresses, so the vector stays sorted.
        let idx = match self.regions.binary_search_by(|r| r.base.cmp(&addr)) {
            Ok(idx) => idx,
            Err(0) => return Err(oob),
            Err(idx) => idx - 1,
        };
        let region = &self.regions[idx];
        let end = addr.checked_add(len as u64).ok_or(oob.clone())?;
        if end > region.end() {
            return Err(oob);
        }
        Ok((idx, (addr - region.base) as usize))
    }

    /// Optional fast path mirroring [`StateMemory::read_into`] without copying.
    pub fn slice(&self, addr: u64, len: usize) -> MemoryResult<&[u8]> {
        let (idx, start) = self.locate(addr, len)?;
        Ok(&self.regions[idx].data[start..start + len])
    }

    pub fn read_u8(&self, addr: u64) -> MemoryResult<u8> {
        Ok(self.read_array::<1>(addr)?[0])
    }

    pub fn read_u16(&self, addr: u64) -> MemoryResult<u16> {
        Ok(u16::from_ne_bytes(self.read_array(addr)?))
    }

    pub fn read_u32(&self, addr: u64) -> MemoryResult<u32> {
        Ok(u32::from_ne_bytes(self.read_array(addr)?))
    }

    pub fn read_u64(&self, addr: u64) -> MemoryResult<u64> {
        Ok(u64::from_ne_bytes(self.read_array(addr)?))
    }

    pub fn read_i32(&self, addr: u64) -> MemoryResult<i32> {
        Ok(i32::from_ne_bytes(self.read_array(addr)?))
    }

    pub fn read_f32(&self, addr: u64) -> MemoryResult<f32> {
        Ok(f32::from_ne_bytes(self.read_array(addr)?))
    }

    pub fn read_f64(&self, addr: u64) -> MemoryResult<f64> {
        Ok(f64::from_ne_bytes(self.read_array(addr)?))
    }

    pub fn read_bool(&self, addr: u64) -> MemoryResult<bool> {
        Ok(self.read_u8(addr)? != 0)
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) -> MemoryResult<()> {
        self.write_from(addr, &[value])
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) -> MemoryResult<()> {
        self.write_from(addr, &value.to_ne_bytes())
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> MemoryResult<()> {
        self.write_from(addr, &value.to_ne_bytes())
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> MemoryResult<()> {
        self.write_from(addr, &value.to_ne_bytes())
    }

    pub fn write_i32(&mut self, addr: u64, value: i32) -> MemoryResult<()> {
        self.write_from(addr, &value.to_ne_bytes())
    }

    pub fn write_f32(&mut self, addr: u64, value: f32) -> MemoryResult<()> {
        self.write_from(addr, &value.to_ne_bytes())
    }

    pub fn write_f64(&mut self, addr: u64, value: f64) -> MemoryResult<()> {
        self.write_from(addr, &value.to_ne_bytes())
    }

    pub fn write_bool(&mut self, addr: u64, value: bool) -> MemoryResult<()> {
        self.write_u8(addr, u8::from(value))
    }

    /// Stores `target` as a pointer (or owning pointer) word at `addr`.
    pub fn write_pointer(&mut self, addr: u64, target: u64) -> MemoryResult<()> {
        self.write_u64(addr, target)
    }

    /// Stores a dynamic collection header (`data`, `len`) at `addr`.
    pub fn write_vec_header(&mut self, addr: u64, data: u64, len: u64) -> MemoryResult<()> {
        self.write_u64(addr, data)?;
        self.write_u64(addr + POINTER_SIZE, len)
    }

    fn read_array<const N: usize>(&self, addr: u64) -> MemoryResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }
}

impl StateMemory for StateArena {
    fn read_into(&self, addr: u64, dst: &mut [u8]) -> MemoryResult<()> {
        let (idx, start) = self.locate(addr, dst.len())?;
        dst.copy_from_slice(&self.regions[idx].data[start..start + dst.len()]);
        Ok(())
    }

    fn write_from(&mut self, addr: u64, src: &[u8]) -> MemoryResult<()> {
        let (idx, start) = self.locate(addr, src.len())?;
        self.regions[idx].data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_disjoint_and_aligned() {
        let mut arena = StateArena::new();
        let a = arena.alloc(3, 1).unwrap();
        let b = arena.alloc(8, 8).unwrap();
        assert_ne!(a, 0);
        assert_eq!(b % 8, 0);
        assert!(b >= a + 3);
        assert_eq!(arena.mapped_len(), 11);
    }

    #[test]
    fn typed_accessors_round_trip() {
        let mut arena = StateArena::new();
        let base = arena.alloc(32, 8).unwrap();
        arena.write_u32(base, 0xdead_beef).unwrap();
        arena.write_f64(base + 8, -2.5).unwrap();
        arena.write_bool(base + 16, true).unwrap();
        assert_eq!(arena.read_u32(base).unwrap(), 0xdead_beef);
        assert_eq!(arena.read_f64(base + 8).unwrap(), -2.5);
        assert!(arena.read_bool(base + 16).unwrap());
        assert_eq!(arena.slice(base, 4).unwrap(), &0xdead_beefu32.to_ne_bytes());
    }

    #[test]
    fn accesses_crossing_a_region_boundary_fail() {
        let mut arena = StateArena::new();
        let base = arena.alloc(4, 4).unwrap();
        let _next = arena.alloc(4, 4).unwrap();
        assert!(matches!(
            arena.read_u64(base),
            Err(MemoryError::OutOfRange { .. })
        ));
        assert!(arena.read_u8(0).is_err());
        assert!(arena.write_u32(u64::MAX - 1, 0).is_err());
    }

    #[test]
    fn resolve_follows_pointer_words() {
        let mut arena = StateArena::new();
        let target = arena.alloc(4, 4).unwrap();
        let holder = arena.alloc(16, 8).unwrap();
        arena.write_pointer(holder, target).unwrap();
        assert_eq!(
            arena.resolve(Indirection::Pointer, holder).unwrap(),
            Referent {
                addr: target,
                len: None
            }
        );

        arena.write_vec_header(holder, target, 5).unwrap();
        assert_eq!(
            arena.resolve(Indirection::Vector, holder).unwrap(),
            Referent {
                addr: target,
                len: Some(5)
            }
        );

        arena.write_pointer(holder, 0).unwrap();
        assert!(matches!(
            arena.resolve(Indirection::Unique, holder),
            Err(MemoryError::NullIndirection { .. })
        ));
    }

    #[test]
    fn rejects_bad_alignment() {
        let mut arena = StateArena::new();
        assert!(arena.alloc(4, 3).is_err());
        assert!(arena.alloc(4, 0).is_err());
    }
}
