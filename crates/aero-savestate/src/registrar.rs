//! Typed front-end used by simulation components to describe their state.

use crate::error::{Result, SaveError};
use crate::item::{normalize_name, Indirection, ItemKind, RegisteredItem};

/// Primitive types that can be registered as scalar state fields.
pub trait StateScalar: Copy {
    const KIND: ItemKind;
    const SIZE: u32;
}

macro_rules! impl_state_scalar {
    ($kind:expr => $($ty:ty),+) => {
        $(
            impl StateScalar for $ty {
                const KIND: ItemKind = $kind;
                const SIZE: u32 = std::mem::size_of::<$ty>() as u32;
            }
        )+
    };
}

impl_state_scalar!(ItemKind::Bool => bool);
impl_state_scalar!(ItemKind::Int => i8, i16, i32, i64);
impl_state_scalar!(ItemKind::Uint => u8, u16, u32, u64);
impl_state_scalar!(ItemKind::Float => f32, f64);

/// Registers fields below one node of the tree.
///
/// Offsets are relative to the node's own base address, except directly below a container where
/// they are absolute addresses.
pub struct Registrar<'a> {
    item: &'a mut RegisteredItem,
}

impl<'a> Registrar<'a> {
    pub fn new(item: &'a mut RegisteredItem) -> Self {
        Self { item }
    }

    /// Low-level escape hatch mirroring [`RegisteredItem::append`].
    pub fn append(
        &mut self,
        offset: u64,
        kind: ItemKind,
        native_size: u32,
        name: &str,
    ) -> Result<Registrar<'_>> {
        Ok(Registrar::new(self.item.append(offset, kind, native_size, name)?))
    }

    /// Opens (or creates) a named container below this node.
    pub fn container(&mut self, name: &str) -> Result<Registrar<'_>> {
        let name = normalize_name(name);
        let exists = self
            .item
            .find(name)
            .is_some_and(|item| item.kind() == ItemKind::Container);
        if exists {
            let item = self
                .item
                .find_mut(name)
                .ok_or_else(|| SaveError::DuplicateName(name.to_string()))?;
            return Ok(Registrar::new(item));
        }
        self.append(0, ItemKind::Container, 0, name)
    }

    pub fn reg<T: StateScalar>(&mut self, offset: u64, name: &str) -> Result<()> {
        self.item.append(offset, T::KIND, T::SIZE, name)?;
        Ok(())
    }

    pub fn reg_array<T: StateScalar>(&mut self, offset: u64, name: &str, count: u32) -> Result<()> {
        self.item
            .append(offset, ItemKind::Array { count }, T::SIZE, name)?
            .append(0, T::KIND, T::SIZE, "")?;
        Ok(())
    }

    /// Registers a `rows` x `cols` row-major array of `T`.
    pub fn reg_array_2d<T: StateScalar>(
        &mut self,
        offset: u64,
        name: &str,
        rows: u32,
        cols: u32,
    ) -> Result<()> {
        self.item
            .append(offset, ItemKind::Array { count: rows }, T::SIZE * cols, name)?
            .append(0, ItemKind::Array { count: cols }, T::SIZE, "")?
            .append(0, T::KIND, T::SIZE, "")?;
        Ok(())
    }

    pub fn reg_struct(
        &mut self,
        offset: u64,
        name: &str,
        size: u32,
        f: impl FnOnce(&mut Registrar<'_>) -> Result<()>,
    ) -> Result<()> {
        let item = self.item.append(offset, ItemKind::Struct, size, name)?;
        f(&mut Registrar::new(item))
    }

    /// Registers `count` structures laid out `stride` bytes apart; `f` describes one element.
    pub fn reg_struct_array(
        &mut self,
        offset: u64,
        name: &str,
        count: u32,
        stride: u32,
        f: impl FnOnce(&mut Registrar<'_>) -> Result<()>,
    ) -> Result<()> {
        let element = self
            .item
            .append(offset, ItemKind::Array { count }, stride, name)?
            .append(0, ItemKind::Struct, stride, "")?;
        f(&mut Registrar::new(element))
    }

    /// Registers a transparent indirection at `offset`; `f` must register exactly one pointee
    /// item at offset 0, which is what gets saved. The pointee is saved under `name`.
    pub fn reg_indirect(
        &mut self,
        offset: u64,
        name: &str,
        indirection: Indirection,
        f: impl FnOnce(&mut Registrar<'_>) -> Result<()>,
    ) -> Result<()> {
        let item = self
            .item
            .append(offset, ItemKind::Indirect(indirection), 0, name)?;
        f(&mut Registrar::new(item))
    }

    pub fn reg_pointer(
        &mut self,
        offset: u64,
        name: &str,
        f: impl FnOnce(&mut Registrar<'_>) -> Result<()>,
    ) -> Result<()> {
        self.reg_indirect(offset, name, Indirection::Pointer, f)
    }

    pub fn reg_unique(
        &mut self,
        offset: u64,
        name: &str,
        f: impl FnOnce(&mut Registrar<'_>) -> Result<()>,
    ) -> Result<()> {
        self.reg_indirect(offset, name, Indirection::Unique, f)
    }

    pub fn reg_vector(
        &mut self,
        offset: u64,
        name: &str,
        f: impl FnOnce(&mut Registrar<'_>) -> Result<()>,
    ) -> Result<()> {
        self.reg_indirect(offset, name, Indirection::Vector, f)
    }

    /// Registers a dynamically sized collection of `len` scalars whose header lives at `offset`.
    pub fn reg_vec<T: StateScalar>(&mut self, offset: u64, name: &str, len: u32) -> Result<()> {
        self.reg_vector(offset, name, |r| r.reg_array::<T>(0, name, len))
    }
}
