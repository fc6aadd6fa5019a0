//! The registered-item tree: a self-describing schema of every field the save state engine can
//! capture or restore.
//!
//! Items carry an offset relative to a running base address rather than an absolute address, so
//! the same subtree describes every live instance of a structure. Direct children of a
//! [`ItemKind::Container`] are the exception: containers reset the base to zero, so their
//! children's offsets are absolute addresses in the [`StateMemory`].

use crc32fast::Hasher;

use crate::error::{Result, SaveError};
use crate::memory::{MemoryError, MemoryResult, StateMemory};

/// Transparent wrappers that redirect the walk to storage located elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indirection {
    /// A plain (non-owning) pointer.
    Pointer,
    /// An owning pointer, e.g. a boxed sub-device.
    Unique,
    /// A dynamically sized collection; the walk continues at its element storage.
    Vector,
}

impl Indirection {
    pub fn name(self) -> &'static str {
        match self {
            Indirection::Pointer => "POINTER",
            Indirection::Unique => "UNIQUE",
            Indirection::Vector => "VECTOR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Grouping level with no storage of its own. Resets the running base to zero.
    Container,
    /// A structure; children are laid out relative to the structure's address.
    Struct,
    /// `count` repetitions of the single element item, `native_size` bytes apart.
    Array { count: u32 },
    Bool,
    Int,
    Uint,
    Float,
    Indirect(Indirection),
}

impl ItemKind {
    fn tag(self) -> u8 {
        match self {
            ItemKind::Container => 0,
            ItemKind::Struct => 1,
            ItemKind::Array { .. } => 2,
            ItemKind::Bool => 3,
            ItemKind::Int => 4,
            ItemKind::Uint => 5,
            ItemKind::Float => 6,
            ItemKind::Indirect(Indirection::Pointer) => 7,
            ItemKind::Indirect(Indirection::Unique) => 8,
            ItemKind::Indirect(Indirection::Vector) => 9,
        }
    }
}

/// Where a walk continues after applying an item's offset.
#[derive(Debug)]
pub enum Resolved<'a> {
    /// Continue with this item at the returned base.
    Here(u64),
    /// The item was a transparent indirection; continue with its pointee at the new base.
    Forward(&'a RegisteredItem, u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredItem {
    offset: u64,
    kind: ItemKind,
    native_size: u32,
    name: String,
    items: Vec<RegisteredItem>,
}

impl Default for RegisteredItem {
    fn default() -> Self {
        Self::root()
    }
}

impl RegisteredItem {
    /// An anonymous container at address zero.
    pub fn root() -> Self {
        Self {
            offset: 0,
            kind: ItemKind::Container,
            native_size: 0,
            name: String::new(),
            items: Vec::new(),
        }
    }

    fn new(offset: u64, kind: ItemKind, native_size: u32, name: &str) -> Self {
        Self {
            offset,
            kind,
            native_size,
            name: normalize_name(name).to_string(),
            items: Vec::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    /// Scalar width in bytes, the element stride for arrays, or the structure size.
    pub fn native_size(&self) -> u32 {
        self.native_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn items(&self) -> &[RegisteredItem] {
        &self.items
    }

    /// Repeat count for arrays; 1 for everything else.
    pub fn count(&self) -> u32 {
        match self.kind {
            ItemKind::Array { count } => count,
            _ => 1,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ItemKind::Array { .. })
    }

    pub fn is_struct_or_container(&self) -> bool {
        matches!(self.kind, ItemKind::Struct | ItemKind::Container)
    }

    pub fn is_int_or_float(&self) -> bool {
        matches!(self.kind, ItemKind::Int | ItemKind::Uint | ItemKind::Float)
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self.kind,
            ItemKind::Bool | ItemKind::Int | ItemKind::Uint | ItemKind::Float
        )
    }

    /// The element template of an array or the pointee of an indirection.
    pub fn element(&self) -> Option<&RegisteredItem> {
        match self.kind {
            ItemKind::Array { .. } | ItemKind::Indirect(_) => self.items.first(),
            _ => None,
        }
    }

    /// Appends a child item and returns it.
    ///
    /// A leading `*` (owning-wrapper marker) and an `m_` member prefix are stripped from `name`.
    /// The pointee of an indirection takes the indirection's name and `name` is ignored. Every
    /// failure is a registration error.
    pub fn append(
        &mut self,
        offset: u64,
        kind: ItemKind,
        native_size: u32,
        name: &str,
    ) -> Result<&mut RegisteredItem> {
        let invalid = |reason| SaveError::InvalidRegistration {
            name: name.to_string(),
            reason,
        };

        match self.kind {
            ItemKind::Bool | ItemKind::Int | ItemKind::Uint | ItemKind::Float => {
                return Err(invalid("scalar items cannot own other items"));
            }
            ItemKind::Array { .. } | ItemKind::Indirect(_) if !self.items.is_empty() => {
                return Err(invalid("arrays and indirections own exactly one item"));
            }
            _ => {}
        }

        match kind {
            ItemKind::Bool if native_size != 1 => return Err(invalid("booleans are one byte")),
            ItemKind::Int | ItemKind::Uint if !matches!(native_size, 1 | 2 | 4 | 8) => {
                return Err(invalid("integer width must be 1, 2, 4 or 8 bytes"));
            }
            ItemKind::Float if !matches!(native_size, 4 | 8) => {
                return Err(invalid("float width must be 4 or 8 bytes"));
            }
            ItemKind::Array { count: 0 } => return Err(invalid("arrays need at least one item")),
            _ => {}
        }

        let mut item = RegisteredItem::new(offset, kind, native_size, name);
        if let ItemKind::Indirect(_) = self.kind {
            // The pointee is saved in place of its indirection, so it carries the same name.
            item.name.clone_from(&self.name);
        }
        if self.find(&item.name).is_some() {
            return Err(SaveError::DuplicateName(item.name));
        }

        tracing::trace!(
            parent = %self.name,
            child = %item.name,
            kind = %item.kind_string(),
            offset,
            "registered save state item"
        );
        let index = self.items.len();
        self.items.push(item);
        Ok(&mut self.items[index])
    }

    /// Exact sibling lookup. Empty names never match.
    pub fn find(&self, name: &str) -> Option<&RegisteredItem> {
        if name.is_empty() {
            return None;
        }
        self.items.iter().find(|item| item.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut RegisteredItem> {
        if name.is_empty() {
            return None;
        }
        self.items.iter_mut().find(|item| item.name == name)
    }

    /// Prunes empty subtrees and sorts the remaining siblings by name.
    ///
    /// Returns `true` if this item is now empty so that the parent can prune it in turn. Scalars
    /// are never pruned.
    pub fn sort_and_prune(&mut self) -> bool {
        if self.is_scalar() {
            return false;
        }

        self.items.retain_mut(|item| !item.sort_and_prune());
        if self.items.len() > 1 {
            self.items.sort_by(|x, y| x.name.as_bytes().cmp(y.name.as_bytes()));
        }
        self.items.is_empty()
    }

    /// Applies this item's offset to `base` and follows transparent indirections.
    ///
    /// Containers reset the base to zero; indirections dereference through `mem` and forward the
    /// walk to their pointee. A dynamic collection whose live length is below the pointee's
    /// registered repeat count is an error.
    pub fn resolve_base<M: StateMemory + ?Sized>(
        &self,
        mem: &M,
        base: u64,
    ) -> MemoryResult<Resolved<'_>> {
        let base = base
            .checked_add(self.offset)
            .ok_or(MemoryError::OutOfRange { addr: base, len: 0 })?;
        match self.kind {
            ItemKind::Indirect(indirection) => {
                let Some(pointee) = self.items.first() else {
                    return Ok(Resolved::Here(base));
                };
                let referent = mem.resolve(indirection, base)?;
                // A collection may grow past its registered length but never fall short of it.
                let expected = u64::from(pointee.count());
                match referent.len {
                    Some(len) if len < expected => Err(MemoryError::ShortCollection {
                        addr: base,
                        len,
                        expected,
                    }),
                    _ => Ok(Resolved::Forward(pointee, referent.addr)),
                }
            }
            ItemKind::Container => Ok(Resolved::Here(0)),
            _ => Ok(Resolved::Here(base)),
        }
    }

    /// Size of this item in a binary snapshot. Depends on the schema only.
    pub fn binary_size(&self) -> u64 {
        match self.kind {
            ItemKind::Bool => 1,
            ItemKind::Int | ItemKind::Uint | ItemKind::Float => u64::from(self.native_size),
            ItemKind::Container | ItemKind::Struct => {
                self.items.iter().map(RegisteredItem::binary_size).sum()
            }
            ItemKind::Array { count } => self
                .items
                .first()
                .map_or(0, |item| u64::from(count) * item.binary_size()),
            ItemKind::Indirect(_) => self.items.first().map_or(0, RegisteredItem::binary_size),
        }
    }

    /// CRC-32 identifying the snapshot layout described by this subtree.
    pub fn signature(&self) -> u32 {
        let mut hasher = Hasher::new();
        self.hash_layout(&mut hasher);
        hasher.finalize()
    }

    fn hash_layout(&self, hasher: &mut Hasher) {
        hasher.update(self.name.as_bytes());
        hasher.update(&[0, self.kind.tag()]);
        hasher.update(&self.native_size.to_le_bytes());
        hasher.update(&self.count().to_le_bytes());
        for item in &self.items {
            item.hash_layout(hasher);
        }
    }

    pub fn kind_string(&self) -> String {
        match self.kind {
            ItemKind::Container => "CONTAINER".to_string(),
            ItemKind::Struct => "STRUCT".to_string(),
            ItemKind::Bool => "BOOL".to_string(),
            ItemKind::Int => format!("INT{}", 8 * self.native_size),
            ItemKind::Uint => format!("UINT{}", 8 * self.native_size),
            ItemKind::Float => format!("FLOAT{}", 8 * self.native_size),
            ItemKind::Array { count } => format!("ARRAY[{count}]"),
            ItemKind::Indirect(indirection) => indirection.name().to_string(),
        }
    }

    /// Number of items in this subtree, including this one.
    pub fn item_count(&self) -> usize {
        1 + self.items.iter().map(RegisteredItem::item_count).sum::<usize>()
    }
}

pub(crate) fn normalize_name(name: &str) -> &str {
    let name = name.strip_prefix('*').unwrap_or(name);
    name.strip_prefix("m_").unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StateArena;

    #[test]
    fn names_are_normalized() {
        let mut root = RegisteredItem::root();
        root.append(0, ItemKind::Uint, 4, "m_score").unwrap();
        root.append(0, ItemKind::Struct, 8, "*m_timer").unwrap();
        root.append(0, ItemKind::Bool, 1, "*flag").unwrap();
        let names: Vec<_> = root.items().iter().map(RegisteredItem::name).collect();
        assert_eq!(names, ["score", "timer", "flag"]);
    }

    #[test]
    fn duplicate_names_are_rejected_after_normalization() {
        let mut root = RegisteredItem::root();
        root.append(0, ItemKind::Uint, 4, "score").unwrap();
        let err = root.append(4, ItemKind::Uint, 4, "m_score").unwrap_err();
        assert!(matches!(err, SaveError::DuplicateName(ref name) if name == "score"));
        assert!(err.is_registration_error());
    }

    #[test]
    fn pointees_take_the_name_of_their_indirection() {
        let mut root = RegisteredItem::root();
        root.append(0, ItemKind::Indirect(Indirection::Pointer), 0, "m_left")
            .unwrap()
            .append(0, ItemKind::Uint, 4, "value")
            .unwrap();
        root.append(8, ItemKind::Indirect(Indirection::Pointer), 0, "right")
            .unwrap()
            .append(0, ItemKind::Uint, 4, "value")
            .unwrap();
        let err = root.append(16, ItemKind::Uint, 4, "left").unwrap_err();
        assert!(matches!(err, SaveError::DuplicateName(ref name) if name == "left"));

        let names: Vec<_> = root
            .items()
            .iter()
            .map(|item| item.element().unwrap().name())
            .collect();
        assert_eq!(names, ["left", "right"]);
    }

    #[test]
    fn short_collections_are_rejected() {
        let mut arena = StateArena::new();
        let data = arena.alloc(8, 8).unwrap();
        let holder = arena.alloc(16, 8).unwrap();

        let mut root = RegisteredItem::root();
        root.append(holder, ItemKind::Indirect(Indirection::Vector), 0, "fifo")
            .unwrap()
            .append(0, ItemKind::Array { count: 4 }, 1, "")
            .unwrap()
            .append(0, ItemKind::Uint, 1, "")
            .unwrap();
        let fifo = &root.items()[0];

        arena.write_vec_header(holder, data, 3).unwrap();
        assert!(matches!(
            fifo.resolve_base(&arena, 0),
            Err(MemoryError::ShortCollection {
                len: 3,
                expected: 4,
                ..
            })
        ));

        arena.write_vec_header(holder, data, 6).unwrap();
        assert!(matches!(
            fifo.resolve_base(&arena, 0).unwrap(),
            Resolved::Forward(_, base) if base == data
        ));
    }

    #[test]
    fn anonymous_items_never_collide_or_match() {
        let mut root = RegisteredItem::root();
        let array = root.append(0, ItemKind::Array { count: 2 }, 4, "regs").unwrap();
        array.append(0, ItemKind::Uint, 4, "").unwrap();
        assert!(root.find("").is_none());
        assert!(root.find("regs").is_some());
    }

    #[test]
    fn invalid_shapes_are_registration_errors() {
        let mut root = RegisteredItem::root();
        assert!(root.append(0, ItemKind::Int, 3, "odd").is_err());
        assert!(root.append(0, ItemKind::Float, 2, "half").is_err());
        assert!(root.append(0, ItemKind::Bool, 4, "wide").is_err());
        assert!(root.append(0, ItemKind::Array { count: 0 }, 4, "none").is_err());

        let scalar = root.append(0, ItemKind::Uint, 1, "byte").unwrap();
        assert!(scalar.append(0, ItemKind::Uint, 1, "inner").is_err());

        let array = root.append(0, ItemKind::Array { count: 4 }, 1, "bytes").unwrap();
        array.append(0, ItemKind::Uint, 1, "").unwrap();
        let err = array.append(0, ItemKind::Uint, 1, "").unwrap_err();
        assert!(matches!(err, SaveError::InvalidRegistration { .. }));
    }

    #[test]
    fn sort_and_prune_removes_empty_subtrees() {
        let mut root = RegisteredItem::root();
        let outer = root.append(0, ItemKind::Container, 0, "outer").unwrap();
        outer.append(0, ItemKind::Struct, 16, "empty").unwrap();
        root.append(0, ItemKind::Struct, 4, "zeta").unwrap()
            .append(0, ItemKind::Uint, 4, "value")
            .unwrap();
        root.append(0, ItemKind::Array { count: 8 }, 4, "no_element").unwrap();
        root.append(0, ItemKind::Indirect(Indirection::Unique), 0, "nothing").unwrap();
        root.append(0, ItemKind::Bool, 1, "alpha").unwrap();

        assert!(!root.sort_and_prune());
        let names: Vec<_> = root.items().iter().map(RegisteredItem::name).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }

    #[test]
    fn binary_size_follows_schema() {
        let mut root = RegisteredItem::root();
        root.append(0, ItemKind::Uint, 4, "score").unwrap();
        root.append(4, ItemKind::Bool, 1, "paused").unwrap();
        let grid = root.append(8, ItemKind::Array { count: 3 }, 8, "grid").unwrap();
        grid.append(0, ItemKind::Array { count: 2 }, 2, "")
            .unwrap()
            .append(0, ItemKind::Int, 2, "")
            .unwrap();
        let ptr = root.append(32, ItemKind::Indirect(Indirection::Pointer), 0, "ptr").unwrap();
        ptr.append(0, ItemKind::Float, 8, "target").unwrap();

        assert_eq!(root.binary_size(), 4 + 1 + 3 * 2 * 2 + 8);
    }

    #[test]
    fn resolve_base_handles_each_kind() {
        let mut arena = StateArena::new();
        let target = arena.alloc(8, 8).unwrap();
        let holder = arena.alloc(8, 8).unwrap();
        arena.write_pointer(holder, target).unwrap();

        let mut root = RegisteredItem::root();
        root.append(holder, ItemKind::Indirect(Indirection::Pointer), 0, "ptr")
            .unwrap()
            .append(0, ItemKind::Uint, 8, "value")
            .unwrap();
        root.append(4, ItemKind::Uint, 4, "plain").unwrap();

        assert!(matches!(
            root.resolve_base(&arena, 1234).unwrap(),
            Resolved::Here(0)
        ));
        match root.items()[0].resolve_base(&arena, 0).unwrap() {
            Resolved::Forward(item, base) => {
                assert_eq!(item.kind(), ItemKind::Uint);
                assert_eq!(base, target);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            root.items()[1].resolve_base(&arena, 100).unwrap(),
            Resolved::Here(104)
        ));
    }

    #[test]
    fn signature_tracks_layout_not_offsets() {
        let build = |offset| {
            let mut root = RegisteredItem::root();
            root.append(offset, ItemKind::Uint, 4, "score").unwrap();
            root
        };
        assert_eq!(build(0).signature(), build(64).signature());

        let mut wider = RegisteredItem::root();
        wider.append(0, ItemKind::Uint, 8, "score").unwrap();
        assert_ne!(build(0).signature(), wider.signature());
    }

    #[test]
    fn kind_strings() {
        let mut root = RegisteredItem::root();
        assert_eq!(root.kind_string(), "CONTAINER");
        let item = root.append(0, ItemKind::Int, 4, "a").unwrap();
        assert_eq!(item.kind_string(), "INT32");
        let item = root.append(0, ItemKind::Array { count: 7 }, 1, "b").unwrap();
        assert_eq!(item.kind_string(), "ARRAY[7]");
        let item = root
            .append(0, ItemKind::Indirect(Indirection::Vector), 0, "c")
            .unwrap();
        assert_eq!(item.kind_string(), "VECTOR");
    }
}
