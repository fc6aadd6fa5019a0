//! Save state and rewind engine.
//!
//! Simulation components describe their mutable state once, through a [`Registrar`], as a tree
//! of named fields located in a [`StateMemory`]. After [`SaveManager::seal`] the tree can be
//! captured as a compact binary snapshot, exported as a diffable `save.json` inside a zip
//! archive, framed into a header-checked state file, or kept in a [`Rewinder`] ring for
//! multi-step time travel.

mod archive;
mod codec;
mod config;
mod error;
mod format;
mod io;
mod item;
mod json;
mod manager;
mod memory;
mod registrar;
mod rewind;
mod zip;

pub use crate::archive::{import_json, ArchiveReader, DEFAULT_INFLATE_LIMIT};
pub use crate::codec::{pack, swap_endianness, unpack};
pub use crate::config::{ConfigError, RewindConfig};
pub use crate::error::{Result, RewindError, SaveError};
pub use crate::format::{
    read_state_file, write_state_file, StateFileOptions, StateFlags, StateHeader, STATE_HEADER_LEN,
    STATE_ID_LEN, STATE_MAGIC, STATE_VERSION,
};
pub use crate::item::{Indirection, ItemKind, RegisteredItem, Resolved};
pub use crate::json::{
    export, format_g, ExternalFiles, ExternalNames, EXTERNAL_BINARY_THRESHOLD, INLINE_SIZE_LIMIT,
};
pub use crate::manager::SaveManager;
pub use crate::memory::{
    MemoryError, MemoryResult, Referent, StateArena, StateMemory, POINTER_SIZE,
};
pub use crate::registrar::{Registrar, StateScalar};
pub use crate::rewind::{status_message, RamState, RewindOperation, Rewinder};
pub use crate::zip::{unique_file_name, ArchiveOptions, ArchiveWriter, JSON_ENTRY_NAME};
