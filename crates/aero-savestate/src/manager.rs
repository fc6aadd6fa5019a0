//! Owner of the state tree and the pre-save/post-load hooks.

use std::io::{Read, Seek, Write};

use crate::archive::{self, ArchiveReader};
use crate::codec;
use crate::error::{Result, SaveError};
use crate::item::RegisteredItem;
use crate::json::{self, ExternalNames};
use crate::memory::StateMemory;
use crate::registrar::Registrar;
use crate::zip::{ArchiveOptions, ArchiveWriter};

type Callback<M> = Box<dyn FnMut(&mut M) -> Result<()>>;

struct NamedCallback<M> {
    name: String,
    f: Callback<M>,
}

/// Registration, sealing and whole-tree save/load against one kind of live state.
///
/// The tree is mutable until [`SaveManager::seal`]; afterwards it is pruned, sorted and read-only,
/// and only then can state be saved or loaded.
pub struct SaveManager<M> {
    root: RegisteredItem,
    sealed: bool,
    binary_size: u64,
    presave: Vec<NamedCallback<M>>,
    postload: Vec<NamedCallback<M>>,
}

impl<M: StateMemory> Default for SaveManager<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: StateMemory> SaveManager<M> {
    pub fn new() -> Self {
        Self {
            root: RegisteredItem::root(),
            sealed: false,
            binary_size: 0,
            presave: Vec::new(),
            postload: Vec::new(),
        }
    }

    /// Registration handle for the root container.
    pub fn registrar(&mut self) -> Result<Registrar<'_>> {
        if self.sealed {
            return Err(SaveError::RegistrationClosed("<root>".to_string()));
        }
        Ok(Registrar::new(&mut self.root))
    }

    /// Registers `f` to run before every save, in registration order.
    pub fn register_presave(
        &mut self,
        name: &str,
        f: impl FnMut(&mut M) -> Result<()> + 'static,
    ) -> Result<()> {
        let sealed = self.sealed;
        push_callback(&mut self.presave, sealed, name, Box::new(f))
    }

    /// Registers `f` to run after every successful load, in registration order.
    pub fn register_postload(
        &mut self,
        name: &str,
        f: impl FnMut(&mut M) -> Result<()> + 'static,
    ) -> Result<()> {
        let sealed = self.sealed;
        push_callback(&mut self.postload, sealed, name, Box::new(f))
    }

    /// Closes registration: prunes empty subtrees, sorts siblings and caches the snapshot size.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(SaveError::AlreadySealed);
        }
        self.root.sort_and_prune();
        self.binary_size = self.root.binary_size();
        self.sealed = true;
        tracing::debug!(
            items = self.root.item_count(),
            binary_size = self.binary_size,
            signature = self.root.signature(),
            presave = self.presave.len(),
            postload = self.postload.len(),
            "sealed save state registration"
        );
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn root(&self) -> &RegisteredItem {
        &self.root
    }

    /// Exact size of a binary snapshot; zero until sealed.
    pub fn binary_size(&self) -> u64 {
        self.binary_size
    }

    pub fn signature(&self) -> u32 {
        self.root.signature()
    }

    pub fn dispatch_presave(&mut self, mem: &mut M) -> Result<()> {
        for cb in &mut self.presave {
            tracing::trace!(callback = %cb.name, "running presave callback");
            (cb.f)(mem)?;
        }
        Ok(())
    }

    pub fn dispatch_postload(&mut self, mem: &mut M) -> Result<()> {
        for cb in &mut self.postload {
            tracing::trace!(callback = %cb.name, "running postload callback");
            (cb.f)(mem)?;
        }
        Ok(())
    }

    /// Runs the pre-save hooks, then packs the whole tree into `buf`, which must be exactly
    /// [`SaveManager::binary_size`] bytes long.
    pub fn save_binary(&mut self, mem: &mut M, buf: &mut [u8]) -> Result<()> {
        self.ensure_sealed()?;
        self.dispatch_presave(mem)?;
        let produced = codec::pack(&self.root, &*mem, buf, 0)?;
        if produced != buf.len() as u64 {
            return Err(SaveError::WriteError {
                expected: buf.len() as u64,
                produced,
            });
        }
        Ok(())
    }

    /// Unpacks the whole tree from `buf`, then runs the post-load hooks.
    ///
    /// On error, live state may already be partially overwritten.
    pub fn load_binary(&mut self, mem: &mut M, buf: &[u8]) -> Result<()> {
        self.ensure_sealed()?;
        let consumed = codec::unpack(&self.root, mem, buf, 0)?;
        if consumed != buf.len() as u64 {
            return Err(SaveError::ReadError {
                expected: buf.len() as u64,
                consumed,
            });
        }
        self.dispatch_postload(mem)
    }

    /// Runs the pre-save hooks, then writes a zip archive holding `save.json` and any
    /// externalized arrays.
    pub fn save_file<W: Write + Seek>(
        &mut self,
        mem: &mut M,
        w: &mut W,
        options: ArchiveOptions,
    ) -> Result<()> {
        self.ensure_sealed()?;
        self.dispatch_presave(mem)?;

        let mut writer = ArchiveWriter::new(options);
        let json = json::export(&self.root, &*mem, &mut writer)?;
        writer.commit(&json, &*mem, w)?;
        tracing::info!(
            json_bytes = json.len(),
            data_files = writer.data_file_names().count(),
            "saved state archive"
        );
        Ok(())
    }

    /// Restores live state from an archive written by [`SaveManager::save_file`], then runs the
    /// post-load hooks.
    pub fn load_file<R: Read + Seek>(&mut self, mem: &mut M, r: &mut R) -> Result<()> {
        self.ensure_sealed()?;
        // Payloads never exceed the binary snapshot; the JSON text has a schema-derived bound.
        let limit = json::text_size_bound(&self.root).saturating_add(self.binary_size);
        let files = ArchiveReader::read_limited(r, limit)?;
        let value: serde_json::Value = serde_json::from_str(files.json()?)?;
        archive::import_json(&self.root, &value, mem, &files)?;
        tracing::info!("loaded state archive");
        self.dispatch_postload(mem)
    }

    /// Renders the current state as `save.json` text without running any hooks.
    pub fn export_json(&self, mem: &M) -> Result<String> {
        self.ensure_sealed()?;
        let mut names = ExternalNames::default();
        Ok(json::export(&self.root, mem, &mut names)?)
    }

    fn ensure_sealed(&self) -> Result<()> {
        if self.sealed {
            Ok(())
        } else {
            Err(SaveError::NotSealed)
        }
    }
}

fn push_callback<M>(
    list: &mut Vec<NamedCallback<M>>,
    sealed: bool,
    name: &str,
    f: Callback<M>,
) -> Result<()> {
    if sealed {
        return Err(SaveError::RegistrationClosed(name.to_string()));
    }
    if list.iter().any(|cb| cb.name == name) {
        return Err(SaveError::DuplicateCallback(name.to_string()));
    }
    list.push(NamedCallback {
        name: name.to_string(),
        f,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::StateArena;

    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn callbacks_run_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut manager = SaveManager::<StateArena>::new();
        for name in ["first", "second"] {
            let log = Rc::clone(&log);
            manager
                .register_presave(name, move |_| {
                    log.borrow_mut().push(name);
                    Ok(())
                })
                .unwrap();
        }
        manager.seal().unwrap();

        let mut arena = StateArena::new();
        manager.dispatch_presave(&mut arena).unwrap();
        assert_eq!(*log.borrow(), ["first", "second"]);
    }

    #[test]
    fn callback_registration_errors() {
        let mut manager = SaveManager::<StateArena>::new();
        manager.register_postload("rebuild", |_| Ok(())).unwrap();
        let err = manager.register_postload("rebuild", |_| Ok(())).unwrap_err();
        assert!(matches!(err, SaveError::DuplicateCallback(_)));

        // The same name on the other list is fine.
        manager.register_presave("rebuild", |_| Ok(())).unwrap();

        manager.seal().unwrap();
        let err = manager.register_presave("late", |_| Ok(())).unwrap_err();
        assert!(matches!(err, SaveError::RegistrationClosed(_)));
        assert!(err.is_registration_error());
        assert!(manager.registrar().is_err());
        assert!(matches!(manager.seal(), Err(SaveError::AlreadySealed)));
    }

    #[test]
    fn unsealed_manager_refuses_to_save() {
        let mut manager = SaveManager::<StateArena>::new();
        let mut arena = StateArena::new();
        assert!(matches!(
            manager.save_binary(&mut arena, &mut []),
            Err(SaveError::NotSealed)
        ));
    }

    #[test]
    fn buffer_size_mismatches_are_reported() {
        let mut arena = StateArena::new();
        let base = arena.alloc(4, 4).unwrap();
        let mut manager = SaveManager::new();
        manager.registrar().unwrap().reg::<u32>(base, "score").unwrap();
        manager.seal().unwrap();
        assert_eq!(manager.binary_size(), 4);

        let err = manager.save_binary(&mut arena, &mut [0u8; 3]).unwrap_err();
        assert!(matches!(err, SaveError::WriteError { expected: 3, produced: 4 }));
        let err = manager.load_binary(&mut arena, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, SaveError::ReadError { expected: 8, consumed: 4 }));
    }

    #[test]
    fn postload_sees_restored_state() {
        let mut arena = StateArena::new();
        let base = arena.alloc(8, 4).unwrap();
        let mut manager = SaveManager::new();
        manager.registrar().unwrap().reg::<u32>(base, "score").unwrap();
        manager
            .register_presave("stash", move |mem: &mut StateArena| {
                let score = mem.read_u32(base)?;
                mem.write_u32(base + 4, score)?;
                Ok(())
            })
            .unwrap();
        manager
            .register_postload("derive", move |mem: &mut StateArena| {
                let score = mem.read_u32(base)?;
                mem.write_u32(base + 4, score * 2)?;
                Ok(())
            })
            .unwrap();
        manager.seal().unwrap();

        arena.write_u32(base, 21).unwrap();
        let mut buf = vec![0u8; manager.binary_size() as usize];
        manager.save_binary(&mut arena, &mut buf).unwrap();
        assert_eq!(arena.read_u32(base + 4).unwrap(), 21);

        arena.write_u32(base, 0).unwrap();
        manager.load_binary(&mut arena, &buf).unwrap();
        assert_eq!(arena.read_u32(base).unwrap(), 21);
        assert_eq!(arena.read_u32(base + 4).unwrap(), 42);
    }
}
