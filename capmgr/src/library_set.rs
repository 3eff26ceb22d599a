//! Walks the host loader's link-map, builds a shared-object record per
//! entry, and fans out fixups across all of them (§4.5).
//!
//! The host dynamic loader is treated strictly as an external collaborator,
//! consumed through exactly three operations: open (optionally in a new
//! namespace), symbol lookup by name, and link-map enumeration. No other
//! implementation detail of the loader is relied upon.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::capability::Capability;
use crate::error::{CapMgrError, LibrarySetError};
use crate::shared_object::{ProgramHeader, SharedObject};

/// One entry of the host loader's link-map, reduced to the fields this
/// crate actually consumes (§6): load bias, full path, the loader-alias
/// "real" pointer (used only to detect the dynamic loader's own entry),
/// and the object's program headers and observed map-start address.
#[derive(Debug, Clone)]
pub struct LinkMapEntry {
    pub load_bias: usize,
    pub full_path: String,
    pub is_loader_alias: bool,
    pub program_headers: Vec<ProgramHeader>,
    pub map_start: usize,
}

/// A handle to an open loader namespace, released on drop.
pub trait LoaderHandle {}

/// The host dynamic loader, consumed via its public enumeration surface.
pub trait HostLoader {
    type Handle: LoaderHandle;

    /// Opens `name`, optionally in a fresh linker namespace.
    fn open(&self, name: &str, new_namespace: bool) -> Result<Self::Handle, LibrarySetError>;

    /// Looks up `symbol` within the namespace opened by `handle`.
    fn symbol(&self, handle: &Self::Handle, symbol: &str) -> Option<usize>;

    /// Walks the loader's link-map doubly-linked list (finding the head via
    /// `prev`, then enumerating forward via `next`) and returns its entries
    /// in list order.
    fn link_map(&self, handle: &Self::Handle) -> Vec<LinkMapEntry>;
}

/// A `full-path -> shared-object record` map, plus the loader handle for the
/// primary object (released when the set is dropped, closing the
/// namespace).
pub struct LibrarySet<H: LoaderHandle> {
    objects: BTreeMap<String, SharedObject>,
    primary: Option<String>,
    handle: H,
}

impl<H: LoaderHandle> LibrarySet<H> {
    /// Opens `name` through `loader`, walks its link-map, and loads every
    /// eligible entry. Fails if zero objects end up loaded.
    pub fn new<L: HostLoader<Handle = H>>(
        loader: &L,
        name: &str,
        rw_base: Capability,
        include_loader: bool,
        new_namespace: bool,
        page_size: usize,
    ) -> Result<Self, CapMgrError> {
        let handle = loader.open(name, new_namespace)?;

        let mut objects = BTreeMap::new();
        let mut primary = None;

        for entry in loader.link_map(&handle) {
            if entry.full_path.is_empty() {
                continue; // the main executable's own entry
            }
            if entry.is_loader_alias && !include_loader {
                continue;
            }
            if entry.program_headers.is_empty() {
                continue;
            }

            let base = if entry.load_bias == entry.map_start {
                rw_base.set_bounds_and_address(&Capability::root(
                    entry.map_start,
                    entry
                        .program_headers
                        .iter()
                        .map(|h| h.p_vaddr as usize + h.p_memsz as usize)
                        .max()
                        .unwrap_or(0),
                    rw_base.permissions(),
                ))
            } else {
                rw_base.set_address(entry.load_bias)
            };

            let mut so = SharedObject::new(entry.full_path.clone(), page_size);
            so.load(&entry.program_headers, base, &rw_base)?;

            if primary.is_none() && entry.full_path.ends_with(name) {
                primary = Some(entry.full_path.clone());
            }
            objects.insert(entry.full_path.clone(), so);
        }

        if objects.is_empty() {
            return Err(CapMgrError::new(LibrarySetError::NoObjectsLoaded));
        }

        info!(count = objects.len(), name, "library set loaded");
        Ok(Self {
            objects,
            primary,
            handle,
        })
    }

    pub fn primary_object(&self) -> Option<&SharedObject> {
        self.primary.as_ref().and_then(|p| self.objects.get(p))
    }

    pub fn objects(&self) -> impl Iterator<Item = &SharedObject> {
        self.objects.values()
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Resolves `symbol` by delegating to the host loader within this set's
    /// namespace.
    pub fn resolve_symbol<L: HostLoader<Handle = H>>(
        &self,
        loader: &L,
        symbol: &str,
    ) -> Option<usize> {
        loader.symbol(&self.handle, symbol)
    }

    /// Runs `do_lib_cap_fixups` on every object in path order, short-
    /// circuiting on the first failure.
    ///
    /// # Safety
    /// Every object in the set must be live-mapped at its recorded base.
    pub unsafe fn do_all_lib_cap_fixups(
        &self,
        fixup_master: &Capability,
        make_restricted: bool,
    ) -> Result<(), CapMgrError> {
        for so in self.objects.values() {
            if let Err(e) = so.do_lib_cap_fixups(fixup_master, make_restricted) {
                warn!(object = so.full_name(), "fixup aborted, library set failing fast");
                return Err(CapMgrError::new(e));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capability::Permissions;
    use std::cell::Cell;

    struct FakeHandle;
    impl LoaderHandle for FakeHandle {}

    struct FakeLoader {
        entries: Vec<LinkMapEntry>,
        opens: Cell<u32>,
    }

    impl HostLoader for FakeLoader {
        type Handle = FakeHandle;

        fn open(&self, _name: &str, _new_namespace: bool) -> Result<Self::Handle, LibrarySetError> {
            self.opens.set(self.opens.get() + 1);
            Ok(FakeHandle)
        }

        fn symbol(&self, _handle: &Self::Handle, _symbol: &str) -> Option<usize> {
            None
        }

        fn link_map(&self, _handle: &Self::Handle) -> Vec<LinkMapEntry> {
            self.entries.clone()
        }
    }

    fn dummy_phdr() -> ProgramHeader {
        ProgramHeader {
            p_type: crate::shared_object::PT_DYNAMIC,
            p_flags: 6,
            p_offset: 0,
            p_vaddr: 0,
            p_filesz: 0,
            p_memsz: 0,
        }
    }

    #[test]
    fn zero_eligible_entries_is_an_error() {
        let loader = FakeLoader {
            entries: vec![LinkMapEntry {
                load_bias: 0,
                full_path: String::new(), // main executable, always skipped
                is_loader_alias: false,
                program_headers: vec![dummy_phdr()],
                map_start: 0,
            }],
            opens: Cell::new(0),
        };
        let rw = Capability::root(0, usize::MAX / 2, Permissions::all());
        let err = LibrarySet::new(&loader, "libcompartment.so", rw, false, false, 4096).unwrap_err();
        assert!(matches!(err.kind, crate::error::CapMgrErrorKind::LibrarySet(
            LibrarySetError::NoObjectsLoaded
        )));
    }

    #[test]
    fn loader_alias_excluded_unless_requested() {
        let loader = FakeLoader {
            entries: vec![LinkMapEntry {
                load_bias: 0x1000,
                full_path: "/lib/ld.so".into(),
                is_loader_alias: true,
                program_headers: vec![dummy_phdr()],
                map_start: 0x1000,
            }],
            opens: Cell::new(0),
        };
        let rw = Capability::root(0, usize::MAX / 2, Permissions::all());
        let err = LibrarySet::new(&loader, "libcompartment.so", rw, false, false, 4096).unwrap_err();
        assert!(matches!(err.kind, crate::error::CapMgrErrorKind::LibrarySet(
            LibrarySetError::NoObjectsLoaded
        )));
    }
}
