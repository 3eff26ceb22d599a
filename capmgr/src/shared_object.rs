//! One record per loaded object: owns its program headers, dynamic view, and
//! the three relocation tables; orchestrates fixup with memory
//! re-protection (§4.4).

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::capability::Capability;
use crate::dynamic::DynamicView;
use crate::error::{DynamicSectionError, RelocationError, SharedObjectError};
use crate::range::Range;
use crate::reloc::{RelocationTable, TableKind};

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

const PF_EXEC: u32 = 1 << 0;
const PF_WRITE: u32 = 1 << 1;
const PF_READ: u32 = 1 << 2;

/// A single ELF program header, as read from the loaded object.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

impl ProgramHeader {
    fn prot(&self) -> libc::c_int {
        let mut prot = 0;
        if self.p_flags & PF_READ != 0 {
            prot |= libc::PROT_READ;
        }
        if self.p_flags & PF_WRITE != 0 {
            prot |= libc::PROT_WRITE;
        }
        if self.p_flags & PF_EXEC != 0 {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// One loaded shared object: program headers, its parsed dynamic view, and
/// the three relocation tables bound to it.
pub struct SharedObject {
    full_name: String,
    base: Capability,
    page_size: usize,
    phdrs: BTreeMap<u32, Vec<ProgramHeader>>,
    dynamic: Option<DynamicView>,
    tables: Vec<RelocationTable>,
    loaded: bool,
}

impl SharedObject {
    pub fn new(full_name: String, page_size: usize) -> Self {
        Self {
            full_name,
            base: Capability::invalid(),
            page_size,
            phdrs: BTreeMap::new(),
            dynamic: None,
            tables: Vec::new(),
            loaded: false,
        }
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn base(&self) -> &Capability {
        &self.base
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn program_headers(&self) -> impl Iterator<Item = (&u32, &Vec<ProgramHeader>)> {
        self.phdrs.iter()
    }

    pub fn tables(&self) -> &[RelocationTable] {
        &self.tables
    }

    /// Populates program headers, dynamic view, and relocation tables from
    /// a parsed header list. Idempotent: a second call is a no-op.
    pub fn load(
        &mut self,
        headers: &[ProgramHeader],
        base: Capability,
        fixup_cap: &Capability,
    ) -> std::result::Result<(), SharedObjectError> {
        if self.loaded {
            return Ok(());
        }
        self.base = base;

        let mut by_type: BTreeMap<u32, Vec<ProgramHeader>> = BTreeMap::new();
        for h in headers {
            by_type.entry(h.p_type).or_default().push(*h);
        }
        let dynamic_segs = by_type.get(&PT_DYNAMIC).map(|v| v.len()).unwrap_or(0);
        if dynamic_segs == 0 {
            return Err(SharedObjectError::NoDynamicSegment);
        }
        if dynamic_segs > 1 {
            return Err(SharedObjectError::DuplicateDynamicSegment(dynamic_segs));
        }
        let dyn_hdr = by_type[&PT_DYNAMIC][0];

        // SAFETY: caller's `base`/`headers` describe a live mapping; this
        // mirrors how the original reads the dynamic section in place after
        // the host loader has already mapped it.
        let readonly = dyn_hdr.p_flags & PF_WRITE == 0;
        let dynamic = unsafe {
            DynamicView::from_memory(
                base.address(),
                base.address() + dyn_hdr.p_vaddr as usize,
                dyn_hdr.p_memsz as usize,
                readonly,
            )
        };

        let mut tables = Vec::new();
        if let Ok((range, is_rela, elem)) = dynamic.plt_rel() {
            tables.push(RelocationTable::check_and_get_range(
                TableKind::Plt,
                range,
                is_rela,
                elem,
            )?);
        }
        if let Ok((range, elem)) = dynamic.rel() {
            tables.push(RelocationTable::check_and_get_range(
                TableKind::Rel,
                range,
                false,
                elem,
            )?);
        }
        if let Ok((range, elem)) = dynamic.rela() {
            tables.push(RelocationTable::check_and_get_range(
                TableKind::Rela,
                range,
                true,
                elem,
            )?);
        }

        self.phdrs = by_type;
        self.dynamic = Some(dynamic);
        self.tables = tables;
        self.loaded = true;
        let _ = fixup_cap;
        Ok(())
    }

    fn exclusions(&self) -> Vec<Range> {
        let Some(dyn_view) = &self.dynamic else {
            return Vec::new();
        };
        let base = self.base.address();
        let mut out = Vec::new();
        if let Ok(addr) = dyn_view.init() {
            out.push(Range::with_len(addr, std::mem::size_of::<Capability>()));
        }
        if let Ok(addr) = dyn_view.fini() {
            out.push(Range::with_len(addr, std::mem::size_of::<Capability>()));
        }
        if let Ok(r) = dyn_view.init_array() {
            out.push(r);
        }
        if let Ok(r) = dyn_view.fini_array() {
            out.push(r);
        }
        let _ = base;
        out
    }

    fn align_down(&self, addr: usize) -> usize {
        addr & !(self.page_size - 1)
    }

    fn protect_block(&self, h: &ProgramHeader, prot: libc::c_int) -> std::result::Result<(), RelocationError> {
        let start = self.base.address() + h.p_vaddr as usize;
        let aligned = self.align_down(start);
        let len = h.p_memsz as usize + (start - aligned);
        let ret = unsafe { libc::mprotect(aligned as *mut libc::c_void, len, prot) };
        if ret != 0 {
            return Err(RelocationError::ProtectFailed(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn protect_all(&self, prot_of: impl Fn(&ProgramHeader) -> libc::c_int) -> std::result::Result<(), RelocationError> {
        for h in self.phdrs.get(&PT_LOAD).into_iter().flatten() {
            self.protect_block(h, prot_of(h))?;
        }
        Ok(())
    }

    /// Re-protects every `PT_LOAD` segment writable, runs every present
    /// relocation table's `PatchCaps` in fixed PLT/REL/RELA order (a
    /// missing table is skipped, not fatal), then restores each segment's
    /// original protection (§4.4).
    ///
    /// # Safety
    /// The object must actually be mapped live at `self.base()`; this
    /// function mutates process memory through raw capability slots.
    pub unsafe fn do_lib_cap_fixups(
        &self,
        fixup_master: &Capability,
        make_restricted: bool,
    ) -> std::result::Result<(), SharedObjectError> {
        let exclusions = self.exclusions();

        self.protect_all(|_| libc::PROT_READ | libc::PROT_WRITE)
            .map_err(SharedObjectError::Reloc)?;

        let mut result = Ok(());
        for table in &self.tables {
            if let Err(e) =
                table.patch_caps(self.base.address(), fixup_master, &exclusions, make_restricted)
            {
                warn!(object = self.full_name, table = table.name(), error = %e, "patch failed");
                result = Err(SharedObjectError::Reloc(e));
                break;
            }
            debug!(object = self.full_name, table = table.name(), "patched");
        }

        self.protect_all(ProgramHeader::prot)
            .map_err(SharedObjectError::Reloc)?;

        result
    }

    #[cfg(test)]
    pub(crate) fn set_tables_for_test(&mut self, tables: Vec<RelocationTable>) {
        self.tables = tables;
    }

    #[cfg(test)]
    pub(crate) fn set_dynamic_for_test(&mut self, dyn_view: DynamicView) {
        self.dynamic = Some(dyn_view);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dynamic::RawDynEntry;

    #[test]
    fn load_requires_exactly_one_dynamic_segment() {
        let mut so = SharedObject::new("/lib/libfoo.so".into(), 4096);
        let headers = [ProgramHeader {
            p_type: PT_LOAD,
            p_flags: 5,
            p_offset: 0,
            p_vaddr: 0,
            p_filesz: 0x1000,
            p_memsz: 0x1000,
        }];
        let base = Capability::root(0x4000_0000, 0x10000, crate::capability::Permissions::all());
        let err = so.load(&headers, base, &base).unwrap_err();
        assert!(matches!(err, SharedObjectError::NoDynamicSegment));
    }

    #[test]
    fn load_is_idempotent() {
        // a second Load() call after success must be a no-op: loaded stays
        // true and does not error even though headers are dropped
        let mut so = SharedObject::new("/lib/libfoo.so".into(), 4096);
        so.loaded = true;
        assert!(so.load(&[], Capability::invalid(), &Capability::invalid()).is_ok());
    }

    #[test]
    fn exclusions_tolerate_missing_tags() {
        let entries = [RawDynEntry { tag: 0, value: 0 }];
        let mut so = SharedObject::new("/lib/libfoo.so".into(), 4096);
        so.set_dynamic_for_test(DynamicView::from_entries(0, &entries, false));
        assert!(so.exclusions().is_empty());
    }
}
