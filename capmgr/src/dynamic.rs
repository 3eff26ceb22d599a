//! Parses a loaded object's `PT_DYNAMIC` segment into a tag→value table and
//! exposes typed getters for the tags the fixup engine needs (§3, §4.2).

use std::collections::HashMap;

use crate::error::{DynTag, DynamicSectionError};
use crate::range::Range;

type Result<T> = std::result::Result<T, DynamicSectionError>;

/// A `{tag, value}` pair from the raw dynamic section, before any typed
/// interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDynEntry {
    pub tag: i64,
    pub value: u64,
}

const DT_NULL: i64 = 0;
const DT_NEEDED: i64 = 1;
const DT_PLTRELSZ: i64 = 2;
const DT_HASH: i64 = 4;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_RELAENT: i64 = 9;
const DT_STRSZ: i64 = 10;
const DT_INIT: i64 = 12;
const DT_FINI: i64 = 13;
const DT_SONAME: i64 = 14;
const DT_REL: i64 = 17;
const DT_RELSZ: i64 = 18;
const DT_RELENT: i64 = 19;
const DT_PLTREL: i64 = 20;
const DT_JMPREL: i64 = 23;
const DT_INIT_ARRAY: i64 = 25;
const DT_FINI_ARRAY: i64 = 26;
const DT_INIT_ARRAYSZ: i64 = 27;
const DT_FINI_ARRAYSZ: i64 = 28;

/// A tag→value map over one object's dynamic section.
///
/// Duplicate tags resolve to the last occurrence, matching both the ELF
/// convention and the original reference's `std::map::insert_or_assign`
/// behavior.
#[derive(Debug, Clone)]
pub struct DynamicView {
    base: usize,
    values: HashMap<i64, u64>,
    readonly: bool,
}

impl DynamicView {
    /// Build a view from an already-parsed array of raw entries, stopping at
    /// the first `DT_NULL` tag (or the end of the slice, whichever comes
    /// first).
    pub fn from_entries(base: usize, entries: &[RawDynEntry], readonly: bool) -> Self {
        let mut values = HashMap::new();
        for entry in entries {
            if entry.tag == DT_NULL {
                break;
            }
            values.insert(entry.tag, entry.value);
        }
        Self {
            base,
            values,
            readonly,
        }
    }

    /// Build a view by walking a contiguous array of `Elf64_Dyn`-shaped
    /// `{i64, u64}` pairs starting at `vaddr` (already relocated to a live
    /// address) for at most `memsz` bytes.
    ///
    /// # Safety
    /// `vaddr` must point to `memsz` readable bytes containing a sequence of
    /// 16-byte `{tag, value}` pairs.
    pub unsafe fn from_memory(base: usize, vaddr: usize, memsz: usize, readonly: bool) -> Self {
        let count = memsz / std::mem::size_of::<RawDynEntry>();
        let ptr = vaddr as *const RawDynEntry;
        let entries = std::slice::from_raw_parts(ptr, count);
        Self::from_entries(base, entries, readonly)
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn raw(&self, tag: i64, missing: DynTag) -> Result<u64> {
        self.values
            .get(&tag)
            .copied()
            .ok_or(DynamicSectionError::MissingTag(missing))
    }

    fn addr(&self, tag: i64, missing: DynTag) -> Result<usize> {
        Ok(self.base + self.raw(tag, missing)? as usize)
    }

    /// `(range, is_rela, element_size)` for `DT_JMPREL`/`DT_PLTRELSZ`/`DT_PLTREL`.
    pub fn plt_rel(&self) -> Result<(Range, bool, usize)> {
        let addr = self.addr(DT_JMPREL, DynTag::PltRel)?;
        let size = self.raw(DT_PLTRELSZ, DynTag::PltRelSz)? as usize;
        let is_rela = self.raw(DT_PLTREL, DynTag::PltRelType)? as i64 == DT_RELA;
        let elem = crate::reloc::element_size(is_rela);
        Ok((Range::with_len(addr, size), is_rela, elem))
    }

    pub fn rel(&self) -> Result<(Range, usize)> {
        let addr = self.addr(DT_REL, DynTag::Rel)?;
        let size = self.raw(DT_RELSZ, DynTag::RelSz)? as usize;
        let ent = self.raw(DT_RELENT, DynTag::RelEnt)? as usize;
        Ok((Range::with_len(addr, size), ent))
    }

    pub fn rela(&self) -> Result<(Range, usize)> {
        let addr = self.addr(DT_RELA, DynTag::Rela)?;
        let size = self.raw(DT_RELASZ, DynTag::RelaSz)? as usize;
        let ent = self.raw(DT_RELAENT, DynTag::RelaEnt)? as usize;
        Ok((Range::with_len(addr, size), ent))
    }

    pub fn strtab(&self) -> Result<(usize, usize)> {
        Ok((
            self.addr(DT_STRTAB, DynTag::StrTab)?,
            self.raw(DT_STRSZ, DynTag::StrSz)? as usize,
        ))
    }

    pub fn symtab(&self) -> Result<usize> {
        self.addr(DT_SYMTAB, DynTag::SymTab)
    }

    pub fn soname_offset(&self) -> Result<usize> {
        Ok(self.raw(DT_SONAME, DynTag::SoName)? as usize)
    }

    pub fn hash(&self) -> Result<usize> {
        self.addr(DT_HASH, DynTag::Hash)
    }

    pub fn init(&self) -> Result<usize> {
        self.addr(DT_INIT, DynTag::Init)
    }

    pub fn fini(&self) -> Result<usize> {
        self.addr(DT_FINI, DynTag::Fini)
    }

    pub fn init_array(&self) -> Result<Range> {
        let addr = self.addr(DT_INIT_ARRAY, DynTag::InitArray)?;
        let size = self.raw(DT_INIT_ARRAYSZ, DynTag::InitArraySz)? as usize;
        Ok(Range::with_len(addr, size))
    }

    pub fn fini_array(&self) -> Result<Range> {
        let addr = self.addr(DT_FINI_ARRAY, DynTag::FiniArray)?;
        let size = self.raw(DT_FINI_ARRAYSZ, DynTag::FiniArraySz)? as usize;
        Ok(Range::with_len(addr, size))
    }

    #[cfg(test)]
    pub(crate) fn contains_tag(&self, tag: i64) -> bool {
        self.values.contains_key(&tag)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(tag: i64, value: u64) -> RawDynEntry {
        RawDynEntry { tag, value }
    }

    #[test]
    fn parses_until_null_tag() {
        let entries = [
            entry(DT_NEEDED, 10),
            entry(DT_STRTAB, 0x100),
            entry(DT_STRSZ, 0x20),
            entry(DT_NULL, 0),
            entry(DT_SONAME, 0xdead), // past the terminator, must be ignored
        ];
        let view = DynamicView::from_entries(0x1000, &entries, false);
        assert_eq!(view.strtab().unwrap(), (0x1100, 0x20));
        assert!(view.soname_offset().is_err());
    }

    #[test]
    fn duplicate_tag_last_wins() {
        let entries = [
            entry(DT_STRTAB, 0x100),
            entry(DT_STRTAB, 0x200),
            entry(DT_STRSZ, 4),
            entry(DT_NULL, 0),
        ];
        let view = DynamicView::from_entries(0, &entries, false);
        assert_eq!(view.strtab().unwrap().0, 0x200);
    }

    #[test]
    fn missing_tag_fails() {
        let entries = [entry(DT_NULL, 0)];
        let view = DynamicView::from_entries(0, &entries, false);
        assert!(matches!(
            view.init(),
            Err(DynamicSectionError::MissingTag(DynTag::Init))
        ));
    }
}
