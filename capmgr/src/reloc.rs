//! Abstract iterator over REL / RELA / PLT relocation tables: classifies
//! each entry and performs the capability fixup (§4.3).

use tracing::trace;

use crate::capability::{Capability, Permissions};
use crate::error::RelocationError;
use crate::range::Range;

type Result<T> = std::result::Result<T, RelocationError>;

/// The five Morello relocation types this engine recognizes and fixes up.
/// All other relocation types are left untouched (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapRelocType {
    Capinit,
    GlobDat,
    JumpSlot,
    Relative,
    Tlsdesc,
}

impl CapRelocType {
    /// The raw Morello relocation type codes this crate classifies.
    /// `TLSDESC` is recognized but given no special treatment beyond the
    /// uniform derive-and-clear-executive rewrite (see `SPEC_FULL.md`,
    /// §D open question (a)).
    const CAPINIT: u32 = 1028;
    const GLOB_DAT: u32 = 1025;
    const JUMP_SLOT: u32 = 1026;
    const RELATIVE: u32 = 1027;
    const TLSDESC: u32 = 1031;

    pub fn from_raw(r_type: u32) -> Option<Self> {
        match r_type {
            Self::CAPINIT => Some(Self::Capinit),
            Self::GLOB_DAT => Some(Self::GlobDat),
            Self::JUMP_SLOT => Some(Self::JumpSlot),
            Self::RELATIVE => Some(Self::Relative),
            Self::TLSDESC => Some(Self::Tlsdesc),
            _ => None,
        }
    }
}

/// Size in bytes of the structure a relocation flavor must be a multiple of
/// (standard 64-bit ELF `Elf64_Rel`/`Elf64_Rela`).
pub fn element_size(is_rela: bool) -> usize {
    if is_rela {
        24
    } else {
        16
    }
}

/// One relocation entry in canonical form: `{offset, info, addend?}`.
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry {
    pub offset: u64,
    pub info: u64,
    pub addend: Option<i64>,
}

impl RelocEntry {
    pub fn sym(&self) -> u32 {
        (self.info >> 32) as u32
    }

    pub fn r_type(&self) -> u32 {
        (self.info & 0xffff_ffff) as u32
    }
}

/// Which of the three tables this is; only used for logging and the fixed
/// processing order (§4.3.1: PLT, REL, RELA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableKind {
    Plt,
    Rel,
    Rela,
}

impl TableKind {
    pub fn name(&self) -> &'static str {
        match self {
            TableKind::Plt => ".rel(a).plt",
            TableKind::Rel => ".rel.dyn",
            TableKind::Rela => ".rela.dyn",
        }
    }
}

/// One of the three relocation tables bound to a loaded object.
pub struct RelocationTable {
    kind: TableKind,
    range: Range,
    is_rela: bool,
    element_size: usize,
}

impl RelocationTable {
    /// Validates the declared element size against the flavor's structure
    /// size and that the range length is an exact multiple of it. A
    /// violation is a fatal initialization failure for the owning object
    /// (§4.3, §7).
    pub fn check_and_get_range(
        kind: TableKind,
        range: Range,
        is_rela: bool,
        element_size: usize,
    ) -> Result<Self> {
        let expected = self::element_size(is_rela);
        if element_size != expected {
            return Err(RelocationError::ElementSizeMismatch {
                table: kind.name(),
                got: element_size,
                expected,
            });
        }
        if range.size() % element_size != 0 {
            return Err(RelocationError::RangeNotMultiple {
                table: kind.name(),
                len: range.size(),
                elem: element_size,
            });
        }
        Ok(Self {
            kind,
            range,
            is_rela,
            element_size,
        })
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn is_rela(&self) -> bool {
        self.is_rela
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Iterate the table's entries by reading raw `Elf64_Rel`/`Elf64_Rela`
    /// structures out of process memory at `self.range()`.
    ///
    /// # Safety
    /// The table's range must describe readable memory laid out as a
    /// contiguous array of the declared flavor's structures.
    pub unsafe fn entries(&self) -> Vec<RelocEntry> {
        let count = self.range.size() / self.element_size;
        let base = self.range.base as *const u8;
        (0..count)
            .map(|i| {
                let p = base.add(i * self.element_size);
                let offset = (p as *const u64).read_unaligned();
                let info = (p.add(8) as *const u64).read_unaligned();
                let addend = self
                    .is_rela
                    .then(|| (p.add(16) as *const i64).read_unaligned());
                RelocEntry {
                    offset,
                    info,
                    addend,
                }
            })
            .collect()
    }

    /// The core fixup algorithm (§4.3.1).
    ///
    /// For every entry, in table order: skip unrecognized relocation types,
    /// skip slots inside an exclusion range, skip untagged (not-yet-installed)
    /// slots, then derive a narrowed (or re-granted) capability from
    /// `fixup_master` and write it back.
    ///
    /// # Safety
    /// `object_base` plus each entry's offset must address a live,
    /// correctly-aligned capability slot within mapped, writable memory.
    pub unsafe fn patch_caps(
        &self,
        object_base: usize,
        fixup_master: &Capability,
        exclusions: &[Range],
        make_restricted: bool,
    ) -> Result<()> {
        for entry in self.entries() {
            let Some(reloc_type) = CapRelocType::from_raw(entry.r_type()) else {
                continue;
            };

            let slot_addr = object_base + entry.offset as usize;
            let slot_range = Range::with_len(slot_addr, std::mem::size_of::<Capability>());
            if exclusions.iter().any(|ex| ex.intersects(slot_range)) {
                trace!(table = self.name(), slot_addr, ?reloc_type, "skip: excluded");
                continue;
            }

            let slot = &mut *(slot_addr as *mut Capability);
            if !slot.is_valid() {
                trace!(table = self.name(), slot_addr, "skip: untagged");
                continue;
            }

            let (add, remove) = if make_restricted {
                (Permissions::empty(), Permissions::EXECUTIVE)
            } else {
                (Permissions::EXECUTIVE, Permissions::empty())
            };
            let derived = fixup_master.derive_from(slot, add, remove);
            trace!(
                table = self.name(),
                slot_addr,
                old = ?slot,
                new = ?derived,
                "patched"
            );
            *slot = derived;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn element_size_mismatch_is_rejected() {
        let err = RelocationTable::check_and_get_range(
            TableKind::Rela,
            Range::with_len(0x1000, 48),
            true,
            16, // should be 24 for Rela
        )
        .unwrap_err();
        assert!(matches!(err, RelocationError::ElementSizeMismatch { .. }));
    }

    #[test]
    fn range_not_multiple_is_rejected() {
        let err = RelocationTable::check_and_get_range(
            TableKind::Rel,
            Range::with_len(0x1000, 17),
            false,
            16,
        )
        .unwrap_err();
        assert!(matches!(err, RelocationError::RangeNotMultiple { .. }));
    }

    #[test]
    fn valid_table_constructs() {
        let table =
            RelocationTable::check_and_get_range(TableKind::Rel, Range::with_len(0x1000, 32), false, 16)
                .unwrap();
        assert_eq!(table.kind(), TableKind::Rel);
    }

    #[test]
    fn unrecognized_relocation_type_is_none() {
        assert!(CapRelocType::from_raw(0xffff).is_none());
        assert_eq!(CapRelocType::from_raw(CapRelocType::RELATIVE), Some(CapRelocType::Relative));
    }

    /// A single `Elf64_Rela`-shaped entry, used to plant a fake relocation
    /// table backed by plain heap memory instead of a mapped object.
    #[repr(C)]
    struct RawRela {
        offset: u64,
        info: u64,
        addend: i64,
    }

    fn rela_info(sym: u32, r_type: u32) -> u64 {
        ((sym as u64) << 32) | r_type as u64
    }

    /// Builds a one-entry RELA table whose single relocation targets offset
    /// 0 of whatever `object_base` is passed to `patch_caps`.
    fn one_entry_rela_table(r_type: u32) -> (Vec<RawRela>, RelocationTable) {
        let entries = vec![RawRela {
            offset: 0,
            info: rela_info(0, r_type),
            addend: 0,
        }];
        let range = Range::with_len(entries.as_ptr() as usize, entries.len() * element_size(true));
        let table =
            RelocationTable::check_and_get_range(TableKind::Rela, range, true, element_size(true))
                .unwrap();
        (entries, table)
    }

    fn fixup_master() -> Capability {
        Capability::root(0, usize::MAX / 2, Permissions::all())
    }

    #[test]
    fn patch_caps_narrows_clears_executive_and_is_idempotent() {
        let mut objects = vec![Capability::root(0x4000, 0x40, Permissions::READ | Permissions::EXECUTIVE)];
        let object_base = objects.as_mut_ptr() as usize;
        let (_entries, table) = one_entry_rela_table(CapRelocType::RELATIVE);
        let master = fixup_master();

        unsafe { table.patch_caps(object_base, &master, &[], true).unwrap() };
        let restricted = objects[0];
        assert_eq!(restricted.base(), 0x4000);
        assert_eq!(restricted.length(), 0x40);
        assert!(!restricted.permissions().contains(Permissions::EXECUTIVE));

        // A second pass in the same direction changes nothing further.
        unsafe { table.patch_caps(object_base, &master, &[], true).unwrap() };
        assert_eq!(objects[0], restricted);
    }

    #[test]
    fn patch_caps_round_trips_executive_permission() {
        let mut objects = vec![Capability::root(0x4000, 0x40, Permissions::READ | Permissions::EXECUTIVE)];
        let object_base = objects.as_mut_ptr() as usize;
        let (_entries, table) = one_entry_rela_table(CapRelocType::RELATIVE);
        let master = fixup_master();

        unsafe { table.patch_caps(object_base, &master, &[], true).unwrap() };
        unsafe { table.patch_caps(object_base, &master, &[], false).unwrap() };

        let restored = objects[0];
        assert_eq!(restored.base(), 0x4000);
        assert_eq!(restored.length(), 0x40);
        assert!(restored.permissions().contains(Permissions::EXECUTIVE));
        assert!(restored.permissions().contains(Permissions::READ));
    }

    #[test]
    fn patch_caps_skips_excluded_slot() {
        let mut objects = vec![Capability::root(0x5000, 0x40, Permissions::READ | Permissions::EXECUTIVE)];
        let object_base = objects.as_mut_ptr() as usize;
        let original = objects[0];
        let (_entries, table) = one_entry_rela_table(CapRelocType::RELATIVE);
        let master = fixup_master();

        let exclusions = [Range::with_len(object_base, std::mem::size_of::<Capability>())];
        unsafe { table.patch_caps(object_base, &master, &exclusions, true).unwrap() };

        assert_eq!(objects[0], original);
    }

    #[test]
    fn patch_caps_skips_untagged_slot() {
        let mut objects = vec![Capability::invalid()];
        let object_base = objects.as_mut_ptr() as usize;
        let (_entries, table) = one_entry_rela_table(CapRelocType::RELATIVE);
        let master = fixup_master();

        unsafe { table.patch_caps(object_base, &master, &[], true).unwrap() };

        assert_eq!(objects[0], Capability::invalid());
    }

    #[test]
    fn patch_caps_skips_unrecognized_relocation_type() {
        let mut objects = vec![Capability::root(0x6000, 0x40, Permissions::READ | Permissions::EXECUTIVE)];
        let object_base = objects.as_mut_ptr() as usize;
        let original = objects[0];
        let (_entries, table) = one_entry_rela_table(0xffff);
        let master = fixup_master();

        unsafe { table.patch_caps(object_base, &master, &[], true).unwrap() };

        assert_eq!(objects[0], original);
    }
}
