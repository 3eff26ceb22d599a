//! A thin, typed model of a CHERI/Morello hardware capability.
//!
//! This does not wrap the real `cheri_*` compiler intrinsics — there is no
//! Morello hardware or toolchain available here — but mirrors the software
//! model a compressed-capability implementation uses: a tagged value with
//! independent address/bounds/permission fields and narrowing-only mutators.
//! Every operation here preserves the monotonicity invariant from §3: bounds
//! may only shrink, permissions may only be AND'd, and there is no operation
//! that widens a capability from a narrower one.

use bitflags::bitflags;

bitflags! {
    /// Capability permission bits. `EXECUTIVE` is the privilege bit this
    /// crate exists to strip from restricted-domain capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Permissions: u32 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const EXECUTE   = 1 << 2;
        const SEAL      = 1 << 3;
        const UNSEAL    = 1 << 4;
        const EXECUTIVE = 1 << 5;
    }
}

/// An object-type value distinguishing sealed capabilities. `UNSEALED` marks
/// an ordinary, dereferenceable capability.
pub type ObjectType = u64;

pub const OTYPE_UNSEALED: ObjectType = ObjectType::MAX;

/// A hardware-tagged fat pointer: address, bounds, permissions, and seal
/// state. See §3 and §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    address: usize,
    base: usize,
    length: usize,
    perms: Permissions,
    tag: bool,
    otype: ObjectType,
    sealed_entry: bool,
}

impl Capability {
    /// Construct a root capability with the given bounds, permissions, and
    /// address set to `base`. Used only to build the small number of
    /// platform "master" capabilities (fixup master, seal master, RWX
    /// master) that every other capability in this crate is derived from.
    pub fn root(base: usize, length: usize, perms: Permissions) -> Self {
        Self {
            address: base,
            base,
            length,
            perms,
            tag: true,
            otype: OTYPE_UNSEALED,
            sealed_entry: false,
        }
    }

    /// An invalid (untagged) capability, e.g. to model a never-installed
    /// slot.
    pub const fn invalid() -> Self {
        Self {
            address: 0,
            base: 0,
            length: 0,
            perms: Permissions::empty(),
            tag: false,
            otype: OTYPE_UNSEALED,
            sealed_entry: false,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn top(&self) -> usize {
        self.base + self.length
    }

    pub fn permissions(&self) -> Permissions {
        self.perms
    }

    pub fn otype(&self) -> ObjectType {
        self.otype
    }

    pub fn is_sealed(&self) -> bool {
        self.otype != OTYPE_UNSEALED || self.sealed_entry
    }

    pub fn is_sealed_entry(&self) -> bool {
        self.sealed_entry
    }

    /// Returns whether the hardware tag is set. An untagged capability
    /// carries no authority regardless of its other fields.
    pub fn is_valid(&self) -> bool {
        self.tag
    }

    /// Repositions the address within the existing bounds; does not change
    /// bounds or permissions. No-op (address unclamped) if sealed.
    pub fn set_address(&self, addr: usize) -> Self {
        if self.is_sealed() {
            return *self;
        }
        Self {
            address: addr,
            ..*self
        }
    }

    /// Sets the address to `base`, then narrows bounds to
    /// `[base, base+length)`. Fails silently (returns `self` unchanged) if
    /// the request would widen the current bounds.
    pub fn set_bounds(&self, base: usize, length: usize) -> Self {
        let top = base + length;
        if base < self.base || top > self.top() || self.is_sealed() {
            return *self;
        }
        Self {
            address: base,
            base,
            length,
            ..*self
        }
    }

    /// Copies `base`, `length`, and `other`'s offset (address) from `other`,
    /// keeping self's permissions. Used to re-parent an executable
    /// capability onto a specific function's extents.
    pub fn set_bounds_and_address(&self, other: &Capability) -> Self {
        Self {
            address: other.address,
            base: other.base,
            length: other.length,
            perms: self.perms,
            tag: self.tag,
            otype: self.otype,
            sealed_entry: self.sealed_entry,
        }
    }

    /// Clears any permission not in `mask`.
    pub fn and_permissions(&self, mask: Permissions) -> Self {
        Self {
            perms: self.perms & mask,
            ..*self
        }
    }

    /// Marks the capability as a sealed call target: it may be branched to
    /// but not written through.
    pub fn make_sealed_entry(&self) -> Self {
        Self {
            sealed_entry: true,
            ..*self
        }
    }

    /// If `other`'s `[base, base+length)` lies within self's, narrows self
    /// to match `other` exactly; otherwise only aligns the address. Final
    /// permissions are `(self.perms AND other.perms) OR add_perms`, then
    /// `AND NOT remove_perms`. Propagates `other`'s sealed-entry bit.
    ///
    /// This is the one operation whose `add_perms` input can *add* a
    /// permission — used only by privileged code re-granting `EXECUTIVE`
    /// when restoring a capability for the executive domain (§4.1
    /// rationale).
    pub fn derive_from(
        &self,
        other: &Capability,
        add_perms: Permissions,
        remove_perms: Permissions,
    ) -> Self {
        let narrowed = if other.base >= self.base && other.top() <= self.top() {
            self.set_bounds(other.base, other.length)
        } else {
            self.set_address(other.address)
        };
        let perms = ((narrowed.perms & other.perms) | add_perms) & !remove_perms;
        Self {
            address: other.address,
            perms,
            sealed_entry: other.sealed_entry,
            ..narrowed
        }
    }

    /// Seals this capability under sealer `sealer`, which must carry
    /// `SEAL` and whose address identifies the sealing object type. The
    /// result is only unsealable by a capability carrying `UNSEAL` with the
    /// same address.
    pub fn seal(&self, sealer: &Capability) -> Self {
        if !sealer.perms.contains(Permissions::SEAL) {
            return Self {
                tag: false,
                ..*self
            };
        }
        Self {
            otype: sealer.address as ObjectType,
            ..*self
        }
    }

    /// Unseals this capability with `sealer`. Returns a tag-cleared
    /// capability unless `sealer` carries `UNSEAL` and its address matches
    /// the otype this capability was sealed under (§8 property 9).
    pub fn unseal(&self, sealer: &Capability) -> Self {
        let matches = sealer.perms.contains(Permissions::UNSEAL)
            && self.otype == sealer.address as ObjectType;
        if !matches {
            return Self {
                tag: false,
                ..*self
            };
        }
        Self {
            otype: OTYPE_UNSEALED,
            ..*self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rwx() -> Capability {
        Capability::root(0x1000, 0x1000, Permissions::all())
    }

    #[test]
    fn set_bounds_narrows_only() {
        let c = rwx();
        let narrowed = c.set_bounds(0x1100, 0x10);
        assert_eq!(narrowed.base(), 0x1100);
        assert_eq!(narrowed.length(), 0x10);

        // widening request is rejected, capability unchanged
        let rejected = narrowed.set_bounds(0x1000, 0x2000);
        assert_eq!(rejected, narrowed);
    }

    #[test]
    fn and_permissions_only_clears() {
        let c = rwx();
        let restricted = c.and_permissions(Permissions::READ | Permissions::WRITE);
        assert!(!restricted.permissions().contains(Permissions::EXECUTE));
        assert!(restricted.permissions().contains(Permissions::READ));
        // re-AND-ing with a superset never adds bits back
        let still_restricted = restricted.and_permissions(Permissions::all());
        assert_eq!(still_restricted.permissions(), restricted.permissions());
    }

    #[test]
    fn derive_from_narrows_when_contained() {
        let fixup_master = Capability::root(0, usize::MAX / 2, Permissions::all());
        let installed = Capability::root(0x2000, 0x40, Permissions::READ | Permissions::EXECUTIVE);
        let derived = fixup_master.derive_from(&installed, Permissions::empty(), Permissions::EXECUTIVE);
        assert_eq!(derived.base(), 0x2000);
        assert_eq!(derived.length(), 0x40);
        assert!(!derived.permissions().contains(Permissions::EXECUTIVE));
        assert!(derived.permissions().contains(Permissions::READ));
    }

    #[test]
    fn derive_from_can_regrant_executive() {
        let fixup_master = Capability::root(0, usize::MAX / 2, Permissions::all());
        let restricted = Capability::root(0x2000, 0x40, Permissions::READ);
        let restored = fixup_master.derive_from(&restricted, Permissions::EXECUTIVE, Permissions::empty());
        assert!(restored.permissions().contains(Permissions::EXECUTIVE));
    }

    #[test]
    fn seal_unseal_round_trip() {
        let sealer = Capability::root(0x1234, 1, Permissions::SEAL | Permissions::UNSEAL);
        let payload = Capability::root(0x5000, 0x100, Permissions::READ | Permissions::WRITE);

        let sealed = payload.seal(&sealer);
        assert!(sealed.is_sealed());

        let unsealed = sealed.unseal(&sealer);
        assert!(!unsealed.is_sealed());
        assert!(unsealed.is_valid());
    }

    #[test]
    fn unseal_with_wrong_sealer_clears_tag() {
        let sealer = Capability::root(0x1234, 1, Permissions::SEAL | Permissions::UNSEAL);
        let other_sealer = Capability::root(0x5678, 1, Permissions::SEAL | Permissions::UNSEAL);
        let payload = Capability::root(0x5000, 0x100, Permissions::READ);

        let sealed = payload.seal(&sealer);
        let unsealed = sealed.unseal(&other_sealer);
        assert!(!unsealed.is_valid());
    }

    #[test]
    fn invalid_capability_has_no_tag() {
        assert!(!Capability::invalid().is_valid());
    }
}
