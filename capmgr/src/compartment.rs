//! Sealer / compartment descriptor (§4.6): allocates the restricted stack
//! and constructs the sealer, executive-entry, and restricted-entry
//! capabilities that pin down one compartment instance, plus the call
//! protocol that invokes it.

use tracing::debug;

use crate::call::{CallArgsHeader, CompartmentCall, CompartmentCallArgs, ServiceFunctionTable};
use crate::capability::{Capability, Permissions};
use crate::error::CompartmentError;
use crate::library_set::{HostLoader, LibrarySet, LoaderHandle};
use crate::trampoline::{SwitchInFn, SwitchReturnFn};

const STACK_GUARD_BYTES: usize = 32;
const STACK_ALIGN: usize = 16;

/// The fixed-layout block the domain-switch trampoline reads registers
/// from on entry (`comp_common_asm.h`'s `CompartmentData_t`). The default-
/// data capability slot is always `None` in this implementation (`SPEC_FULL.md`
/// §D open question (c)).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CompartmentData {
    pub stack_top: Capability,
    pub thread_pointer: Capability,
    pub default_data: Option<Capability>,
}

/// One restricted-domain compartment instance.
pub struct CompartmentDescriptor<H: LoaderHandle> {
    id: u64,
    comp_data: CompartmentData,
    sealer: Capability,
    entry: Capability,
    exit_fp: SwitchReturnFn,
    switch_in: SwitchInFn,
    service_entry_fp: usize,
    service_dispatch_fp: usize,
    service_table: ServiceFunctionTable,
    library_set: *const LibrarySet<H>,
}

/// Arguments needed to carve out a restricted stack: anonymous, private,
/// read/write, marked as a stack mapping (§4.6 step 1).
fn allocate_restricted_stack(stack_size: usize, page_size: usize) -> std::io::Result<Capability> {
    let size = (stack_size + page_size - 1) & !(page_size - 1);
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    let base = ptr as usize;
    let usable_top = (base + size - STACK_GUARD_BYTES) & !(STACK_ALIGN - 1);
    let cap = Capability::root(base, usable_top - base, Permissions::READ | Permissions::WRITE)
        .set_address(usable_top);
    Ok(cap)
}

impl<H: LoaderHandle> CompartmentDescriptor<H> {
    /// Constructs a compartment instance: allocates its restricted stack,
    /// captures the thread-pointer register, builds the sealer from the
    /// platform seal master narrowed to a single object id, and resolves
    /// `entry_symbol` in `library_set` to build the sealed-entry capability
    /// (§4.6).
    #[allow(clippy::too_many_arguments)]
    pub fn new<L: HostLoader<Handle = H>>(
        loader: &L,
        library_set: &LibrarySet<H>,
        id: u64,
        stack_size: usize,
        page_size: usize,
        seal_master: &Capability,
        seal_id: u64,
        rx_master: &Capability,
        thread_pointer: Capability,
        entry_symbol: &str,
        exit_fp: SwitchReturnFn,
        switch_in: SwitchInFn,
        service_entry_fp: usize,
        service_dispatch_fp: usize,
        service_table: ServiceFunctionTable,
    ) -> Result<Self, CompartmentError> {
        let stack_top =
            allocate_restricted_stack(stack_size, page_size).map_err(|source| {
                CompartmentError::StackMapFailed {
                    size: stack_size,
                    source,
                }
            })?;

        let sealer = seal_master
            .set_bounds(seal_id as usize, 1)
            .set_address(seal_id as usize)
            .and_permissions(Permissions::SEAL | Permissions::UNSEAL);

        let entry_addr = library_set
            .resolve_symbol(loader, entry_symbol)
            .ok_or_else(|| CompartmentError::EntrySymbolNotFound(entry_symbol.to_string()))?;

        // The host loader's symbol lookup yields only a raw address, never a
        // size, so the narrowed capability's length is 0 here; it still
        // authenticates the branch target via its address and sealed-entry
        // bit.
        let entry = rx_master
            .set_bounds_and_address(&Capability::root(
                entry_addr,
                0,
                Permissions::READ | Permissions::EXECUTE,
            ))
            .make_sealed_entry();

        let comp_data = CompartmentData {
            stack_top,
            thread_pointer: thread_pointer.and_permissions(Permissions::READ | Permissions::WRITE),
            default_data: None,
        };

        debug!(id, entry_symbol, "compartment constructed");

        Ok(Self {
            id,
            comp_data,
            sealer,
            entry,
            exit_fp,
            switch_in,
            service_entry_fp,
            service_dispatch_fp,
            service_table,
            library_set: library_set as *const _,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sealer(&self) -> &Capability {
        &self.sealer
    }

    /// Resolves `name` via the library set, fills a call-args block, seals
    /// it, and invokes the executive -> restricted trampoline (§4.6).
    ///
    /// # Safety
    /// Must be called with a live `switch_in` trampoline and a
    /// `library_set` still valid for the lifetime of this descriptor.
    pub unsafe fn call_compartment_function<L: HostLoader<Handle = H>>(
        &self,
        loader: &L,
        name: &str,
        call: CompartmentCall,
    ) -> Result<u64, CompartmentError> {
        let library_set = &*self.library_set;
        let target_addr = library_set
            .resolve_symbol(loader, name)
            .ok_or_else(|| CompartmentError::FunctionNotFound(name.to_string()))?;

        let header = CallArgsHeader {
            exit_fp: self.exit_fp as usize,
            service_entry_fp: self.service_entry_fp,
            service_dispatch_fp: self.service_dispatch_fp,
            sealer: self.sealer,
            target_fp: target_addr,
            service_table: self.service_table.clone(),
        };
        let args = CompartmentCallArgs { header, call };

        // The args block lives on our stack for the duration of the call;
        // it is only ever referenced through the sealed capability below.
        let args_cap = Capability::root(
            &args as *const _ as usize,
            std::mem::size_of::<CompartmentCallArgs>(),
            Permissions::READ,
        )
        .seal(&self.sealer);

        let retval = (self.switch_in)(&self.comp_data, self.entry, args_cap, self.sealer);
        Ok(retval)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stack_capability_is_aligned_and_guarded() {
        let cap = allocate_restricted_stack(1 << 16, 4096).unwrap();
        assert_eq!(cap.address() % STACK_ALIGN, 0);
        assert!(cap.address() <= cap.top());
    }
}
