//! The five example compartment API wrappers (`SPEC_FULL.md` §C.2),
//! grounded in `example_comp_api.h/.cpp` and wired through a proxy
//! analogous to `CCompartmentApiProxy`. The business logic these call into
//! lives inside the compartment's shared object and is out of scope here —
//! this only marshals calls across the domain boundary and interprets the
//! scalar return value.

use capmgr::call::CompartmentCall;
use capmgr::compartment::CompartmentDescriptor;
use capmgr::error::CompartmentError;
use capmgr::library_set::{HostLoader, LoaderHandle};

pub struct CompartmentApiProxy<'a, H: LoaderHandle, L: HostLoader<Handle = H>> {
    descriptor: &'a CompartmentDescriptor<H>,
    loader: &'a L,
}

impl<'a, H: LoaderHandle, L: HostLoader<Handle = H>> CompartmentApiProxy<'a, H, L> {
    pub fn new(descriptor: &'a CompartmentDescriptor<H>, loader: &'a L) -> Self {
        Self { descriptor, loader }
    }

    fn call(&self, name: &str, call: CompartmentCall) -> Result<u64, CompartmentError> {
        unsafe { self.descriptor.call_compartment_function(self.loader, name, call) }
    }

    pub fn add_two_numbers(&self, a: i32, b: i32) -> Result<i32, CompartmentError> {
        let retval = self.call("add_two_numbers", CompartmentCall::AddTwoNumbers { a, b })?;
        Ok(retval as i32)
    }

    /// Returns the heap pointer the compartment allocated, and the byte
    /// count that was copied (§8 E2).
    pub fn copy_string_to_heap(&self, s: &str) -> Result<usize, CompartmentError> {
        let retval = self.call(
            "copy_string_to_heap",
            CompartmentCall::CopyStringToHeap { s: s.to_string() },
        )?;
        Ok(retval as usize)
    }

    pub fn print_heap_string_and_free(
        &self,
        ptr: usize,
        chars_to_print: usize,
    ) -> Result<bool, CompartmentError> {
        let retval = self.call(
            "print_heap_string_and_free",
            CompartmentCall::PrintHeapStringAndFree { ptr, chars_to_print },
        )?;
        Ok(retval != 0)
    }

    pub fn dump_struct(&self, i: u32, b: bool, c: u8) -> Result<(), CompartmentError> {
        self.call("dump_struct", CompartmentCall::DumpStruct { i, b, c })?;
        Ok(())
    }

    /// Clamped to `0..=4` by the compartment's own level setter; levels
    /// outside that range return `false` (§8 E4).
    pub fn set_compartment_debug_level(&self, level: i32) -> Result<bool, CompartmentError> {
        let retval = self.call(
            "set_compartment_debug_level",
            CompartmentCall::SetCompartmentDebugLevel { level },
        )?;
        Ok(retval != 0)
    }
}
