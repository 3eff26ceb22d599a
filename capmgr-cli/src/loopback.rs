//! Host stand-in for the architecture-specific domain-switch assembly
//! (§4.9), used on every target except `aarch64`, where the real Morello
//! trampoline would be linked in instead. A domain switch has no meaning on
//! a host without CHERI hardware, so this collapses it to an ordinary
//! same-address-space call: unseal the args block (already a software
//! operation everywhere else in this crate), read the call kind it
//! carries, and invoke the already-`dlsym`-resolved target address with the
//! real C ABI signature `example_comp_api.h` declares for it.
//!
//! This only marshals an address the library set already resolved; the
//! business logic behind that address still lives entirely inside the
//! compartment's shared object.

use std::ffi::{c_char, CString};

use capmgr::call::{CompartmentCall, CompartmentCallArgs};
use capmgr::capability::Capability;
use capmgr::compartment::CompartmentData;

/// Mirrors `example_comp_api.h`'s `struct example_struct`.
#[repr(C)]
struct ExampleStruct {
    i: u32,
    b: bool,
    c: c_char,
}

unsafe fn call_target(args: &CompartmentCallArgs) -> u64 {
    let fp = args.header.target_fp;
    match &args.call {
        CompartmentCall::AddTwoNumbers { a, b } => {
            let f: unsafe extern "C" fn(i32, i32) -> i32 = std::mem::transmute(fp);
            f(*a, *b) as i64 as u64
        }
        CompartmentCall::CopyStringToHeap { s } => {
            let f: unsafe extern "C" fn(*const c_char) -> *mut c_char = std::mem::transmute(fp);
            let cstr = CString::new(s.as_str()).unwrap_or_default();
            f(cstr.as_ptr()) as usize as u64
        }
        CompartmentCall::PrintHeapStringAndFree { ptr, chars_to_print } => {
            let f: unsafe extern "C" fn(*mut c_char, i16) -> bool = std::mem::transmute(fp);
            f(*ptr as *mut c_char, *chars_to_print as i16) as u64
        }
        CompartmentCall::DumpStruct { i, b, c } => {
            let f: unsafe extern "C" fn(*const ExampleStruct) = std::mem::transmute(fp);
            let data = ExampleStruct {
                i: *i,
                b: *b,
                c: *c as c_char,
            };
            f(&data as *const _);
            0
        }
        CompartmentCall::SetCompartmentDebugLevel { level } => {
            let f: unsafe extern "C" fn(i32) -> bool = std::mem::transmute(fp);
            f(*level) as u64
        }
    }
}

/// Stands in for `capmgr_switch_in` on targets without the real
/// domain-switch assembly: unseals `sealed_args` with `sealer`, reads the
/// call it carries, and invokes the already-resolved target function with
/// the signature `example_comp_api.h` gives it.
///
/// Only ever reached via [`crate::CompartmentDescriptor::call_compartment_function`]
/// in this binary, so `sealed_args` always wraps a `CompartmentCallArgs`;
/// a compartment-side upcall through [`capmgr::proxy::ServiceCallProxy`]
/// would need a second loopback reading a `ServiceCallArgs` instead, which
/// this CLI never installs.
///
/// # Safety
/// `sealed_args` must have been sealed over a live `CompartmentCallArgs`
/// whose `target_fp` is a valid function pointer with the ABI its call
/// variant expects.
pub unsafe extern "C" fn switch_in(
    _comp_data: *const CompartmentData,
    _entry: Capability,
    sealed_args: Capability,
    sealer: Capability,
) -> u64 {
    let unsealed = sealed_args.unseal(&sealer);
    if !unsealed.is_valid() {
        return 0;
    }
    let args = &*(unsealed.address() as *const CompartmentCallArgs);
    call_target(args)
}

/// Stands in for `capmgr_switch_return`. Never actually reached by this
/// loopback: [`switch_in`] above returns its scalar result directly instead
/// of branching back through a separate return trampoline, since there is
/// no divergent control flow to restore without a real domain switch. Kept
/// only so a `CompartmentDescriptor` always holds a well-typed `exit_fp`.
pub unsafe extern "C" fn switch_return(retval: u64) -> ! {
    panic!("capmgr_switch_return invoked on a host loopback build (retval={retval})");
}
