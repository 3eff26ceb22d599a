//! The two domain-switch primitives (§4.9). Both are implemented in
//! architecture-specific assembly outside this crate's scope; this module
//! specifies only their contract as function-pointer types.
//!
//! The register-save contract: callee-saved registers are *not* preserved
//! across a domain switch by the trampoline. Any caller that needs them
//! preserved must save them itself before crossing.

use crate::capability::Capability;
use crate::compartment::CompartmentData;

/// Atomically changes domain (executive <-> restricted), installs a new
/// stack pointer, thread-pointer register, and default-data capability from
/// the compartment descriptor, branches to `entry` passing
/// `(sealed_args, sealer)`, and saves enough state for `SwitchReturn` to
/// resume the caller.
pub type SwitchInFn =
    unsafe extern "C" fn(
        comp_data: *const CompartmentData,
        entry: Capability,
        sealed_args: Capability,
        sealer: Capability,
    ) -> u64;

/// Restores the state saved by the matching `SwitchInFn` call and yields a
/// single scalar return value to the caller of that switch.
pub type SwitchReturnFn = unsafe extern "C" fn(retval: u64) -> !;
