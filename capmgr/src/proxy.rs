//! Compartment-side call proxy (§4.8): mirrors the call protocol in the
//! opposite direction, always using the same sealer. A single instance
//! exists per in-flight compartment call, reachable to compartment library
//! code via [`current`], and is released when the call returns.

use std::cell::RefCell;

use crate::call::{CallArgsHeader, ServiceCall, ServiceCallArgs};
use crate::capability::{Capability, Permissions};
use crate::trampoline::SwitchInFn;

thread_local! {
    /// The single in-flight proxy for the duration of one compartment call.
    /// Restricted code never holds interior mutability over this directly —
    /// it only ever sees `&ServiceCallProxy` through [`current`].
    static CURRENT: RefCell<Option<ServiceCallProxy>> = const { RefCell::new(None) };
}

/// Given a service name and typed arguments, looks up the function pointer
/// in the service table the executive delivered, fills an args block,
/// seals it with the shared sealer, and invokes the restricted ->
/// executive trampoline.
pub struct ServiceCallProxy {
    header: CallArgsHeader,
    switch_in: SwitchInFn,
}

impl ServiceCallProxy {
    fn new(header: CallArgsHeader, switch_in: SwitchInFn) -> Self {
        Self { header, switch_in }
    }

    /// Installs the proxy for the duration of one compartment call. Called
    /// by the compartment's entry trampoline before dispatching to library
    /// code.
    pub fn install(header: CallArgsHeader, switch_in: SwitchInFn) {
        CURRENT.with(|cell| {
            *cell.borrow_mut() = Some(Self::new(header, switch_in));
        });
    }

    /// Releases the proxy. Called after the dispatched function returns.
    pub fn release() {
        CURRENT.with(|cell| {
            cell.borrow_mut().take();
        });
    }

    fn call_service(&self, kind: u32, call: ServiceCall) -> u64 {
        let Some(target_fp) = self.header.service_table.lookup(match call {
            ServiceCall::CheriMalloc { .. } => "cheri_malloc",
            ServiceCall::CheriFree { .. } => "cheri_free",
        }) else {
            return 0;
        };

        let args = ServiceCallArgs {
            header: CallArgsHeader {
                target_fp,
                ..self.header.clone()
            },
            call,
        };
        let args_cap = Capability::root(
            &args as *const _ as usize,
            std::mem::size_of::<ServiceCallArgs>(),
            Permissions::READ,
        )
        .seal(&self.header.sealer);

        // No caller-side compartment data is required for an upcall to the
        // capability manager's own service handler.
        let null_comp_data = crate::compartment::CompartmentData {
            stack_top: Capability::invalid(),
            thread_pointer: Capability::invalid(),
            default_data: None,
        };

        let _ = kind;
        unsafe {
            (self.switch_in)(
                &null_comp_data,
                Capability::root(
                    self.header.service_entry_fp,
                    0,
                    Permissions::EXECUTE,
                )
                .make_sealed_entry(),
                args_cap,
                self.header.sealer,
            )
        }
    }

    pub fn cheri_malloc(&self, size_bytes: usize) -> u64 {
        self.call_service(0, ServiceCall::CheriMalloc { size_bytes })
    }

    pub fn cheri_free(&self, ptr: usize) -> u64 {
        self.call_service(1, ServiceCall::CheriFree { ptr })
    }
}

/// Runs `f` with the in-flight proxy, if one is installed.
pub fn current<R>(f: impl FnOnce(&ServiceCallProxy) -> R) -> Option<R> {
    CURRENT.with(|cell| cell.borrow().as_ref().map(f))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::call::ServiceFunctionTable;

    #[allow(clippy::missing_safety_doc)]
    unsafe extern "C" fn noop_switch_in(
        _comp_data: *const crate::compartment::CompartmentData,
        _entry: Capability,
        _sealed_args: Capability,
        _sealer: Capability,
    ) -> u64 {
        42
    }

    #[test]
    fn install_and_release_round_trip() {
        assert!(current(|_| ()).is_none());

        let header = CallArgsHeader {
            exit_fp: 0,
            service_entry_fp: 0,
            service_dispatch_fp: 0,
            sealer: Capability::root(1, 1, Permissions::SEAL | Permissions::UNSEAL),
            target_fp: 0,
            service_table: ServiceFunctionTable::new(vec![("cheri_malloc", 0x10)]),
        };
        ServiceCallProxy::install(header, noop_switch_in);
        assert!(current(|_| ()).is_some());

        let ret = current(|p| p.cheri_malloc(64)).unwrap();
        assert_eq!(ret, 42);

        ServiceCallProxy::release();
        assert!(current(|_| ()).is_none());
    }
}
