//! The service dispatcher: entered in executive domain with an already-
//! unsealed args block, it dispatches by tag to the registered executive
//! handler and invokes the executive -> restricted return trampoline
//! (§4.7).

use tracing::error;

use crate::call::ServiceCall;
use crate::capability::{Capability, Permissions};

/// The wire-level discriminant a sealed service call arrives tagged with.
/// Modeled separately from [`ServiceCall`] because, unlike that
/// already-validated enum, this value crosses the domain boundary as a raw
/// integer and may not name a registered service (§7 "dispatch failure").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServiceCallKind {
    CheriMalloc = 0,
    CheriFree = 1,
}

impl TryFrom<u32> for ServiceCallKind {
    type Error = ();

    fn try_from(v: u32) -> std::result::Result<Self, ()> {
        match v {
            0 => Ok(Self::CheriMalloc),
            1 => Ok(Self::CheriFree),
            _ => Err(()),
        }
    }
}

/// `cheri_malloc`: allocates `size` bytes via the C allocator (`calloc`
/// zero-fills them in the same step), and clears the `EXECUTIVE` permission
/// from the returned capability before handing it back to restricted code
/// (`example_capmgr_service_api.cpp`).
fn cheri_malloc(heap_master: &Capability, size: usize) -> Capability {
    let ptr = unsafe { libc::calloc(1, size.max(1)) };
    if ptr.is_null() {
        return Capability::invalid();
    }
    heap_master
        .set_bounds(ptr as usize, size)
        .and_permissions(Permissions::all() & !Permissions::EXECUTIVE)
}

/// `cheri_free`: deallocates the block described by `cap`, which must be
/// one this dispatcher previously handed out via `cheri_malloc`. Uses the C
/// allocator's `free`, which (unlike Rust's global allocator) needs no
/// matching size on the free path.
///
/// # Safety
/// `cap`'s address must describe a live allocation made by `cheri_malloc`,
/// not already freed.
unsafe fn cheri_free(cap: &Capability) {
    if !cap.is_valid() {
        return;
    }
    libc::free(cap.address() as *mut libc::c_void);
}

/// Dispatches one already-unsealed service call. Returns `None` for an
/// unrecognized kind, logging the failure (§4.7, §7) — non-fatal, since the
/// caller (restricted code) controls the discriminant and can only hurt
/// itself by sending garbage.
///
/// # Safety
/// For `CheriFree`, the pointer embedded in `call` must describe a live
/// allocation previously returned by this dispatcher's `CheriMalloc`.
pub unsafe fn dispatch(
    kind: u32,
    call: ServiceCall,
    heap_master: &Capability,
) -> Option<Capability> {
    let Ok(kind) = ServiceCallKind::try_from(kind) else {
        error!(kind, "unknown service call kind");
        return None;
    };

    match (kind, call) {
        (ServiceCallKind::CheriMalloc, ServiceCall::CheriMalloc { size_bytes }) => {
            Some(cheri_malloc(heap_master, size_bytes))
        }
        (ServiceCallKind::CheriFree, ServiceCall::CheriFree { ptr }) => {
            let cap = heap_master.set_address(ptr);
            cheri_free(&cap);
            Some(Capability::invalid())
        }
        _ => {
            error!("service call kind/payload mismatch");
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn malloc_zero_fills_and_clears_executive() {
        let heap_master = Capability::root(0, usize::MAX / 2, Permissions::all());
        let cap = cheri_malloc(&heap_master, 64);
        assert!(cap.is_valid());
        assert!(!cap.permissions().contains(Permissions::EXECUTIVE));
        let bytes = unsafe { std::slice::from_raw_parts(cap.address() as *const u8, 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { cheri_free(&cap) };
    }

    #[test]
    fn unknown_kind_returns_none() {
        let heap_master = Capability::root(0, usize::MAX / 2, Permissions::all());
        let result = unsafe {
            dispatch(99, ServiceCall::CheriFree { ptr: 0 }, &heap_master)
        };
        assert!(result.is_none());
    }
}
