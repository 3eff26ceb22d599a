//! A capability-based compartmentalization manager for a CHERI-style
//! architecture (the ARM Morello extension to AArch64).
//!
//! This crate confines code loaded from a shared object inside a
//! *restricted* execution domain that cannot forge, widen, or smuggle out
//! hardware capabilities, and mediates every upcall that restricted code
//! must make back into the privileged *executive* domain.
//!
//! Two pieces carry almost the entire design:
//!
//! - the **dynamic relocation patcher** ([`reloc`], [`shared_object`],
//!   [`dynamic`]): after the host loader has mapped a compartment's shared
//!   object, this walks its ELF dynamic section, finds every
//!   capability-bearing relocation, and derives a narrowed capability that
//!   strips the executive permission;
//! - the **compartment call protocol** ([`compartment`], [`service`],
//!   [`proxy`], [`call`]): a bidirectional, sealed, stack-switching call
//!   convention between the executive and restricted domains.
//!
//! The host dynamic loader, the low-level domain-switch trampolines
//! ([`trampoline`]), the textual logger, and the example compartment API
//! business logic are all external collaborators this crate only specifies
//! the contract of.

pub mod call;
pub mod capability;
pub mod compartment;
pub mod dynamic;
pub mod error;
pub mod library_set;
pub mod proxy;
pub mod range;
pub mod reloc;
pub mod service;
pub mod shared_object;
pub mod trampoline;

pub use capability::{Capability, Permissions};
pub use error::{CapMgrError, Result};
pub use range::Range;
