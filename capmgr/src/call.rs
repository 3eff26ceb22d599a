//! The call-args block (§3) and the two payload families it carries: one
//! variant per compartment API function, one variant per executive
//! service. Both travel sealed across the domain boundary.
//!
//! The source this crate is grounded on models each payload as a derived
//! class sharing a common header; here that collapses to a tagged union
//! (sum type), with the shared header lifted out as a separate field.

use crate::capability::Capability;

/// Process-wide immutable mapping from service name to the executive-side
/// function pointer implementing it. Established once at process init and
/// read-only thereafter (§3, §5).
#[derive(Debug, Clone)]
pub struct ServiceFunctionTable {
    entries: Vec<(&'static str, usize)>,
}

impl ServiceFunctionTable {
    pub fn new(entries: Vec<(&'static str, usize)>) -> Self {
        Self { entries }
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, fp)| *fp)
    }
}

/// Fields shared by every call-args block, regardless of direction.
#[derive(Debug, Clone)]
pub struct CallArgsHeader {
    pub exit_fp: usize,
    pub service_entry_fp: usize,
    pub service_dispatch_fp: usize,
    pub sealer: Capability,
    pub target_fp: usize,
    pub service_table: ServiceFunctionTable,
}

/// One variant per compartment API function exposed by the example
/// business logic (`SPEC_FULL.md` §C.2); the business logic itself is out
/// of scope, only the typed call-through payload belongs here.
#[derive(Debug, Clone)]
pub enum CompartmentCall {
    AddTwoNumbers { a: i32, b: i32 },
    CopyStringToHeap { s: String },
    PrintHeapStringAndFree { ptr: usize, chars_to_print: usize },
    DumpStruct { i: u32, b: bool, c: u8 },
    SetCompartmentDebugLevel { level: i32 },
}

/// One variant per executive service a compartment may request via upcall
/// (§4.7).
#[derive(Debug, Clone, Copy)]
pub enum ServiceCall {
    CheriMalloc { size_bytes: usize },
    CheriFree { ptr: usize },
}

/// An executive -> restricted call-args block: header plus a compartment
/// API payload. Built by the call protocol, sealed, and delivered across
/// the domain boundary.
#[derive(Debug, Clone)]
pub struct CompartmentCallArgs {
    pub header: CallArgsHeader,
    pub call: CompartmentCall,
}

/// A restricted -> executive call-args block: header plus a service
/// payload. Built by the compartment-side proxy.
#[derive(Debug, Clone)]
pub struct ServiceCallArgs {
    pub header: CallArgsHeader,
    pub call: ServiceCall,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn service_table_lookup() {
        let table = ServiceFunctionTable::new(vec![("cheri_malloc", 0x1000), ("cheri_free", 0x2000)]);
        assert_eq!(table.lookup("cheri_malloc"), Some(0x1000));
        assert_eq!(table.lookup("nonexistent"), None);
    }
}
