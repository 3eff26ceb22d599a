//! `capmgr`: loads a compartment's shared object, patches its Morello
//! capability relocations down to restricted-domain permissions, invokes a
//! short demonstration call sequence through the example compartment API,
//! then restores executive permissions before exiting (§6, §8 E1–E5).

mod api;
mod host_loader;
mod loopback;

use std::path::PathBuf;

use clap::Parser;
use humansize::{format_size, BINARY};
use miette::IntoDiagnostic;
use tracing::{info, Level};

use capmgr::call::ServiceFunctionTable;
use capmgr::capability::{Capability, Permissions};
use capmgr::compartment::CompartmentDescriptor;
use capmgr::library_set::LibrarySet;
use capmgr::trampoline::{SwitchInFn, SwitchReturnFn};

use api::CompartmentApiProxy;
use host_loader::LinuxLoader;

// Implemented in architecture-specific assembly outside this crate (§4.9);
// linked in on an actual Morello target. Every other host falls back to
// `loopback`, which performs the same marshal-and-call by hand since there
// is no real domain switch to drive on non-CHERI hardware.
#[cfg(target_arch = "aarch64")]
extern "C" {
    fn capmgr_switch_in(
        comp_data: *const capmgr::compartment::CompartmentData,
        entry: Capability,
        sealed_args: Capability,
        sealer: Capability,
    ) -> u64;
    fn capmgr_switch_return(retval: u64) -> !;
}

#[cfg(target_arch = "aarch64")]
fn switch_fns() -> (SwitchReturnFn, SwitchInFn) {
    (capmgr_switch_return, capmgr_switch_in)
}

#[cfg(not(target_arch = "aarch64"))]
fn switch_fns() -> (SwitchReturnFn, SwitchInFn) {
    (loopback::switch_return, loopback::switch_in)
}

fn clamp_verbosity(s: &str) -> Result<u8, String> {
    let v: u8 = s.parse().map_err(|_| format!("not a number: {s}"))?;
    Ok(v.min(4))
}

/// Loads a compartment's shared object, patches its capability relocations,
/// and runs a short demonstration call sequence against it.
#[derive(Parser, Debug)]
#[command(name = "capmgr", version, about)]
struct Cli {
    /// Path to the compartment's shared object.
    #[arg(long = "comp-lib", default_value = "./libcompartment.so")]
    comp_lib: PathBuf,

    /// Log verbosity: 0 = always/error, 1 = warning, 2 = info, 3 = debug, 4 = verbose.
    #[arg(short = 'v', long, default_value_t = 0, value_parser = clamp_verbosity)]
    verbosity: u8,

    /// Dump program headers and relocation tables before patching.
    #[arg(long)]
    dump_tables: bool,
}

fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn dump_tables(library_set: &LibrarySet<host_loader::LinuxLoaderHandle>) {
    for so in library_set.objects() {
        println!("object: {}", so.full_name());
        for (p_type, headers) in so.program_headers() {
            for h in headers {
                println!(
                    "  phdr type={} flags={:#x} offset={:#x} vaddr={:#x} memsz={:#x}",
                    p_type, h.p_flags, h.p_offset, h.p_vaddr, h.p_memsz
                );
            }
        }
        for table in so.tables() {
            println!(
                "  table {} ({} entries, {})",
                table.name(),
                table.range().size() / table.element_size(),
                format_size(table.range().size(), BINARY)
            );
            for entry in unsafe { table.entries() } {
                match entry.addend {
                    Some(a) => println!(
                        "    offset={:#x} sym={} type={} addend={}",
                        entry.offset,
                        entry.sym(),
                        entry.r_type(),
                        a
                    ),
                    None => println!(
                        "    offset={:#x} sym={} type={}",
                        entry.offset,
                        entry.sym(),
                        entry.r_type()
                    ),
                }
            }
        }
    }
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(level_for(cli.verbosity))
        .init();
    // Routes any `log` crate output from linked C shims or dependencies
    // through the same `tracing` subscriber.
    tracing_log::LogTracer::init().into_diagnostic()?;

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

    // The executive's own unrestricted authority, from which every other
    // capability in this process is narrowed.
    let root_authority = Capability::root(0, usize::MAX, Permissions::all());
    let seal_master = root_authority.and_permissions(Permissions::SEAL | Permissions::UNSEAL);
    let rx_master = root_authority.and_permissions(Permissions::READ | Permissions::EXECUTE);

    let loader = LinuxLoader;
    let comp_lib = cli.comp_lib.to_string_lossy().into_owned();
    let library_set =
        LibrarySet::new(&loader, &comp_lib, root_authority, false, false, page_size)
            .into_diagnostic()?;

    if cli.dump_tables {
        dump_tables(&library_set);
    }

    // Narrow every loaded object's capability-bearing relocations down to
    // restricted-domain permissions before any compartment code runs.
    unsafe {
        library_set
            .do_all_lib_cap_fixups(&root_authority, true)
            .into_diagnostic()?;
    }

    // This binary never installs a `ServiceCallProxy`, so no compartment
    // code in this demonstration ever issues an upcall through these
    // entries; a real build would populate them with the linked addresses
    // its own compartment shared object resolves `cheri_malloc`/`cheri_free`
    // to.
    let service_table = ServiceFunctionTable::new(vec![("cheri_malloc", 0), ("cheri_free", 0)]);

    let (exit_fp, switch_in) = switch_fns();

    let descriptor = CompartmentDescriptor::new(
        &loader,
        &library_set,
        0,
        1 << 16,
        page_size,
        &seal_master,
        1,
        &rx_master,
        Capability::invalid(),
        "compartment_entry",
        exit_fp,
        switch_in,
        0,
        capmgr::service::dispatch as usize,
        service_table,
    )
    .into_diagnostic()?;

    let api = CompartmentApiProxy::new(&descriptor, &loader);

    // E4: verbose debug level before the demonstration sequence runs.
    let _ = api.set_compartment_debug_level(4);

    // E1
    let sum = api.add_two_numbers(3, 8).into_diagnostic()?;
    info!(sum, "add_two_numbers(3, 8)");

    // E2
    let ptr = api.copy_string_to_heap("This is a test").into_diagnostic()?;
    let ok = api
        .print_heap_string_and_free(ptr, 7)
        .into_diagnostic()?;
    info!(ok, "print_heap_string_and_free");

    // E3
    api.dump_struct(99, false, b'!').into_diagnostic()?;

    // Restore executive permissions before exiting.
    unsafe {
        library_set
            .do_all_lib_cap_fixups(&root_authority, false)
            .into_diagnostic()?;
    }

    Ok(())
}
