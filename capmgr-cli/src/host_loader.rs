//! A Linux/glibc implementation of [`capmgr::library_set::HostLoader`].
//!
//! Rather than replicate glibc's private `struct link_map` layout (the
//! "one portability hazard" the reference design flags), this loader uses
//! `dl_iterate_phdr`, glibc's own stable public enumeration API, to
//! produce the link-map-shaped view the core crate needs: base address,
//! full path, and program headers, in load order. See `DESIGN.md` for the
//! tradeoffs this substitution makes against the reference's raw
//! `link_map` walk.

use std::ffi::{c_void, CStr, CString};

use capmgr::library_set::{HostLoader, LinkMapEntry, LoaderHandle};
use capmgr::shared_object::ProgramHeader;
use capmgr::error::LibrarySetError;

pub struct LinuxLoaderHandle {
    raw: *mut c_void,
}

impl Drop for LinuxLoaderHandle {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.raw);
        }
    }
}

impl LoaderHandle for LinuxLoaderHandle {}

pub struct LinuxLoader;

struct CollectCtx {
    entries: Vec<LinkMapEntry>,
}

unsafe extern "C" fn collect_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> libc::c_int {
    let ctx = &mut *(data as *mut CollectCtx);
    let info = &*info;

    let full_path = if info.dlpi_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };

    let mut program_headers = Vec::with_capacity(info.dlpi_phnum as usize);
    let mut lowest_vaddr = u64::MAX;
    for i in 0..info.dlpi_phnum {
        let phdr = &*info.dlpi_phdr.add(i as usize);
        if phdr.p_type == capmgr::shared_object::PT_LOAD {
            lowest_vaddr = lowest_vaddr.min(phdr.p_vaddr);
        }
        program_headers.push(ProgramHeader {
            p_type: phdr.p_type,
            p_flags: phdr.p_flags,
            p_offset: phdr.p_offset,
            p_vaddr: phdr.p_vaddr,
            p_filesz: phdr.p_filesz,
            p_memsz: phdr.p_memsz,
        });
    }
    let lowest_vaddr = if lowest_vaddr == u64::MAX { 0 } else { lowest_vaddr };

    let load_bias = info.dlpi_addr as usize;
    let map_start = load_bias + lowest_vaddr as usize;
    let is_loader_alias = full_path.contains("ld-linux") || full_path.contains("/ld.so");

    ctx.entries.push(LinkMapEntry {
        load_bias,
        full_path,
        is_loader_alias,
        program_headers,
        map_start,
    });

    0
}

impl HostLoader for LinuxLoader {
    type Handle = LinuxLoaderHandle;

    fn open(&self, name: &str, new_namespace: bool) -> Result<Self::Handle, LibrarySetError> {
        let c_name = CString::new(name).map_err(|_| LibrarySetError::OpenFailed(name.into()))?;
        let flags = libc::RTLD_NOW;
        let raw = unsafe {
            if new_namespace {
                libc::dlmopen(libc::LM_ID_NEWLM, c_name.as_ptr(), flags)
            } else {
                libc::dlopen(c_name.as_ptr(), flags)
            }
        };
        if raw.is_null() {
            return Err(LibrarySetError::OpenFailed(name.into()));
        }
        Ok(LinuxLoaderHandle { raw })
    }

    fn symbol(&self, handle: &Self::Handle, symbol: &str) -> Option<usize> {
        let c_sym = CString::new(symbol).ok()?;
        let ptr = unsafe { libc::dlsym(handle.raw, c_sym.as_ptr()) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as usize)
        }
    }

    fn link_map(&self, _handle: &Self::Handle) -> Vec<LinkMapEntry> {
        let mut ctx = CollectCtx {
            entries: Vec::new(),
        };
        unsafe {
            libc::dl_iterate_phdr(Some(collect_callback), &mut ctx as *mut _ as *mut c_void);
        }
        ctx.entries
    }
}
