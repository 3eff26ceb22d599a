use miette::Diagnostic;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CapMgrError>;

/// Top-level error, wrapping a specific failure kind plus any related
/// failures collected alongside it (e.g. a library set reporting every
/// object that failed to load, not just the first).
#[derive(Debug, Error, Diagnostic)]
#[error("{kind}")]
pub struct CapMgrError {
    #[source]
    pub kind: CapMgrErrorKind,
    #[related]
    pub related: Vec<CapMgrError>,
}

impl CapMgrError {
    pub fn new(kind: impl Into<CapMgrErrorKind>) -> Self {
        Self {
            kind: kind.into(),
            related: Vec::new(),
        }
    }

    pub fn with_related(kind: impl Into<CapMgrErrorKind>, related: Vec<CapMgrError>) -> Self {
        Self {
            kind: kind.into(),
            related,
        }
    }

    /// Partition an iterator of fallible results into the successes and a
    /// single aggregate error carrying every failure as `related`, if any
    /// occurred.
    pub fn collect<T>(
        iter: impl IntoIterator<Item = Result<T>>,
    ) -> std::result::Result<Vec<T>, CapMgrError> {
        let (oks, errs): (Vec<_>, Vec<_>) =
            itertools::Itertools::partition_map(iter.into_iter(), |r| match r {
                Ok(v) => itertools::Either::Left(v),
                Err(e) => itertools::Either::Right(e),
            });
        if errs.is_empty() {
            Ok(oks)
        } else {
            Err(CapMgrError::with_related(
                CapMgrErrorKind::Aggregate { count: errs.len() },
                errs,
            ))
        }
    }
}

impl<K: Into<CapMgrErrorKind>> From<K> for CapMgrError {
    fn from(kind: K) -> Self {
        CapMgrError::new(kind)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CapMgrErrorKind {
    #[error("{count} related failures")]
    Aggregate { count: usize },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dynamic(#[from] DynamicSectionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Reloc(#[from] RelocationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    SharedObject(#[from] SharedObjectError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    LibrarySet(#[from] LibrarySetError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Compartment(#[from] CompartmentError),
}

/// Errors from the ELF dynamic-section view (§4.2).
#[derive(Debug, Error, Diagnostic)]
pub enum DynamicSectionError {
    #[error("required dynamic tag {0:?} missing")]
    MissingTag(DynTag),

    #[error("PT_DYNAMIC segment truncated before a null terminator tag")]
    Truncated,
}

/// Tags the dynamic-section view's typed getters recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynTag {
    PltRel,
    PltRelSz,
    PltRelType,
    Rel,
    RelSz,
    RelEnt,
    Rela,
    RelaSz,
    RelaEnt,
    StrTab,
    StrSz,
    SymTab,
    SoName,
    Hash,
    Init,
    Fini,
    InitArray,
    InitArraySz,
    FiniArray,
    FiniArraySz,
}

/// Errors from relocation-table construction and patching (§4.3).
#[derive(Debug, Error, Diagnostic)]
pub enum RelocationError {
    #[error("{table} element size {got} does not match the {expected} bytes required for its flavor")]
    ElementSizeMismatch {
        table: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("{table} range of {len} bytes is not a multiple of its element size {elem}")]
    RangeNotMultiple {
        table: &'static str,
        len: usize,
        elem: usize,
    },

    #[error("mprotect failed while re-protecting a PT_LOAD segment: {0}")]
    ProtectFailed(std::io::Error),
}

/// Errors from the shared-object record (§4.4).
#[derive(Debug, Error, Diagnostic)]
pub enum SharedObjectError {
    #[error("object has no PT_DYNAMIC segment")]
    NoDynamicSegment,

    #[error("object has {0} PT_DYNAMIC segments, expected exactly one")]
    DuplicateDynamicSegment(usize),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dynamic(#[from] DynamicSectionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Reloc(#[from] RelocationError),
}

/// Errors from the library set / link-map walk (§4.5).
#[derive(Debug, Error, Diagnostic)]
pub enum LibrarySetError {
    #[error("host loader refused to open {0:?}")]
    OpenFailed(std::path::PathBuf),

    #[error("link-map walk produced zero usable objects")]
    NoObjectsLoaded,

    #[error(transparent)]
    #[diagnostic(transparent)]
    SharedObject(#[from] SharedObjectError),
}

/// Errors from compartment construction and invocation (§4.6).
#[derive(Debug, Error, Diagnostic)]
pub enum CompartmentError {
    #[error("failed to map a {size}-byte restricted stack: {source}")]
    StackMapFailed {
        size: usize,
        source: std::io::Error,
    },

    #[error("entry trampoline symbol {0:?} was not found")]
    EntrySymbolNotFound(String),

    #[error("compartment function {0:?} was not found")]
    FunctionNotFound(String),
}
