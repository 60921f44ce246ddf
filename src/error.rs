use std::{error::Error, fmt};

/// Classification of engine failures. A missing key is deliberately not
/// represented here: lookups report it as `None`, not as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Underlying file I/O failed.
    Io,
    /// Structural tree invariant violated, or a key could not be resolved
    /// even through the fallback traversal.
    BTree,
    /// Lock acquisition exceeded its budget.
    LockTimeout,
    /// Write attempted while the engine is read-only.
    ReadOnly,
    /// Caller handed us something we cannot act on.
    InvalidArgument,
    /// Header checksum or chain link inconsistency.
    Corruption,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Io => "io error",
            ErrorKind::BTree => "btree error",
            ErrorKind::LockTimeout => "lock timeout",
            ErrorKind::ReadOnly => "read-only",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Corruption => "corruption",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
pub struct DomError {
    kind: ErrorKind,
    details: String,
}

impl DomError {
    pub fn new(kind: ErrorKind, msg: &str) -> DomError {
        DomError {
            kind,
            details: msg.to_string(),
        }
    }

    pub fn io(msg: &str) -> DomError {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn btree(msg: &str) -> DomError {
        Self::new(ErrorKind::BTree, msg)
    }

    pub fn invalid_argument(msg: &str) -> DomError {
        Self::new(ErrorKind::InvalidArgument, msg)
    }

    pub fn corruption(msg: &str) -> DomError {
        Self::new(ErrorKind::Corruption, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn show_backtrace(&self) {
        let bt = backtrace::Backtrace::new();
        log::debug!("error: {}, backtrace:\n{:?}", self, bt);
    }
}

impl fmt::Display for DomError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.details)
    }
}

impl Error for DomError {}

impl From<std::io::Error> for DomError {
    fn from(e: std::io::Error) -> Self {
        DomError::new(ErrorKind::Io, &e.to_string())
    }
}
