// SPDX-License-Identifier: MPL-2.0

/// The error type of DVMA operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The device address space has no room for the requested range.
    OutOfSpace,
    /// The page-table service could not provide entries for a range.
    TableExhausted,
    /// The device attributes cannot describe the requested transfer.
    IncompatibleConfig,
    /// The buffer description is malformed or cannot be translated.
    InvalidArgs,
    /// Memory for handle bookkeeping could not be allocated.
    NoResources,
    /// The requested window does not exist.
    OutOfRange,
    /// The handle was used in a state that does not allow the operation.
    Usage(UsageError),
}

/// Misuses of a [`DmaHandle`] that are detected and rejected.
///
/// [`DmaHandle`]: crate::DmaHandle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    /// Binding a handle that is already bound.
    AlreadyBound,
    /// Unbinding, or requesting windows of, a handle that is not bound.
    NotBound,
    /// Freeing a handle that is still bound.
    FreeWhileBound,
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

impl From<alloc::collections::TryReserveError> for Error {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        Error::NoResources
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::OutOfSpace => f.write_str("device address space exhausted"),
            Error::TableExhausted => f.write_str("page-table entries exhausted"),
            Error::IncompatibleConfig => f.write_str("incompatible device attributes"),
            Error::InvalidArgs => f.write_str("invalid buffer description"),
            Error::NoResources => f.write_str("no memory for DMA handle state"),
            Error::OutOfRange => f.write_str("DMA window index out of range"),
            Error::Usage(err) => write!(f, "DMA handle misuse: {:?}", err),
        }
    }
}

/// The result type of DVMA operations.
pub type Result<T> = core::result::Result<T, Error>;
