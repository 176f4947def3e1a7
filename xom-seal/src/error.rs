use thiserror::Error;

use crate::frame::Gfn;

pub type XomResult<T> = Result<T, XomError>;

// Not exported on every libc target; x86 Linux and Xen both use 85:
const ERESTART: std::ffi::c_int = 85;

/// Errors reported by the sealing protocol, its clients and the pool.
///
/// The variants are kinds rather than codes; [`XomError::errno`] gives the
/// value a hypercall returns to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum XomError {
    /// No enforcement backend, or the domain is not eligible for XOM.
    #[error("execute-only memory is not supported here")]
    Unsupported,
    /// Bad index, double lock, zero count, remark, double seal, or marking
    /// an unsealed page.
    #[error("invalid argument")]
    InvalidArgument,
    /// Frame number(s) outside of the currently mapped range.
    #[error("frame range exceeds the mapped range")]
    Range,
    /// Metadata or backing memory could not be allocated.
    #[error("out of memory for XOM metadata or backing pages")]
    ResourceExhausted,
    /// The underlying page has a type or ownership conflict.
    #[error("page type conflict prevents the requested transition")]
    PermissionDenied,
    /// Cooperative preemption point reached; resume from the next element.
    #[error("preempted, restart from the next unprocessed element")]
    NeedsRestart,
    /// A guest data access hit a frame it may not read or write.
    #[error("access to frame {0} is not permitted")]
    Fault(Gfn),
}

impl XomError {
    /// Linux errno a hypercall reports for this error (as a positive value).
    pub fn errno(&self) -> std::ffi::c_int {
        match self {
            XomError::Unsupported => libc::EOPNOTSUPP,
            XomError::InvalidArgument => libc::EINVAL,
            XomError::Range => libc::EOVERFLOW,
            XomError::ResourceExhausted => libc::ENOMEM,
            XomError::PermissionDenied => libc::EPERM,
            XomError::NeedsRestart => ERESTART,
            XomError::Fault(_) => libc::EFAULT,
        }
    }

    /// Whether this is a resumption signal rather than a failure.
    pub fn is_restart(&self) -> bool {
        matches!(self, XomError::NeedsRestart)
    }
}
