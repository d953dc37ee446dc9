use thiserror::Error;

/// Errors surfaced by capability operations.
///
/// Argument-shape problems (`InvalidTarget`, `InvalidHandle`,
/// `UnknownCapability`) are detected at the API boundary, before any
/// kernel or filesystem interaction. Kernel rejections that do not fit
/// a more precise variant carry their raw errno in `SyscallFailure`.
#[derive(Debug, Error)]
pub enum CapError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("malformed capability data: {0}")]
    MalformedCapabilityData(String),

    #[error("state stack is empty")]
    StateStackEmpty,

    #[error("syscall failed with errno {0}")]
    SyscallFailure(i32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for CapError {
    fn from(err: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match err {
            Errno::EPERM | Errno::EACCES => CapError::PermissionDenied(err.desc().to_string()),
            Errno::ESRCH => CapError::InvalidTarget("no such process".to_string()),
            _ => CapError::SyscallFailure(err as i32),
        }
    }
}

impl From<capctl::Error> for CapError {
    fn from(err: capctl::Error) -> Self {
        match err.code() {
            libc::EPERM | libc::EACCES => CapError::PermissionDenied(err.to_string()),
            libc::ESRCH => CapError::InvalidTarget("no such process".to_string()),
            code => CapError::SyscallFailure(code),
        }
    }
}
