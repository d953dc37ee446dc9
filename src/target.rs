use std::{
    fs::File,
    io,
    os::fd::{AsRawFd, RawFd},
    path::Path,
};

use nix::{sys::signal::kill, unistd::Pid};
use strum::EnumIs;

use crate::error::CapError;

/// Whose capabilities a session manipulates. Resolved and validated at
/// bind time; immutable for the lifetime of the session.
#[derive(Debug, EnumIs)]
pub enum Target {
    CurrentProcess,
    Pid(i32),
    /// File targets own their descriptor; it closes when the target is
    /// dropped.
    File(File),
}

impl Target {
    pub fn current() -> Self {
        Target::CurrentProcess
    }

    /// Binds to a live process. The pid is probed with a null signal,
    /// so a pid that is gone or not inspectable at the caller's
    /// privilege level is rejected here rather than on first use.
    pub fn for_pid(pid: i32) -> Result<Self, CapError> {
        kill(Pid::from_raw(pid), None)
            .map_err(|e| CapError::InvalidTarget(format!("pid {}: {}", pid, e)))?;
        Ok(Target::Pid(pid))
    }

    /// Opens and binds a regular file by path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, CapError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                CapError::InvalidTarget(format!("{}: no such file", path.display()))
            }
            io::ErrorKind::PermissionDenied => CapError::PermissionDenied(path.display().to_string()),
            _ => CapError::Io(e),
        })?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(CapError::InvalidTarget(format!(
                "{}: not a regular file",
                path.display()
            )));
        }
        Ok(Target::File(file))
    }

    /// Binds an already-open handle, taking ownership of it. A stale
    /// descriptor is rejected up front.
    pub fn from_open_handle(file: File) -> Result<Self, CapError> {
        file.metadata()
            .map_err(|e| CapError::InvalidHandle(e.to_string()))?;
        Ok(Target::File(file))
    }

    pub(crate) fn fd(&self) -> Option<RawFd> {
        match self {
            Target::File(file) => Some(file.as_raw_fd()),
            _ => None,
        }
    }
}
