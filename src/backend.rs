//! Platform seam between the in-memory state machine and the kernel.
//!
//! Everything that actually touches process credentials or the
//! filesystem goes through [`Backend`], so the bit-state machine and
//! query logic stay unit-testable without elevated privilege.

use std::{fs, io, os::fd::RawFd};

use capctl::{prctl, CapSet, CapState};
use nix::unistd::{Gid, Uid};
use tracing::warn;

use crate::cap::Capability;
use crate::error::CapError;
use crate::fcaps::{XATTR_CAPS_MAX_SIZE, XATTR_NAME_CAPS};

/// Full capability state of one process, one mask per namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessState {
    pub effective: u64,
    pub permitted: u64,
    pub inheritable: u64,
    pub bounding: u64,
    pub ambient: u64,
}

/// Minimal platform interface: read/write process capability state and
/// read/write the `security.capability` attribute of an open file.
pub trait Backend {
    /// Highest valid capability id on this backend.
    fn last_cap(&self) -> u8;

    /// Reads the five sets of the calling process (`None`) or of
    /// another pid.
    fn read_process(&mut self, pid: Option<i32>) -> Result<ProcessState, CapError>;

    /// Writes effective/permitted/inheritable of the calling process in
    /// one kernel update.
    fn write_caps(&mut self, effective: u64, permitted: u64, inheritable: u64)
        -> Result<(), CapError>;

    /// Removes one capability from the calling process's bounding set.
    /// The kernel offers no raise primitive; drops are final.
    fn drop_bounding(&mut self, cap: Capability) -> Result<(), CapError>;

    /// Raises or lowers one ambient capability of the calling process.
    fn set_ambient(&mut self, cap: Capability, raise: bool) -> Result<(), CapError>;

    /// Sets or clears the keep-capabilities flag of the calling
    /// process.
    fn set_keepcaps(&mut self, keep: bool) -> Result<(), CapError>;

    /// Locks the calling process's securebits so uid 0 grants nothing:
    /// `NOROOT` and `NO_SETUID_FIXUP`, each with its lock bit.
    fn lock_securebits(&mut self) -> Result<(), CapError>;

    /// Sets real, effective and saved gid in one step.
    fn change_gid(&mut self, gid: u32) -> Result<(), CapError>;

    /// Sets real, effective and saved uid in one step.
    fn change_uid(&mut self, uid: u32) -> Result<(), CapError>;

    /// Drops every supplementary group of the calling process.
    fn drop_supplementary_groups(&mut self) -> Result<(), CapError>;

    /// Raw `security.capability` value of an open file, `None` when the
    /// attribute is absent.
    fn read_file_attr(&mut self, fd: RawFd) -> Result<Option<Vec<u8>>, CapError>;

    /// Replaces the `security.capability` value of an open file.
    fn write_file_attr(&mut self, fd: RawFd, data: &[u8]) -> Result<(), CapError>;
}

fn capset_bits(set: CapSet) -> u64 {
    set.iter().fold(0u64, |mask, cap| mask | (1u64 << (cap as u8)))
}

fn bits_capset(bits: u64) -> CapSet {
    let mut set = CapSet::empty();
    for cap in (!CapSet::empty()).iter() {
        if bits & (1u64 << (cap as u8)) != 0 {
            set.add(cap);
        }
    }
    set
}

fn kernel_cap(cap: Capability) -> Result<capctl::Cap, CapError> {
    (!CapSet::empty())
        .iter()
        .find(|c| *c as u8 == cap.id())
        .ok_or_else(|| CapError::UnknownCapability(cap.name()))
}

/// Parse the `Cap*` lines of `/proc/<pid>/status`; the only portable
/// way to see another process's bounding and ambient sets.
fn read_status_caps(pid: i32) -> Result<ProcessState, CapError> {
    let path = format!("/proc/{}/status", pid);
    let status = fs::read_to_string(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CapError::InvalidTarget(format!("no such process: {}", pid)),
        io::ErrorKind::PermissionDenied => CapError::PermissionDenied(path.clone()),
        _ => CapError::Io(e),
    })?;
    let mut state = ProcessState::default();
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let field = match key {
            "CapInh" => &mut state.inheritable,
            "CapPrm" => &mut state.permitted,
            "CapEff" => &mut state.effective,
            "CapBnd" => &mut state.bounding,
            "CapAmb" => &mut state.ambient,
            _ => continue,
        };
        *field = u64::from_str_radix(value.trim(), 16).map_err(|e| {
            CapError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad {} line in {}: {}", key, path, e),
            ))
        })?;
    }
    Ok(state)
}

/// Backend talking to the running kernel through capctl and xattr
/// syscalls.
#[derive(Debug, Clone)]
pub struct KernelBackend {
    last_cap: u8,
}

impl KernelBackend {
    /// Discovers the valid capability id range. The kernel's
    /// `cap_last_cap` is clamped to the highest capability this build
    /// can drive through the write path.
    pub fn probe() -> Self {
        let known = (!CapSet::empty())
            .iter()
            .map(|c| c as u8)
            .max()
            .unwrap_or(0);
        let kernel = fs::read_to_string("/proc/sys/kernel/cap_last_cap")
            .ok()
            .and_then(|s| s.trim().parse::<u8>().ok())
            .unwrap_or(known);
        if kernel > known {
            warn!(
                "kernel reports cap_last_cap {} but only ids up to {} are supported",
                kernel, known
            );
        }
        KernelBackend {
            last_cap: kernel.min(known),
        }
    }
}

impl Default for KernelBackend {
    fn default() -> Self {
        Self::probe()
    }
}

impl Backend for KernelBackend {
    fn last_cap(&self) -> u8 {
        self.last_cap
    }

    fn read_process(&mut self, pid: Option<i32>) -> Result<ProcessState, CapError> {
        match pid {
            Some(p) if p != nix::unistd::getpid().as_raw() => read_status_caps(p),
            _ => {
                let state = CapState::get_current()?;
                let ambient = capctl::ambient::probe().map(capset_bits).unwrap_or(0);
                Ok(ProcessState {
                    effective: capset_bits(state.effective),
                    permitted: capset_bits(state.permitted),
                    inheritable: capset_bits(state.inheritable),
                    bounding: capset_bits(capctl::bounding::probe()),
                    ambient,
                })
            }
        }
    }

    fn write_caps(
        &mut self,
        effective: u64,
        permitted: u64,
        inheritable: u64,
    ) -> Result<(), CapError> {
        let mut state = CapState::empty();
        state.effective = bits_capset(effective);
        state.permitted = bits_capset(permitted);
        state.inheritable = bits_capset(inheritable);
        state.set_current().map_err(CapError::from)
    }

    fn drop_bounding(&mut self, cap: Capability) -> Result<(), CapError> {
        capctl::bounding::drop(kernel_cap(cap)?).map_err(CapError::from)
    }

    fn set_ambient(&mut self, cap: Capability, raise: bool) -> Result<(), CapError> {
        let cap = kernel_cap(cap)?;
        if raise {
            capctl::ambient::raise(cap).map_err(CapError::from)
        } else {
            capctl::ambient::lower(cap).map_err(CapError::from)
        }
    }

    fn set_keepcaps(&mut self, keep: bool) -> Result<(), CapError> {
        prctl::set_keepcaps(keep).map_err(CapError::from)
    }

    fn lock_securebits(&mut self) -> Result<(), CapError> {
        let bits = prctl::Secbits::NOROOT
            | prctl::Secbits::NOROOT_LOCKED
            | prctl::Secbits::NO_SETUID_FIXUP
            | prctl::Secbits::NO_SETUID_FIXUP_LOCKED;
        prctl::set_securebits(bits).map_err(CapError::from)
    }

    fn change_gid(&mut self, gid: u32) -> Result<(), CapError> {
        let gid = Gid::from_raw(gid);
        nix::unistd::setresgid(gid, gid, gid).map_err(CapError::from)
    }

    fn change_uid(&mut self, uid: u32) -> Result<(), CapError> {
        let uid = Uid::from_raw(uid);
        nix::unistd::setresuid(uid, uid, uid).map_err(CapError::from)
    }

    fn drop_supplementary_groups(&mut self) -> Result<(), CapError> {
        nix::unistd::setgroups(&[]).map_err(CapError::from)
    }

    fn read_file_attr(&mut self, fd: RawFd) -> Result<Option<Vec<u8>>, CapError> {
        let mut buf = [0u8; XATTR_CAPS_MAX_SIZE];
        let ret = unsafe {
            libc::fgetxattr(
                fd,
                XATTR_NAME_CAPS.as_ptr() as *const libc::c_char,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENODATA) => Ok(None),
                Some(libc::ERANGE) => Err(CapError::MalformedCapabilityData(
                    "attribute larger than any known revision".to_string(),
                )),
                Some(libc::EPERM) | Some(libc::EACCES) => {
                    Err(CapError::PermissionDenied(err.to_string()))
                }
                Some(code) => Err(CapError::SyscallFailure(code)),
                None => Err(CapError::Io(err)),
            };
        }
        Ok(Some(buf[..ret as usize].to_vec()))
    }

    fn write_file_attr(&mut self, fd: RawFd, data: &[u8]) -> Result<(), CapError> {
        let ret = unsafe {
            libc::fsetxattr(
                fd,
                XATTR_NAME_CAPS.as_ptr() as *const libc::c_char,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EPERM) | Some(libc::EACCES) => {
                    Err(CapError::PermissionDenied(err.to_string()))
                }
                Some(code) => Err(CapError::SyscallFailure(code)),
                None => Err(CapError::Io(err)),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::{cell::RefCell, collections::HashMap, rc::Rc};

    use super::*;

    /// Substitute kernel for tests: capability state and xattrs live in
    /// memory, bounding drops are monotonic like the real thing, and
    /// xattrs key on the file's inode so independent opens of the same
    /// path observe the same attribute.
    #[derive(Debug, Default)]
    pub(crate) struct FakeKernel {
        pub last_cap: u8,
        pub current: ProcessState,
        pub procs: HashMap<i32, ProcessState>,
        pub xattrs: HashMap<(u64, u64), Vec<u8>>,
        pub uid: u32,
        pub gid: u32,
        pub supplementary: Vec<u32>,
        pub keepcaps: bool,
        pub securebits_locked: bool,
        pub deny_writes: bool,
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeBackend(pub Rc<RefCell<FakeKernel>>);

    impl FakeBackend {
        pub fn with_last_cap(last_cap: u8) -> Self {
            FakeBackend(Rc::new(RefCell::new(FakeKernel {
                last_cap,
                ..Default::default()
            })))
        }
    }

    fn inode_key(fd: RawFd) -> (u64, u64) {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(fd, &mut st) };
        assert_eq!(ret, 0, "fstat on test fd");
        (st.st_dev, st.st_ino)
    }

    impl Backend for FakeBackend {
        fn last_cap(&self) -> u8 {
            self.0.borrow().last_cap
        }

        fn read_process(&mut self, pid: Option<i32>) -> Result<ProcessState, CapError> {
            let kernel = self.0.borrow();
            match pid {
                None => Ok(kernel.current),
                Some(p) => kernel
                    .procs
                    .get(&p)
                    .copied()
                    .ok_or_else(|| CapError::InvalidTarget(format!("no such process: {}", p))),
            }
        }

        fn write_caps(
            &mut self,
            effective: u64,
            permitted: u64,
            inheritable: u64,
        ) -> Result<(), CapError> {
            let mut kernel = self.0.borrow_mut();
            if kernel.deny_writes {
                return Err(CapError::PermissionDenied("fake kernel".to_string()));
            }
            kernel.current.effective = effective;
            kernel.current.permitted = permitted;
            kernel.current.inheritable = inheritable;
            Ok(())
        }

        fn drop_bounding(&mut self, cap: Capability) -> Result<(), CapError> {
            let mut kernel = self.0.borrow_mut();
            if kernel.deny_writes {
                return Err(CapError::PermissionDenied("fake kernel".to_string()));
            }
            kernel.current.bounding &= !(1u64 << cap.id());
            Ok(())
        }

        fn set_ambient(&mut self, cap: Capability, raise: bool) -> Result<(), CapError> {
            let mut kernel = self.0.borrow_mut();
            if kernel.deny_writes {
                return Err(CapError::PermissionDenied("fake kernel".to_string()));
            }
            let bit = 1u64 << cap.id();
            if raise {
                kernel.current.ambient |= bit;
            } else {
                kernel.current.ambient &= !bit;
            }
            Ok(())
        }

        fn set_keepcaps(&mut self, keep: bool) -> Result<(), CapError> {
            // the real prctl never fails for this flag
            self.0.borrow_mut().keepcaps = keep;
            Ok(())
        }

        fn lock_securebits(&mut self) -> Result<(), CapError> {
            let mut kernel = self.0.borrow_mut();
            if kernel.deny_writes {
                return Err(CapError::PermissionDenied("fake kernel".to_string()));
            }
            kernel.securebits_locked = true;
            Ok(())
        }

        fn change_gid(&mut self, gid: u32) -> Result<(), CapError> {
            let mut kernel = self.0.borrow_mut();
            if kernel.deny_writes {
                return Err(CapError::PermissionDenied("fake kernel".to_string()));
            }
            kernel.gid = gid;
            Ok(())
        }

        fn change_uid(&mut self, uid: u32) -> Result<(), CapError> {
            let mut kernel = self.0.borrow_mut();
            if kernel.deny_writes {
                return Err(CapError::PermissionDenied("fake kernel".to_string()));
            }
            kernel.uid = uid;
            Ok(())
        }

        fn drop_supplementary_groups(&mut self) -> Result<(), CapError> {
            let mut kernel = self.0.borrow_mut();
            if kernel.deny_writes {
                return Err(CapError::PermissionDenied("fake kernel".to_string()));
            }
            kernel.supplementary.clear();
            Ok(())
        }

        fn read_file_attr(&mut self, fd: RawFd) -> Result<Option<Vec<u8>>, CapError> {
            Ok(self.0.borrow().xattrs.get(&inode_key(fd)).cloned())
        }

        fn write_file_attr(&mut self, fd: RawFd, data: &[u8]) -> Result<(), CapError> {
            let mut kernel = self.0.borrow_mut();
            if kernel.deny_writes {
                return Err(CapError::PermissionDenied("fake kernel".to_string()));
            }
            kernel.xattrs.insert(inode_key(fd), data.to_vec());
            Ok(())
        }
    }
}
