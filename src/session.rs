use tracing::debug;

use crate::backend::{Backend, KernelBackend};
use crate::cap::Capability;
use crate::error::CapError;
use crate::fcaps::FileCaps;
use crate::set::{Action, CapabilitySet, CapabilityType, ChangeIdFlags, QueryResult, Select};
use crate::target::Target;

/// A capability session: one [`Target`], one in-memory
/// [`CapabilitySet`], and the backend that synchronizes them.
///
/// The usual flow is bind, load (or start from the empty state), mutate,
/// query or print, then commit with [`apply`]/[`apply_caps_file`], or
/// simply drop the session to discard the changes.
///
/// [`apply`]: CapSession::apply
/// [`apply_caps_file`]: CapSession::apply_caps_file
pub struct CapSession<B: Backend = KernelBackend> {
    target: Target,
    query_pid: Option<i32>,
    set: CapabilitySet,
    backend: B,
}

impl CapSession<KernelBackend> {
    /// Session bound to the current process, against the running kernel.
    pub fn new() -> Self {
        Self::with_backend(Target::current(), KernelBackend::probe())
    }

    pub fn bind(target: Target) -> Self {
        Self::with_backend(target, KernelBackend::probe())
    }
}

impl Default for CapSession<KernelBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> CapSession<B> {
    /// Binds a target against an explicit backend. This is the seam
    /// that lets tests substitute a fake kernel.
    pub fn with_backend(target: Target, backend: B) -> Self {
        let set = CapabilitySet::new(backend.last_cap());
        CapSession {
            target,
            query_pid: None,
            set,
            backend,
        }
    }

    /// Redirects subsequent load/query calls to another pid. The bound
    /// target is unchanged; `apply` keeps addressing it.
    pub fn setpid(&mut self, pid: i32) {
        self.query_pid = Some(pid);
    }

    pub fn capability_set(&self) -> &CapabilitySet {
        &self.set
    }

    pub fn last_cap(&self) -> u8 {
        self.set.last_cap()
    }

    fn file_fd(&self) -> Result<std::os::fd::RawFd, CapError> {
        self.target
            .fd()
            .ok_or_else(|| CapError::InvalidTarget("not a file target".to_string()))
    }

    /// Process-state writes only ever address the calling process.
    fn ensure_self_target(&self) -> Result<(), CapError> {
        match &self.target {
            Target::File(_) => Err(CapError::InvalidTarget(
                "cannot apply process state to a file target".to_string(),
            )),
            Target::Pid(pid) if *pid != nix::unistd::getpid().as_raw() => {
                Err(CapError::PermissionDenied(format!(
                    "the kernel only accepts capability updates for the calling process, not pid {}",
                    pid
                )))
            }
            _ => Ok(()),
        }
    }

    /// Loads the five sets of the bound (or `setpid`-overridden)
    /// process into the session, replacing the in-memory state.
    pub fn caps_process(&mut self) -> Result<(), CapError> {
        let pid = match (&self.target, self.query_pid) {
            (_, Some(pid)) => Some(pid),
            (Target::Pid(pid), None) => Some(*pid),
            (Target::CurrentProcess, None) => None,
            (Target::File(_), None) => {
                return Err(CapError::InvalidTarget(
                    "file target carries no process state".to_string(),
                ))
            }
        };
        let state = self.backend.read_process(pid)?;
        self.set.set_mask(CapabilityType::EFFECTIVE, state.effective);
        self.set.set_mask(CapabilityType::PERMITTED, state.permitted);
        self.set
            .set_mask(CapabilityType::INHERITABLE, state.inheritable);
        self.set
            .set_mask(CapabilityType::BOUNDING_SET, state.bounding);
        self.set.set_mask(CapabilityType::AMBIENT, state.ambient);
        Ok(())
    }

    /// Loads the bound file's `security.capability` attribute. An
    /// absent attribute is an empty set, not an error; file
    /// capabilities have no bounding or ambient representation.
    pub fn caps_file(&mut self) -> Result<(), CapError> {
        let fd = self.file_fd()?;
        self.set.clear(Select::ALL);
        let Some(raw) = self.backend.read_file_attr(fd)? else {
            return Ok(());
        };
        let caps = FileCaps::unpack(&raw)?;
        self.set.set_mask(CapabilityType::EFFECTIVE, caps.effective);
        self.set.set_mask(CapabilityType::PERMITTED, caps.permitted);
        self.set
            .set_mask(CapabilityType::INHERITABLE, caps.inheritable);
        Ok(())
    }

    pub fn clear(&mut self, select: Select) {
        self.set.clear(select);
    }

    pub fn fill(&mut self, select: Select) {
        self.set.fill(select);
    }

    /// Atomic single-capability update across every namespace in
    /// `types`.
    pub fn update(
        &mut self,
        action: Action,
        types: CapabilityType,
        cap: Capability,
    ) -> Result<(), CapError> {
        self.set.update(action, types, cap)
    }

    /// Applies [`update`] once per element, in order. With `fail_fast`
    /// the batch stops at the first failure and returns the results
    /// produced so far; elements already applied are **not** rolled
    /// back. Without it, every element is attempted and reported.
    ///
    /// [`update`]: CapSession::update
    pub fn update_each(
        &mut self,
        action: Action,
        types: CapabilityType,
        caps: &[Capability],
        fail_fast: bool,
    ) -> Vec<Result<(), CapError>> {
        let mut results = Vec::with_capacity(caps.len());
        for cap in caps {
            let result = self.set.update(action, types, *cap);
            let failed = result.is_err();
            results.push(result);
            if fail_fast && failed {
                break;
            }
        }
        results
    }

    /// True iff the bit is set for that exact namespace.
    pub fn have_capability(&self, types: CapabilityType, cap: Capability) -> bool {
        self.set.has(types, cap)
    }

    /// Aggregate query over every (namespace, id) pair implied by
    /// `select`; see [`CapabilitySet::check`].
    pub fn have_capabilities(&self, select: Select) -> QueryResult {
        self.set.check(select)
    }

    /// [`have_capabilities`] against freshly re-read process state. A
    /// target whose state cannot be read (gone, not inspectable, or a
    /// file) answers [`QueryResult::Fail`] instead of an error.
    ///
    /// [`have_capabilities`]: CapSession::have_capabilities
    pub fn have_capabilities_live(&mut self, select: Select) -> QueryResult {
        match self.caps_process() {
            Ok(()) => self.set.check(select),
            Err(e) => {
                debug!("live capability query failed: {}", e);
                QueryResult::Fail
            }
        }
    }

    /// Writes the in-memory bits for the covered namespaces back into
    /// the live process. Bounding-set changes are kernel-monotonic:
    /// bits the kernel has already dropped stay dropped, and an
    /// attempted re-add is a logged no-op. Only the originally bound
    /// process can be applied to; `setpid` does not redirect commits.
    pub fn apply(&mut self, select: Select) -> Result<(), CapError> {
        self.ensure_self_target()?;

        // bounding drops may still need privileges the caps write below
        // would remove, so they come first
        if select.contains(Select::BOUNDS) {
            let live = self.backend.read_process(None)?.bounding;
            let wanted = self.set.mask(CapabilityType::BOUNDING_SET);
            for id in 0..=self.set.last_cap() {
                let bit = 1u64 << id;
                let cap = Capability::by_id(id)?;
                if (live & bit) != 0 && (wanted & bit) == 0 {
                    self.backend.drop_bounding(cap)?;
                } else if (live & bit) == 0 && (wanted & bit) != 0 {
                    debug!(
                        "bounding bit {} was already dropped and cannot be raised again",
                        cap.name()
                    );
                }
            }
        }
        if select.contains(Select::CAPS) {
            self.backend.write_caps(
                self.set.mask(CapabilityType::EFFECTIVE),
                self.set.mask(CapabilityType::PERMITTED),
                self.set.mask(CapabilityType::INHERITABLE),
            )?;
        }
        if select.contains(Select::AMBIENT) {
            let live = self.backend.read_process(None)?.ambient;
            let wanted = self.set.mask(CapabilityType::AMBIENT);
            for id in 0..=self.set.last_cap() {
                let bit = 1u64 << id;
                if (live & bit) == (wanted & bit) {
                    continue;
                }
                self.backend
                    .set_ambient(Capability::by_id(id)?, (wanted & bit) != 0)?;
            }
        }
        Ok(())
    }

    /// Serializes effective/permitted/inheritable into the versioned
    /// file-capability layout and writes the bound file's
    /// `security.capability` attribute. Requires CAP_SETFCAP.
    pub fn apply_caps_file(&mut self) -> Result<(), CapError> {
        let fd = self.file_fd()?;
        let caps = FileCaps {
            effective: self.set.mask(CapabilityType::EFFECTIVE),
            permitted: self.set.mask(CapabilityType::PERMITTED),
            inheritable: self.set.mask(CapabilityType::INHERITABLE),
            rootid: None,
        };
        self.backend.write_file_attr(fd, &caps.pack())
    }

    /// Locks the calling process's securebits so uid 0 stops implying
    /// privilege: `SECBIT_NOROOT` and `SECBIT_NO_SETUID_FIXUP`, each
    /// with its lock bit. Irreversible for the life of the process.
    pub fn lock(&mut self) -> Result<(), CapError> {
        self.ensure_self_target()?;
        self.backend.lock_securebits()
    }

    /// Switches real/effective/saved uid and gid while keeping the
    /// session's capability bits across the transition. The credential
    /// capabilities (`setuid`, `setgid`, `setpcap`) are raised when the
    /// in-memory set lacks them and dropped again once the ids have
    /// changed, so the committed state cannot switch ids a second time.
    /// `None` leaves that id untouched.
    pub fn change_id(
        &mut self,
        uid: Option<u32>,
        gid: Option<u32>,
        flags: ChangeIdFlags,
    ) -> Result<(), CapError> {
        self.ensure_self_target()?;
        let cred = CapabilityType::EFFECTIVE | CapabilityType::PERMITTED;
        let setuid = Capability::by_name("setuid")?;
        let setgid = Capability::by_name("setgid")?;
        let setpcap = Capability::by_name("setpcap")?;
        if uid.is_some() && !self.set.has(cred, setuid) {
            self.set.update(Action::Add, cred, setuid)?;
        }
        if gid.is_some() && !self.set.has(cred, setgid) {
            self.set.update(Action::Add, cred, setgid)?;
        }

        self.backend.set_keepcaps(true)?;
        self.apply(Select::CAPS)?;
        if flags.contains(ChangeIdFlags::CLEAR_BOUNDING) {
            self.set.clear(Select::BOUNDS);
            self.apply(Select::BOUNDS)?;
        }
        if let Some(gid) = gid {
            self.backend.change_gid(gid)?;
            if flags.contains(ChangeIdFlags::DROP_SUPP_GRP) {
                self.backend.drop_supplementary_groups()?;
            }
        }
        if let Some(uid) = uid {
            self.backend.change_uid(uid)?;
        }
        self.backend.set_keepcaps(false)?;

        for cap in [setpcap, setuid, setgid] {
            self.set.update(Action::Drop, cred, cap)?;
        }
        self.apply(Select::CAPS)
    }
}
