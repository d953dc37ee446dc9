use tracing::{debug, warn};

use crate::backend::{Backend, KernelBackend, ProcessState};
use crate::cap::Capability;
use crate::error::CapError;

/// LIFO stack of full process capability snapshots.
///
/// `save` captures the live state of the calling process; `restore`
/// pops the most recent snapshot and re-applies it. Snapshots are
/// process-scoped and never persist across restarts. The stack does
/// not enforce balanced save/restore pairs; [`scoped`] gives the
/// guaranteed-on-all-exit-paths form.
///
/// [`scoped`]: StateStack::scoped
pub struct StateStack<B: Backend = KernelBackend> {
    backend: B,
    snapshots: Vec<ProcessState>,
}

impl StateStack<KernelBackend> {
    pub fn new() -> Self {
        Self::with_backend(KernelBackend::probe())
    }
}

impl Default for StateStack<KernelBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> StateStack<B> {
    pub fn with_backend(backend: B) -> Self {
        StateStack {
            backend,
            snapshots: Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Captures the live capability state (all namespaces) and pushes
    /// it.
    pub fn save(&mut self) -> Result<(), CapError> {
        let snapshot = self.backend.read_process(None)?;
        self.snapshots.push(snapshot);
        Ok(())
    }

    /// Pops the most recent snapshot and writes it back in one pass:
    /// bounding drops first (they may need privileges the caps write
    /// would remove), then effective/permitted/inheritable, then the
    /// ambient diff. Bounding bits dropped since the save cannot come
    /// back; that is the kernel's monotonicity rule, not a stack
    /// choice.
    pub fn restore(&mut self) -> Result<(), CapError> {
        let snapshot = self.snapshots.pop().ok_or(CapError::StateStackEmpty)?;
        let live = self.backend.read_process(None)?;
        let last = self.backend.last_cap();

        for id in 0..=last {
            let bit = 1u64 << id;
            let cap = Capability::by_id(id)?;
            if (live.bounding & bit) != 0 && (snapshot.bounding & bit) == 0 {
                self.backend.drop_bounding(cap)?;
            } else if (live.bounding & bit) == 0 && (snapshot.bounding & bit) != 0 {
                debug!(
                    "bounding bit {} was dropped after the snapshot and stays dropped",
                    cap.name()
                );
            }
        }
        self.backend
            .write_caps(snapshot.effective, snapshot.permitted, snapshot.inheritable)?;
        for id in 0..=last {
            let bit = 1u64 << id;
            if (live.ambient & bit) == (snapshot.ambient & bit) {
                continue;
            }
            self.backend
                .set_ambient(Capability::by_id(id)?, (snapshot.ambient & bit) != 0)?;
        }
        Ok(())
    }

    /// Saves now and restores when the guard drops, on every exit path.
    pub fn scoped(&mut self) -> Result<StateGuard<'_, B>, CapError> {
        self.save()?;
        Ok(StateGuard { stack: self })
    }
}

/// Restores the snapshot taken by [`StateStack::scoped`] on drop.
pub struct StateGuard<'a, B: Backend> {
    stack: &'a mut StateStack<B>,
}

impl<B: Backend> Drop for StateGuard<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = self.stack.restore() {
            warn!("failed to restore saved capability state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::session::CapSession;
    use crate::set::{Action, CapabilityType, Select};
    use crate::target::Target;

    fn cap(name: &str) -> Capability {
        Capability::by_name(name).unwrap()
    }

    #[test]
    fn test_restore_on_empty_stack() {
        let mut stack = StateStack::with_backend(FakeBackend::with_last_cap(40));
        assert!(matches!(stack.restore(), Err(CapError::StateStackEmpty)));
    }

    #[test]
    fn test_save_then_restore_round_trip() {
        let backend = FakeBackend::with_last_cap(40);
        backend.0.borrow_mut().current = ProcessState {
            effective: 0b1,
            permitted: 0b11,
            inheritable: 0,
            bounding: 0b11,
            ambient: 0,
        };
        let mut stack = StateStack::with_backend(backend.clone());
        stack.save().unwrap();
        assert_eq!(stack.depth(), 1);

        let mut session = CapSession::with_backend(Target::current(), backend.clone());
        session.caps_process().unwrap();
        session
            .update(Action::Drop, CapabilityType::EFFECTIVE, cap("chown"))
            .unwrap();
        session.apply(Select::CAPS).unwrap();
        assert_eq!(backend.0.borrow().current.effective, 0);

        stack.restore().unwrap();
        assert!(stack.is_empty());
        session.caps_process().unwrap();
        assert!(session.have_capability(CapabilityType::EFFECTIVE, cap("chown")));
    }

    #[test]
    fn test_restore_cannot_raise_dropped_bounding_bit() {
        let backend = FakeBackend::with_last_cap(40);
        backend.0.borrow_mut().current.bounding = 0b1;
        let mut stack = StateStack::with_backend(backend.clone());
        stack.save().unwrap();

        // dropped behind the stack's back, as the kernel allows
        backend.0.borrow_mut().current.bounding = 0;
        stack.restore().unwrap();
        assert_eq!(backend.0.borrow().current.bounding, 0);
    }

    #[test]
    fn test_restore_rebalances_ambient() {
        let backend = FakeBackend::with_last_cap(40);
        backend.0.borrow_mut().current.ambient = 0b10;
        let mut stack = StateStack::with_backend(backend.clone());
        stack.save().unwrap();

        backend.0.borrow_mut().current.ambient = 0b1;
        stack.restore().unwrap();
        assert_eq!(backend.0.borrow().current.ambient, 0b10);
    }

    #[test]
    fn test_scoped_guard_restores_on_drop() {
        let backend = FakeBackend::with_last_cap(40);
        backend.0.borrow_mut().current.effective = 0b100;
        let mut stack = StateStack::with_backend(backend.clone());
        {
            let _guard = stack.scoped().unwrap();
            backend.0.borrow_mut().current.effective = 0;
        }
        assert_eq!(backend.0.borrow().current.effective, 0b100);
        assert!(stack.is_empty());
    }
}
