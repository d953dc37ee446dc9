use bitflags::bitflags;
use strum::EnumIs;

use crate::cap::Capability;
use crate::error::CapError;

bitflags! {
    /// The five capability namespaces a process carries. Operations take
    /// a bitwise-OR combination to touch several namespaces at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CapabilityType: u8 {
        const EFFECTIVE = 1;
        const PERMITTED = 2;
        const INHERITABLE = 4;
        const BOUNDING_SET = 8;
        const AMBIENT = 16;
    }
}

bitflags! {
    /// Coarse selection used by clear/fill/apply and aggregate queries.
    /// `CAPS` expands to effective|permitted|inheritable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Select: u8 {
        const CAPS = 1;
        const BOUNDS = 2;
        const AMBIENT = 4;
        const BOTH = Self::CAPS.bits() | Self::BOUNDS.bits();
        const ALL = Self::CAPS.bits() | Self::BOUNDS.bits() | Self::AMBIENT.bits();
    }
}

impl Select {
    /// Expands the selection into the concrete namespaces it covers.
    pub fn types(self) -> CapabilityType {
        let mut types = CapabilityType::empty();
        if self.contains(Select::CAPS) {
            types |= CapabilityType::EFFECTIVE
                | CapabilityType::PERMITTED
                | CapabilityType::INHERITABLE;
        }
        if self.contains(Select::BOUNDS) {
            types |= CapabilityType::BOUNDING_SET;
        }
        if self.contains(Select::AMBIENT) {
            types |= CapabilityType::AMBIENT;
        }
        types
    }
}

bitflags! {
    /// What else to shed while switching credentials with
    /// [`change_id`].
    ///
    /// [`change_id`]: crate::session::CapSession::change_id
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChangeIdFlags: u8 {
        const DROP_SUPP_GRP = 1;
        const CLEAR_BOUNDING = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIs)]
pub enum Action {
    Add,
    Drop,
}

/// Outcome of an aggregate query. In-memory queries cannot fail and
/// never produce `Fail`; the live variant reports `Fail` when the
/// backing process state cannot be re-read. The other three describe
/// how many of the selected bits are set, never access problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    Fail,
    None,
    Partial,
    Full,
}

/// Canonical iteration order for per-namespace masks.
pub(crate) const TYPE_ORDER: [CapabilityType; 5] = [
    CapabilityType::EFFECTIVE,
    CapabilityType::PERMITTED,
    CapabilityType::INHERITABLE,
    CapabilityType::BOUNDING_SET,
    CapabilityType::AMBIENT,
];

/// In-memory capability state: one fixed-width bitmask per namespace.
///
/// The set is created against the `cap_last_cap` in force at
/// construction; a bit is only ever set for ids inside `[0, last_cap]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    last_cap: u8,
    masks: [u64; 5],
}

impl CapabilitySet {
    pub fn new(last_cap: u8) -> Self {
        CapabilitySet {
            last_cap: last_cap.min(63),
            masks: [0; 5],
        }
    }

    pub fn last_cap(&self) -> u8 {
        self.last_cap
    }

    /// Mask with every valid capability id bit set.
    pub fn full_mask(&self) -> u64 {
        if self.last_cap >= 63 {
            u64::MAX
        } else {
            (1u64 << (self.last_cap + 1)) - 1
        }
    }

    fn index(ty: CapabilityType) -> usize {
        TYPE_ORDER
            .iter()
            .position(|t| *t == ty)
            .expect("single capability type expected")
    }

    /// Raw bitmask of one namespace.
    pub fn mask(&self, ty: CapabilityType) -> u64 {
        self.masks[Self::index(ty)]
    }

    /// Replaces one namespace's bitmask, constrained to the valid range.
    pub(crate) fn set_mask(&mut self, ty: CapabilityType, bits: u64) {
        self.masks[Self::index(ty)] = bits & self.full_mask();
    }

    /// Zeroes every bit in every namespace covered by `select`.
    pub fn clear(&mut self, select: Select) {
        let types = select.types();
        for (i, ty) in TYPE_ORDER.iter().enumerate() {
            if types.contains(*ty) {
                self.masks[i] = 0;
            }
        }
    }

    /// Sets every valid capability bit in every namespace covered by
    /// `select`.
    pub fn fill(&mut self, select: Select) {
        let full = self.full_mask();
        let types = select.types();
        for (i, ty) in TYPE_ORDER.iter().enumerate() {
            if types.contains(*ty) {
                self.masks[i] = full;
            }
        }
    }

    /// Sets (`Add`) or clears (`Drop`) one capability bit in each
    /// namespace present in `types`. Fails without touching anything
    /// when the id is beyond the valid range.
    pub fn update(
        &mut self,
        action: Action,
        types: CapabilityType,
        cap: Capability,
    ) -> Result<(), CapError> {
        if cap.id() > self.last_cap {
            return Err(CapError::UnknownCapability(cap.name()));
        }
        let bit = 1u64 << cap.id();
        for (i, ty) in TYPE_ORDER.iter().enumerate() {
            if types.contains(*ty) {
                match action {
                    Action::Add => self.masks[i] |= bit,
                    Action::Drop => self.masks[i] &= !bit,
                }
            }
        }
        Ok(())
    }

    /// True iff the bit is set in every namespace included in `types`.
    pub fn has(&self, types: CapabilityType, cap: Capability) -> bool {
        if types.is_empty() || cap.id() > self.last_cap {
            return false;
        }
        let bit = 1u64 << cap.id();
        TYPE_ORDER
            .iter()
            .enumerate()
            .filter(|(_, ty)| types.contains(**ty))
            .all(|(i, _)| self.masks[i] & bit != 0)
    }

    /// Aggregate over every (namespace, id) pair implied by `select`:
    /// all set is `Full`, none set is `None`, anything else `Partial`.
    /// A multi-namespace selection is only `Full` when every included
    /// namespace holds every valid bit simultaneously.
    pub fn check(&self, select: Select) -> QueryResult {
        let full = self.full_mask();
        let types = select.types();
        let mut all_full = true;
        let mut all_empty = true;
        for (i, ty) in TYPE_ORDER.iter().enumerate() {
            if !types.contains(*ty) {
                continue;
            }
            let mask = self.masks[i] & full;
            if mask != full {
                all_full = false;
            }
            if mask != 0 {
                all_empty = false;
            }
        }
        if types.is_empty() || all_empty {
            QueryResult::None
        } else if all_full {
            QueryResult::Full
        } else {
            QueryResult::Partial
        }
    }
}
