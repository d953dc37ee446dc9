use strum::EnumIs;

use crate::cap::Capability;
use crate::set::{CapabilitySet, CapabilityType, Select, TYPE_ORDER};

/// Where a rendering goes. `Stdout` prints as a side effect; both
/// destinations return the rendered string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIs)]
pub enum Destination {
    Stdout,
    Buffer,
}

/// Comma-joined mnemonic names of every bit set for `ty`, in id order,
/// or `"none"` when the namespace is empty. Pass a single namespace; a
/// combined mask renders the intersection.
pub fn caps_text(dest: Destination, set: &CapabilitySet, ty: CapabilityType) -> String {
    let names: Vec<String> = (0..=set.last_cap())
        .filter_map(|id| Capability::by_id(id).ok())
        .filter(|cap| set.has(ty, *cap))
        .map(|cap| cap.name())
        .collect();
    let out = if names.is_empty() {
        "none".to_string()
    } else {
        names.join(",")
    };
    if dest.is_stdout() {
        println!("{}", out);
    }
    out
}

/// Raw bitmask of each namespace covered by `select` as decimal text,
/// in canonical namespace order, comma-joined.
pub fn caps_numeric(dest: Destination, set: &CapabilitySet, select: Select) -> String {
    let types = select.types();
    let masks: Vec<String> = TYPE_ORDER
        .iter()
        .filter(|ty| types.contains(**ty))
        .map(|ty| set.mask(*ty).to_string())
        .collect();
    let out = if masks.is_empty() {
        "none".to_string()
    } else {
        masks.join(",")
    };
    if dest.is_stdout() {
        println!("{}", out);
    }
    out
}
