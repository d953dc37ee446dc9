use std::{fmt, str::FromStr};

use crate::error::CapError;

/// Mnemonic names indexed by capability id, as the kernel numbers them.
/// Ids the table does not cover render as the generic `cap_N` form so a
/// newer kernel's capabilities stay addressable.
pub(crate) const CAP_NAMES: [&str; 41] = [
    "chown",
    "dac_override",
    "dac_read_search",
    "fowner",
    "fsetid",
    "kill",
    "setgid",
    "setuid",
    "setpcap",
    "linux_immutable",
    "net_bind_service",
    "net_broadcast",
    "net_admin",
    "net_raw",
    "ipc_lock",
    "ipc_owner",
    "sys_module",
    "sys_rawio",
    "sys_chroot",
    "sys_ptrace",
    "sys_pacct",
    "sys_admin",
    "sys_boot",
    "sys_nice",
    "sys_resource",
    "sys_time",
    "sys_tty_config",
    "mknod",
    "lease",
    "audit_write",
    "audit_control",
    "setfcap",
    "mac_override",
    "mac_admin",
    "syslog",
    "wake_alarm",
    "block_suspend",
    "audit_read",
    "perfmon",
    "bpf",
    "checkpoint_restore",
];

/// A single capability, normalized to its numeric id.
///
/// Construction goes through the two explicit parse paths, [`by_id`] and
/// [`by_name`]; every bit operation downstream works on the id only.
///
/// [`by_id`]: Capability::by_id
/// [`by_name`]: Capability::by_name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Capability(u8);

impl Capability {
    /// Wraps a raw capability id. Ids that cannot fit a 64-bit mask are
    /// rejected here; the session checks the running kernel's
    /// `cap_last_cap` upper bound at mutation time.
    pub fn by_id(id: u8) -> Result<Self, CapError> {
        if usize::from(id) >= 64 {
            return Err(CapError::UnknownCapability(format!("cap_{}", id)));
        }
        Ok(Capability(id))
    }

    /// Resolves a mnemonic name. Matching is case-insensitive and
    /// tolerates the `CAP_` prefix, so `chown`, `CHOWN` and `CAP_CHOWN`
    /// all resolve to id 0. The generic `cap_N` form parses back to N.
    pub fn by_name(name: &str) -> Result<Self, CapError> {
        let lower = name.trim().to_ascii_lowercase();
        let bare = lower.strip_prefix("cap_").unwrap_or(&lower);
        if let Some(id) = CAP_NAMES.iter().position(|n| *n == bare) {
            return Ok(Capability(id as u8));
        }
        if !bare.is_empty() && bare.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = bare.parse::<u8>() {
                return Self::by_id(id);
            }
        }
        Err(CapError::UnknownCapability(name.to_string()))
    }

    pub fn id(self) -> u8 {
        self.0
    }

    /// Walks every capability the name table knows, in id order. Ids a
    /// newer kernel added beyond the table are not included; they are
    /// still constructible through [`by_id`].
    ///
    /// [`by_id`]: Capability::by_id
    pub fn known() -> impl Iterator<Item = Capability> {
        (0..CAP_NAMES.len() as u8).map(Capability)
    }

    /// The mnemonic for this id, or the `cap_N` form when the id is
    /// beyond the name table.
    pub fn name(self) -> String {
        match CAP_NAMES.get(usize::from(self.0)) {
            Some(name) => (*name).to_string(),
            None => format!("cap_{}", self.0),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Capability {
    type Err = CapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::by_name(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_id_round_trip() {
        for (id, name) in CAP_NAMES.iter().enumerate() {
            let cap = Capability::by_name(name).expect("table name must resolve");
            assert_eq!(cap.id(), id as u8);
            assert_eq!(cap.name(), *name);
        }
    }

    #[test]
    fn test_from_name_representations() {
        assert_eq!(Capability::by_name("chown").unwrap().id(), 0);
        assert_eq!(Capability::by_name("CHOWN").unwrap().id(), 0);
        assert_eq!(Capability::by_name("CAP_CHOWN").unwrap().id(), 0);
        assert_eq!(Capability::by_name(" dac_override ").unwrap().id(), 1);
        assert_eq!("cap_sys_admin".parse::<Capability>().unwrap().id(), 21);
    }

    #[test]
    fn test_known_walks_the_table_in_id_order() {
        let caps: Vec<Capability> = Capability::known().collect();
        assert_eq!(caps.len(), CAP_NAMES.len());
        assert_eq!(caps[0].name(), "chown");
        assert!(caps.iter().enumerate().all(|(i, c)| usize::from(c.id()) == i));
    }

    #[test]
    fn test_unknown_name() {
        let err = Capability::by_name("does_not_exist").unwrap_err();
        assert!(matches!(err, CapError::UnknownCapability(_)));
    }

    #[test]
    fn test_numbered_form() {
        let cap = Capability::by_id(45).unwrap();
        assert_eq!(cap.name(), "cap_45");
        assert_eq!(Capability::by_name("cap_45").unwrap(), cap);
        assert!(Capability::by_id(64).is_err());
        assert!(Capability::by_name("cap_200").is_err());
    }
}
