//! Codec for the `security.capability` extended attribute.
//!
//! The on-disk layout is the kernel's versioned VFS capability
//! structure: a little-endian magic/version word followed by one
//! (permitted, inheritable) pair of 32-bit words per revision word, with
//! revision 3 appending the namespace root id. Serialization always
//! emits revision 2, which round-trips byte-for-byte with what the
//! kernel and native tooling write on a regular filesystem.

use crate::error::CapError;

pub(crate) const VFS_CAP_FLAGS_EFFECTIVE: u32 = 0x00_0001;
pub(crate) const VFS_CAP_REVISION_MASK: u32 = 0xFF00_0000;

pub(crate) const VFS_CAP_REVISION_1: u32 = 0x0100_0000;
pub(crate) const XATTR_CAPS_SZ_1: usize = 12;
pub(crate) const VFS_CAP_REVISION_2: u32 = 0x0200_0000;
pub(crate) const XATTR_CAPS_SZ_2: usize = 20;
pub(crate) const VFS_CAP_REVISION_3: u32 = 0x0300_0000;
pub(crate) const XATTR_CAPS_SZ_3: usize = 24;

pub(crate) const XATTR_CAPS_MAX_SIZE: usize = XATTR_CAPS_SZ_3;

pub(crate) const XATTR_NAME_CAPS: &[u8] = b"security.capability\0";

/// File capabilities decoded from (or destined for) the xattr.
///
/// Files carry no bounding or ambient state. The effective side is a
/// single flag on disk; when set, the decoded effective mask is the
/// union of permitted and inheritable, mirroring how libcap-ng and the
/// kernel expose it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileCaps {
    pub effective: u64,
    pub permitted: u64,
    pub inheritable: u64,
    /// Revision 3 only: user-namespace root id the caps are relative to.
    pub rootid: Option<u32>,
}

fn word(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

impl FileCaps {
    /// Parses a raw xattr value in any of the three known revisions.
    pub fn unpack(data: &[u8]) -> Result<Self, CapError> {
        if data.len() < 4 {
            return Err(CapError::MalformedCapabilityData(format!(
                "attribute too short: {} bytes",
                data.len()
            )));
        }
        let magic = word(data, 0);
        let revision = magic & VFS_CAP_REVISION_MASK;
        let words = match (revision, data.len()) {
            (VFS_CAP_REVISION_1, XATTR_CAPS_SZ_1) => 1,
            (VFS_CAP_REVISION_2, XATTR_CAPS_SZ_2) => 2,
            (VFS_CAP_REVISION_3, XATTR_CAPS_SZ_3) => 2,
            _ => {
                return Err(CapError::MalformedCapabilityData(format!(
                    "revision {:#x} with {} bytes",
                    revision >> 24,
                    data.len()
                )))
            }
        };

        let mut permitted = 0u64;
        let mut inheritable = 0u64;
        for w in 0..words {
            let offset = 4 + w * 8;
            permitted |= u64::from(word(data, offset)) << (32 * w);
            inheritable |= u64::from(word(data, offset + 4)) << (32 * w);
        }
        let effective = if magic & VFS_CAP_FLAGS_EFFECTIVE != 0 {
            permitted | inheritable
        } else {
            0
        };
        let rootid = if revision == VFS_CAP_REVISION_3 {
            Some(word(data, 20))
        } else {
            None
        };

        Ok(FileCaps {
            effective,
            permitted,
            inheritable,
            rootid,
        })
    }

    /// Serializes to the revision 2 layout. The effective flag is set
    /// whenever any effective bit is present.
    pub fn pack(&self) -> Vec<u8> {
        let mut magic = VFS_CAP_REVISION_2;
        if self.effective != 0 {
            magic |= VFS_CAP_FLAGS_EFFECTIVE;
        }
        let mut out = Vec::with_capacity(XATTR_CAPS_SZ_2);
        out.extend_from_slice(&magic.to_le_bytes());
        for w in 0..2u32 {
            let shift = 32 * w;
            out.extend_from_slice(&((self.permitted >> shift) as u32).to_le_bytes());
            out.extend_from_slice(&((self.inheritable >> shift) as u32).to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // chown|dac_override permitted, chown inheritable, effective flag on
    const V2_FIXTURE: [u8; 20] = [
        0x01, 0x00, 0x00, 0x02, // magic: revision 2 | effective
        0x03, 0x00, 0x00, 0x00, // permitted low
        0x01, 0x00, 0x00, 0x00, // inheritable low
        0x00, 0x00, 0x00, 0x00, // permitted high
        0x00, 0x00, 0x00, 0x00, // inheritable high
    ];

    #[test]
    fn test_unpack_v2() {
        let caps = FileCaps::unpack(&V2_FIXTURE).unwrap();
        assert_eq!(caps.permitted, 0b11);
        assert_eq!(caps.inheritable, 0b01);
        assert_eq!(caps.effective, 0b11);
        assert_eq!(caps.rootid, None);
    }

    #[test]
    fn test_pack_v2_byte_exact() {
        let caps = FileCaps {
            effective: 0b11,
            permitted: 0b11,
            inheritable: 0b01,
            rootid: None,
        };
        assert_eq!(caps.pack(), V2_FIXTURE.to_vec());
    }

    #[test]
    fn test_pack_without_effective_flag() {
        let caps = FileCaps {
            effective: 0,
            permitted: 1 << 21, // sys_admin
            inheritable: 0,
            rootid: None,
        };
        let data = caps.pack();
        assert_eq!(word(&data, 0), VFS_CAP_REVISION_2);
        assert_eq!(FileCaps::unpack(&data).unwrap(), caps);
    }

    #[test]
    fn test_effective_subset_collapses_to_union_on_disk() {
        // the layout stores effective as one flag, so any nonzero
        // effective mask comes back as permitted|inheritable
        let caps = FileCaps {
            effective: 0b001,
            permitted: 0b011,
            inheritable: 0b100,
            rootid: None,
        };
        let back = FileCaps::unpack(&caps.pack()).unwrap();
        assert_eq!(back.permitted, 0b011);
        assert_eq!(back.inheritable, 0b100);
        assert_eq!(back.effective, 0b111);
    }

    #[test]
    fn test_unpack_v1() {
        let mut data = Vec::new();
        data.extend_from_slice(&(VFS_CAP_REVISION_1 | VFS_CAP_FLAGS_EFFECTIVE).to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes()); // dac_override permitted
        data.extend_from_slice(&0u32.to_le_bytes());
        let caps = FileCaps::unpack(&data).unwrap();
        assert_eq!(caps.permitted, 0b10);
        assert_eq!(caps.effective, 0b10);
    }

    #[test]
    fn test_unpack_v3_rootid() {
        let mut data = V2_FIXTURE.to_vec();
        data[3] = 0x03; // bump revision
        data.extend_from_slice(&1000u32.to_le_bytes());
        let caps = FileCaps::unpack(&data).unwrap();
        assert_eq!(caps.rootid, Some(1000));
        assert_eq!(caps.permitted, 0b11);
    }

    #[test]
    fn test_unpack_malformed() {
        assert!(matches!(
            FileCaps::unpack(&[0x01, 0x00]),
            Err(CapError::MalformedCapabilityData(_))
        ));
        // unknown revision
        let mut data = V2_FIXTURE.to_vec();
        data[3] = 0x07;
        assert!(matches!(
            FileCaps::unpack(&data),
            Err(CapError::MalformedCapabilityData(_))
        ));
        // truncated revision 2 payload
        assert!(matches!(
            FileCaps::unpack(&V2_FIXTURE[..16]),
            Err(CapError::MalformedCapabilityData(_))
        ));
    }
}
