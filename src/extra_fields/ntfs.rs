//! NTFS timestamp extra field (0x000a).

use super::UsedExtraField;

/// Seconds between the NTFS epoch (1601-01-01) and the unix epoch.
const NTFS_UNIX_OFFSET: i64 = 11_644_473_600;
/// NTFS time is counted in 100ns ticks.
const TICKS_PER_SECOND: i64 = 10_000_000;

/// | Value      | Size | Description                  |
/// | ---------- | ---- | ---------------------------- |
/// | `0x000a`   | 2    | Tag                          |
/// | Size       | 2    | Always 32                    |
/// | Reserved   | 4    |                              |
/// | `0x0001`   | 2    | Attribute tag (times)        |
/// | Size       | 2    | Always 24                    |
/// | Mtime      | 8    | 100ns ticks since 1601-01-01 |
/// | Atime      | 8    |                              |
/// | Ctime      | 8    |                              |
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ntfs {
    mtime: u64,
    atime: u64,
    ctime: u64,
}

impl Ntfs {
    /// Full on-the-wire length of the field.
    pub(crate) const FULL_SIZE: usize = 36;

    /// All three timestamps are set to the modification time; the writer
    /// has no separate access/creation information for a streamed entry.
    pub(crate) fn from_unix(unix_mtime: i64) -> Self {
        let ticks = unix_mtime
            .saturating_add(NTFS_UNIX_OFFSET)
            .saturating_mul(TICKS_PER_SECOND)
            .max(0) as u64;
        Ntfs {
            mtime: ticks,
            atime: ticks,
            ctime: ticks,
        }
    }

    pub(crate) fn serialize(&self) -> Box<[u8]> {
        let mut ret = Vec::with_capacity(Self::FULL_SIZE);
        ret.extend(UsedExtraField::Ntfs.to_le_bytes());
        ret.extend(32u16.to_le_bytes());
        ret.extend(0u32.to_le_bytes());
        ret.extend(1u16.to_le_bytes());
        ret.extend(24u16.to_le_bytes());
        ret.extend(self.mtime.to_le_bytes());
        ret.extend(self.atime.to_le_bytes());
        ret.extend(self.ctime.to_le_bytes());
        debug_assert_eq!(ret.len(), Self::FULL_SIZE);
        ret.into_boxed_slice()
    }
}
