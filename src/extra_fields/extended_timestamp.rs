//! extended timestamp, as described in <https://libzip.org/specifications/extrafld.txt>

use super::UsedExtraField;

/// Only the modification time is written, in both the local and the central
/// copy, so the payload is always flags + one u32 (5 bytes, 9 on the wire).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtendedTimestamp {
    mod_time: u32,
}

const FLAG_MOD_TIME: u8 = 0b0000_0001;

impl ExtendedTimestamp {
    /// Full on-the-wire length of the field.
    pub(crate) const FULL_SIZE: usize = 9;

    pub(crate) fn new(unix_mtime: i64) -> Self {
        // the field stores a 32-bit unix timestamp; out-of-range times
        // saturate rather than wrap into a bogus epoch
        let mod_time = unix_mtime.clamp(0, u32::MAX as i64) as u32;
        ExtendedTimestamp { mod_time }
    }

    pub(crate) fn mod_time(&self) -> u32 {
        self.mod_time
    }

    pub(crate) fn serialize(&self) -> Box<[u8]> {
        let mut ret = Vec::with_capacity(Self::FULL_SIZE);
        ret.extend(UsedExtraField::ExtendedTimestamp.to_le_bytes());
        ret.extend(5u16.to_le_bytes());
        ret.push(FLAG_MOD_TIME);
        ret.extend(self.mod_time.to_le_bytes());
        debug_assert_eq!(ret.len(), Self::FULL_SIZE);
        ret.into_boxed_slice()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nine_bytes_with_mtime_flag() {
        let field = ExtendedTimestamp::new(1_700_000_000);
        let bytes = field.serialize();
        assert_eq!(bytes.len(), ExtendedTimestamp::FULL_SIZE);
        assert_eq!(&bytes[..2], &0x5455u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &5u16.to_le_bytes());
        assert_eq!(bytes[4], 0x01);
        assert_eq!(&bytes[5..9], &1_700_000_000u32.to_le_bytes());
    }

    #[test]
    fn pre_epoch_times_saturate() {
        assert_eq!(ExtendedTimestamp::new(-1).mod_time(), 0);
        assert_eq!(
            ExtendedTimestamp::new(i64::MAX).mod_time(),
            u32::MAX
        );
    }
}
