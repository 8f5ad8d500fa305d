//! AE-x encryption extra field (0x9901).

use super::UsedExtraField;
use crate::types::{AesMode, AesVendorVersion};

/// | Value    | Size | Description                        |
/// | -------- | ---- | ---------------------------------- |
/// | `0x9901` | 2    | Tag                                |
/// | Size     | 2    | Always 7                           |
/// | Version  | 2    | AE-1 or AE-2                       |
/// | `AE`     | 2    | Vendor ID                          |
/// | Strength | 1    | 1 = AES-128, 2 = AES-192, 3 = AES-256 |
/// | Method   | 2    | The wrapped compression method     |
#[derive(Debug, Clone, Copy)]
pub(crate) struct AesExtraField {
    vendor_version: AesVendorVersion,
    strength: AesMode,
    compression_method: u16,
}

impl AesExtraField {
    /// Full on-the-wire length of the field.
    pub(crate) const FULL_SIZE: usize = 11;

    pub(crate) fn new(
        vendor_version: AesVendorVersion,
        strength: AesMode,
        compression_method: u16,
    ) -> Self {
        AesExtraField {
            vendor_version,
            strength,
            compression_method,
        }
    }

    pub(crate) fn serialize(&self) -> Box<[u8]> {
        let mut ret = Vec::with_capacity(Self::FULL_SIZE);
        ret.extend(UsedExtraField::AeXEncryption.to_le_bytes());
        ret.extend(7u16.to_le_bytes());
        ret.extend((self.vendor_version as u16).to_le_bytes());
        ret.extend(b"AE");
        ret.push(self.strength as u8);
        ret.extend(self.compression_method.to_le_bytes());
        debug_assert_eq!(ret.len(), Self::FULL_SIZE);
        ret.into_boxed_slice()
    }
}
