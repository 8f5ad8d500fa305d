//! Possible ZIP compression methods.

use std::fmt;

/// Identifies the storage format used to write an entry's payload.
///
/// When a payload is WinZip-AES encrypted, the wire method is
/// [`CompressionMethod::Aes`] and the wrapped method is recorded in the AES
/// extra field instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CompressionMethod {
    /// Store the file as is
    Stored,
    /// Compress the file using Deflate
    #[cfg(feature = "deflate")]
    Deflated,
    /// Wrap the payload in WinZip AES encryption
    #[cfg(feature = "aes-crypto")]
    Aes,
    /// A method not directly produced by this writer, trusted from a
    /// passthrough caller
    Unsupported(u16),
}

impl CompressionMethod {
    pub const STORE: u16 = 0;
    pub const DEFLATE: u16 = 8;
    pub const AES: u16 = 99;

    /// The numeric identifier written to the wire for this method.
    pub const fn wire_id(self) -> u16 {
        match self {
            CompressionMethod::Stored => Self::STORE,
            #[cfg(feature = "deflate")]
            CompressionMethod::Deflated => Self::DEFLATE,
            #[cfg(feature = "aes-crypto")]
            CompressionMethod::Aes => Self::AES,
            CompressionMethod::Unsupported(id) => id,
        }
    }

    /// Picks the codec for a requested compression level (0 stores, anything
    /// above deflates).
    pub(crate) fn from_level(level: u32) -> CompressionMethod {
        if level == 0 {
            CompressionMethod::Stored
        } else {
            #[cfg(feature = "deflate")]
            {
                CompressionMethod::Deflated
            }
            #[cfg(not(feature = "deflate"))]
            {
                CompressionMethod::Unsupported(Self::DEFLATE)
            }
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompressionMethod::Unsupported(id) => write!(f, "Unsupported({id})"),
            _ => write!(f, "{self:?}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::CompressionMethod;

    #[test]
    fn wire_ids() {
        assert_eq!(CompressionMethod::Stored.wire_id(), 0);
        #[cfg(feature = "deflate")]
        assert_eq!(CompressionMethod::Deflated.wire_id(), 8);
        #[cfg(feature = "aes-crypto")]
        assert_eq!(CompressionMethod::Aes.wire_id(), 99);
        assert_eq!(CompressionMethod::Unsupported(14).wire_id(), 14);
    }

    #[test]
    fn level_zero_stores() {
        assert_eq!(
            CompressionMethod::from_level(0),
            CompressionMethod::Stored
        );
    }
}
