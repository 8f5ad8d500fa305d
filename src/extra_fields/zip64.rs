//! ZIP64 extended information extra field (0x0001).
//!
//! | Value                  | Size    | Description                                  |
//! | ---------------------- | ------- | -------------------------------------------- |
//! | `0x0001`               | 2 bytes | Tag for this "extra" block type              |
//! | Size                   | 2 bytes | Size of this "extra" block                   |
//! | Original Size          | 8 bytes | Original uncompressed file size              |
//! | Compressed Size        | 8 bytes | Size of compressed data                      |
//! | Relative Header Offset | 8 bytes | Offset of local header record                |
//! | Disk Start Number      | 4 bytes | Number of the disk on which this file starts |
//!
//! Every member is optional; which ones appear is THE sizing rule the
//! assembler and the size estimator must agree on byte for byte, so both go
//! through the constructors here and nowhere else.

use core::mem;

use super::UsedExtraField;
use crate::spec::ZIP64_BYTES_THR;

#[derive(Copy, Clone, Debug)]
pub(crate) struct Zip64ExtraField {
    uncompressed_size: Option<u64>,
    compressed_size: Option<u64>,
    header_start: Option<u64>,
    disk_start: Option<u32>,
}

fn over(size: u64) -> bool {
    size > ZIP64_BYTES_THR
}

impl Zip64ExtraField {
    /// Field for a local header.
    ///
    /// `None` sizes are unknown at header time; the member is reserved with
    /// a placeholder so the header length never depends on data that has
    /// not streamed yet. The compressed member also rides along whenever
    /// the uncompressed side needs ZIP64, because a streaming entry cannot
    /// know its compressed size when the header goes out.
    ///
    /// Directory entries never carry size members, and the offset member is
    /// suppressed at offset zero even when ZIP64 is forced (the first
    /// entry's offset always fits).
    pub(crate) fn local_header(
        uncompressed_size: Option<u64>,
        compressed_size: Option<u64>,
        header_start: u64,
        forced: bool,
        directory: bool,
        split_archive: bool,
    ) -> Option<Self> {
        let include_uncompressed =
            !directory && (forced || uncompressed_size.map_or(true, over));
        let include_compressed = !directory
            && (forced
                || compressed_size.map_or(true, over)
                || uncompressed_size.map_or(true, over));
        Self::build(
            include_uncompressed.then(|| uncompressed_size.unwrap_or(0)),
            include_compressed.then(|| compressed_size.unwrap_or(0)),
            header_start,
            forced,
            split_archive,
        )
    }

    /// Field for a central directory header; all values are final here and
    /// members appear only when their value overflows or ZIP64 is forced.
    pub(crate) fn central_header(
        uncompressed_size: u64,
        compressed_size: u64,
        header_start: u64,
        forced: bool,
        directory: bool,
        split_archive: bool,
    ) -> Option<Self> {
        let include_uncompressed = !directory && (forced || over(uncompressed_size));
        let include_compressed = !directory && (forced || over(compressed_size));
        Self::build(
            include_uncompressed.then_some(uncompressed_size),
            include_compressed.then_some(compressed_size),
            header_start,
            forced,
            split_archive,
        )
    }

    fn build(
        uncompressed_size: Option<u64>,
        compressed_size: Option<u64>,
        header_start: u64,
        forced: bool,
        split_archive: bool,
    ) -> Option<Self> {
        let header_start =
            (over(header_start) || (forced && header_start > 0)).then_some(header_start);
        let disk_start = (split_archive && forced).then_some(0u32);

        if uncompressed_size.is_none()
            && compressed_size.is_none()
            && header_start.is_none()
            && disk_start.is_none()
        {
            return None;
        }
        Some(Zip64ExtraField {
            uncompressed_size,
            compressed_size,
            header_start,
            disk_start,
        })
    }

    /// Whether the uncompressed-size member is present; the 32-bit header
    /// field must be written as `0xFFFFFFFF` exactly when it is.
    pub(crate) fn has_uncompressed(&self) -> bool {
        self.uncompressed_size.is_some()
    }

    pub(crate) fn has_compressed(&self) -> bool {
        self.compressed_size.is_some()
    }

    pub(crate) fn has_header_start(&self) -> bool {
        self.header_start.is_some()
    }

    fn data_size(&self) -> u16 {
        let mut size = 0u16;
        if self.uncompressed_size.is_some() {
            size += mem::size_of::<u64>() as u16;
        }
        if self.compressed_size.is_some() {
            size += mem::size_of::<u64>() as u16;
        }
        if self.header_start.is_some() {
            size += mem::size_of::<u64>() as u16;
        }
        if self.disk_start.is_some() {
            size += mem::size_of::<u32>() as u16;
        }
        size
    }

    /// Get the full size of the block
    pub(crate) fn full_size(&self) -> usize {
        self.data_size() as usize + 2 * mem::size_of::<u16>()
    }

    /// Serialize the block
    pub(crate) fn serialize(&self) -> Box<[u8]> {
        let full_size = self.full_size();
        let mut ret = Vec::with_capacity(full_size);
        ret.extend(UsedExtraField::Zip64ExtendedInfo.to_le_bytes());
        ret.extend(self.data_size().to_le_bytes());
        if let Some(uncompressed_size) = self.uncompressed_size {
            ret.extend(uncompressed_size.to_le_bytes());
        }
        if let Some(compressed_size) = self.compressed_size {
            ret.extend(compressed_size.to_le_bytes());
        }
        if let Some(header_start) = self.header_start {
            ret.extend(header_start.to_le_bytes());
        }
        if let Some(disk_start) = self.disk_start {
            ret.extend(disk_start.to_le_bytes());
        }
        debug_assert_eq!(ret.len(), full_size);
        ret.into_boxed_slice()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BIG: u64 = ZIP64_BYTES_THR + 1;

    #[test]
    fn absent_when_nothing_overflows() {
        assert!(Zip64ExtraField::central_header(100, 100, 100, false, false, false).is_none());
        assert!(
            Zip64ExtraField::local_header(Some(100), Some(100), 100, false, false, false).is_none()
        );
    }

    #[test]
    fn forced_first_entry_omits_offset() {
        let field =
            Zip64ExtraField::local_header(Some(100), Some(100), 0, true, false, false).unwrap();
        assert_eq!(field.full_size(), 20);

        let later =
            Zip64ExtraField::local_header(Some(100), Some(100), 500, true, false, false).unwrap();
        assert_eq!(later.full_size(), 28);
    }

    #[test]
    fn forced_directory_carries_offset_only() {
        assert!(Zip64ExtraField::central_header(0, 0, 0, true, true, false).is_none());
        let later = Zip64ExtraField::central_header(0, 0, 500, true, true, false).unwrap();
        assert_eq!(later.full_size(), 12);
    }

    #[test]
    fn unknown_sizes_reserve_both_members() {
        let field = Zip64ExtraField::local_header(None, None, 0, false, false, false).unwrap();
        assert_eq!(field.full_size(), 20);
        let bytes = field.serialize();
        assert_eq!(&bytes[..2], &0x0001u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &16u16.to_le_bytes());
        // placeholders are zero
        assert!(bytes[4..20].iter().all(|b| *b == 0));
    }

    #[test]
    fn oversized_uncompressed_drags_compressed_along_locally() {
        // streaming entry: compressed size can be small, the local copy
        // still reserves the member
        let local =
            Zip64ExtraField::local_header(Some(BIG), Some(100), 0, false, false, false).unwrap();
        assert_eq!(local.full_size(), 20);
        // the central copy records only what overflows
        let central = Zip64ExtraField::central_header(BIG, 100, 0, false, false, false).unwrap();
        assert_eq!(central.full_size(), 12);
    }

    #[test]
    fn split_archives_add_the_disk_member_when_forced() {
        let field =
            Zip64ExtraField::local_header(Some(100), Some(100), 500, true, false, true).unwrap();
        assert_eq!(field.full_size(), 32);
        assert!(
            Zip64ExtraField::local_header(Some(100), Some(100), 500, false, false, true).is_none()
        );
    }

    #[test]
    fn serialized_values_round_trip() {
        let field = Zip64ExtraField::central_header(BIG, BIG, BIG, false, false, false).unwrap();
        let bytes = field.serialize();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[4..12], &BIG.to_le_bytes());
        assert_eq!(&bytes[12..20], &BIG.to_le_bytes());
        assert_eq!(&bytes[20..28], &BIG.to_le_bytes());
    }
}
