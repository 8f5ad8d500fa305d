#![macro_use]

//! On-the-wire ZIP record layouts.
//!
//! Every fixed-size record is a `repr(packed)` block whose byte length is
//! exactly `mem::size_of::<Self>()`; the writer and the size estimator both
//! rely on that so the two can never disagree on record sizes.

use crate::result::{ZipError, ZipResult};
use memchr::memmem::FinderRev;
use std::io;
use std::io::prelude::*;
use std::mem;

pub type Magic = u32;

pub const LOCAL_FILE_HEADER_SIGNATURE: Magic = 0x04034b50;
pub const CENTRAL_DIRECTORY_HEADER_SIGNATURE: Magic = 0x02014b50;
pub const DATA_DESCRIPTOR_SIGNATURE: Magic = 0x08074b50;
pub(crate) const CENTRAL_DIRECTORY_END_SIGNATURE: Magic = 0x06054b50;
pub const ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE: Magic = 0x06064b50;
pub(crate) const ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE: Magic = 0x07064b50;

/// Largest value representable in the 32-bit size/offset fields; anything
/// beyond promotes the entry (or archive) to ZIP64.
pub const ZIP64_BYTES_THR: u64 = 0xFFFF_FFFE;
/// Largest entry count before the end record must be ZIP64.
pub const ZIP64_ENTRY_THR: usize = 0xFFFE;

/// General purpose bit flag: payload is encrypted.
pub const GP_FLAG_ENCRYPTED: u16 = 1 << 0;
/// General purpose bit flag: sizes/CRC follow the payload in a data descriptor.
pub const GP_FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// General purpose bit flag: file name and comment are UTF-8.
pub const GP_FLAG_UTF8: u16 = 1 << 11;

/// Version needed to extract a baseline entry (2.0).
pub const VERSION_NEEDED_DEFAULT: u16 = 20;
/// Version needed to extract a ZIP64 entry (4.5).
pub const VERSION_NEEDED_ZIP64: u16 = 45;
/// Version needed to extract a WinZip AES entry (5.1).
pub const VERSION_NEEDED_AES: u16 = 51;

/// Returns whether the name labels a directory entry.
pub fn is_dir(name: &str) -> bool {
    name.ends_with('/')
}

pub trait Block: Sized + Copy {
    fn interpret(bytes: &[u8]) -> ZipResult<Self>;

    fn deserialize(block: &[u8]) -> Self {
        assert_eq!(block.len(), mem::size_of::<Self>());
        let block_ptr: *const Self = block.as_ptr().cast();
        unsafe { block_ptr.read() }
    }

    fn parse<T: Read>(reader: &mut T) -> ZipResult<Self> {
        let mut block = vec![0u8; mem::size_of::<Self>()];
        reader.read_exact(&mut block)?;
        Self::interpret(&block)
    }

    fn encode(self) -> Box<[u8]>;

    fn serialize(self) -> Box<[u8]> {
        let mut out_block = vec![0u8; mem::size_of::<Self>()];
        let out_view: &mut [u8] = out_block.as_mut();
        let out_ptr: *mut Self = out_view.as_mut_ptr().cast();
        unsafe {
            out_ptr.write(self);
        }
        out_block.into_boxed_slice()
    }

    fn write<T: Write>(self, writer: &mut T) -> ZipResult<()> {
        let block = self.encode();
        writer.write_all(&block)?;
        Ok(())
    }
}

/// Convert all the fields of a struct *from* little-endian representations.
macro_rules! from_le {
    ($obj:ident, $field:ident, $type:ty) => {
        $obj.$field = <$type>::from_le($obj.$field);
    };
    ($obj:ident, [($field:ident, $type:ty) $(,)?]) => {
        from_le![$obj, $field, $type];
    };
    ($obj:ident, [($field:ident, $type:ty), $($rest:tt),+ $(,)?]) => {
        from_le![$obj, $field, $type];
        from_le!($obj, [$($rest),+]);
    };
}

/// Convert all the fields of a struct *into* little-endian representations.
macro_rules! to_le {
    ($obj:ident, $field:ident, $type:ty) => {
        $obj.$field = <$type>::to_le($obj.$field);
    };
    ($obj:ident, [($field:ident, $type:ty) $(,)?]) => {
        to_le![$obj, $field, $type];
    };
    ($obj:ident, [($field:ident, $type:ty), $($rest:tt),+ $(,)?]) => {
        to_le![$obj, $field, $type];
        to_le!($obj, [$($rest),+]);
    };
}

/// Implement the little-endian swaps and the `Block` round-trip for a
/// packed record in one go.
macro_rules! zip_block {
    ($block:ty, $magic:expr, $err:literal, [$($fields:tt),+ $(,)?]) => {
        impl $block {
            #[inline(always)]
            fn from_le(mut self) -> Self {
                from_le![self, [$($fields),+]];
                self
            }

            #[inline(always)]
            fn to_le(mut self) -> Self {
                to_le![self, [$($fields),+]];
                self
            }
        }

        impl Block for $block {
            fn interpret(bytes: &[u8]) -> ZipResult<Self> {
                let block = Self::deserialize(bytes).from_le();
                if block.magic != $magic {
                    return Err(ZipError::InvalidArgument($err.into()));
                }
                Ok(block)
            }

            fn encode(self) -> Box<[u8]> {
                self.to_le().serialize()
            }
        }
    };
}

/// Fixed portion of the local file header (30 bytes).
#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub struct LocalHeaderBlock {
    pub magic: Magic,
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

zip_block!(
    LocalHeaderBlock,
    LOCAL_FILE_HEADER_SIGNATURE,
    "Invalid local file header",
    [
        (magic, Magic),
        (version_needed, u16),
        (flags, u16),
        (compression_method, u16),
        (last_mod_time, u16),
        (last_mod_date, u16),
        (crc32, u32),
        (compressed_size, u32),
        (uncompressed_size, u32),
        (file_name_length, u16),
        (extra_field_length, u16),
    ]
);

/// Fixed portion of a central directory file header (46 bytes).
#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub struct CentralHeaderBlock {
    pub magic: Magic,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
    pub file_comment_length: u16,
    pub disk_number_start: u16,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    pub header_offset: u32,
}

zip_block!(
    CentralHeaderBlock,
    CENTRAL_DIRECTORY_HEADER_SIGNATURE,
    "Invalid central directory header",
    [
        (magic, Magic),
        (version_made_by, u16),
        (version_needed, u16),
        (flags, u16),
        (compression_method, u16),
        (last_mod_time, u16),
        (last_mod_date, u16),
        (crc32, u32),
        (compressed_size, u32),
        (uncompressed_size, u32),
        (file_name_length, u16),
        (extra_field_length, u16),
        (file_comment_length, u16),
        (disk_number_start, u16),
        (internal_attributes, u16),
        (external_attributes, u32),
        (header_offset, u32),
    ]
);

/// Data descriptor trailing a streamed entry (16 bytes).
#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub struct DataDescriptorBlock {
    pub magic: Magic,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

zip_block!(
    DataDescriptorBlock,
    DATA_DESCRIPTOR_SIGNATURE,
    "Invalid data descriptor",
    [
        (magic, Magic),
        (crc32, u32),
        (compressed_size, u32),
        (uncompressed_size, u32),
    ]
);

/// ZIP64 form of the data descriptor (24 bytes).
#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub struct Zip64DataDescriptorBlock {
    pub magic: Magic,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

zip_block!(
    Zip64DataDescriptorBlock,
    DATA_DESCRIPTOR_SIGNATURE,
    "Invalid zip64 data descriptor",
    [
        (magic, Magic),
        (crc32, u32),
        (compressed_size, u64),
        (uncompressed_size, u64),
    ]
);

/// End of central directory record, minus the trailing comment (22 bytes).
#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub struct CDEBlock {
    pub magic: Magic,
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub number_of_files_on_this_disk: u16,
    pub number_of_files: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub zip_file_comment_length: u16,
}

zip_block!(
    CDEBlock,
    CENTRAL_DIRECTORY_END_SIGNATURE,
    "Invalid end of central directory",
    [
        (magic, Magic),
        (disk_number, u16),
        (disk_with_central_directory, u16),
        (number_of_files_on_this_disk, u16),
        (number_of_files, u16),
        (central_directory_size, u32),
        (central_directory_offset, u32),
        (zip_file_comment_length, u16),
    ]
);

#[derive(Debug)]
pub struct CentralDirectoryEnd {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub number_of_files_on_this_disk: u16,
    pub number_of_files: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub zip_file_comment: Vec<u8>,
}

impl CentralDirectoryEnd {
    fn block_and_comment(self) -> (CDEBlock, Vec<u8>) {
        let Self {
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            zip_file_comment,
        } = self;
        let block = CDEBlock {
            magic: CENTRAL_DIRECTORY_END_SIGNATURE,
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            zip_file_comment_length: zip_file_comment.len().try_into().unwrap_or(u16::MAX),
        };
        (block, zip_file_comment)
    }

    pub fn parse<T: Read>(reader: &mut T) -> ZipResult<CentralDirectoryEnd> {
        let CDEBlock {
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            zip_file_comment_length,
            ..
        } = CDEBlock::parse(reader)?;

        let mut zip_file_comment = vec![0u8; zip_file_comment_length as usize];
        reader.read_exact(&mut zip_file_comment)?;

        Ok(CentralDirectoryEnd {
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            zip_file_comment,
        })
    }

    /// Scan backwards from the end of the stream for the end record.
    ///
    /// Only used by consumers re-reading an archive this writer produced
    /// (the integration tests do); the writer itself never seeks.
    pub fn find_and_parse<T: Read + Seek>(reader: &mut T) -> ZipResult<(CentralDirectoryEnd, u64)> {
        let file_length = reader.seek(io::SeekFrom::End(0))?;

        if file_length < mem::size_of::<CDEBlock>() as u64 {
            return Err(ZipError::InvalidArgument("Invalid zip header".into()));
        }

        const END_WINDOW_SIZE: usize = 512;

        let sig_bytes = CENTRAL_DIRECTORY_END_SIGNATURE.to_le_bytes();
        let finder = FinderRev::new(&sig_bytes);

        let mut window_start: u64 = file_length.saturating_sub(END_WINDOW_SIZE as u64);
        let mut window = [0u8; END_WINDOW_SIZE];
        loop {
            reader.seek(io::SeekFrom::Start(window_start))?;

            let end = (window_start + END_WINDOW_SIZE as u64).min(file_length);
            let cur_len = (end - window_start) as usize;
            debug_assert!(cur_len <= END_WINDOW_SIZE);
            let cur_window: &mut [u8] = &mut window[..cur_len];
            reader.read_exact(cur_window)?;

            for offset in finder.rfind_iter(cur_window) {
                let cde_start_pos = window_start + offset as u64;
                reader.seek(io::SeekFrom::Start(cde_start_pos))?;
                if let Ok(cde) = Self::parse(reader) {
                    return Ok((cde, cde_start_pos));
                }
            }
            if window_start == 0 {
                break;
            }
            window_start = window_start
                .saturating_sub(END_WINDOW_SIZE as u64 - mem::size_of_val(&sig_bytes) as u64);
        }

        Err(ZipError::InvalidArgument(
            "Could not find central directory end".into(),
        ))
    }

    pub fn write<T: Write>(self, writer: &mut T) -> ZipResult<()> {
        let (block, comment) = self.block_and_comment();
        block.write(writer)?;
        writer.write_all(&comment)?;
        Ok(())
    }
}

/// ZIP64 end of central directory locator (20 bytes).
#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub struct Zip64CDELocatorBlock {
    pub magic: Magic,
    pub disk_with_central_directory: u32,
    pub end_of_central_directory_offset: u64,
    pub number_of_disks: u32,
}

zip_block!(
    Zip64CDELocatorBlock,
    ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE,
    "Invalid zip64 locator",
    [
        (magic, Magic),
        (disk_with_central_directory, u32),
        (end_of_central_directory_offset, u64),
        (number_of_disks, u32),
    ]
);

pub struct Zip64CentralDirectoryEndLocator {
    pub disk_with_central_directory: u32,
    pub end_of_central_directory_offset: u64,
    pub number_of_disks: u32,
}

impl Zip64CentralDirectoryEndLocator {
    pub fn parse<T: Read>(reader: &mut T) -> ZipResult<Zip64CentralDirectoryEndLocator> {
        let Zip64CDELocatorBlock {
            disk_with_central_directory,
            end_of_central_directory_offset,
            number_of_disks,
            ..
        } = Zip64CDELocatorBlock::parse(reader)?;

        Ok(Zip64CentralDirectoryEndLocator {
            disk_with_central_directory,
            end_of_central_directory_offset,
            number_of_disks,
        })
    }

    pub fn block(self) -> Zip64CDELocatorBlock {
        let Self {
            disk_with_central_directory,
            end_of_central_directory_offset,
            number_of_disks,
        } = self;
        Zip64CDELocatorBlock {
            magic: ZIP64_CENTRAL_DIRECTORY_END_LOCATOR_SIGNATURE,
            disk_with_central_directory,
            end_of_central_directory_offset,
            number_of_disks,
        }
    }

    pub fn write<T: Write>(self, writer: &mut T) -> ZipResult<()> {
        self.block().write(writer)
    }
}

/// ZIP64 end of central directory record (56 bytes).
#[derive(Copy, Clone, Debug)]
#[repr(packed)]
pub struct Zip64CDEBlock {
    pub magic: Magic,
    pub record_size: u64,
    pub version_made_by: u16,
    pub version_needed_to_extract: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub number_of_files_on_this_disk: u64,
    pub number_of_files: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

zip_block!(
    Zip64CDEBlock,
    ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE,
    "Invalid zip64 end of central directory",
    [
        (magic, Magic),
        (record_size, u64),
        (version_made_by, u16),
        (version_needed_to_extract, u16),
        (disk_number, u32),
        (disk_with_central_directory, u32),
        (number_of_files_on_this_disk, u64),
        (number_of_files, u64),
        (central_directory_size, u64),
        (central_directory_offset, u64),
    ]
);

pub struct Zip64CentralDirectoryEnd {
    pub version_made_by: u16,
    pub version_needed_to_extract: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub number_of_files_on_this_disk: u64,
    pub number_of_files: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64CentralDirectoryEnd {
    pub fn parse<T: Read>(reader: &mut T) -> ZipResult<Zip64CentralDirectoryEnd> {
        let Zip64CDEBlock {
            version_made_by,
            version_needed_to_extract,
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
            ..
        } = Zip64CDEBlock::parse(reader)?;
        Ok(Self {
            version_made_by,
            version_needed_to_extract,
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
        })
    }

    pub fn block(self) -> Zip64CDEBlock {
        let Self {
            version_made_by,
            version_needed_to_extract,
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
        } = self;
        Zip64CDEBlock {
            magic: ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE,
            // the "size of the remainder of the record" per APPNOTE 4.3.14.1
            record_size: 44,
            version_made_by,
            version_needed_to_extract,
            disk_number,
            disk_with_central_directory,
            number_of_files_on_this_disk,
            number_of_files,
            central_directory_size,
            central_directory_offset,
        }
    }

    pub fn write<T: Write>(self, writer: &mut T) -> ZipResult<()> {
        self.block().write(writer)
    }
}
