#![allow(dead_code)]

//! A deliberately small archive re-reader used to round-trip what the
//! writer emits. It understands exactly what this writer produces: stored
//! and deflated entries, data descriptors, ZIP64 records and the extra
//! fields the writer attaches.

use std::io::{Cursor, Read};

use zipstream::spec::{
    Block, CentralDirectoryEnd, CentralHeaderBlock, LocalHeaderBlock, Zip64CentralDirectoryEnd,
    Zip64CentralDirectoryEndLocator,
};

pub const ZIP64_EXTRA_TAG: u16 = 0x0001;
pub const EXTENDED_TIMESTAMP_TAG: u16 = 0x5455;
pub const NTFS_TAG: u16 = 0x000a;
pub const AES_TAG: u16 = 0x9901;

#[derive(Debug)]
pub struct ParsedEntry {
    pub name: String,
    pub flags: u16,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub header_offset: u64,
    pub external_attributes: u32,
    pub version_needed: u16,
    pub comment: Vec<u8>,
    pub central_extra: Vec<u8>,
    /// Decompressed payload (empty for directories and entries whose
    /// method the reader does not decode).
    pub data: Vec<u8>,
}

impl ParsedEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    pub fn extra_field(&self, tag: u16) -> Option<&[u8]> {
        extra_field(&self.central_extra, tag)
    }
}

#[derive(Debug)]
pub struct ParsedArchive {
    pub entries: Vec<ParsedEntry>,
    pub comment: Vec<u8>,
    pub zip64: bool,
}

pub fn extra_field(extra: &[u8], tag: u16) -> Option<&[u8]> {
    let mut rest = extra;
    while rest.len() >= 4 {
        let field_tag = u16::from_le_bytes([rest[0], rest[1]]);
        let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            return None;
        }
        if field_tag == tag {
            return Some(&rest[4..4 + len]);
        }
        rest = &rest[4 + len..];
    }
    None
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> u16 {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf).unwrap();
    u16::from_le_bytes(buf)
}

fn read_exact(cursor: &mut Cursor<&[u8]>, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).unwrap();
    buf
}

/// Reads the ZIP64 extra field members that correspond to saturated
/// 32-bit header fields, in their fixed order.
fn apply_zip64(
    extra: &[u8],
    uncompressed: &mut u64,
    compressed: &mut u64,
    offset: Option<&mut u64>,
) {
    let Some(mut field) = extra_field(extra, ZIP64_EXTRA_TAG) else {
        return;
    };
    let mut take = |wanted: bool| -> Option<u64> {
        if !wanted || field.len() < 8 {
            return None;
        }
        let value = u64::from_le_bytes(field[..8].try_into().unwrap());
        field = &field[8..];
        Some(value)
    };
    if let Some(value) = take(*uncompressed == u32::MAX as u64) {
        *uncompressed = value;
    }
    if let Some(value) = take(*compressed == u32::MAX as u64) {
        *compressed = value;
    }
    if let Some(offset) = offset {
        if let Some(value) = take(*offset == u32::MAX as u64) {
            *offset = value;
        }
    }
}

fn decompress(method: u16, payload: &[u8]) -> Vec<u8> {
    match method {
        0 => payload.to_vec(),
        8 => {
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(payload)
                .read_to_end(&mut out)
                .unwrap();
            out
        }
        _ => Vec::new(),
    }
}

/// Parses a complete archive held in memory.
pub fn parse_archive(bytes: &[u8]) -> ParsedArchive {
    let mut cursor = Cursor::new(bytes);
    let (eocd, eocd_pos) = CentralDirectoryEnd::find_and_parse(&mut cursor).unwrap();

    // a ZIP64 locator, when present, sits immediately before the end record
    let mut zip64 = false;
    let mut count = eocd.number_of_files as u64;
    let mut cd_offset = eocd.central_directory_offset as u64;
    if eocd_pos >= 20 {
        let mut locator_cursor = Cursor::new(&bytes[eocd_pos as usize - 20..eocd_pos as usize]);
        if let Ok(locator) = Zip64CentralDirectoryEndLocator::parse(&mut locator_cursor) {
            let mut end_cursor =
                Cursor::new(&bytes[locator.end_of_central_directory_offset as usize..]);
            let zip64_end = Zip64CentralDirectoryEnd::parse(&mut end_cursor).unwrap();
            zip64 = true;
            count = zip64_end.number_of_files;
            cd_offset = zip64_end.central_directory_offset;
        }
    }

    let mut central = Cursor::new(&bytes[cd_offset as usize..]);
    let mut entries = Vec::new();
    for _ in 0..count {
        let block = CentralHeaderBlock::parse(&mut central).unwrap();
        let name = String::from_utf8(read_exact(
            &mut central,
            { block.file_name_length } as usize,
        ))
        .unwrap();
        let central_extra = read_exact(&mut central, { block.extra_field_length } as usize);
        let comment = read_exact(&mut central, { block.file_comment_length } as usize);

        let mut uncompressed_size = { block.uncompressed_size } as u64;
        let mut compressed_size = { block.compressed_size } as u64;
        let mut header_offset = { block.header_offset } as u64;
        apply_zip64(
            &central_extra,
            &mut uncompressed_size,
            &mut compressed_size,
            Some(&mut header_offset),
        );

        // re-read the local header to find the payload
        let mut local = Cursor::new(&bytes[header_offset as usize..]);
        let local_block = LocalHeaderBlock::parse(&mut local).unwrap();
        let data_start = header_offset
            + 30
            + { local_block.file_name_length } as u64
            + { local_block.extra_field_length } as u64;
        let payload =
            &bytes[data_start as usize..(data_start + compressed_size) as usize];
        let data = decompress({ block.compression_method }, payload);

        entries.push(ParsedEntry {
            name,
            flags: block.flags,
            method: block.compression_method,
            crc32: block.crc32,
            compressed_size,
            uncompressed_size,
            header_offset,
            external_attributes: block.external_attributes,
            version_needed: block.version_needed,
            comment,
            central_extra,
            data,
        });
    }

    ParsedArchive {
        entries,
        comment: eocd.zip_file_comment,
        zip64,
    }
}
