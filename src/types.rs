//! Types describing the entries recorded in an archive.

use std::fmt;

use crate::result::DateTimeRangeError;
use crate::spec::{self, ZIP64_BYTES_THR};

#[cfg(feature = "time")]
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

pub(crate) mod ffi {
    pub const S_IFDIR: u32 = 0o0040000;
    pub const S_IFREG: u32 = 0o0100000;
}

/// MS-DOS directory attribute bit, kept for readers that predate unix modes.
pub(crate) const DOS_DIRECTORY_ATTR: u32 = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum System {
    Dos = 0,
    Unix = 3,
    Unknown,
}

impl From<System> for u8 {
    fn from(system: System) -> Self {
        match system {
            System::Dos => 0,
            System::Unix => 3,
            System::Unknown => 4,
        }
    }
}

/// Representation of a moment in time.
///
/// Zip files use an old format from DOS to store timestamps,
/// with its own set of peculiarities.
/// For example, it has a resolution of 2 seconds!
///
/// # Warning
///
/// Because there is no timezone associated with the [`DateTime`], they should
/// ideally only be used for user-facing descriptions. The extended and NTFS
/// timestamp extra fields carry the precise UTC instant.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DateTime {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
}

impl Default for DateTime {
    /// Constructs an 'default' datetime of 1980-01-01 00:00:00
    fn default() -> DateTime {
        DateTime {
            year: 1980,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        }
    }
}

impl fmt::Display for DateTime {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

impl DateTime {
    /// Returns the current time if possible, otherwise the default of 1980-01-01.
    #[cfg(feature = "time")]
    pub fn default_for_write() -> Self {
        OffsetDateTime::now_utc()
            .try_into()
            .unwrap_or_else(|_| DateTime::default())
    }

    /// Returns the current time if possible, otherwise the default of 1980-01-01.
    #[cfg(not(feature = "time"))]
    pub fn default_for_write() -> Self {
        DateTime::default()
    }

    /// Converts an msdos (u16, u16) pair to a DateTime object if it represents
    /// a valid date and time.
    pub fn try_from_msdos(datepart: u16, timepart: u16) -> Result<DateTime, DateTimeRangeError> {
        let seconds = (timepart & 0b0000000000011111) << 1;
        let minutes = (timepart & 0b0000011111100000) >> 5;
        let hours = (timepart & 0b1111100000000000) >> 11;
        let days = datepart & 0b0000000000011111;
        let months = (datepart & 0b0000000111100000) >> 5;
        let years = (datepart & 0b1111111000000000) >> 9;
        Self::from_date_and_time(
            years.checked_add(1980).ok_or(DateTimeRangeError)?,
            months.try_into()?,
            days.try_into()?,
            hours.try_into()?,
            minutes.try_into()?,
            seconds.try_into()?,
        )
    }

    /// Constructs a DateTime from a specific date and time
    ///
    /// The bounds are:
    /// * year: [1980, 2107]
    /// * month: [1, 12]
    /// * day: [1, 31]
    /// * hour: [0, 23]
    /// * minute: [0, 59]
    /// * second: [0, 60]
    pub fn from_date_and_time(
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
    ) -> Result<DateTime, DateTimeRangeError> {
        if (1980..=2107).contains(&year)
            && (1..=12).contains(&month)
            && (1..=31).contains(&day)
            && hour <= 23
            && minute <= 59
            && second <= 60
        {
            Ok(DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
            })
        } else {
            Err(DateTimeRangeError)
        }
    }

    /// Gets the time portion of this datetime in the msdos representation
    ///
    /// Seconds are quantized to the even value below, as the format allows
    /// only two-second resolution.
    pub const fn timepart(&self) -> u16 {
        ((self.second as u16) >> 1) | ((self.minute as u16) << 5) | ((self.hour as u16) << 11)
    }

    /// Gets the date portion of this datetime in the msdos representation
    pub const fn datepart(&self) -> u16 {
        (self.day as u16) | ((self.month as u16) << 5) | ((self.year - 1980) << 9)
    }

    /// Get the year. There is no epoch, i.e. 2018 will be returned as 2018.
    pub const fn year(&self) -> u16 {
        self.year
    }

    /// Get the month, where 1 = january and 12 = december
    pub const fn month(&self) -> u8 {
        self.month
    }

    /// Get the day
    pub const fn day(&self) -> u8 {
        self.day
    }

    /// Get the hour
    pub const fn hour(&self) -> u8 {
        self.hour
    }

    /// Get the minute
    pub const fn minute(&self) -> u8 {
        self.minute
    }

    /// Get the second
    pub const fn second(&self) -> u8 {
        self.second
    }
}

#[cfg(feature = "time")]
impl TryFrom<OffsetDateTime> for DateTime {
    type Error = DateTimeRangeError;

    fn try_from(dt: OffsetDateTime) -> Result<Self, Self::Error> {
        if dt.year() >= 1980 && dt.year() <= 2107 {
            Ok(DateTime {
                year: dt.year().try_into()?,
                month: dt.month().into(),
                day: dt.day(),
                hour: dt.hour(),
                minute: dt.minute(),
                second: dt.second(),
            })
        } else {
            Err(DateTimeRangeError)
        }
    }
}

#[cfg(feature = "time")]
impl TryFrom<DateTime> for OffsetDateTime {
    type Error = time::error::ComponentRange;

    fn try_from(dt: DateTime) -> Result<Self, Self::Error> {
        let date = Date::from_calendar_date(dt.year as i32, Month::try_from(dt.month)?, dt.day)?;
        let time = Time::from_hms(dt.hour, dt.minute, dt.second)?;
        Ok(PrimitiveDateTime::new(date, time).assume_utc())
    }
}

/// The encryption specification used to encrypt a file with AES.
///
/// According to the [specification](https://www.winzip.com/win/en/aes_info.html#winzip11) AE-2
/// does not make use of the CRC check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum AesVendorVersion {
    Ae1 = 0x0001,
    Ae2 = 0x0002,
}

/// AES variant used.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AesMode {
    /// 128-bit AES encryption.
    Aes128 = 0x01,
    /// 192-bit AES encryption.
    Aes192 = 0x02,
    /// 256-bit AES encryption.
    Aes256 = 0x03,
}

impl AesMode {
    /// Length of the salt for the given AES mode.
    pub const fn salt_length(&self) -> usize {
        self.key_length() / 2
    }

    /// Length of the key for the given AES mode.
    pub const fn key_length(&self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Fixed framing overhead an AES wrapper adds around the compressed
    /// payload: salt, the 2-byte password verifier and the 10-byte
    /// authentication tag.
    pub const fn overhead(&self) -> u64 {
        self.salt_length() as u64 + 2 + 10
    }
}

/// Everything recorded about a committed entry, frozen once its pipeline
/// completes and replayed into the central directory at close time.
#[derive(Debug, Clone)]
pub(crate) struct EntryData {
    pub system: System,
    pub version_made_by: u8,
    /// Caller-requested floor for the version-needed field.
    pub version_floor: Option<u16>,
    pub flags: u16,
    /// Compression method as stored on the wire (99 for AES wrappers).
    pub compression_method: u16,
    pub last_modified: DateTime,
    /// Modification time as UNIX epoch seconds, for the timestamp extra fields.
    pub unix_mtime: i64,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub file_name: Box<str>,
    pub file_comment: Vec<u8>,
    pub header_start: u64,
    pub external_attributes: u32,
    pub directory: bool,
    pub zip64: bool,
    /// ZIP64 was requested for this entry (archive-wide or per-entry), as
    /// opposed to promotion forced by the values themselves.
    pub forced_zip64: bool,
    pub using_data_descriptor: bool,
    pub extended_timestamp: bool,
    pub ntfs_timestamp: bool,
    /// Strength, vendor version and the wrapped method for AES entries.
    pub aes_mode: Option<(AesMode, AesVendorVersion, u16)>,
}

impl EntryData {
    /// PKZIP version needed to open this entry.
    pub fn version_needed(&self) -> u16 {
        let needed = if self.aes_mode.is_some() {
            spec::VERSION_NEEDED_AES
        } else if self.zip64 {
            spec::VERSION_NEEDED_ZIP64
        } else {
            spec::VERSION_NEEDED_DEFAULT
        };
        needed.max(self.version_floor.unwrap_or(0))
    }

    /// Whether any of this entry's final values overflow the 32-bit fields.
    pub fn oversized(&self) -> bool {
        self.uncompressed_size > ZIP64_BYTES_THR
            || self.compressed_size > ZIP64_BYTES_THR
            || self.header_start > ZIP64_BYTES_THR
    }
}
