//! Error types that can be emitted from this library

use displaydoc::Display;
use thiserror::Error;

use std::borrow::Cow;
use std::io;

/// Generic result type with ZipError as its error variant
pub type ZipResult<T> = Result<T, ZipError>;

/// Error type for the ZIP writer
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum ZipError {
    /// i/o error: {0}
    Io(#[from] io::Error),

    /// invalid argument: {0}
    InvalidArgument(Cow<'static, str>),

    /// compressed size unknown for entry: {0}
    UnknownSize(Box<str>),

    /// codec failure: {0}
    Codec(Cow<'static, str>),

    /// operation was aborted
    Aborted,

    /// cannot estimate archive size: {0}
    Estimation(Cow<'static, str>),
}

impl ZipError {
    /// True when the error was produced by an observed cancellation.
    pub fn is_abort(&self) -> bool {
        matches!(self, ZipError::Aborted)
    }
}

pub(crate) fn invalid_argument<T, M: Into<Cow<'static, str>>>(message: M) -> ZipResult<T> {
    Err(ZipError::InvalidArgument(message.into()))
}

impl From<ZipError> for io::Error {
    fn from(err: ZipError) -> io::Error {
        let kind = match &err {
            ZipError::Io(err) => err.kind(),
            ZipError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            ZipError::UnknownSize(_) => io::ErrorKind::InvalidInput,
            ZipError::Codec(_) => io::ErrorKind::InvalidData,
            ZipError::Aborted => io::ErrorKind::Interrupted,
            ZipError::Estimation(_) => io::ErrorKind::InvalidInput,
        };

        io::Error::new(kind, err)
    }
}

/// Error type for DOS timestamp conversion
#[derive(Debug)]
pub struct DateTimeRangeError;

impl From<std::num::TryFromIntError> for DateTimeRangeError {
    fn from(_value: std::num::TryFromIntError) -> Self {
        DateTimeRangeError
    }
}

impl std::fmt::Display for DateTimeRangeError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "a date could not be represented within the bounds the MS-DOS date range (1980-2107)"
        )
    }
}

impl std::error::Error for DateTimeRangeError {}
