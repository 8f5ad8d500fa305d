//! A streaming ZIP / ZIP64 archive writer.
//!
//! `zipstream` assembles archives from entry payloads of known or unknown
//! length without ever seeking: headers switch to data descriptors and
//! ZIP64 records where sizes are not known up front. Compression runs on a
//! bounded pool of worker threads while payload bytes are emitted in
//! `add()` order (or completion order, if requested), and
//! [`estimate_stream_size`] predicts the final archive size to the byte
//! from declarative entry metadata alone.
//!
//! ```no_run
//! use std::io::Cursor;
//! use zipstream::{EntryOptions, ZipWriter};
//!
//! fn main() -> zipstream::ZipResult<()> {
//!     let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
//!     let entry = zip.add(
//!         "hello.txt",
//!         &b"Hello, world!"[..],
//!         EntryOptions {
//!             compression_level: Some(0),
//!             uncompressed_size: Some(13),
//!             ..EntryOptions::default()
//!         },
//!     )?;
//!     entry.wait()?;
//!     let archive = zip.finish(None)?.into_inner();
//!     assert!(!archive.is_empty());
//!     Ok(())
//! }
//! ```

#![allow(clippy::needless_doctest_main)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod compression;
pub mod estimate;
pub mod pool;
pub mod result;
pub mod spec;
pub mod stream;
pub mod types;
pub mod write;

mod codec;
mod extra_fields;
mod pipeline;

pub use crate::compression::CompressionMethod;
pub use crate::estimate::{estimate_stream_size, ArchiveSpec, EntrySpec};
pub use crate::pipeline::EntryProgress;
pub use crate::pool::{configure, terminate_workers, AbortSignal, PoolConfig, WorkerPool};
pub use crate::result::{ZipError, ZipResult};
pub use crate::stream::{ArchiveReader, EntryWriter, ZipWriterStream};
pub use crate::types::{AesMode, DateTime};
pub use crate::write::{
    ArchiveOptions, EntryHandle, EntryMetadata, EntryOptions, ZipWriter,
    DEFAULT_COMPRESSION_LEVEL,
};
