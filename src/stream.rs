//! A pipe-shaped facade over [`ZipWriter`].
//!
//! [`ZipWriterStream`] couples the writer to a bounded in-memory byte
//! queue: archive bytes come out of an [`ArchiveReader`] on the consumer
//! side, and each entry's payload goes in through a per-entry
//! [`EntryWriter`] sink. The queue applies backpressure both ways, so a
//! consumer must keep draining the reader while entries are written (and
//! while `close` runs), typically from another thread.

use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc};

use crate::pool::WorkerPool;
use crate::result::{ZipResult, ZipError};
use crate::write::{ArchiveOptions, EntryMetadata, EntryHandle, EntryOptions, ZipWriter};

/// Chunks buffered in a pipe before the producing side blocks.
const PIPE_BACKLOG: usize = 16;

/// Shared reader over a chunk channel; yields EOF once the producing side
/// hangs up.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        ChannelReader {
            rx,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.current.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.current.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// The readable side of a [`ZipWriterStream`]: the archive bytes, in
/// order, as the writer emits them.
pub struct ArchiveReader {
    inner: ChannelReader,
}

impl Read for ArchiveReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// The sink handed to the inner [`ZipWriter`]; forwards every write into
/// the bounded pipe.
pub struct PipeSink {
    tx: SyncSender<Vec<u8>>,
}

impl Write for PipeSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx.send(buf.to_vec()).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "archive reader was dropped")
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writable sink for one entry's payload. Dropping it (or calling
/// [`EntryWriter::finish`]) ends the entry's stream.
pub struct EntryWriter {
    tx: Option<SyncSender<Vec<u8>>>,
    handle: Option<EntryHandle>,
}

impl Write for EntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "entry already finished"))?;
        tx.send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "entry was cancelled"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EntryWriter {
    /// Ends the payload and waits for the entry to commit.
    pub fn finish(mut self) -> ZipResult<EntryMetadata> {
        self.tx = None;
        match self.handle.take() {
            Some(handle) => handle.wait(),
            None => Err(ZipError::InvalidArgument("entry already finished".into())),
        }
    }

    /// Ends the payload without waiting; the handle resolves once the
    /// entry commits.
    pub fn into_handle(mut self) -> Option<EntryHandle> {
        self.tx = None;
        self.handle.take()
    }
}

/// A [`ZipWriter`] whose output is exposed as a readable byte stream.
pub struct ZipWriterStream {
    writer: ZipWriter<PipeSink>,
}

impl ZipWriterStream {
    /// Builds the stream pair; hand the [`ArchiveReader`] to the consumer
    /// before adding entries.
    pub fn new(options: ArchiveOptions) -> (ZipWriterStream, ArchiveReader) {
        Self::with_pool(options, WorkerPool::global())
    }

    pub fn with_pool(
        options: ArchiveOptions,
        pool: Arc<WorkerPool>,
    ) -> (ZipWriterStream, ArchiveReader) {
        let (tx, rx) = mpsc::sync_channel(PIPE_BACKLOG);
        let writer = ZipWriter::with_pool(PipeSink { tx }, options, pool);
        (
            ZipWriterStream { writer },
            ArchiveReader {
                inner: ChannelReader::new(rx),
            },
        )
    }

    /// The inner writer, for `add` calls that already have a reader.
    pub fn zip_writer(&mut self) -> &mut ZipWriter<PipeSink> {
        &mut self.writer
    }

    /// Opens a writable sink for one entry's payload.
    pub fn writable(&mut self, name: &str, options: EntryOptions) -> ZipResult<EntryWriter> {
        let (tx, rx) = mpsc::sync_channel(PIPE_BACKLOG);
        let handle = self
            .writer
            .add(name, ChannelReader::new(rx), options)?;
        Ok(EntryWriter {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Closes the archive; the reader yields the central directory and
    /// then EOF.
    pub fn close(mut self, comment: Option<&str>) -> ZipResult<()> {
        self.writer.close(comment)
    }
}
