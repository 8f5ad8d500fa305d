//! Types for assembling ZIP archives from streamed entries.
//!
//! [`ZipWriter`] owns the ordering discipline and the byte cursor. Entry
//! payloads are transformed by codecs on pool workers (or inline) and flow
//! back as frames over channels; a per-writer sequencer thread owns the
//! sink exclusively and turns those frames into local headers, payloads,
//! data descriptors and finally the central directory. No memory is shared
//! between the codec side and the sequencer: byte buffers are moved.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexSet;

use crate::compression::CompressionMethod;
use crate::estimate::{self, ArchiveSpec, EntrySpec};
#[cfg(feature = "aes-crypto")]
use crate::extra_fields::AesExtraField;
use crate::extra_fields::{ExtendedTimestamp, Ntfs, Zip64ExtraField};
use crate::pipeline::{self, Aborts, EntryProgress, Frame, PipelineConfig, PipelineResult};
use crate::pool::{AbortSignal, WorkerPool};
use crate::result::{invalid_argument, ZipError, ZipResult};
use crate::spec::{
    self, Block, CentralDirectoryEnd, CentralHeaderBlock, LocalHeaderBlock,
    Zip64CentralDirectoryEnd, Zip64CentralDirectoryEndLocator, Zip64DataDescriptorBlock,
    ZIP64_BYTES_THR, ZIP64_ENTRY_THR,
};
use crate::types::{ffi, AesMode, AesVendorVersion, DateTime, EntryData, System, DOS_DIRECTORY_ATTR};

/// Frames buffered per entry before backpressure stalls its worker; with
/// the default chunk size this is the high-watermark of held-back output.
const FRAME_BACKLOG: usize = 16;

/// The default compression level for new entries.
#[cfg(feature = "deflate")]
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
/// The default compression level for new entries.
#[cfg(not(feature = "deflate"))]
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 0;

/// Archive-wide options, fixed at construction.
#[derive(Clone)]
pub struct ArchiveOptions {
    /// Force ZIP64 records for every entry and the archive tail.
    pub zip64: bool,
    /// Emit entry payloads in `add()` call order (the default). When false,
    /// entries are emitted in the order their compression completes; the
    /// central directory lists them in call order either way.
    pub keep_order: bool,
    /// Attach the extended timestamp field (0x5455) to headers.
    pub extended_timestamp: bool,
    /// Attach the NTFS timestamp field (0x000a) to headers.
    pub ntfs_timestamp: bool,
    /// Record MS-DOS attributes (and the DOS originator system).
    pub ms_dos_compatible: bool,
    /// Floor for the version-needed-to-extract fields.
    pub version: Option<u16>,
    /// The version-made-by byte recorded in central headers.
    pub version_made_by: u8,
    /// Archive comment, unless `close` overrides it.
    pub comment: Option<String>,
    /// Default password; entries with any password are AES-encrypted.
    pub password: Option<String>,
    /// Default AES strength for encrypted entries.
    pub encryption_strength: AesMode,
    /// Account for the ZIP64 disk-number member (the split *transport* is
    /// the sink's concern, not this writer's).
    pub split_archive: bool,
    /// Archive-level cancellation token.
    pub abort: Option<AbortSignal>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            zip64: false,
            keep_order: true,
            extended_timestamp: true,
            ntfs_timestamp: true,
            ms_dos_compatible: true,
            version: None,
            version_made_by: 20,
            comment: None,
            password: None,
            encryption_strength: AesMode::Aes256,
            split_archive: false,
            abort: None,
        }
    }
}

/// Per-entry options for [`ZipWriter::add`].
#[derive(Clone, Default)]
pub struct EntryOptions {
    /// 0 stores the payload verbatim, anything above deflates it. `None`
    /// uses [`DEFAULT_COMPRESSION_LEVEL`].
    pub compression_level: Option<u32>,
    /// Declared size of the payload before compression. Entries with a
    /// known size that fits 32 bits are written without a data descriptor;
    /// anything else streams with one. A declared size that disagrees with
    /// the streamed bytes fails the entry.
    pub uncompressed_size: Option<u64>,
    /// Entry comment for the central directory.
    pub comment: Option<String>,
    /// DOS modification time; defaults to the current time.
    pub last_modified: Option<DateTime>,
    /// Force ZIP64 records for this entry.
    pub zip64: bool,
    /// Override the archive-level extended timestamp default.
    pub extended_timestamp: Option<bool>,
    /// Override the archive-level NTFS timestamp default.
    pub ntfs_timestamp: Option<bool>,
    /// Password for this entry; overrides the archive default.
    pub password: Option<String>,
    /// AES strength; overrides the archive default.
    pub encryption_strength: Option<AesMode>,
    /// The source bytes are already in their final form: skip the codec
    /// but keep the entry framing.
    pub pass_through: bool,
    /// Wire compression method for passthrough payloads, trusted as-is.
    pub compression_method: Option<u16>,
    /// CRC-32 of the original data for passthrough payloads; computed over
    /// the streamed bytes when absent.
    pub known_crc32: Option<u32>,
    /// Per-entry cancellation token.
    pub abort: Option<AbortSignal>,
    /// Best-effort observation hooks.
    pub progress: Option<Arc<dyn EntryProgress>>,
}

/// What a committed entry looks like from the outside.
#[derive(Debug, Clone)]
pub struct EntryMetadata {
    pub name: Box<str>,
    pub directory: bool,
    pub compression_method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Offset of the entry's local header in the archive.
    pub header_offset: u64,
    pub zip64: bool,
    pub uses_data_descriptor: bool,
    pub last_modified: DateTime,
}

#[derive(Debug)]
struct EntryShared {
    slot: Mutex<Option<ZipResult<EntryMetadata>>>,
    cond: Condvar,
}

/// The pending result of an [`ZipWriter::add`] call; resolves once the
/// entry is committed to the archive (or fails).
#[derive(Debug)]
pub struct EntryHandle {
    shared: Arc<EntryShared>,
}

impl EntryHandle {
    /// Blocks until the entry is committed and returns its final metadata.
    pub fn wait(self) -> ZipResult<EntryMetadata> {
        let mut slot = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self
                .shared
                .cond
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns the result if the entry already settled.
    pub fn try_wait(&self) -> Option<ZipResult<EntryMetadata>> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn resolve(shared: &EntryShared, result: ZipResult<EntryMetadata>) {
    let mut slot = shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(result);
    }
    shared.cond.notify_all();
}

/// An archive-poisoning failure, remembered so later calls surface the
/// same kind of error.
#[derive(Debug, Clone)]
enum Fatal {
    Aborted,
    Codec(String),
    Io(io::ErrorKind, String),
    Invalid(String),
}

impl Fatal {
    fn from_error(err: &ZipError) -> Fatal {
        match err {
            ZipError::Aborted => Fatal::Aborted,
            ZipError::Io(err) => Fatal::Io(err.kind(), err.to_string()),
            ZipError::InvalidArgument(msg) => Fatal::Invalid(msg.to_string()),
            other => Fatal::Codec(other.to_string()),
        }
    }

    fn to_error(&self) -> ZipError {
        match self {
            Fatal::Aborted => ZipError::Aborted,
            Fatal::Codec(msg) => ZipError::Codec(msg.clone().into()),
            Fatal::Io(kind, msg) => ZipError::Io(io::Error::new(*kind, msg.clone())),
            Fatal::Invalid(msg) => ZipError::InvalidArgument(msg.clone().into()),
        }
    }
}

/// How the local header relates to the payload stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeaderMode {
    /// No payload; header carries true zero sizes.
    Directory,
    /// Header precedes the payload with placeholder sizes and a ZIP64
    /// reservation; a data descriptor follows.
    Streaming,
    /// The whole entry is processed first, then the header is written
    /// with final values and no descriptor follows.
    Buffered,
}

#[derive(Clone)]
enum FrameSender {
    Bounded(SyncSender<Frame>),
    Unbounded(mpsc::Sender<Frame>),
}

impl FrameSender {
    fn send(&self, frame: Frame) -> Result<(), ()> {
        match self {
            FrameSender::Bounded(tx) => tx.send(frame).map_err(|_| ()),
            FrameSender::Unbounded(tx) => tx.send(frame).map_err(|_| ()),
        }
    }
}

struct PendingEntry {
    index: usize,
    data: EntryData,
    mode: HeaderMode,
    declared_size: Option<u64>,
    /// Compressed size known at header time (stored entries), for the
    /// ZIP64 reservation values.
    known_compressed: Option<u64>,
    pass_through: bool,
    rx: Receiver<Frame>,
    shared: Arc<EntryShared>,
}

struct SequencerQueue {
    pending: VecDeque<PendingEntry>,
    /// Indices whose pipelines finished, in completion order.
    completed: VecDeque<usize>,
    /// Close was requested with this comment.
    closing: Option<Vec<u8>>,
    /// The writer is being dropped without a close.
    shutdown: bool,
    fatal: Option<Fatal>,
}

struct SequencerShared {
    queue: Mutex<SequencerQueue>,
    cond: Condvar,
}

impl SequencerShared {
    fn new() -> Arc<Self> {
        Arc::new(SequencerShared {
            queue: Mutex::new(SequencerQueue {
                pending: VecDeque::new(),
                completed: VecDeque::new(),
                closing: None,
                shutdown: false,
                fatal: None,
            }),
            cond: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SequencerQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_completed(&self, index: usize) {
        self.lock().completed.push_back(index);
        self.cond.notify_all();
    }
}

/// Streaming ZIP archive generator.
///
/// Entries are submitted with [`ZipWriter::add`] and compressed
/// concurrently on the worker pool; [`ZipWriter::close`] waits for every
/// entry, writes the central directory and the end records. Output is
/// strictly append-only: the writer never seeks, switching to data
/// descriptors and ZIP64 records where sizes are not known up front.
pub struct ZipWriter<W: Write + Send + 'static> {
    shared: Arc<SequencerShared>,
    thread: Option<JoinHandle<ZipResult<W>>>,
    finished_sink: Option<W>,
    pool: Arc<WorkerPool>,
    options: ArchiveOptions,
    names: IndexSet<Box<str>>,
    added_specs: Vec<Option<EntrySpec>>,
    next_index: usize,
    closed: bool,
}

impl<W: Write + Send + 'static> ZipWriter<W> {
    /// Creates a writer with default options, backed by the process-wide
    /// worker pool.
    pub fn new(sink: W) -> ZipWriter<W> {
        Self::with_pool(sink, ArchiveOptions::default(), WorkerPool::global())
    }

    pub fn new_with_options(sink: W, options: ArchiveOptions) -> ZipWriter<W> {
        Self::with_pool(sink, options, WorkerPool::global())
    }

    /// Creates a writer backed by a specific pool instead of the
    /// process-wide one.
    pub fn with_pool(sink: W, options: ArchiveOptions, pool: Arc<WorkerPool>) -> ZipWriter<W> {
        let shared = SequencerShared::new();
        let thread_shared = Arc::clone(&shared);
        let thread_options = options.clone();
        let thread = std::thread::Builder::new()
            .name("zipstream-sequencer".into())
            .spawn(move || sequencer(sink, thread_shared, thread_options))
            .expect("failed to spawn archive sequencer");

        ZipWriter {
            shared,
            thread: Some(thread),
            finished_sink: None,
            pool,
            options,
            names: IndexSet::new(),
            added_specs: Vec::new(),
            next_index: 0,
            closed: false,
        }
    }

    fn ensure_open(&self) -> ZipResult<()> {
        if self.closed {
            return invalid_argument("archive is already closed");
        }
        if let Some(fatal) = &self.shared.lock().fatal {
            return Err(fatal.to_error());
        }
        Ok(())
    }

    /// Submits an entry. The returned handle resolves once the entry is
    /// committed; compression proceeds concurrently with further `add`
    /// calls, bounded by the pool's worker cap.
    pub fn add<R: Read + Send + 'static>(
        &mut self,
        name: &str,
        source: R,
        options: EntryOptions,
    ) -> ZipResult<EntryHandle> {
        if spec::is_dir(name) {
            return invalid_argument("names ending in '/' denote directories; use add_directory");
        }
        self.add_inner(name.to_string(), Some(Box::new(source)), options, false)
    }

    /// Adds a directory entry. A trailing `/` is appended when missing.
    pub fn add_directory(&mut self, name: &str, options: EntryOptions) -> ZipResult<EntryHandle> {
        let mut name = name.to_string();
        if !name.ends_with('/') {
            name.push('/');
        }
        self.add_inner(name, None, options, true)
    }

    fn add_inner(
        &mut self,
        name: String,
        source: Option<Box<dyn Read + Send>>,
        options: EntryOptions,
        directory: bool,
    ) -> ZipResult<EntryHandle> {
        self.ensure_open()?;

        if name.is_empty() {
            return invalid_argument("entry name is empty");
        }
        if name.len() > u16::MAX as usize {
            return invalid_argument("entry name exceeds 65535 bytes");
        }
        if options.comment.as_ref().is_some_and(|c| c.len() > u16::MAX as usize) {
            return invalid_argument("entry comment exceeds 65535 bytes");
        }

        let level = if directory {
            0
        } else {
            options
                .compression_level
                .unwrap_or(DEFAULT_COMPRESSION_LEVEL)
        };
        if level > 0 && !cfg!(feature = "deflate") {
            return invalid_argument("compression level > 0 requires the `deflate` feature");
        }

        let password = if directory {
            None
        } else {
            options.password.clone().or_else(|| self.options.password.clone())
        };
        if password.is_some() && !cfg!(feature = "aes-crypto") {
            return invalid_argument("passwords require the `aes-crypto` feature");
        }
        if password.is_some() && options.pass_through {
            return invalid_argument("passthrough entries cannot be encrypted by the writer");
        }
        let strength = options
            .encryption_strength
            .unwrap_or(self.options.encryption_strength);

        if !self.names.insert(name.clone().into_boxed_str()) {
            return invalid_argument(format!("duplicate entry name: {name}"));
        }

        let declared_size = if directory {
            Some(0)
        } else {
            options.uncompressed_size
        };
        let forced_zip64 = self.options.zip64 || options.zip64;
        let mode = if directory {
            HeaderMode::Directory
        } else if forced_zip64 || declared_size.map_or(true, |size| size > ZIP64_BYTES_THR) {
            HeaderMode::Streaming
        } else {
            HeaderMode::Buffered
        };

        let inner_method = if options.pass_through {
            options.compression_method.unwrap_or(CompressionMethod::STORE)
        } else {
            CompressionMethod::from_level(level).wire_id()
        };
        let aes_mode = password
            .is_some()
            .then_some((strength, AesVendorVersion::Ae2, inner_method));
        let wire_method = if aes_mode.is_some() {
            CompressionMethod::AES
        } else {
            inner_method
        };

        let mut flags = spec::GP_FLAG_UTF8;
        if mode == HeaderMode::Streaming {
            flags |= spec::GP_FLAG_DATA_DESCRIPTOR;
        }
        if aes_mode.is_some() {
            flags |= spec::GP_FLAG_ENCRYPTED;
        }

        let last_modified = options.last_modified.unwrap_or_else(DateTime::default_for_write);
        let system = if self.options.ms_dos_compatible {
            System::Dos
        } else {
            System::Unix
        };
        let external_attributes = external_attributes(system, directory);

        let extended_timestamp = options
            .extended_timestamp
            .unwrap_or(self.options.extended_timestamp);
        let ntfs_timestamp = options
            .ntfs_timestamp
            .unwrap_or(self.options.ntfs_timestamp);

        let data = EntryData {
            system,
            version_made_by: self.options.version_made_by,
            version_floor: self.options.version,
            flags,
            compression_method: wire_method,
            last_modified,
            unix_mtime: unix_mtime(options.last_modified.as_ref()),
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            file_name: name.clone().into_boxed_str(),
            file_comment: options
                .comment
                .as_ref()
                .map(|c| c.as_bytes().to_vec())
                .unwrap_or_default(),
            header_start: 0,
            external_attributes,
            directory,
            zip64: false,
            forced_zip64,
            using_data_descriptor: mode == HeaderMode::Streaming,
            extended_timestamp,
            ntfs_timestamp,
            aes_mode,
        };

        // compressed size known up front only for stored payloads
        let known_compressed = if level == 0 && !options.pass_through && !directory {
            declared_size.map(|size| {
                size + aes_mode
                    .map(|(strength, _, _)| strength.overhead())
                    .unwrap_or(0)
            })
        } else {
            None
        };

        self.added_specs.push(entry_spec_for(
            &name,
            declared_size,
            level,
            &options,
            directory,
            aes_mode.map(|(strength, _, _)| strength),
        ));

        let (tx, rx) = if self.options.keep_order {
            let (tx, rx) = mpsc::sync_channel(FRAME_BACKLOG);
            (FrameSender::Bounded(tx), rx)
        } else {
            let (tx, rx) = mpsc::channel();
            (FrameSender::Unbounded(tx), rx)
        };

        let shared_entry = Arc::new(EntryShared {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        });
        let handle = EntryHandle {
            shared: Arc::clone(&shared_entry),
        };
        let index = self.next_index;
        self.next_index += 1;

        {
            let mut queue = self.shared.lock();
            queue.pending.push_back(PendingEntry {
                index,
                data,
                mode,
                declared_size,
                known_compressed,
                pass_through: options.pass_through,
                rx,
                shared: shared_entry,
            });
            self.shared.cond.notify_all();
        }

        if directory {
            self.shared.notify_completed(index);
            return Ok(handle);
        }

        let source = source.ok_or_else(|| ZipError::InvalidArgument("missing source".into()))?;
        let tx_keep = tx.clone();
        let lease_cancel = AbortSignal::new();
        let aborts = Aborts::new([
            self.options.abort.clone(),
            options.abort.clone(),
            Some(lease_cancel.clone()),
        ]);
        let config = PipelineConfig {
            chunk_size: self.pool.chunk_size(),
            compression_level: level,
            pass_through: options.pass_through,
            known_crc32: options.known_crc32,
            declared_size,
            encryption: password.map(|password| (strength, password)),
            aborts: aborts.clone(),
            progress: options.progress.clone(),
        };
        let sequencer_shared = Arc::clone(&self.shared);
        let job = move || {
            // announces completion even if the pipeline unwinds
            struct NotifyOnDrop {
                shared: Arc<SequencerShared>,
                index: usize,
            }
            impl Drop for NotifyOnDrop {
                fn drop(&mut self) {
                    self.shared.notify_completed(self.index);
                }
            }
            let _notify = NotifyOnDrop {
                shared: sequencer_shared,
                index,
            };

            let mut source = source;
            let mut recycle = true;
            let outcome = pipeline::run(&mut *source, &config, &mut |bytes| {
                tx.send(Frame::Data(bytes)).map_err(|_| ZipError::Aborted)
            });
            match outcome {
                Ok(result) => {
                    let _ = tx.send(Frame::Done(result));
                }
                Err(err) => {
                    recycle = !err.is_abort();
                    let _ = tx.send(Frame::Fail(err));
                }
            }
            recycle
        };

        if self.pool.use_workers() {
            let dispatched = self
                .pool
                .acquire(&lease_cancel)
                .and_then(|lease| lease.dispatch(job));
            if let Err(err) = dispatched {
                // the sequencer already owns the queued entry; fail it
                // through the normal frame path so ordering stays intact
                let _ = tx_keep.send(Frame::Fail(Fatal::from_error(&err).to_error()));
                self.shared.notify_completed(index);
                return Err(err);
            }
        } else {
            job();
        }

        Ok(handle)
    }

    /// Predicts the exact archive size for the entries added so far plus
    /// `additions`, under this writer's options. Every entry must have a
    /// declared size; level > 0 additions must carry a predicted
    /// compressed size.
    pub fn estimate_stream_size(&self, additions: &[EntrySpec]) -> ZipResult<u64> {
        let mut files = Vec::with_capacity(self.added_specs.len() + additions.len());
        for spec in &self.added_specs {
            match spec {
                Some(spec) => files.push(spec.clone()),
                None => {
                    return Err(ZipError::Estimation(
                        "an entry was added without a declared uncompressed size".into(),
                    ))
                }
            }
        }
        files.extend(additions.iter().cloned());
        estimate::estimate_stream_size(&ArchiveSpec {
            options: self.options.clone(),
            files,
        })
    }

    /// Terminates the pool backing this writer. Idempotent; see
    /// [`WorkerPool::terminate_all`].
    pub fn terminate_workers(&self) -> ZipResult<()> {
        self.pool.terminate_all()
    }

    /// Waits for all entries, writes the central directory and the end
    /// records, and flushes the sink. A second call is an error.
    pub fn close(&mut self, comment: Option<&str>) -> ZipResult<()> {
        if self.closed {
            return invalid_argument("archive is already closed");
        }
        let comment_bytes = comment
            .map(|c| c.as_bytes().to_vec())
            .or_else(|| self.options.comment.as_ref().map(|c| c.as_bytes().to_vec()))
            .unwrap_or_default();
        if comment_bytes.len() > u16::MAX as usize {
            return invalid_argument("archive comment exceeds 65535 bytes");
        }
        self.closed = true;

        {
            let mut queue = self.shared.lock();
            queue.closing = Some(comment_bytes);
            self.shared.cond.notify_all();
        }

        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return invalid_argument("archive is already closed"),
        };
        match thread.join() {
            Ok(Ok(sink)) => {
                self.finished_sink = Some(sink);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ZipError::Codec("archive sequencer panicked".into())),
        }
    }

    /// Closes the archive and hands the sink back.
    pub fn finish(mut self, comment: Option<&str>) -> ZipResult<W> {
        self.close(comment)?;
        self.finished_sink
            .take()
            .ok_or_else(|| ZipError::Codec("sink already taken".into()))
    }

    /// The sink, once [`ZipWriter::close`] has succeeded.
    pub fn into_inner(mut self) -> Option<W> {
        self.finished_sink.take()
    }
}

impl<W: Write + Send + 'static> Drop for ZipWriter<W> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            {
                let mut queue = self.shared.lock();
                queue.shutdown = true;
                self.shared.cond.notify_all();
            }
            let _ = thread.join();
        }
    }
}

fn external_attributes(system: System, directory: bool) -> u32 {
    match system {
        System::Dos => {
            if directory {
                DOS_DIRECTORY_ATTR
            } else {
                0
            }
        }
        _ => {
            if directory {
                ((ffi::S_IFDIR | 0o755) << 16) | DOS_DIRECTORY_ATTR
            } else {
                (ffi::S_IFREG | 0o644) << 16
            }
        }
    }
}

fn unix_mtime(last_modified: Option<&DateTime>) -> i64 {
    #[cfg(feature = "time")]
    if let Some(dt) = last_modified {
        if let Ok(odt) = time::OffsetDateTime::try_from(*dt) {
            return odt.unix_timestamp();
        }
    }
    #[cfg(not(feature = "time"))]
    let _ = last_modified;

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn entry_spec_for(
    name: &str,
    declared_size: Option<u64>,
    level: u32,
    options: &EntryOptions,
    directory: bool,
    encryption: Option<AesMode>,
) -> Option<EntrySpec> {
    if options.pass_through {
        return None;
    }
    declared_size.map(|uncompressed_size| EntrySpec {
        name: name.to_string(),
        uncompressed_size,
        compressed_size: None,
        compression_level: level,
        comment: options.comment.clone(),
        directory,
        extended_timestamp: options.extended_timestamp,
        ntfs_timestamp: options.ntfs_timestamp,
        zip64: options.zip64,
        encryption,
    })
}

// ---------------------------------------------------------------------------
// Sequencer: the only code that touches the sink and the cursor.
// ---------------------------------------------------------------------------

enum Work {
    Entry(PendingEntry),
    Finish(Vec<u8>),
    Shutdown,
}

fn sequencer<W: Write>(
    mut sink: W,
    shared: Arc<SequencerShared>,
    options: ArchiveOptions,
) -> ZipResult<W> {
    let mut cursor = 0u64;
    let mut committed: Vec<EntryData> = Vec::new();
    let mut indices: Vec<usize> = Vec::new();

    loop {
        let work = next_work(&shared, &options)?;
        match work {
            Work::Shutdown => return Err(ZipError::Aborted),
            Work::Finish(comment) => {
                finish_archive(&mut sink, cursor, &mut committed, &mut indices, &options, comment)?;
                return Ok(sink);
            }
            Work::Entry(entry) => {
                let index = entry.index;
                match process_entry(&mut sink, &mut cursor, entry, &options, &shared) {
                    Ok(Some(data)) => {
                        committed.push(data);
                        indices.push(index);
                    }
                    Ok(None) => {}
                    // the fatal was recorded before the entry resolved
                    Err(_) => {}
                }
            }
        }
    }
}

/// Blocks until there is an entry to emit, a close to finish, or a reason
/// to bail out. On a poisoned archive all queued entries are failed and
/// the close call (if any) receives the fatal error.
fn next_work(shared: &SequencerShared, options: &ArchiveOptions) -> ZipResult<Work> {
    let mut queue = shared.lock();
    loop {
        if queue.shutdown {
            return Ok(Work::Shutdown);
        }

        if queue.fatal.is_none() {
            if let Some(signal) = &options.abort {
                if signal.is_aborted() {
                    queue.fatal = Some(Fatal::Aborted);
                }
            }
        }

        if let Some(fatal) = queue.fatal.clone() {
            for entry in queue.pending.drain(..) {
                resolve(&entry.shared, Err(fatal.to_error()));
            }
            queue.completed.clear();
            if queue.closing.is_some() {
                return Err(fatal.to_error());
            }
        } else if options.keep_order {
            if let Some(entry) = queue.pending.pop_front() {
                return Ok(Work::Entry(entry));
            }
        } else if let Some(index) = queue.completed.pop_front() {
            if let Some(pos) = queue.pending.iter().position(|e| e.index == index) {
                if let Some(entry) = queue.pending.remove(pos) {
                    return Ok(Work::Entry(entry));
                }
            }
            continue;
        }

        if queue.fatal.is_none() && queue.pending.is_empty() {
            if let Some(comment) = queue.closing.take() {
                return Ok(Work::Finish(comment));
            }
        }

        queue = shared
            .cond
            .wait(queue)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Emits one entry. Every outcome resolves the entry's handle, and a
/// poisoning failure records the archive fatal *before* the handle
/// resolves, so a caller that observes the failure already sees the
/// archive poisoned.
fn process_entry<W: Write>(
    sink: &mut W,
    cursor: &mut u64,
    entry: PendingEntry,
    options: &ArchiveOptions,
    shared: &SequencerShared,
) -> Result<Option<EntryData>, Fatal> {
    let entry_shared = Arc::clone(&entry.shared);
    let result = process_entry_inner(sink, cursor, entry, options);
    if let Err(fatal) = &result {
        {
            let mut queue = shared.lock();
            if queue.fatal.is_none() {
                queue.fatal = Some(fatal.clone());
            }
        }
        shared.cond.notify_all();
        resolve(&entry_shared, Err(fatal.to_error()));
    }
    result
}

fn process_entry_inner<W: Write>(
    sink: &mut W,
    cursor: &mut u64,
    mut entry: PendingEntry,
    options: &ArchiveOptions,
) -> Result<Option<EntryData>, Fatal> {
    entry.data.header_start = *cursor;
    match entry.mode {
        HeaderMode::Directory => {
            entry.data.zip64 =
                entry.data.forced_zip64 || entry.data.header_start > ZIP64_BYTES_THR;
            let header = local_header_bytes(&entry, options);
            write_payload(sink, cursor, &header)?;
            let metadata = metadata_of(&entry.data);
            resolve(&entry.shared, Ok(metadata));
            Ok(Some(entry.data))
        }
        HeaderMode::Streaming => process_streaming(sink, cursor, entry, options),
        HeaderMode::Buffered => process_buffered(sink, cursor, entry, options),
    }
}

fn process_streaming<W: Write>(
    sink: &mut W,
    cursor: &mut u64,
    mut entry: PendingEntry,
    options: &ArchiveOptions,
) -> Result<Option<EntryData>, Fatal> {
    // a streaming header reserves ZIP64 space, so the entry is ZIP64 for
    // its whole life even if the payload turns out small
    entry.data.zip64 = true;
    let header = local_header_bytes(&entry, options);
    write_payload(sink, cursor, &header)?;

    loop {
        if let Some(signal) = &options.abort {
            if signal.is_aborted() {
                return Err(Fatal::Aborted);
            }
        }
        match entry.rx.recv() {
            Ok(Frame::Data(bytes)) => {
                write_payload(sink, cursor, &bytes)?;
            }
            Ok(Frame::Done(result)) => {
                entry.data.crc32 = result.crc32;
                entry.data.compressed_size = result.compressed_size;
                entry.data.uncompressed_size = result.uncompressed_size;
                let descriptor = Zip64DataDescriptorBlock {
                    magic: spec::DATA_DESCRIPTOR_SIGNATURE,
                    crc32: result.crc32,
                    compressed_size: result.compressed_size,
                    uncompressed_size: result.uncompressed_size,
                };
                write_payload(sink, cursor, &descriptor.encode())?;

                if let Some(err) = size_mismatch(&entry, &result) {
                    return Err(err);
                }
                let metadata = metadata_of(&entry.data);
                resolve(&entry.shared, Ok(metadata));
                return Ok(Some(entry.data));
            }
            Ok(Frame::Fail(err)) => {
                return entry_failure(&entry, err, options);
            }
            Err(_) => {
                return Err(Fatal::Codec(
                    "entry pipeline terminated unexpectedly".into(),
                ));
            }
        }
    }
}

fn process_buffered<W: Write>(
    sink: &mut W,
    cursor: &mut u64,
    mut entry: PendingEntry,
    options: &ArchiveOptions,
) -> Result<Option<EntryData>, Fatal> {
    let mut payload: Vec<Vec<u8>> = Vec::new();
    let result: PipelineResult = loop {
        match entry.rx.recv() {
            Ok(Frame::Data(bytes)) => payload.push(bytes),
            Ok(Frame::Done(result)) => break result,
            Ok(Frame::Fail(err)) => {
                return entry_failure(&entry, err, options);
            }
            Err(_) => {
                return Err(Fatal::Codec(
                    "entry pipeline terminated unexpectedly".into(),
                ));
            }
        }
    };

    if let Some(err) = size_mismatch(&entry, &result) {
        // header not yet written; the archive stays usable
        resolve(&entry.shared, Err(err.to_error()));
        return Ok(None);
    }

    entry.data.crc32 = result.crc32;
    entry.data.compressed_size = result.compressed_size;
    entry.data.uncompressed_size = result.uncompressed_size;
    entry.data.zip64 = entry.data.oversized();

    let header = local_header_bytes(&entry, options);
    write_payload(sink, cursor, &header)?;
    for bytes in &payload {
        if let Some(signal) = &options.abort {
            if signal.is_aborted() {
                return Err(Fatal::Aborted);
            }
        }
        write_payload(sink, cursor, bytes)?;
    }

    let metadata = metadata_of(&entry.data);
    resolve(&entry.shared, Ok(metadata));
    Ok(Some(entry.data))
}

/// A pipeline failure. Cancellation of a single entry leaves the archive
/// usable: the entry is not committed and any partial bytes stay in the
/// stream (there is no rewind). An archive-level abort, and every codec or
/// source error, poisons the archive.
fn entry_failure(
    entry: &PendingEntry,
    err: ZipError,
    options: &ArchiveOptions,
) -> Result<Option<EntryData>, Fatal> {
    let archive_aborted = options
        .abort
        .as_ref()
        .map_or(false, AbortSignal::is_aborted);
    let fatal = Fatal::from_error(&err);
    if matches!(fatal, Fatal::Aborted) && !archive_aborted {
        resolve(&entry.shared, Err(err));
        return Ok(None);
    }
    Err(fatal)
}

fn size_mismatch(entry: &PendingEntry, result: &PipelineResult) -> Option<Fatal> {
    if entry.pass_through {
        return None;
    }
    match entry.declared_size {
        Some(declared) if declared != result.uncompressed_size => Some(Fatal::Invalid(format!(
            "entry {}: declared uncompressed size {declared} but {} bytes were streamed",
            entry.data.file_name, result.uncompressed_size
        ))),
        _ => None,
    }
}

fn write_payload<W: Write>(sink: &mut W, cursor: &mut u64, bytes: &[u8]) -> Result<(), Fatal> {
    sink.write_all(bytes)
        .map_err(|err| Fatal::Io(err.kind(), err.to_string()))?;
    *cursor += bytes.len() as u64;
    Ok(())
}

fn metadata_of(data: &EntryData) -> EntryMetadata {
    EntryMetadata {
        name: data.file_name.clone(),
        directory: data.directory,
        compression_method: data.compression_method,
        crc32: data.crc32,
        compressed_size: data.compressed_size,
        uncompressed_size: data.uncompressed_size,
        header_offset: data.header_start,
        zip64: data.zip64,
        uses_data_descriptor: data.using_data_descriptor,
        last_modified: data.last_modified,
    }
}

/// Timestamp and AES fields shared by the local and central headers.
fn fixed_extra_fields(data: &EntryData) -> Vec<u8> {
    let mut extra = Vec::new();
    if data.extended_timestamp {
        extra.extend_from_slice(&ExtendedTimestamp::new(data.unix_mtime).serialize());
    }
    if data.ntfs_timestamp {
        extra.extend_from_slice(&Ntfs::from_unix(data.unix_mtime).serialize());
    }
    #[cfg(feature = "aes-crypto")]
    if let Some((strength, vendor, method)) = data.aes_mode {
        extra.extend_from_slice(&AesExtraField::new(vendor, strength, method).serialize());
    }
    extra
}

fn local_header_bytes(entry: &PendingEntry, options: &ArchiveOptions) -> Vec<u8> {
    let data = &entry.data;
    let mut extra = fixed_extra_fields(data);

    let (zip64_field, sizes_known) = match entry.mode {
        HeaderMode::Directory => (
            Zip64ExtraField::local_header(
                Some(0),
                Some(0),
                data.header_start,
                data.forced_zip64,
                true,
                options.split_archive,
            ),
            true,
        ),
        HeaderMode::Streaming => (
            Zip64ExtraField::local_header(
                entry.declared_size,
                entry.known_compressed,
                data.header_start,
                data.forced_zip64,
                false,
                options.split_archive,
            ),
            false,
        ),
        HeaderMode::Buffered => (
            Zip64ExtraField::local_header(
                Some(data.uncompressed_size),
                Some(data.compressed_size),
                data.header_start,
                data.forced_zip64,
                false,
                options.split_archive,
            ),
            true,
        ),
    };
    let (compressed_field, uncompressed_field) = if sizes_known {
        (
            clamp32(
                data.compressed_size,
                zip64_field.map_or(false, |f| f.has_compressed()),
            ),
            clamp32(
                data.uncompressed_size,
                zip64_field.map_or(false, |f| f.has_uncompressed()),
            ),
        )
    } else {
        (u32::MAX, u32::MAX)
    };
    if let Some(field) = zip64_field {
        extra.extend_from_slice(&field.serialize());
    }

    let block = LocalHeaderBlock {
        magic: spec::LOCAL_FILE_HEADER_SIGNATURE,
        version_needed: data.version_needed(),
        flags: data.flags,
        compression_method: data.compression_method,
        last_mod_time: data.last_modified.timepart(),
        last_mod_date: data.last_modified.datepart(),
        crc32: data.crc32,
        compressed_size: compressed_field,
        uncompressed_size: uncompressed_field,
        file_name_length: data.file_name.len() as u16,
        extra_field_length: extra.len() as u16,
    };

    let mut bytes = Vec::with_capacity(30 + data.file_name.len() + extra.len());
    bytes.extend_from_slice(&block.encode());
    bytes.extend_from_slice(data.file_name.as_bytes());
    bytes.extend_from_slice(&extra);
    bytes
}

fn central_header_bytes(data: &EntryData, options: &ArchiveOptions) -> Vec<u8> {
    let mut extra = fixed_extra_fields(data);
    let zip64_field = Zip64ExtraField::central_header(
        data.uncompressed_size,
        data.compressed_size,
        data.header_start,
        data.forced_zip64,
        data.directory,
        options.split_archive,
    );
    let compressed_field = clamp32(
        data.compressed_size,
        zip64_field.map_or(false, |f| f.has_compressed()),
    );
    let uncompressed_field = clamp32(
        data.uncompressed_size,
        zip64_field.map_or(false, |f| f.has_uncompressed()),
    );
    let offset_field = clamp32(
        data.header_start,
        zip64_field.map_or(false, |f| f.has_header_start()),
    );
    if let Some(field) = zip64_field {
        extra.extend_from_slice(&field.serialize());
    }

    let block = CentralHeaderBlock {
        magic: spec::CENTRAL_DIRECTORY_HEADER_SIGNATURE,
        version_made_by: ((u8::from(data.system) as u16) << 8) | data.version_made_by as u16,
        version_needed: data.version_needed(),
        flags: data.flags,
        compression_method: data.compression_method,
        last_mod_time: data.last_modified.timepart(),
        last_mod_date: data.last_modified.datepart(),
        crc32: data.crc32,
        compressed_size: compressed_field,
        uncompressed_size: uncompressed_field,
        file_name_length: data.file_name.len() as u16,
        extra_field_length: extra.len() as u16,
        file_comment_length: data.file_comment.len() as u16,
        disk_number_start: 0,
        internal_attributes: 0,
        external_attributes: data.external_attributes,
        header_offset: offset_field,
    };

    let mut bytes =
        Vec::with_capacity(46 + data.file_name.len() + extra.len() + data.file_comment.len());
    bytes.extend_from_slice(&block.encode());
    bytes.extend_from_slice(data.file_name.as_bytes());
    bytes.extend_from_slice(&extra);
    bytes.extend_from_slice(&data.file_comment);
    bytes
}

fn clamp32(value: u64, in_zip64_field: bool) -> u32 {
    if in_zip64_field {
        u32::MAX
    } else {
        value as u32
    }
}

fn finish_archive<W: Write>(
    sink: &mut W,
    mut cursor: u64,
    committed: &mut Vec<EntryData>,
    indices: &mut Vec<usize>,
    options: &ArchiveOptions,
    comment: Vec<u8>,
) -> ZipResult<()> {
    // central records always follow add() order, whatever order the
    // payloads were emitted in
    let mut order: Vec<usize> = (0..committed.len()).collect();
    order.sort_by_key(|i| indices[*i]);

    let central_start = cursor;
    for i in order {
        let bytes = central_header_bytes(&committed[i], options);
        sink.write_all(&bytes)?;
        cursor += bytes.len() as u64;
    }
    let central_size = cursor - central_start;

    let count = committed.len();
    let zip64_archive = committed.iter().any(|data| data.zip64)
        || count > ZIP64_ENTRY_THR
        || central_size > ZIP64_BYTES_THR
        || central_start > ZIP64_BYTES_THR;

    if zip64_archive {
        let version_made_by = ((u8::from(if options.ms_dos_compatible {
            System::Dos
        } else {
            System::Unix
        }) as u16)
            << 8)
            | options.version_made_by as u16;
        Zip64CentralDirectoryEnd {
            version_made_by,
            version_needed_to_extract: spec::VERSION_NEEDED_ZIP64,
            disk_number: 0,
            disk_with_central_directory: 0,
            number_of_files_on_this_disk: count as u64,
            number_of_files: count as u64,
            central_directory_size: central_size,
            central_directory_offset: central_start,
        }
        .write(sink)?;
        Zip64CentralDirectoryEndLocator {
            disk_with_central_directory: 0,
            end_of_central_directory_offset: central_start + central_size,
            number_of_disks: 1,
        }
        .write(sink)?;
    }

    CentralDirectoryEnd {
        disk_number: 0,
        disk_with_central_directory: 0,
        number_of_files_on_this_disk: count.min(u16::MAX as usize) as u16,
        number_of_files: count.min(u16::MAX as usize) as u16,
        central_directory_size: clamp32(central_size, central_size > ZIP64_BYTES_THR),
        central_directory_offset: clamp32(central_start, central_start > ZIP64_BYTES_THR),
        zip_file_comment: comment,
    }
    .write(sink)?;
    sink.flush()?;
    Ok(())
}
