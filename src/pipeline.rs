//! The compute half of an entry: pull chunks from the source, run them
//! through the codec and hand the transformed frames to the assembler.
//!
//! This code runs on a pool worker (or inline on the calling thread when
//! workers are disabled); it never touches the output cursor. Cancellation
//! is observed between chunks.

use std::io::Read;
use std::sync::Arc;

use crc32fast::Hasher;

use crate::codec::{self, CodecResult};
use crate::pool::AbortSignal;
use crate::result::{ZipError, ZipResult};
use crate::types::AesMode;

/// Best-effort observation hooks for a single entry.
///
/// Calls arrive from whatever thread runs the entry's codec and may be
/// coalesced under load.
pub trait EntryProgress: Send + Sync {
    /// The entry started streaming; the declared size is passed when known.
    fn on_start(&self, _total: Option<u64>) {}
    /// Cumulative input bytes handed to the codec so far.
    fn on_progress(&self, _processed: u64) {}
    /// The entry finished; the computed uncompressed size is final.
    fn on_end(&self, _uncompressed_size: u64) {}
}

/// Every cancellation token that can fail this entry: archive-level,
/// per-entry, and the pool lease's own token.
#[derive(Clone, Default)]
pub(crate) struct Aborts {
    signals: Vec<AbortSignal>,
}

impl Aborts {
    pub(crate) fn new(signals: impl IntoIterator<Item = Option<AbortSignal>>) -> Self {
        Aborts {
            signals: signals.into_iter().flatten().collect(),
        }
    }

    pub(crate) fn check(&self) -> ZipResult<()> {
        for signal in &self.signals {
            signal.check()?;
        }
        Ok(())
    }
}

/// What an entry pipeline reports back once its source is exhausted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PipelineResult {
    pub crc32: u32,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

/// A transformed piece of one entry, moved from the codec side to the
/// assembler over a channel.
pub(crate) enum Frame {
    Data(Vec<u8>),
    Done(PipelineResult),
    Fail(ZipError),
}

pub(crate) struct PipelineConfig {
    pub chunk_size: usize,
    pub compression_level: u32,
    /// Bypass the codec; bytes are already in their final form.
    pub pass_through: bool,
    /// Caller-supplied CRC for passthrough payloads.
    pub known_crc32: Option<u32>,
    pub declared_size: Option<u64>,
    pub encryption: Option<(AesMode, String)>,
    pub aborts: Aborts,
    pub progress: Option<Arc<dyn EntryProgress>>,
}

/// Drives one entry end to end, emitting transformed frames through `emit`.
pub(crate) fn run(
    source: &mut dyn Read,
    config: &PipelineConfig,
    emit: &mut dyn FnMut(Vec<u8>) -> ZipResult<()>,
) -> ZipResult<PipelineResult> {
    config.aborts.check()?;
    if let Some(progress) = &config.progress {
        progress.on_start(config.declared_size);
    }

    let result = if config.pass_through {
        run_pass_through(source, config, emit)?
    } else {
        run_codec(source, config, emit)?
    };

    if let Some(progress) = &config.progress {
        progress.on_end(result.uncompressed_size);
    }
    Ok(result)
}

fn run_codec(
    source: &mut dyn Read,
    config: &PipelineConfig,
    emit: &mut dyn FnMut(Vec<u8>) -> ZipResult<()>,
) -> ZipResult<PipelineResult> {
    let encryption = config
        .encryption
        .as_ref()
        .map(|(mode, password)| (*mode, password.as_str()));
    let mut codec = codec::build(config.compression_level, encryption)?;

    let mut buf = vec![0u8; config.chunk_size];
    let mut processed = 0u64;
    loop {
        config.aborts.check()?;
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        codec.update(&buf[..n], emit)?;
        processed += n as u64;
        if let Some(progress) = &config.progress {
            progress.on_progress(processed);
        }
    }

    let CodecResult {
        input_bytes,
        output_bytes,
        signature,
    } = codec.finish(emit)?;

    Ok(PipelineResult {
        crc32: signature,
        uncompressed_size: input_bytes,
        compressed_size: output_bytes,
    })
}

/// Passthrough skips the codec but still frames the payload: the streamed
/// bytes are taken as the compressed form, and a CRC is computed over them
/// when the caller did not supply one.
fn run_pass_through(
    source: &mut dyn Read,
    config: &PipelineConfig,
    emit: &mut dyn FnMut(Vec<u8>) -> ZipResult<()>,
) -> ZipResult<PipelineResult> {
    let mut hasher = config.known_crc32.is_none().then(Hasher::new);
    let mut buf = vec![0u8; config.chunk_size];
    let mut streamed = 0u64;
    loop {
        config.aborts.check()?;
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        streamed += n as u64;
        emit(buf[..n].to_vec())?;
        if let Some(progress) = &config.progress {
            progress.on_progress(streamed);
        }
    }

    Ok(PipelineResult {
        crc32: config
            .known_crc32
            .unwrap_or_else(|| hasher.take().map(Hasher::finalize).unwrap_or(0)),
        uncompressed_size: config.declared_size.unwrap_or(streamed),
        compressed_size: streamed,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn config(chunk_size: usize) -> PipelineConfig {
        PipelineConfig {
            chunk_size,
            compression_level: 0,
            pass_through: false,
            known_crc32: None,
            declared_size: None,
            encryption: None,
            aborts: Aborts::default(),
            progress: None,
        }
    }

    struct Recorder {
        started: AtomicU64,
        last: AtomicU64,
        ended: AtomicU64,
    }

    impl EntryProgress for Recorder {
        fn on_start(&self, _total: Option<u64>) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_progress(&self, processed: u64) {
            self.last.store(processed, Ordering::SeqCst);
        }
        fn on_end(&self, size: u64) {
            self.ended.store(size, Ordering::SeqCst);
        }
    }

    #[test]
    fn stored_entry_reports_counts_and_hooks() {
        let input = vec![42u8; 10_000];
        let recorder = Arc::new(Recorder {
            started: AtomicU64::new(0),
            last: AtomicU64::new(0),
            ended: AtomicU64::new(0),
        });
        let mut cfg = config(1024);
        cfg.progress = Some(recorder.clone());

        let mut out = Vec::new();
        let result = run(&mut &input[..], &cfg, &mut |chunk| {
            out.extend_from_slice(&chunk);
            Ok(())
        })
        .unwrap();

        assert_eq!(out, input);
        assert_eq!(result.uncompressed_size, 10_000);
        assert_eq!(result.compressed_size, 10_000);
        assert_eq!(result.crc32, crc32fast::hash(&input));
        assert_eq!(recorder.started.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.last.load(Ordering::SeqCst), 10_000);
        assert_eq!(recorder.ended.load(Ordering::SeqCst), 10_000);
    }

    #[test]
    fn abort_stops_the_stream() {
        let abort = AbortSignal::new();
        abort.abort();
        let mut cfg = config(1024);
        cfg.aborts = Aborts::new([Some(abort)]);

        let input = vec![0u8; 100];
        let err = run(&mut &input[..], &cfg, &mut |_chunk| Ok(())).unwrap_err();
        assert!(err.is_abort());
    }

    #[test]
    fn pass_through_trusts_supplied_crc_and_size() {
        let payload = b"already-compressed".to_vec();
        let mut cfg = config(7);
        cfg.pass_through = true;
        cfg.known_crc32 = Some(0x1234_5678);
        cfg.declared_size = Some(400);

        let mut out = Vec::new();
        let result = run(&mut &payload[..], &cfg, &mut |chunk| {
            out.extend_from_slice(&chunk);
            Ok(())
        })
        .unwrap();

        assert_eq!(out, payload);
        assert_eq!(result.crc32, 0x1234_5678);
        assert_eq!(result.uncompressed_size, 400);
        assert_eq!(result.compressed_size, payload.len() as u64);
    }

    #[test]
    fn pass_through_computes_missing_crc() {
        let payload = b"raw bytes".to_vec();
        let mut cfg = config(4);
        cfg.pass_through = true;

        let result = run(&mut &payload[..], &cfg, &mut |_chunk| Ok(())).unwrap();
        assert_eq!(result.crc32, crc32fast::hash(&payload));
        assert_eq!(result.uncompressed_size, payload.len() as u64);
    }
}
