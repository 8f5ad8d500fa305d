//! The per-entry byte transformation contract.
//!
//! A codec is a stateful transformer with the lifecycle
//! `update(chunk)* -> finish()`. Each call may emit zero or more output
//! chunks through the caller's sink; `finish` returns the totals the entry
//! pipeline records (input/output byte counts and the CRC-32 signature).
//! A codec that has failed once is poisoned and refuses further calls.

use crate::result::{ZipError, ZipResult};
use crc32fast::Hasher;

#[cfg(feature = "aes-crypto")]
pub(crate) mod aes;

/// Where codec output chunks go. Chunks are moved, never borrowed back.
pub(crate) type ChunkSink<'a> = dyn FnMut(Vec<u8>) -> ZipResult<()> + 'a;

/// Computed values returned alongside the final output chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecResult {
    /// Sum of the lengths of all input chunks.
    pub input_bytes: u64,
    /// Sum of the lengths of all emitted chunks.
    pub output_bytes: u64,
    /// CRC-32 of the input bytes, unless the concrete codec defines
    /// otherwise (the AES wrapper reports 0).
    pub signature: u32,
}

pub(crate) trait Codec: Send {
    fn update(&mut self, chunk: &[u8], out: &mut ChunkSink) -> ZipResult<()>;

    fn finish(&mut self, out: &mut ChunkSink) -> ZipResult<CodecResult>;
}

fn poisoned<T>() -> ZipResult<T> {
    Err(ZipError::Codec("codec used after a failure".into()))
}

/// Identity codec for stored entries; still tracks counts and the CRC.
pub(crate) struct StoreCodec {
    hasher: Hasher,
    input_bytes: u64,
    finished: bool,
}

impl StoreCodec {
    pub(crate) fn new() -> Self {
        StoreCodec {
            hasher: Hasher::new(),
            input_bytes: 0,
            finished: false,
        }
    }
}

impl Codec for StoreCodec {
    fn update(&mut self, chunk: &[u8], out: &mut ChunkSink) -> ZipResult<()> {
        if self.finished {
            return poisoned();
        }
        self.hasher.update(chunk);
        self.input_bytes += chunk.len() as u64;
        if !chunk.is_empty() {
            out(chunk.to_vec())?;
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut ChunkSink) -> ZipResult<CodecResult> {
        if self.finished {
            return poisoned();
        }
        self.finished = true;
        Ok(CodecResult {
            input_bytes: self.input_bytes,
            output_bytes: self.input_bytes,
            signature: self.hasher.clone().finalize(),
        })
    }
}

/// RFC 1951 raw deflate via flate2.
#[cfg(feature = "deflate")]
pub(crate) struct DeflateCodec {
    encoder: Option<flate2::write::DeflateEncoder<Vec<u8>>>,
    hasher: Hasher,
    input_bytes: u64,
    output_bytes: u64,
}

#[cfg(feature = "deflate")]
impl DeflateCodec {
    pub(crate) fn new(level: u32) -> Self {
        let compression = flate2::Compression::new(level.clamp(1, 9));
        DeflateCodec {
            encoder: Some(flate2::write::DeflateEncoder::new(Vec::new(), compression)),
            hasher: Hasher::new(),
            input_bytes: 0,
            output_bytes: 0,
        }
    }

    fn drain(&mut self, out: &mut ChunkSink) -> ZipResult<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return poisoned();
        };
        if !encoder.get_ref().is_empty() {
            let produced = std::mem::take(encoder.get_mut());
            self.output_bytes += produced.len() as u64;
            out(produced)?;
        }
        Ok(())
    }
}

#[cfg(feature = "deflate")]
impl Codec for DeflateCodec {
    fn update(&mut self, chunk: &[u8], out: &mut ChunkSink) -> ZipResult<()> {
        use std::io::Write;

        let Some(encoder) = self.encoder.as_mut() else {
            return poisoned();
        };
        if let Err(err) = encoder.write_all(chunk) {
            self.encoder = None;
            return Err(ZipError::Codec(format!("deflate failed: {err}").into()));
        }
        self.hasher.update(chunk);
        self.input_bytes += chunk.len() as u64;
        self.drain(out)
    }

    fn finish(&mut self, out: &mut ChunkSink) -> ZipResult<CodecResult> {
        let Some(encoder) = self.encoder.take() else {
            return poisoned();
        };
        let tail = match encoder.finish() {
            Ok(tail) => tail,
            Err(err) => {
                return Err(ZipError::Codec(format!("deflate failed: {err}").into()));
            }
        };
        if !tail.is_empty() {
            self.output_bytes += tail.len() as u64;
            out(tail)?;
        }
        Ok(CodecResult {
            input_bytes: self.input_bytes,
            output_bytes: self.output_bytes,
            signature: self.hasher.clone().finalize(),
        })
    }
}

/// Builds the codec stack for an entry: store or deflate, optionally wrapped
/// in the WinZip AES encrypter.
pub(crate) fn build(
    level: u32,
    encryption: Option<(crate::types::AesMode, &str)>,
) -> ZipResult<Box<dyn Codec>> {
    let inner: Box<dyn Codec> = if level == 0 {
        Box::new(StoreCodec::new())
    } else {
        #[cfg(feature = "deflate")]
        {
            Box::new(DeflateCodec::new(level))
        }
        #[cfg(not(feature = "deflate"))]
        {
            return Err(ZipError::InvalidArgument(
                "compression level > 0 requires the `deflate` feature".into(),
            ));
        }
    };

    match encryption {
        None => Ok(inner),
        #[cfg(feature = "aes-crypto")]
        Some((mode, password)) => Ok(Box::new(aes::AesCodec::new(inner, mode, password)?)),
        #[cfg(not(feature = "aes-crypto"))]
        Some(_) => Err(ZipError::InvalidArgument(
            "passwords require the `aes-crypto` feature".into(),
        )),
    }
}
