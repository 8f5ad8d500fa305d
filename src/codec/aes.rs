//! WinZip AES (AE-2) encryption wrapper around an inner codec.
//!
//! Frame layout: salt (8/12/16 bytes by strength), 2-byte password
//! verifier, AES-CTR ciphertext of the inner codec's output, then a 10-byte
//! authentication tag (truncated HMAC-SHA1 over the ciphertext). The CTR
//! counter is 16 bytes little-endian starting at 1, per the WinZip AE spec;
//! that rules out the standard big-endian CTR modes, so the keystream is
//! produced from the raw block cipher.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use zeroize::Zeroize;

use crate::codec::{Codec, CodecResult, ChunkSink};
use crate::result::{ZipError, ZipResult};
use crate::types::AesMode;

/// Iteration count fixed by the WinZip AE specification.
const KEY_DERIVATION_ROUNDS: u32 = 1000;
const VERIFIER_LENGTH: usize = 2;
const AUTH_TAG_LENGTH: usize = 10;
const BLOCK_LENGTH: usize = 16;

enum AesCipher {
    Aes128(Box<aes::Aes128>),
    Aes192(Box<aes::Aes192>),
    Aes256(Box<aes::Aes256>),
}

impl AesCipher {
    fn new(mode: AesMode, key: &[u8]) -> Self {
        match mode {
            AesMode::Aes128 => {
                AesCipher::Aes128(Box::new(aes::Aes128::new(GenericArray::from_slice(key))))
            }
            AesMode::Aes192 => {
                AesCipher::Aes192(Box::new(aes::Aes192::new(GenericArray::from_slice(key))))
            }
            AesMode::Aes256 => {
                AesCipher::Aes256(Box::new(aes::Aes256::new(GenericArray::from_slice(key))))
            }
        }
    }

    fn encrypt_block(&self, block: &mut [u8; BLOCK_LENGTH]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            AesCipher::Aes128(cipher) => cipher.encrypt_block(block),
            AesCipher::Aes192(cipher) => cipher.encrypt_block(block),
            AesCipher::Aes256(cipher) => cipher.encrypt_block(block),
        }
    }
}

/// Little-endian counter-mode keystream, carried across chunk boundaries.
struct KeyStream {
    cipher: AesCipher,
    counter: u128,
    buffer: [u8; BLOCK_LENGTH],
    pos: usize,
}

impl KeyStream {
    fn new(cipher: AesCipher) -> Self {
        KeyStream {
            cipher,
            counter: 1,
            buffer: [0u8; BLOCK_LENGTH],
            pos: BLOCK_LENGTH,
        }
    }

    fn xor(&mut self, data: &mut [u8]) {
        for byte in data {
            if self.pos == BLOCK_LENGTH {
                self.buffer = self.counter.to_le_bytes();
                self.cipher.encrypt_block(&mut self.buffer);
                self.counter = self.counter.wrapping_add(1);
                self.pos = 0;
            }
            *byte ^= self.buffer[self.pos];
            self.pos += 1;
        }
    }
}

pub(crate) struct AesCodec {
    inner: Box<dyn Codec>,
    keystream: KeyStream,
    hmac: Option<Hmac<Sha1>>,
    /// Salt plus verifier, emitted ahead of the first ciphertext chunk.
    header: Option<Vec<u8>>,
    output_bytes: u64,
    finished: bool,
}

impl AesCodec {
    pub(crate) fn new(
        inner: Box<dyn Codec>,
        mode: AesMode,
        password: &str,
    ) -> ZipResult<AesCodec> {
        let mut salt = vec![0u8; mode.salt_length()];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self::with_salt(inner, mode, password, salt)
    }

    fn with_salt(
        inner: Box<dyn Codec>,
        mode: AesMode,
        password: &str,
        salt: Vec<u8>,
    ) -> ZipResult<AesCodec> {
        let key_length = mode.key_length();
        let mut derived = vec![0u8; 2 * key_length + VERIFIER_LENGTH];
        pbkdf2::pbkdf2_hmac::<Sha1>(
            password.as_bytes(),
            &salt,
            KEY_DERIVATION_ROUNDS,
            &mut derived,
        );

        let cipher = AesCipher::new(mode, &derived[..key_length]);
        let hmac = <Hmac<Sha1> as Mac>::new_from_slice(&derived[key_length..2 * key_length])
            .map_err(|err| ZipError::Codec(format!("hmac init failed: {err}").into()))?;

        let mut header = salt;
        header.extend_from_slice(&derived[2 * key_length..]);
        derived.zeroize();

        Ok(AesCodec {
            inner,
            keystream: KeyStream::new(cipher),
            hmac: Some(hmac),
            header: Some(header),
            output_bytes: 0,
            finished: false,
        })
    }

    fn emit_header(&mut self, out: &mut ChunkSink) -> ZipResult<()> {
        if let Some(header) = self.header.take() {
            self.output_bytes += header.len() as u64;
            out(header)?;
        }
        Ok(())
    }
}

impl Codec for AesCodec {
    fn update(&mut self, chunk: &[u8], out: &mut ChunkSink) -> ZipResult<()> {
        if self.finished {
            return Err(ZipError::Codec("codec used after a failure".into()));
        }
        self.emit_header(out)?;

        let keystream = &mut self.keystream;
        let hmac = &mut self.hmac;
        let output_bytes = &mut self.output_bytes;
        self.inner.update(chunk, &mut |mut produced: Vec<u8>| {
            keystream.xor(&mut produced);
            if let Some(hmac) = hmac.as_mut() {
                hmac.update(&produced);
            }
            *output_bytes += produced.len() as u64;
            out(produced)
        })
    }

    fn finish(&mut self, out: &mut ChunkSink) -> ZipResult<CodecResult> {
        if self.finished {
            return Err(ZipError::Codec("codec used after a failure".into()));
        }
        self.finished = true;
        self.emit_header(out)?;

        let keystream = &mut self.keystream;
        let hmac = &mut self.hmac;
        let output_bytes = &mut self.output_bytes;
        let inner = self.inner.finish(&mut |mut produced: Vec<u8>| {
            keystream.xor(&mut produced);
            if let Some(hmac) = hmac.as_mut() {
                hmac.update(&produced);
            }
            *output_bytes += produced.len() as u64;
            out(produced)
        })?;

        let hmac = self
            .hmac
            .take()
            .ok_or_else(|| ZipError::Codec("authentication state lost".into()))?;
        let tag = hmac.finalize().into_bytes();
        self.output_bytes += AUTH_TAG_LENGTH as u64;
        out(tag[..AUTH_TAG_LENGTH].to_vec())?;

        Ok(CodecResult {
            input_bytes: inner.input_bytes,
            output_bytes: self.output_bytes,
            // AE-2 drops the CRC check; headers record 0
            signature: 0,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::StoreCodec;

    fn derive(mode: AesMode, password: &str, salt: &[u8]) -> Vec<u8> {
        let mut derived = vec![0u8; 2 * mode.key_length() + VERIFIER_LENGTH];
        pbkdf2::pbkdf2_hmac::<Sha1>(
            password.as_bytes(),
            salt,
            KEY_DERIVATION_ROUNDS,
            &mut derived,
        );
        derived
    }

    fn run_aes(mode: AesMode, password: &str, salt: &[u8], input: &[u8]) -> (Vec<u8>, CodecResult) {
        let mut codec = AesCodec::with_salt(
            Box::new(StoreCodec::new()),
            mode,
            password,
            salt.to_vec(),
        )
        .unwrap();
        let mut produced = Vec::new();
        {
            let mut sink = |chunk: Vec<u8>| {
                produced.extend_from_slice(&chunk);
                Ok(())
            };
            for chunk in input.chunks(7) {
                codec.update(chunk, &mut sink).unwrap();
            }
        }
        let mut sink = |chunk: Vec<u8>| {
            produced.extend_from_slice(&chunk);
            Ok(())
        };
        let result = codec.finish(&mut sink).unwrap();
        (produced, result)
    }

    #[test]
    fn framing_and_sizes() {
        let salt = [7u8; 16];
        let input = b"the quick brown fox jumps over the lazy dog";
        let (produced, result) = run_aes(AesMode::Aes256, "secret", &salt, input);

        assert_eq!(
            produced.len(),
            16 + VERIFIER_LENGTH + input.len() + AUTH_TAG_LENGTH
        );
        assert_eq!(result.output_bytes, produced.len() as u64);
        assert_eq!(result.input_bytes, input.len() as u64);
        assert_eq!(result.signature, 0);
        assert_eq!(&produced[..16], &salt);
    }

    #[test]
    fn verifier_matches_derived_key_material() {
        let salt = [3u8; 8];
        let (produced, _) = run_aes(AesMode::Aes128, "pw", &salt, b"payload");
        let derived = derive(AesMode::Aes128, "pw", &salt);
        assert_eq!(&produced[8..10], &derived[32..34]);
    }

    #[test]
    fn ciphertext_decrypts_and_authenticates() {
        let salt = [9u8; 16];
        let password = "hunter2";
        let input: Vec<u8> = (0u16..1000).flat_map(|i| i.to_le_bytes()).collect();
        let (produced, _) = run_aes(AesMode::Aes256, password, &salt, &input);

        let derived = derive(AesMode::Aes256, password, &salt);
        let body_start = 16 + VERIFIER_LENGTH;
        let body_end = produced.len() - AUTH_TAG_LENGTH;
        let mut body = produced[body_start..body_end].to_vec();

        let mut hmac = <Hmac<Sha1> as Mac>::new_from_slice(&derived[32..64]).unwrap();
        hmac.update(&body);
        let tag = hmac.finalize().into_bytes();
        assert_eq!(&tag[..AUTH_TAG_LENGTH], &produced[body_end..]);

        // CTR is symmetric; xor with the same keystream restores the input
        let cipher = AesCipher::new(AesMode::Aes256, &derived[..32]);
        let mut keystream = KeyStream::new(cipher);
        keystream.xor(&mut body);
        assert_eq!(body, input);
    }

    #[test]
    fn empty_payload_still_emits_salt_verifier_and_tag() {
        let salt = [1u8; 12];
        let (produced, result) = run_aes(AesMode::Aes192, "pw", &salt, b"");
        assert_eq!(produced.len(), 12 + VERIFIER_LENGTH + AUTH_TAG_LENGTH);
        assert_eq!(result.output_bytes, produced.len() as u64);
    }
}
