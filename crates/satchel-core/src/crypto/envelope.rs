use std::io::{Read, Write};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SatchelError};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Envelope header format version.
pub const ENVELOPE_VERSION: u32 = 2;

/// Cipher identifier written into the header.
pub const ENVELOPE_METHOD: &str = "aes-256-cbc";

/// Plaintext block size for streaming encryption.
const STREAM_BLOCK_SIZE: usize = 8 * 1024;

/// Upper bound on the envelope header; anything larger is corrupt.
const MAX_HEADER_LEN: u32 = 64 * 1024;

/// Header of an encrypted stream, serialized as JSON behind a u32be length
/// prefix. One envelope per encrypted stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    pub version: u32,
    pub method: String,
    /// Base64 of the 16-byte stream IV.
    pub iv: String,
    /// Base64 of `wrap_iv || AES-256-CBC(KEK, wrap_iv, DEK)`.
    pub wrapped_key: String,
    /// First 8 hex chars of SHA-256(master key); identifies which master
    /// key wrapped the DEK. Mismatches are logged, not enforced.
    pub key_id: String,
}

/// Per-run data key. Held in memory only for the duration of the run.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DataKey([u8; 32]);

/// Envelope encryption manager: wraps/unwraps a per-stream data key under a
/// key derived from the long-lived master key, and streams ciphertext as
/// independently encrypted length-prefixed blocks.
pub struct EnvelopeCipher {
    kek: KeyEncryptionKey,
    key_id: String,
}

impl std::fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCipher")
            .field("kek", &"<redacted>")
            .field("key_id", &self.key_id)
            .finish()
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyEncryptionKey([u8; 32]);

impl EnvelopeCipher {
    /// Derive the KEK as SHA-256 of the master key bytes.
    pub fn new(master_key: &str) -> Result<Self> {
        if master_key.is_empty() {
            return Err(SatchelError::Config(
                "encryption master key is empty".into(),
            ));
        }
        let digest = Sha256::digest(master_key.as_bytes());
        let mut kek = [0u8; 32];
        kek.copy_from_slice(&digest);
        let key_id = hex::encode(&digest[..4]);
        Ok(Self {
            kek: KeyEncryptionKey(kek),
            key_id,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Encrypt `plaintext` from the reader into the writer.
    ///
    /// Output layout: `u32be header_len | header JSON` followed by
    /// `u32be block_len | cipher_block` for each 8 KiB plaintext block,
    /// every block encrypted independently under the stream DEK/IV.
    pub fn encrypt_stream(&self, mut plaintext: impl Read, out: &mut impl Write) -> Result<()> {
        let mut dek = DataKey([0u8; 32]);
        OsRng.fill_bytes(&mut dek.0);
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut iv);

        let header = EnvelopeHeader {
            version: ENVELOPE_VERSION,
            method: ENVELOPE_METHOD.to_string(),
            iv: BASE64.encode(iv),
            wrapped_key: BASE64.encode(self.wrap_key(&dek.0)),
            key_id: self.key_id.clone(),
        };
        let header_json = serde_json::to_vec(&header)?;
        out.write_all(&(header_json.len() as u32).to_be_bytes())?;
        out.write_all(&header_json)?;

        let mut block = [0u8; STREAM_BLOCK_SIZE];
        loop {
            let n = read_block(&mut plaintext, &mut block)?;
            if n == 0 {
                break;
            }
            let cipher_block = Aes256CbcEnc::new(&dek.0.into(), &iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(&block[..n]);
            out.write_all(&(cipher_block.len() as u32).to_be_bytes())?;
            out.write_all(&cipher_block)?;
        }
        Ok(())
    }

    /// Reverse of [`encrypt_stream`]. Any malformed header, unwrap failure,
    /// or block decryption failure is reported as `DecryptionFailed`.
    pub fn decrypt_stream(&self, mut input: impl Read, out: &mut impl Write) -> Result<()> {
        let header = read_header(&mut input)?;
        if header.version != ENVELOPE_VERSION {
            return Err(SatchelError::InvalidFormat(format!(
                "unsupported envelope version: {}",
                header.version
            )));
        }
        if header.method != ENVELOPE_METHOD {
            return Err(SatchelError::InvalidFormat(format!(
                "unsupported envelope method: '{}'",
                header.method
            )));
        }
        if header.key_id != self.key_id {
            tracing::warn!(
                expected = %self.key_id,
                found = %header.key_id,
                "envelope key id does not match configured master key"
            );
        }

        let iv: [u8; 16] = BASE64
            .decode(&header.iv)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(SatchelError::DecryptionFailed)?;
        let wrapped = BASE64
            .decode(&header.wrapped_key)
            .map_err(|_| SatchelError::DecryptionFailed)?;
        let dek = self.unwrap_key(&wrapped)?;

        loop {
            let mut len_buf = [0u8; 4];
            match input.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let block_len = u32::from_be_bytes(len_buf) as usize;
            if block_len == 0 || block_len > STREAM_BLOCK_SIZE + 16 {
                return Err(SatchelError::DecryptionFailed);
            }
            let mut cipher_block = vec![0u8; block_len];
            input
                .read_exact(&mut cipher_block)
                .map_err(|_| SatchelError::DecryptionFailed)?;
            let plain = Aes256CbcDec::new(&dek.0.into(), &iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(&cipher_block)
                .map_err(|_| SatchelError::DecryptionFailed)?;
            out.write_all(&plain)?;
        }
        Ok(())
    }

    /// Convenience wrappers over the streaming API for in-memory payloads.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + 256);
        self.encrypt_stream(plaintext, &mut out)?;
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len());
        self.decrypt_stream(data, &mut out)?;
        Ok(out)
    }

    /// `wrapped = wrap_iv || AES-256-CBC(KEK, wrap_iv, DEK)`.
    fn wrap_key(&self, dek: &[u8; 32]) -> Vec<u8> {
        let mut wrap_iv = [0u8; 16];
        OsRng.fill_bytes(&mut wrap_iv);
        let ciphertext = Aes256CbcEnc::new(&self.kek.0.into(), &wrap_iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(dek);
        let mut out = Vec::with_capacity(16 + ciphertext.len());
        out.extend_from_slice(&wrap_iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey> {
        if wrapped.len() <= 16 {
            return Err(SatchelError::DecryptionFailed);
        }
        let (wrap_iv, ciphertext) = wrapped.split_at(16);
        let iv: [u8; 16] = wrap_iv.try_into().map_err(|_| SatchelError::DecryptionFailed)?;
        let plain = Aes256CbcDec::new(&self.kek.0.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| SatchelError::DecryptionFailed)?;
        let key: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| SatchelError::DecryptionFailed)?;
        Ok(DataKey(key))
    }
}

fn read_header(input: &mut impl Read) -> Result<EnvelopeHeader> {
    let mut len_buf = [0u8; 4];
    input
        .read_exact(&mut len_buf)
        .map_err(|_| SatchelError::DecryptionFailed)?;
    let header_len = u32::from_be_bytes(len_buf);
    if header_len == 0 || header_len > MAX_HEADER_LEN {
        return Err(SatchelError::DecryptionFailed);
    }
    let mut header_json = vec![0u8; header_len as usize];
    input
        .read_exact(&mut header_json)
        .map_err(|_| SatchelError::DecryptionFailed)?;
    serde_json::from_slice(&header_json).map_err(|_| SatchelError::DecryptionFailed)
}

/// Fill `buf` as far as the reader allows; returns bytes read (0 = EOF).
fn read_block(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
