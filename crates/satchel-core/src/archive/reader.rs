use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use flate2::read::DeflateDecoder;

use crate::archive::{check_flags, ARCHIVE_MAGIC, ARCHIVE_VERSION, FLAG_DEFLATE, FLAG_ENCRYPTED};
use crate::crypto::EnvelopeCipher;
use crate::error::{Result, SatchelError};
use crate::manifest::{Manifest, MANIFEST_NAME};

#[derive(Debug)]
struct EntryRecord {
    flags: u8,
    offset: usize,
    stored_len: usize,
}

/// Read-only view over an archive produced by either writer.
///
/// The constructor scans the record stream once and indexes entries by
/// name; payloads are decoded on demand.
#[derive(Debug)]
pub struct ArchiveReader {
    data: Vec<u8>,
    index: BTreeMap<String, EntryRecord>,
    cipher: Option<EnvelopeCipher>,
}

impl ArchiveReader {
    pub fn open(path: impl AsRef<Path>, cipher: Option<EnvelopeCipher>) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?, cipher)
    }

    pub fn from_bytes(data: Vec<u8>, cipher: Option<EnvelopeCipher>) -> Result<Self> {
        if data.len() < 5 || &data[..4] != ARCHIVE_MAGIC {
            return Err(SatchelError::InvalidFormat(
                "not a satchel archive: bad magic".into(),
            ));
        }
        if data[4] != ARCHIVE_VERSION {
            return Err(SatchelError::InvalidFormat(format!(
                "unsupported archive version: {}",
                data[4]
            )));
        }

        let mut index = BTreeMap::new();
        let mut pos = 5usize;
        while pos < data.len() {
            let name_len = read_u32(&data, &mut pos)? as usize;
            if name_len == 0 || name_len > super::MAX_ENTRY_NAME_LEN as usize {
                return Err(SatchelError::InvalidFormat(format!(
                    "archive entry name length out of range: {name_len}"
                )));
            }
            let name_bytes = read_slice(&data, &mut pos, name_len)?;
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| SatchelError::InvalidFormat("entry name is not UTF-8".into()))?
                .to_string();
            let flags = read_slice(&data, &mut pos, 1)?[0];
            check_flags(flags)?;
            let stored_len = read_u64(&data, &mut pos)? as usize;
            let offset = pos;
            read_slice(&data, &mut pos, stored_len)?;
            index.insert(
                name,
                EntryRecord {
                    flags,
                    offset,
                    stored_len,
                },
            );
        }

        Ok(Self {
            data,
            index,
            cipher,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(|k| k.as_str())
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Decode one entry's content, or `None` if the name is absent.
    ///
    /// Reading an encrypted entry without a cipher is an `Encryption`
    /// error ("key not configured"), not a silent skip.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let record = match self.index.get(name) {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut payload = self.data[record.offset..record.offset + record.stored_len].to_vec();

        if record.flags & FLAG_ENCRYPTED != 0 {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                SatchelError::Encryption(format!(
                    "entry '{name}' is encrypted but no key is configured"
                ))
            })?;
            payload = cipher.decrypt(&payload)?;
        }
        if record.flags & FLAG_DEFLATE != 0 {
            payload = inflate(&payload)?;
        }
        Ok(Some(payload))
    }

    /// Parse the embedded `manifest.json`.
    pub fn manifest(&self) -> Result<Manifest> {
        let bytes = self.read(MANIFEST_NAME)?.ok_or_else(|| {
            SatchelError::InvalidFormat("archive has no manifest.json entry".into())
        })?;
        Manifest::from_json(&bytes)
    }
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| SatchelError::InvalidFormat(format!("deflate: {e}")))?;
    Ok(out)
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(read_slice(data, pos, 4)?);
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(read_slice(data, pos, 8)?);
    Ok(u64::from_be_bytes(buf))
}

fn read_slice<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| SatchelError::InvalidFormat("truncated archive record".into()))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}
