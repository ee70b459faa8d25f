use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::DeflateEncoder;
use flate2::Compression;
use tracing::debug;

use crate::archive::{ARCHIVE_MAGIC, ARCHIVE_VERSION, FLAG_DEFLATE, FLAG_ENCRYPTED};
use crate::crypto::EnvelopeCipher;
use crate::error::{Result, SatchelError};

/// Writes one archive file entry by entry.
///
/// Each entry payload is DEFLATE-compressed at the configured level and,
/// when a cipher is present, envelope-encrypted on top. The writer owns the
/// output exclusively until `finalize`; entries are buffered into a temp
/// file and atomically renamed into place so a failed run never leaves a
/// half-written archive at the target path.
pub struct ArchiveWriter {
    tmp: Option<tempfile::NamedTempFile>,
    target: PathBuf,
    level: u32,
    cipher: Option<EnvelopeCipher>,
    entry_count: usize,
}

impl ArchiveWriter {
    pub fn create(target: impl Into<PathBuf>, level: u32, cipher: Option<EnvelopeCipher>) -> Result<Self> {
        let target = target.into();
        if !(1..=9).contains(&level) {
            return Err(SatchelError::Config(format!(
                "compression level must be 1-9, got {level}"
            )));
        }
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(ARCHIVE_MAGIC)?;
        tmp.write_all(&[ARCHIVE_VERSION])?;
        Ok(Self {
            tmp: Some(tmp),
            target,
            level,
            cipher,
            entry_count: 0,
        })
    }

    pub fn is_encrypting(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Append one entry. Record layout:
    /// `u32be name_len | name | u8 flags | u64be stored_len | stored bytes`.
    pub fn add_entry(&mut self, name: &str, content: &[u8]) -> Result<()> {
        if name.is_empty() || name.len() > super::MAX_ENTRY_NAME_LEN as usize {
            return Err(SatchelError::InvalidFormat(format!(
                "invalid archive entry name: '{name}'"
            )));
        }

        let mut flags = FLAG_DEFLATE;
        let mut stored = deflate(content, self.level)?;
        if let Some(cipher) = &self.cipher {
            stored = cipher.encrypt(&stored)?;
            flags |= FLAG_ENCRYPTED;
        }

        let out = self
            .tmp
            .as_mut()
            .ok_or_else(|| SatchelError::Other("archive writer already finalized".into()))?;
        out.write_all(&(name.len() as u32).to_be_bytes())?;
        out.write_all(name.as_bytes())?;
        out.write_all(&[flags])?;
        out.write_all(&(stored.len() as u64).to_be_bytes())?;
        out.write_all(&stored)?;
        self.entry_count += 1;

        debug!(
            entry = name,
            plain = content.len(),
            stored = stored.len(),
            "archive entry written"
        );
        Ok(())
    }

    /// Flush and atomically move the archive into place. Returns the final
    /// size in bytes. If this fails the whole run fails; there is no
    /// partial-archive recovery.
    pub fn finalize(mut self) -> Result<u64> {
        let mut tmp = self
            .tmp
            .take()
            .ok_or_else(|| SatchelError::Other("archive writer already finalized".into()))?;
        tmp.flush()?;
        let size = tmp.as_file().metadata()?.len();
        tmp.persist(&self.target).map_err(|e| e.error)?;
        Ok(size)
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

pub(crate) fn deflate(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
