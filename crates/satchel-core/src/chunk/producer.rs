use std::io::Read;

use crossbeam_channel::Sender;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::chunk::collator::FramingMode;
use crate::chunk::{chunk_name, Chunk, SourceKind};
use crate::error::{Result, SatchelError};

/// Fixed read block size for database dump streams.
pub const DB_READ_BLOCK: usize = 8 * 1024;

/// Encode one file as a self-describing framing record:
/// `u32be path_len | path | u32be content_len | content`.
pub fn encode_file_record(rel_path: &str, content: &[u8]) -> Result<Vec<u8>> {
    let path = rel_path.as_bytes();
    if path.is_empty() || u32::try_from(path.len()).is_err() {
        return Err(SatchelError::InvalidFormat(format!(
            "file record path length out of range: {}",
            path.len()
        )));
    }
    let content_len = u32::try_from(content.len()).map_err(|_| {
        SatchelError::InvalidFormat(format!(
            "file '{rel_path}' too large for framing record: {} bytes",
            content.len()
        ))
    })?;
    let mut record = Vec::with_capacity(8 + path.len() + content.len());
    record.extend_from_slice(&(path.len() as u32).to_be_bytes());
    record.extend_from_slice(path);
    record.extend_from_slice(&content_len.to_be_bytes());
    record.extend_from_slice(content);
    Ok(record)
}

/// Decode a concatenated sequence of framing records back into
/// `(path, content)` pairs.
///
/// A malformed or truncated trailing record stops the scan: silently (with
/// a warning log) in `Lenient` mode, as an `InvalidFormat` error in
/// `Strict` mode.
pub fn decode_file_records(buf: &[u8], mode: FramingMode) -> Result<Vec<(String, Vec<u8>)>> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < buf.len() {
        match decode_one(buf, pos) {
            Some((path, content, next)) => {
                records.push((path, content));
                pos = next;
            }
            None => {
                let trailing = buf.len() - pos;
                match mode {
                    FramingMode::Strict => {
                        return Err(SatchelError::InvalidFormat(format!(
                            "truncated file record at offset {pos} ({trailing} trailing bytes)"
                        )));
                    }
                    FramingMode::Lenient => {
                        warn!(
                            offset = pos,
                            trailing, "truncated trailing file record, stopping reconstruction"
                        );
                        break;
                    }
                }
            }
        }
    }
    Ok(records)
}

fn decode_one(buf: &[u8], pos: usize) -> Option<(String, Vec<u8>, usize)> {
    let path_len = read_u32(buf, pos)? as usize;
    let path_start = pos + 4;
    let path_end = path_start.checked_add(path_len)?;
    let path = std::str::from_utf8(buf.get(path_start..path_end)?).ok()?;
    let content_len = read_u32(buf, path_end)? as usize;
    let content_start = path_end + 4;
    let content_end = content_start.checked_add(content_len)?;
    let content = buf.get(content_start..content_end)?;
    Some((path.to_string(), content.to_vec(), content_end))
}

fn read_u32(buf: &[u8], pos: usize) -> Option<u32> {
    let bytes = buf.get(pos..pos + 4)?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    Some(u32::from_be_bytes(arr))
}

/// Push-based chunk producer for one base name.
///
/// Completed chunks are sent into a bounded channel immediately; when the
/// channel is full the producer blocks until an upload slot frees, which
/// bounds peak memory to roughly `max_concurrent * chunk_size`.
pub struct ChunkSink<'a> {
    tx: &'a Sender<Chunk>,
    base_name: String,
    kind: SourceKind,
    chunk_size: usize,
    buffer: Vec<u8>,
    next_index: u32,
}

impl<'a> ChunkSink<'a> {
    pub fn new(tx: &'a Sender<Chunk>, base_name: String, kind: SourceKind, chunk_size: usize) -> Self {
        Self {
            tx,
            base_name,
            kind,
            chunk_size,
            buffer: Vec::with_capacity(chunk_size.min(64 * 1024)),
            next_index: 0,
        }
    }

    /// Stream a database dump into raw-concatenation chunks.
    ///
    /// Reads fixed 8 KiB blocks into the rolling buffer; once the buffer
    /// reaches or exceeds `chunk_size` it is flushed whole as one chunk.
    /// Returns the total byte count and SHA-256 hex of the full stream.
    pub fn stream_database(&mut self, mut source: impl Read) -> Result<(u64, String)> {
        let mut block = [0u8; DB_READ_BLOCK];
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;

        loop {
            let n = source.read(&mut block)?;
            if n == 0 {
                break;
            }
            hasher.update(&block[..n]);
            total += n as u64;
            self.buffer.extend_from_slice(&block[..n]);
            if self.buffer.len() >= self.chunk_size {
                self.flush()?;
            }
        }
        Ok((total, hex::encode(hasher.finalize())))
    }

    /// Append one file as a framing record.
    ///
    /// If the buffer has already reached `chunk_size`, it is flushed before
    /// the new record is appended. Chunk size is a soft lower bound: a
    /// record larger than `chunk_size` still lands in one chunk, never
    /// split across two.
    pub fn append_file_record(&mut self, rel_path: &str, content: &[u8]) -> Result<()> {
        if !self.buffer.is_empty() && self.buffer.len() >= self.chunk_size {
            self.flush()?;
        }
        let record = encode_file_record(rel_path, content)?;
        self.buffer.extend_from_slice(&record);
        Ok(())
    }

    /// Push raw bytes as one single chunk regardless of size. Used for the
    /// manifest chunk, which is always exactly one chunk at index 0.
    pub fn push_blob(&mut self, payload: Vec<u8>) -> Result<()> {
        self.flush()?;
        self.buffer = payload;
        self.flush()
    }

    /// Flush any remaining buffered bytes and return the chunk count.
    pub fn finish(mut self) -> Result<u32> {
        self.flush()?;
        Ok(self.next_index)
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut self.buffer);
        let chunk = Chunk {
            name: chunk_name(&self.base_name, self.next_index),
            base_name: self.base_name.clone(),
            kind: self.kind,
            index: self.next_index,
            payload,
        };
        debug!(
            chunk = %chunk.name,
            bytes = chunk.payload.len(),
            "chunk flushed"
        );
        self.next_index += 1;
        self.tx
            .send(chunk)
            .map_err(|_| SatchelError::Other("chunk channel closed".into()))
    }
}
