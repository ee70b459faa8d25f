pub mod reader;
pub mod writer;

pub use reader::ArchiveReader;
pub use writer::ArchiveWriter;

use crate::error::{Result, SatchelError};

/// Archive file magic.
pub const ARCHIVE_MAGIC: &[u8; 4] = b"SBAK";

/// Archive container format version.
pub const ARCHIVE_VERSION: u8 = 1;

/// Entry flag: payload is DEFLATE-compressed.
pub const FLAG_DEFLATE: u8 = 0b0000_0001;

/// Entry flag: payload is envelope-encrypted (applied after compression).
pub const FLAG_ENCRYPTED: u8 = 0b0000_0010;

const KNOWN_FLAGS: u8 = FLAG_DEFLATE | FLAG_ENCRYPTED;

/// Longest entry name accepted when reading. Defends against scanning
/// garbage as a length prefix.
pub const MAX_ENTRY_NAME_LEN: u32 = 4096;

pub(crate) fn check_flags(flags: u8) -> Result<()> {
    if flags & !KNOWN_FLAGS != 0 {
        return Err(SatchelError::InvalidFormat(format!(
            "unknown archive entry flags: {flags:#010b}"
        )));
    }
    Ok(())
}
