use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::archive::ArchiveReader;
use crate::error::Result;
use crate::manifest::Manifest;

/// Cap on collected human-readable error strings.
const MAX_ERRORS: usize = 5;

/// Outcome of one verification pass. Produced fresh on every call and
/// never persisted by this crate.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub checked: usize,
    pub failed: usize,
    /// Up to [`MAX_ERRORS`] human-readable failure descriptions.
    pub errors: Vec<String>,
}

impl VerificationResult {
    pub fn is_ok(&self) -> bool {
        self.failed == 0
    }

    pub fn summary(&self) -> String {
        if self.is_ok() {
            format!("{} entries verified", self.checked)
        } else {
            format!(
                "{} of {} entries failed verification: {}",
                self.failed,
                self.checked,
                self.errors.join("; ")
            )
        }
    }

    fn record(&mut self, message: String) {
        self.failed += 1;
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(message);
        }
    }
}

/// Check every manifest entry of an archive against its stored content.
///
/// Content mismatches are reported in the structured result, never as an
/// error; the only `Err` cases are a missing or unparseable manifest. The
/// same pass serves the post-construction self-check and the re-download
/// audit, which differ only in where the archive bytes come from.
///
/// A manifest size of exactly 0 disables the size comparison for that
/// entry. Long-standing behavior that callers rely on; a genuinely empty
/// file's size is therefore never validated.
pub fn verify_archive(reader: &ArchiveReader) -> Result<VerificationResult> {
    let manifest = reader.manifest()?;
    Ok(verify_against(reader, &manifest))
}

pub fn verify_against(reader: &ArchiveReader, manifest: &Manifest) -> VerificationResult {
    let mut result = VerificationResult {
        checked: 0,
        failed: 0,
        errors: Vec::new(),
    };

    for entry in &manifest.entries {
        result.checked += 1;
        let content = match reader.read(&entry.path) {
            Ok(Some(content)) => content,
            Ok(None) => {
                result.record(format!("'{}': missing from archive", entry.path));
                continue;
            }
            Err(e) => {
                result.record(format!("'{}': unreadable: {e}", entry.path));
                continue;
            }
        };

        if entry.size != 0 && content.len() as u64 != entry.size {
            result.record(format!(
                "'{}': size mismatch: manifest says {}, archive holds {}",
                entry.path,
                entry.size,
                content.len()
            ));
            continue;
        }

        if !entry.sha256.is_empty() && !hash_matches(&entry.sha256, &content) {
            result.record(format!("'{}': sha256 mismatch", entry.path));
        }
    }

    if result.is_ok() {
        info!(checked = result.checked, "archive verification passed");
    } else {
        warn!(
            checked = result.checked,
            failed = result.failed,
            "archive verification failed"
        );
    }
    result
}

fn hash_matches(expected_hex: &str, content: &[u8]) -> bool {
    let expected = match hex::decode(expected_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let actual = Sha256::digest(content);
    expected.ct_eq(actual.as_slice()).into()
}
