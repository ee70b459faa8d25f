use std::path::Path;

use tracing::{error, info, warn};

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::backup::{cipher_for, walk_file_set, RunOutcome};
use crate::config::BackupConfig;
use crate::dump::{run_dump, validate_dump};
use crate::error::Result;
use crate::filter::FilterChain;
use crate::manifest::{ManifestBuilder, MANIFEST_NAME};
use crate::verify::verify_archive;

/// Direct single-process path: dump databases and walk file roots straight
/// into one archive on local disk, then self-verify it.
///
/// Strictly sequential; the archive handle is exclusively owned for the
/// whole construction. A database connection whose dump fails (after the
/// reduced-flag retry) is skipped with a warning; everything else fatal
/// unwinds here and is recorded in the outcome.
pub fn run(config: &BackupConfig, target: &Path) -> RunOutcome {
    match try_run(config, target) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "direct backup run failed");
            RunOutcome::failure(None, e.to_string())
        }
    }
}

fn try_run(config: &BackupConfig, target: &Path) -> Result<RunOutcome> {
    config.validate()?;
    let cipher = cipher_for(config)?;
    let mut writer = ArchiveWriter::create(target, config.compression_level, cipher)?;
    let mut builder = ManifestBuilder::new(config);

    for conn in config.databases.iter().filter(|d| d.enabled) {
        let dump = run_dump(conn).and_then(|bytes| {
            validate_dump(conn, &bytes)?;
            Ok(bytes)
        });
        let bytes = match dump {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(connection = %conn.name, error = %e, "skipping connection after failed dump");
                continue;
            }
        };
        let entry = format!("database/{}.sql", conn.name);
        writer.add_entry(&entry, &bytes)?;
        builder.add_entry(entry, &bytes);
    }

    let chain = FilterChain::from_config(&config.filters);
    for set in &config.files {
        for (relative, absolute) in walk_file_set(Path::new(&set.root), &chain)? {
            let content = std::fs::read(&absolute)?;
            let entry = format!("files/{relative}");
            writer.add_entry(&entry, &content)?;
            builder.add_entry(entry, &content);
        }
    }

    let manifest = builder.build(false)?;
    let entry_count = manifest.entries.len();
    writer.add_entry(MANIFEST_NAME, &manifest.to_json()?)?;
    let size_bytes = writer.finalize()?;
    info!(
        target = %target.display(),
        entries = entry_count,
        bytes = size_bytes,
        "archive written"
    );

    let reader = ArchiveReader::open(target, cipher_for(config)?)?;
    let verification = verify_archive(&reader)?;
    if !verification.is_ok() {
        return Ok(RunOutcome::failure(
            Some(target.to_path_buf()),
            verification.summary(),
        ));
    }
    Ok(RunOutcome::success(
        target.to_path_buf(),
        size_bytes,
        entry_count,
    ))
}
