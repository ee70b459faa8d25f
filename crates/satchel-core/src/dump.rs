use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, DbDriver};
use crate::error::{Result, SatchelError};

/// Build the dump tool invocation for one connection.
///
/// `reduced` drops the optional flags (routines, triggers, ownership info)
/// for the automatic second attempt after a failed full dump. Credentials
/// are passed via environment where the tool supports it so they never
/// appear in process listings.
pub fn dump_command(conn: &DatabaseConfig, reduced: bool) -> Command {
    match conn.driver {
        DbDriver::MySql => {
            let mut cmd = Command::new("mysqldump");
            cmd.arg("--host").arg(&conn.host);
            if let Some(port) = conn.port {
                cmd.arg("--port").arg(port.to_string());
            }
            cmd.arg("--user").arg(&conn.username);
            if !conn.password.is_empty() {
                cmd.env("MYSQL_PWD", &conn.password);
            }
            cmd.arg("--single-transaction");
            if !reduced {
                cmd.arg("--routines").arg("--triggers");
            }
            cmd.arg(&conn.database);
            cmd
        }
        DbDriver::Postgres => {
            let mut cmd = Command::new("pg_dump");
            cmd.arg("--host").arg(&conn.host);
            if let Some(port) = conn.port {
                cmd.arg("--port").arg(port.to_string());
            }
            cmd.arg("--username").arg(&conn.username);
            if !conn.password.is_empty() {
                cmd.env("PGPASSWORD", &conn.password);
            }
            cmd.arg("--no-password");
            if !reduced {
                cmd.arg("--no-owner").arg("--no-privileges");
            }
            cmd.arg(&conn.database);
            cmd
        }
        DbDriver::Sqlite => {
            // `database` is the file path; no network, no credentials.
            let mut cmd = Command::new("sqlite3");
            cmd.arg(&conn.database).arg(".dump");
            cmd
        }
    }
}

/// Run the dump tool to completion, capturing stdout.
///
/// A non-zero exit triggers one automatic retry with the reduced flag set;
/// a second failure is a `Dump` error for this connection.
pub fn run_dump(conn: &DatabaseConfig) -> Result<Vec<u8>> {
    info!(connection = %conn.name, driver = conn.driver.as_str(), "dumping database");
    match run_once(conn, false) {
        Ok(bytes) => Ok(bytes),
        Err(err) => {
            warn!(
                connection = %conn.name,
                error = %err,
                "dump failed, retrying with reduced flag set"
            );
            run_once(conn, true)
        }
    }
}

fn run_once(conn: &DatabaseConfig, reduced: bool) -> Result<Vec<u8>> {
    let output = dump_command(conn, reduced)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| SatchelError::Dump {
            connection: conn.name.clone(),
            message: format!("failed to launch dump tool: {e}"),
        })?;
    if !output.status.success() {
        return Err(SatchelError::Dump {
            connection: conn.name.clone(),
            message: format!(
                "dump tool exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    debug!(
        connection = %conn.name,
        bytes = output.stdout.len(),
        reduced,
        "dump complete"
    );
    Ok(output.stdout)
}

/// A running dump process whose stdout is consumed incrementally.
///
/// Used by the chunked path: the producer reads this in fixed blocks and
/// must call `finish` after EOF to surface a non-zero exit.
pub struct DumpStream {
    connection: String,
    child: Child,
    stdout: ChildStdout,
}

impl DumpStream {
    pub fn finish(mut self) -> Result<()> {
        let status = self.child.wait().map_err(|e| SatchelError::Dump {
            connection: self.connection.clone(),
            message: format!("failed to wait for dump tool: {e}"),
        })?;
        if !status.success() {
            return Err(SatchelError::Dump {
                connection: self.connection.clone(),
                message: format!("dump tool exited with {status}"),
            });
        }
        Ok(())
    }
}

impl Read for DumpStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for DumpStream {
    fn drop(&mut self) {
        // Reap the child if the stream is abandoned mid-run.
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Spawn the dump tool and hand back its stdout as a live byte stream.
pub fn spawn_dump(conn: &DatabaseConfig) -> Result<DumpStream> {
    info!(connection = %conn.name, driver = conn.driver.as_str(), "spawning dump stream");
    let mut child = dump_command(conn, false)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| SatchelError::Dump {
            connection: conn.name.clone(),
            message: format!("failed to launch dump tool: {e}"),
        })?;
    let stdout = child.stdout.take().ok_or_else(|| SatchelError::Dump {
        connection: conn.name.clone(),
        message: "dump tool has no stdout".into(),
    })?;
    Ok(DumpStream {
        connection: conn.name.clone(),
        child,
        stdout,
    })
}

const SQLISH_MARKERS: &[&str] = &[
    "--", "/*", "create ", "insert ", "drop ", "set ", "begin", "pragma",
];

/// Sanity-check captured dump output: non-empty, with a plausibly SQL-ish
/// head. Deliberately lenient; the output is otherwise treated as opaque.
pub fn validate_dump(conn: &DatabaseConfig, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(SatchelError::Dump {
            connection: conn.name.clone(),
            message: "dump produced no output".into(),
        });
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(4096)]).to_lowercase();
    let head = head.trim_start();
    if !SQLISH_MARKERS.iter().any(|m| head.contains(m)) {
        return Err(SatchelError::Dump {
            connection: conn.name.clone(),
            message: "dump output does not look like SQL".into(),
        });
    }
    Ok(())
}
