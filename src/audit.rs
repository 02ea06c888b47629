//! Append-only audit log kept in the work root.
//!
//! Each line reads `{timestamp} - {LEVEL} - {message}`. The file is meant
//! for humans tailing a run, so there are no structured fields and no
//! rotation. Every write is mirrored to `tracing` for developer diagnostics.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::config::paths;

/// Default number of lines returned by [`AuditLog::tail`].
pub const DEFAULT_TAIL_LINES: usize = 500;

/// Severity written into the audit line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit log sink keyed by work root.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Open the audit log for a work root. The file is created on first write.
    pub fn for_root(work_root: &Path) -> Self {
        Self {
            path: paths::log_file(work_root),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.write(AuditLevel::Info, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.write(AuditLevel::Warning, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.write(AuditLevel::Error, message.as_ref());
    }

    /// Append one line. Write failures are swallowed: logging must never
    /// abort the run it observes.
    pub fn write(&self, level: AuditLevel, message: &str) {
        match level {
            AuditLevel::Info => tracing::info!("{message}"),
            AuditLevel::Warning => tracing::warn!("{message}"),
            AuditLevel::Error => tracing::error!("{message}"),
        }

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let line = format_line(&timestamp, level, message);
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = written {
            tracing::debug!(path = %self.path.display(), "Audit log write failed: {e}");
        }
    }

    /// Return the last `max_lines` lines of the log, or a placeholder when
    /// the file is absent or unreadable.
    pub fn tail(&self, max_lines: usize) -> String {
        if !self.path.exists() {
            return format!("[ Log file not found: {} ]", self.path.display());
        }
        let content = match std::fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => return format!("[ Failed to read log: {e} ]"),
        };

        let lines: Vec<&str> = content.split('\n').collect();
        if lines.len() > max_lines {
            let start = lines.len() - max_lines;
            format!(
                "[ Showing last {max_lines} lines ]...\n{}",
                lines[start..].join("\n")
            )
        } else {
            content
        }
    }
}

fn format_line(timestamp: &str, level: AuditLevel, message: &str) -> String {
    format!("{timestamp} - {level} - {message}\n")
}
