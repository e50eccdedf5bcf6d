//! Transfer log
//!
//! Line-oriented text log kept in the receiver's root directory. The receiver
//! appends one entry per completed file; `--parse-transfer-log` prints the log
//! and cuts off a half-written last line left behind by a crash.
//!
//! ```text
//! # wdt transfer log v1
//! session\t<transfer id or ->\t<ports>
//! file\t<relative path>\t<bytes>
//! ```
//!
//! Backslash, tab, newline and carriage return in names are written as
//! `\\`, `\t`, `\n` and `\r`.

use crate::role::TransferLog;
use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const LOG_HEADER: &str = "# wdt transfer log v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Session,
    File,
}

impl EntryKind {
    fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Session => "session",
            EntryKind::File => "file",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "session" => Some(EntryKind::Session),
            "file" => Some(EntryKind::File),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: EntryKind,
    pub name: String,
    pub size: u64,
}

impl LogEntry {
    pub fn session(transfer_id: &str, ports: usize) -> Self {
        let name = if transfer_id.is_empty() {
            "-".to_string()
        } else {
            transfer_id.to_string()
        };
        Self {
            kind: EntryKind::Session,
            name,
            size: ports as u64,
        }
    }

    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            name: name.into(),
            size,
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\n",
            self.kind.as_str(),
            escape(&self.name),
            self.size
        )
    }

    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split('\t').collect();
        let [kind, name, size] = parts.as_slice() else {
            return None;
        };
        let name = unescape(name)?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            kind: EntryKind::from_str(kind)?,
            name,
            size: size.parse().ok()?,
        })
    }
}

fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(field: &str) -> Option<String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            't' => out.push('\t'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            _ => return None,
        }
    }
    Some(out)
}

// =============================================================================
// Writer (receiver side)
// =============================================================================

/// Append-only handle shared by the receiver's session tasks.
#[derive(Debug)]
pub struct TransferLogWriter {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl TransferLogWriter {
    /// Open (creating if needed) the log, writing the header to a new file.
    /// A torn last entry from an earlier crash is cut off first so new
    /// entries start on a fresh line; a corrupt log is refused.
    pub async fn open(path: &Path) -> Result<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open transfer log {}", path.display()))?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .await
            .with_context(|| format!("Failed to read transfer log {}", path.display()))?;
        let mut valid_len = content.len() as u64;
        if !content.is_empty() {
            let parsed = TransferLogManager::parse(&content)
                .with_context(|| format!("Refusing to append to {}", path.display()))?;
            if parsed.torn_tail {
                warn!(
                    "Transfer log {} has a partial last entry, truncating to {} bytes",
                    path.display(),
                    parsed.valid_len
                );
                file.set_len(parsed.valid_len).await?;
                valid_len = parsed.valid_len;
            }
        }
        if valid_len == 0 {
            file.write_all(format!("{}\n", LOG_HEADER).as_bytes()).await?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub async fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(entry.to_line().as_bytes())
            .await
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

// =============================================================================
// Manager (parse and repair)
// =============================================================================

/// Outcome of scanning a log file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedLog {
    pub entries: Vec<LogEntry>,
    /// Byte length covering the header and every valid, complete entry
    pub valid_len: u64,
    /// Whether the file ended in a partial entry that should be cut off
    pub torn_tail: bool,
}

/// Reads, prints and repairs `<root>/<log_name>`.
#[derive(Debug, Clone)]
pub struct TransferLogManager {
    root: PathBuf,
    log_name: String,
}

impl TransferLogManager {
    pub fn new(log_name: impl Into<String>) -> Self {
        Self {
            root: PathBuf::from("."),
            log_name: log_name.into(),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(&self.log_name)
    }

    /// Parse log text. A bad line is only tolerated as the unterminated last
    /// line of the file.
    pub fn parse(content: &str) -> Result<ParsedLog> {
        let mut parsed = ParsedLog::default();
        let mut offset = 0usize;
        let mut lines = content.split_inclusive('\n').peekable();

        match lines.next() {
            Some(first) if first.trim_end_matches(['\r', '\n']) == LOG_HEADER => {
                offset += first.len();
                parsed.valid_len = offset as u64;
            }
            Some(first) if !first.ends_with('\n') && LOG_HEADER.starts_with(first) => {
                // Crashed while writing the header: nothing valid to keep.
                parsed.torn_tail = true;
                return Ok(parsed);
            }
            Some(_) => anyhow::bail!("Missing transfer log header"),
            None => anyhow::bail!("Transfer log is empty"),
        }

        let mut line_no = 1;
        while let Some(raw) = lines.next() {
            line_no += 1;
            let terminated = raw.ends_with('\n');
            let text = raw.trim_end_matches(['\r', '\n']);
            let is_last = lines.peek().is_none();

            match LogEntry::parse(text) {
                Some(entry) if terminated => {
                    parsed.entries.push(entry);
                    offset += raw.len();
                    parsed.valid_len = offset as u64;
                }
                _ if is_last && !terminated => {
                    parsed.torn_tail = true;
                }
                _ => anyhow::bail!("Corrupt transfer log entry at line {}: {:?}", line_no, text),
            }
        }

        Ok(parsed)
    }

    /// Print every entry to `out` and truncate a torn tail in place.
    pub fn parse_and_write<W: Write>(&self, out: &mut W) -> Result<ParsedLog> {
        let path = self.log_path();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read transfer log {}", path.display()))?;
        let parsed = Self::parse(&content)?;

        for entry in &parsed.entries {
            out.write_all(entry.to_line().as_bytes())?;
        }

        if parsed.torn_tail {
            warn!(
                "Transfer log {} has a partial last entry, truncating to {} bytes",
                path.display(),
                parsed.valid_len
            );
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .with_context(|| format!("Failed to open {} for repair", path.display()))?;
            file.set_len(parsed.valid_len)?;
            file.sync_all()?;
            info!("Transfer log repaired");
        } else {
            debug!(entries = parsed.entries.len(), "Transfer log is intact");
        }
        Ok(parsed)
    }
}

impl TransferLog for TransferLogManager {
    fn set_root_dir(&mut self, root: &Path) {
        self.root = root.to_path_buf();
    }

    fn parse_and_print(&mut self) -> bool {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        match self.parse_and_write(&mut out) {
            Ok(_) => true,
            Err(e) => {
                error!("{:#}", e);
                false
            }
        }
    }
}
