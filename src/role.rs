//! Transfer role capabilities.
//!
//! The dispatcher drives senders, receivers and the transfer-log tool only
//! through these traits; the default TCP engine in [`crate::engine`] is one
//! implementation, tests plug in mocks.

use crate::abort::AbortChecker;
use crate::config::TransferOptions;
use crate::error::ErrorCode;
use crate::items::TransferItem;
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Reports
// =============================================================================

/// Aggregate result of a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    error_code: ErrorCode,
    /// Files fully transferred
    pub files: u64,
    /// Payload bytes transferred
    pub bytes: u64,
}

impl TransferSummary {
    pub fn new(error_code: ErrorCode, files: u64, bytes: u64) -> Self {
        Self {
            error_code,
            files,
            bytes,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        self.error_code
    }

    /// Fold another summary in, keeping the first failure.
    pub fn merge(&mut self, other: &TransferSummary) {
        self.error_code = self.error_code.merge(other.error_code);
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

/// What a role hands back when a transfer completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    summary: TransferSummary,
}

impl TransferReport {
    pub fn new(summary: TransferSummary) -> Self {
        Self { summary }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(TransferSummary::new(code, 0, 0))
    }

    pub fn summary(&self) -> &TransferSummary {
        &self.summary
    }
}

// =============================================================================
// Roles
// =============================================================================

/// Setters shared by both sides of a transfer.
pub trait TransferRole: Send {
    fn set_abort_checker(&mut self, checker: Arc<dyn AbortChecker>);
    fn set_transfer_id(&mut self, id: &str);
    fn set_protocol_version(&mut self, version: u32);
}

/// The active side: pushes items to a destination.
#[async_trait]
pub trait SendRole: TransferRole {
    fn set_include_regex(&mut self, pattern: &str);
    fn set_exclude_regex(&mut self, pattern: &str);
    fn set_prune_dir_regex(&mut self, pattern: &str);

    /// Run the whole transfer.
    async fn transfer(&mut self) -> Result<TransferReport>;
}

/// The passive side: listens on a port range and writes into its root.
#[async_trait]
pub trait ReceiveRole: TransferRole {
    /// Bind listening ports; returns how many succeeded.
    async fn register_ports(&mut self) -> usize;

    /// Start serving one transfer in the background.
    async fn transfer_async(&mut self) -> Result<()>;

    /// Wait for the transfer started by [`transfer_async`](Self::transfer_async).
    async fn finish(&mut self) -> Result<TransferReport>;

    /// Serve transfers until the process is stopped.
    async fn run_forever(&mut self) -> Result<()>;
}

/// Transfer log inspection and repair.
pub trait TransferLog {
    fn set_root_dir(&mut self, root: &Path);

    /// Print the log and repair a torn tail. False when the log is unusable.
    fn parse_and_print(&mut self) -> bool;
}

/// Everything a sender needs at construction time.
#[derive(Debug, Clone)]
pub struct SenderSpec {
    pub destination: String,
    pub root: PathBuf,
    pub ports: Vec<u16>,
    pub items: Vec<TransferItem>,
    pub options: TransferOptions,
}

/// Everything a receiver needs at construction time.
#[derive(Debug, Clone)]
pub struct ReceiverSpec {
    pub root: PathBuf,
    pub options: TransferOptions,
}

/// Builds role objects for the dispatcher.
pub trait RoleFactory {
    type Sender: SendRole;
    type Receiver: ReceiveRole;
    type Log: TransferLog;

    fn sender(&self, spec: SenderSpec) -> Self::Sender;
    fn receiver(&self, spec: ReceiverSpec) -> Self::Receiver;
    fn transfer_log(&self) -> Self::Log;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_merge() {
        let mut total = TransferSummary::new(ErrorCode::Ok, 2, 100);
        total.merge(&TransferSummary::new(ErrorCode::Abort, 1, 10));
        total.merge(&TransferSummary::new(ErrorCode::ConnError, 0, 0));
        assert_eq!(total.error_code(), ErrorCode::Abort);
        assert_eq!(total.files, 3);
        assert_eq!(total.bytes, 110);
    }

    #[test]
    fn test_report_from_code() {
        let report = TransferReport::from_code(ErrorCode::IdMismatch);
        assert_eq!(report.summary().error_code(), ErrorCode::IdMismatch);
        assert_eq!(report.summary().files, 0);
    }
}
