//! Mode dispatch - picks exactly one run mode and drives the matching role.
//!
//! ```text
//! RunConfig --mode()--> LogRepair      -> TransferLog::parse_and_print
//!                       ReceiveOnce    -> register_ports, arm, transfer_async + finish, cancel
//!                       ReceiveForever -> register_ports, arm, run_forever
//!                       Send           -> [read_items], arm, transfer, cancel
//! ```
//!
//! The watchdog is armed right before the transfer call and a
//! [`CancelOnDrop`] guard cancels it on every way out of the branch.

use crate::abort::{CancelOnDrop, Watchdog};
use crate::config::TransferOptions;
use crate::error::{ErrorCode, Result, NO_PORTS_EXIT_STATUS};
use crate::items::read_items;
use crate::role::{
    ReceiveRole, ReceiverSpec, RoleFactory, SendRole, SenderSpec, TransferLog, TransferReport,
    TransferRole,
};
use std::path::PathBuf;
use tokio::io::AsyncBufRead;
use tracing::{error, info, warn};

/// The four mutually exclusive ways a run can go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    LogRepair,
    ReceiveOnce,
    ReceiveForever,
    Send,
}

impl ExecutionMode {
    pub fn select(destination_empty: bool, daemon: bool, log_repair: bool) -> Self {
        match (log_repair, destination_empty, daemon) {
            (true, _, _) => ExecutionMode::LogRepair,
            (false, true, true) => ExecutionMode::ReceiveForever,
            (false, true, false) => ExecutionMode::ReceiveOnce,
            (false, false, _) => ExecutionMode::Send,
        }
    }
}

/// Fully resolved input to a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub destination: String,
    pub root: PathBuf,
    pub daemon: bool,
    pub explicit_files: bool,
    pub parse_transfer_log: bool,
    pub transfer_id: String,
    pub protocol_version: u32,
    pub abort_after_seconds: i64,
    pub include_regex: String,
    pub exclude_regex: String,
    pub prune_dir_regex: String,
    pub options: TransferOptions,
}

impl RunConfig {
    pub fn mode(&self) -> ExecutionMode {
        ExecutionMode::select(
            self.destination.is_empty(),
            self.daemon,
            self.parse_transfer_log,
        )
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            root: PathBuf::from("."),
            daemon: true,
            explicit_files: false,
            parse_transfer_log: false,
            transfer_id: String::new(),
            protocol_version: 0,
            abort_after_seconds: 0,
            include_regex: String::new(),
            exclude_regex: String::new(),
            prune_dir_regex: String::new(),
            options: TransferOptions::default(),
        }
    }
}

/// What a run hands back to the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A mode ran to completion with this code.
    Finished(ErrorCode),
    /// The receiver could not bind a single port; no transfer was attempted.
    NoPorts,
}

impl RunOutcome {
    pub fn exit_status(self) -> u8 {
        match self {
            RunOutcome::Finished(code) => code.as_exit_status(),
            RunOutcome::NoPorts => NO_PORTS_EXIT_STATUS,
        }
    }

    pub fn error_code(self) -> Option<ErrorCode> {
        match self {
            RunOutcome::Finished(code) => Some(code),
            RunOutcome::NoPorts => None,
        }
    }
}

/// Runs one mode per invocation against a [`RoleFactory`].
pub struct Dispatcher<F> {
    config: RunConfig,
    factory: F,
}

impl<F: RoleFactory> Dispatcher<F> {
    pub fn new(config: RunConfig, factory: F) -> Self {
        Self { config, factory }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the selected mode. `input` is only read for an explicit-file send.
    pub async fn run<R>(&self, input: R) -> Result<RunOutcome>
    where
        R: AsyncBufRead + Unpin,
    {
        let cfg = &self.config;
        info!(
            "Starting with directory = {} and destination = {} num sockets = {} from port = {}",
            cfg.root.display(),
            cfg.destination,
            cfg.options.num_ports,
            cfg.options.start_port
        );

        match cfg.mode() {
            ExecutionMode::LogRepair => Ok(self.repair_log()),
            ExecutionMode::ReceiveOnce => Ok(self.receive(false).await),
            ExecutionMode::ReceiveForever => Ok(self.receive(true).await),
            ExecutionMode::Send => self.send(input).await,
        }
    }

    fn repair_log(&self) -> RunOutcome {
        let mut log = self.factory.transfer_log();
        log.set_root_dir(&self.config.root);
        if log.parse_and_print() {
            RunOutcome::Finished(ErrorCode::Ok)
        } else {
            error!("Transfer log parsing failed");
            RunOutcome::Finished(ErrorCode::Error)
        }
    }

    async fn receive(&self, forever: bool) -> RunOutcome {
        let cfg = &self.config;
        let mut receiver = self.factory.receiver(ReceiverSpec {
            root: cfg.root.clone(),
            options: cfg.options.clone(),
        });
        self.apply_common(&mut receiver);

        let bound = receiver.register_ports().await;
        if bound == 0 {
            error!("Couldn't bind on any port");
            return RunOutcome::NoPorts;
        }
        info!(bound, "Registered listening ports");

        let mut watchdog = Watchdog::new();
        self.set_up_abort(&mut receiver, &mut watchdog);
        let _cancel = CancelOnDrop::new(&watchdog);

        if forever {
            tokio::select! {
                result = receiver.run_forever() => {
                    if let Err(e) = result {
                        error!("Receiver stopped: {:#}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down receiver");
                }
            }
            return RunOutcome::Finished(ErrorCode::Ok);
        }

        let result = match receiver.transfer_async().await {
            Ok(()) => receiver.finish().await,
            Err(e) => Err(e),
        };
        RunOutcome::Finished(reduce(result))
    }

    async fn send<R>(&self, input: R) -> Result<RunOutcome>
    where
        R: AsyncBufRead + Unpin,
    {
        let cfg = &self.config;
        let items = if cfg.explicit_files {
            read_items(input).await?
        } else {
            Vec::new()
        };

        let mut sender = self.factory.sender(SenderSpec {
            destination: cfg.destination.clone(),
            root: cfg.root.clone(),
            ports: cfg.options.ports(),
            items,
            options: cfg.options.clone(),
        });

        let mut watchdog = Watchdog::new();
        self.set_up_abort(&mut sender, &mut watchdog);
        self.apply_common(&mut sender);
        sender.set_include_regex(&cfg.include_regex);
        sender.set_exclude_regex(&cfg.exclude_regex);
        sender.set_prune_dir_regex(&cfg.prune_dir_regex);

        let _cancel = CancelOnDrop::new(&watchdog);
        let result = sender.transfer().await;
        Ok(RunOutcome::Finished(reduce(result)))
    }

    fn apply_common(&self, role: &mut impl TransferRole) {
        role.set_transfer_id(&self.config.transfer_id);
        if self.config.protocol_version > 0 {
            role.set_protocol_version(self.config.protocol_version);
        }
    }

    /// Hand the role a checker and start the countdown, if a timeout is set.
    fn set_up_abort(&self, role: &mut impl TransferRole, watchdog: &mut Watchdog) {
        let timeout = self.config.abort_after_seconds;
        if timeout <= 0 {
            return;
        }
        role.set_abort_checker(watchdog.checker());
        watchdog.arm(timeout);
    }
}

/// Collapse a role's result into the code the process exits with.
fn reduce(result: anyhow::Result<TransferReport>) -> ErrorCode {
    match result {
        Ok(report) => {
            let summary = report.summary();
            let code = summary.error_code();
            if code.is_ok() {
                info!(files = summary.files, bytes = summary.bytes, "Transfer finished");
            } else {
                warn!(%code, files = summary.files, bytes = summary.bytes, "Transfer finished with error");
            }
            code
        }
        Err(e) => {
            error!("Transfer failed: {:#}", e);
            ErrorCode::Error
        }
    }
}
