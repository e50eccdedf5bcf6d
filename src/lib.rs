//! wdt - launcher for a multi-port bulk transfer engine.
//!
//! Picks one of four run modes from configuration, optionally reads an
//! explicit item list, guards the transfer with an abort watchdog and turns
//! the engine's report into a process exit status.

pub mod abort;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod items;
pub mod role;

pub use abort::{AbortChecker, AbortSignal, SignalChecker, Watchdog};
pub use dispatch::{Dispatcher, ExecutionMode, RunConfig, RunOutcome};
pub use error::{ErrorCode, LaunchError};
pub use items::TransferItem;
