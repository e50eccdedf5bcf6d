//! Command-line arguments.

use crate::config::TransferOptions;
use crate::dispatch::RunConfig;
use crate::engine::protocol::MAX_STRING_LEN;
use crate::error::{LaunchError, Result};
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};

/// WDT Warp-speed Data Transfer
///
/// Run without a destination to receive, with `--destination <host>` to send.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Destination host; empty means this process is the receiver
    #[arg(short, long, env = "WDT_DESTINATION", default_value = "")]
    pub destination: String,

    /// Source/destination directory
    #[arg(long, env = "WDT_DIRECTORY", default_value = ".")]
    pub directory: PathBuf,

    /// Run the receiver as a never ending process
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub run_as_daemon: bool,

    /// Read a list of files (and optional sizes) from stdin instead of scanning the directory
    #[arg(long)]
    pub files: bool,

    /// Parse and repair the transfer log in the directory, then exit
    #[arg(long)]
    pub parse_transfer_log: bool,

    /// Transfer id; sender and receiver must agree
    #[arg(long, env = "WDT_TRANSFER_ID", default_value = "")]
    pub transfer_id: String,

    /// Protocol version to use (0 keeps the default)
    #[arg(long, default_value_t = 0)]
    pub protocol_version: u32,

    /// Abort the transfer after this many seconds (0 disables)
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub abort_after_seconds: i64,

    /// Only send files whose relative path matches
    #[arg(long, default_value = "")]
    pub include_regex: String,

    /// Skip files whose relative path matches
    #[arg(long, default_value = "")]
    pub exclude_regex: String,

    /// Skip directories whose relative path matches
    #[arg(long, default_value = "")]
    pub prune_dir_regex: String,

    /// First port of the range
    #[arg(long)]
    pub start_port: Option<u16>,

    /// Number of ports (and parallel connections)
    #[arg(long)]
    pub num_ports: Option<u16>,

    /// TOML file with transfer options
    #[arg(long, env = "WDT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Expand tilde (~) in paths to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

impl Args {
    /// Layer config file and flags into the dispatcher's input.
    pub fn resolve(&self) -> Result<RunConfig> {
        let mut options = match &self.config {
            Some(path) => TransferOptions::load(&expand_tilde(path))?,
            None => TransferOptions::default(),
        };
        if let Some(port) = self.start_port {
            options.start_port = port;
        }
        if let Some(n) = self.num_ports {
            options.num_ports = n;
        }
        options.validate()?;
        if self.transfer_id.len() > MAX_STRING_LEN {
            return Err(LaunchError::Config(format!(
                "transfer id is {} bytes, limit is {}",
                self.transfer_id.len(),
                MAX_STRING_LEN
            )));
        }

        Ok(RunConfig {
            destination: self.destination.trim().to_string(),
            root: expand_tilde(&self.directory),
            daemon: self.run_as_daemon,
            explicit_files: self.files,
            parse_transfer_log: self.parse_transfer_log,
            transfer_id: self.transfer_id.clone(),
            protocol_version: self.protocol_version,
            abort_after_seconds: self.abort_after_seconds,
            include_regex: self.include_regex.clone(),
            exclude_regex: self.exclude_regex.clone(),
            prune_dir_regex: self.prune_dir_regex.clone(),
            options,
        })
    }
}
