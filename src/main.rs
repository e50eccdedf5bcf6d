use clap::error::ErrorKind;
use clap::Parser;
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing::error;
use tracing_subscriber::EnvFilter;

use wdt::cli::Args;
use wdt::engine::TcpEngine;
use wdt::error::STARTUP_ERROR_EXIT_STATUS;
use wdt::Dispatcher;

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(STARTUP_ERROR_EXIT_STATUS),
            };
        }
    };
    init_logging(args.verbose);

    let config = match args.resolve() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(e.exit_status());
        }
    };

    let engine = TcpEngine::new(config.options.log_name.clone());
    let dispatcher = Dispatcher::new(config, engine);
    match dispatcher.run(BufReader::new(tokio::io::stdin())).await {
        Ok(outcome) => ExitCode::from(outcome.exit_status()),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_status())
        }
    }
}
