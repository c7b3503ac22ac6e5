//! Survey Compiler - command-line entry point

use clap::Parser;
use std::process;
use survey_common::logging::{init_logging, LogConfig, LogLevel};
use survey_compiler::{commands, Cli, Config};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::default()
        .with_level(log_level)
        .with_file("./logs", "survey-compiler");

    // LOG_* environment variables take precedence
    let log_config = match log_config.clone().merge_env() {
        Ok(merged) => merged,
        Err(e) => {
            eprintln!("Ignoring invalid LOG_* settings: {}", e);
            log_config
        }
    };

    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            None
        }
    };

    let result = match Config::load(cli.config.as_deref()) {
        Ok(config) => commands::execute(&cli.command, config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(error = %format!("{:#}", e), "Command failed");
        eprintln!("Error: {:#}", e);
        drop(guard);
        process::exit(1);
    }

    drop(guard);
}
