use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tos_bootnode::{
    bootstrap::{self, DefaultLauncher, Outcome},
    config::Config,
};
use tos_bootnode_common::{config::VERSION, logger::init_logger, tokio::signal};

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => {
            if log::log_enabled!(log::Level::Info) {
                info!("Received interrupt signal");
            }
        }
        Err(e) => {
            if log::log_enabled!(log::Level::Error) {
                error!("Cannot listen for the interrupt signal: {}", e);
            }
            futures::future::pending::<()>().await
        }
    }
}

async fn run(config: Config) -> Result<ExitCode> {
    let outcome = bootstrap::run(&config.bootnode, &DefaultLauncher, shutdown_signal()).await?;
    match outcome {
        Outcome::KeyGenerated { path, fingerprint } => {
            if log::log_enabled!(log::Level::Info) {
                info!("Node key written to {}", path.display());
            }
            println!("{}", fingerprint);
        }
        Outcome::AddressWritten(fingerprint) => println!("{}", fingerprint),
        Outcome::Shutdown => {
            if log::log_enabled!(log::Level::Info) {
                info!("Bye");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut config = Config::parse();

    if let Some(path) = config.config_file.clone() {
        if config.generate_config_template {
            return match config.write_template(&path) {
                Ok(()) => {
                    println!("Config file template generated at {}", path.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::FAILURE
                }
            };
        }

        config = match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        };
    } else if config.generate_config_template {
        eprintln!("Provided config file path is required to generate the template with --config-file");
        return ExitCode::FAILURE;
    }

    if let Err(e) = init_logger(&config.log.to_logger_config()).context("Error while initializing the logger") {
        eprintln!("{:#}", e);
        return ExitCode::FAILURE;
    }
    if log::log_enabled!(log::Level::Info) {
        info!("TOS Bootnode v{}", VERSION);
    }

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            if log::log_enabled!(log::Level::Error) {
                error!("{:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}
