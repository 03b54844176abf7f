/*++

Licensed under the Apache-2.0 license.

File Name:

   main.rs

Abstract:

    Main entry point of the key provisioning service administration tool.

--*/

use anyhow::Context;
use bkps_provisioning::{load_config, BkpsConfig};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::str::FromStr;

mod sealing;

#[derive(Parser)]
#[command(version, about = "Key provisioning service administration", long_about = None)]
struct Cli {
    /// Service configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configuration file and print the effective settings
    CheckConfig,
    /// Run the sealing key lifecycle against a local enclave
    SealingKey {
        /// Number of rotations after the key is created
        #[arg(long, default_value_t = 0)]
        rotate: u32,

        /// Back up the sealing key and write the encrypted key (hex) to FILE
        #[arg(long, value_name = "FILE")]
        backup: Option<PathBuf>,

        /// Restore the key written by --backup
        #[arg(long, requires = "backup")]
        restore: bool,
    },
}

fn config(path: Option<&PathBuf>) -> anyhow::Result<BkpsConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(BkpsConfig::default()),
    }
}

fn run(cli: &Cli, config: &BkpsConfig) -> anyhow::Result<()> {
    match &cli.command {
        Commands::CheckConfig => {
            println!("{config:#?}");
            Ok(())
        }
        Commands::SealingKey {
            rotate,
            backup,
            restore,
        } => sealing::run_cmd(*rotate, backup.as_deref(), *restore),
    }
}

fn init_logger(config: &BkpsConfig) -> anyhow::Result<()> {
    let level = LevelFilter::from_str(&config.log_level).unwrap_or(LevelFilter::Info);
    SimpleLogger::new()
        .with_level(level)
        .init()
        .context("Failed to initialize logger")?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let config = config(cli.config.as_ref())
        .and_then(|config| init_logger(&config).map(|_| config))
        .unwrap_or_else(|e| {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        });

    run(&cli, &config).unwrap_or_else(|e| {
        log::error!("Error: {e:#}");
        std::process::exit(1);
    });
}
