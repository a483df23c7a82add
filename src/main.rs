//! kiln - live preview engine for UI components.

#![allow(dead_code)]

mod build;
mod cache;
mod cli;
mod component;
mod config;
mod core;
mod engine;
mod hub;
mod logger;
mod registry;
mod scanner;
mod utils;
mod watch;

use anyhow::Result;
use clap::{ColorChoice, Parser};
use cli::{Cli, Commands};
use config::EngineConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global color override based on CLI option
    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {} // owo-colors auto-detects TTY
    }
    logger::set_verbose(cli.verbose);

    let mut config = EngineConfig::load(&cli.root, cli.config.as_deref())?;

    let ok = match cli.command {
        Commands::Scan => cli::scan::scan_components(&config)?,
        Commands::Build => cli::build::build_components(config)?,
        Commands::Serve { interface, port } => {
            if let Some(interface) = interface {
                config.serve.interface = interface;
            }
            if let Some(port) = port {
                config.serve.port = port;
            }
            cli::serve::serve_components(config)?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
